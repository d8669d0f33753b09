//! Protobuf messages for the v1 tunnel protocol.
//!
//! Field tags are part of the wire contract with deployed agents; never
//! renumber an existing field.

/// Kind of a [`TunnelFrame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum FrameType {
    Unspecified = 0,
    Checkin = 1,
    CheckinResponse = 2,
    Connect = 3,
    Connected = 4,
    Open = 5,
    Data = 6,
    Close = 7,
    Ping = 8,
    Pong = 9,
    Logs = 10,
    Error = 11,
    /// The sender will write no more data on the stream.
    Eof = 12,
}

/// Tunnel status as reported to an agent on check-in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TunnelState {
    Idle = 0,
    Required = 1,
    Active = 2,
}

/// Error codes carried by [`TunnelError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Unspecified = 0,
    Unauthorized = 1,
    CapacityExceeded = 2,
    BadHandshake = 3,
    NotFound = 4,
    Internal = 5,
}

/// A single unit on the tunnel connection.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TunnelFrame {
    #[prost(enumeration = "FrameType", tag = "1")]
    pub frame_type: i32,
    /// Multiplexed stream the frame belongs to; zero for control frames.
    #[prost(uint64, tag = "2")]
    pub stream_id: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub data: ::prost::alloc::vec::Vec<u8>,
    #[prost(oneof = "tunnel_frame::Payload", tags = "4, 5, 6, 7, 8, 9")]
    pub payload: ::core::option::Option<tunnel_frame::Payload>,
}

pub mod tunnel_frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "4")]
        Checkin(super::CheckinRequest),
        #[prost(message, tag = "5")]
        CheckinResponse(super::CheckinResponse),
        #[prost(message, tag = "6")]
        Connect(super::ConnectRequest),
        #[prost(message, tag = "7")]
        Connected(super::ConnectAck),
        #[prost(message, tag = "8")]
        Error(super::TunnelError),
        #[prost(message, tag = "9")]
        Logs(super::JobLogs),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckinRequest {
    #[prost(int64, tag = "1")]
    pub endpoint_id: i64,
    /// Identity of the agent host; bound to the endpoint on first check-in.
    #[prost(string, tag = "2")]
    pub edge_id: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CheckinResponse {
    #[prost(enumeration = "TunnelState", tag = "1")]
    pub status: i32,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    /// One-time secret, only set while the tunnel is required.
    #[prost(string, tag = "3")]
    pub credentials: ::prost::alloc::string::String,
    #[prost(uint32, tag = "4")]
    pub checkin_interval_secs: u32,
    #[prost(message, repeated, tag = "5")]
    pub schedules: ::prost::alloc::vec::Vec<EdgeJobSchedule>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EdgeJobSchedule {
    #[prost(int64, tag = "1")]
    pub id: i64,
    #[prost(string, tag = "2")]
    pub cron_expression: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "3")]
    pub script: ::prost::alloc::vec::Vec<u8>,
    #[prost(bool, tag = "4")]
    pub collect_logs: bool,
    #[prost(int32, tag = "5")]
    pub version: i32,
    #[prost(bool, tag = "6")]
    pub recurring: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    #[prost(int64, tag = "1")]
    pub endpoint_id: i64,
    #[prost(string, tag = "2")]
    pub credentials: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectAck {
    #[prost(uint32, tag = "1")]
    pub port: u32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TunnelError {
    #[prost(enumeration = "ErrorCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: ::prost::alloc::string::String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobLogs {
    #[prost(int64, tag = "1")]
    pub job_id: i64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: ::prost::alloc::vec::Vec<u8>,
}

impl TunnelFrame {
    fn control(frame_type: FrameType, payload: Option<tunnel_frame::Payload>) -> Self {
        Self {
            frame_type: frame_type as i32,
            stream_id: 0,
            data: Vec::new(),
            payload,
        }
    }

    pub fn checkin(endpoint_id: i64, edge_id: impl Into<String>) -> Self {
        Self::control(
            FrameType::Checkin,
            Some(tunnel_frame::Payload::Checkin(CheckinRequest {
                endpoint_id,
                edge_id: edge_id.into(),
            })),
        )
    }

    pub fn checkin_response(response: CheckinResponse) -> Self {
        Self::control(
            FrameType::CheckinResponse,
            Some(tunnel_frame::Payload::CheckinResponse(response)),
        )
    }

    pub fn connect(endpoint_id: i64, credentials: impl Into<String>) -> Self {
        Self::control(
            FrameType::Connect,
            Some(tunnel_frame::Payload::Connect(ConnectRequest {
                endpoint_id,
                credentials: credentials.into(),
            })),
        )
    }

    pub fn connected(port: u16) -> Self {
        Self::control(
            FrameType::Connected,
            Some(tunnel_frame::Payload::Connected(ConnectAck {
                port: u32::from(port),
            })),
        )
    }

    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::control(
            FrameType::Error,
            Some(tunnel_frame::Payload::Error(TunnelError {
                code: code as i32,
                message: message.into(),
            })),
        )
    }

    pub fn logs(job_id: i64, data: Vec<u8>) -> Self {
        Self::control(
            FrameType::Logs,
            Some(tunnel_frame::Payload::Logs(JobLogs { job_id, data })),
        )
    }

    pub fn ping() -> Self {
        Self::control(FrameType::Ping, None)
    }

    pub fn pong() -> Self {
        Self::control(FrameType::Pong, None)
    }

    /// Announce a new multiplexed stream.
    pub fn open(stream_id: u64) -> Self {
        Self {
            frame_type: FrameType::Open as i32,
            stream_id,
            data: Vec::new(),
            payload: None,
        }
    }

    pub fn stream_data(stream_id: u64, data: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data as i32,
            stream_id,
            data,
            payload: None,
        }
    }

    /// Half-close: no more DATA follows on `stream_id` from this side.
    pub fn eof(stream_id: u64) -> Self {
        Self {
            frame_type: FrameType::Eof as i32,
            stream_id,
            data: Vec::new(),
            payload: None,
        }
    }

    /// Tear down `stream_id` in both directions.
    pub fn close(stream_id: u64) -> Self {
        Self {
            frame_type: FrameType::Close as i32,
            stream_id,
            data: Vec::new(),
            payload: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn unknown_frame_type_decodes_as_unspecified() {
        let frame = TunnelFrame {
            frame_type: 99,
            ..Default::default()
        };
        let decoded = TunnelFrame::decode(frame.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.frame_type(), FrameType::Unspecified);
    }

    #[test]
    fn connect_frame_carries_credentials() {
        let frame = TunnelFrame::connect(7, "secret");
        assert_eq!(frame.frame_type(), FrameType::Connect);
        match frame.payload {
            Some(tunnel_frame::Payload::Connect(req)) => {
                assert_eq!(req.endpoint_id, 7);
                assert_eq!(req.credentials, "secret");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn stream_frames_have_no_payload() {
        let frame = TunnelFrame::stream_data(3, b"abc".to_vec());
        assert_eq!(frame.stream_id, 3);
        assert_eq!(frame.frame_type(), FrameType::Data);
        assert!(frame.payload.is_none());
    }
}
