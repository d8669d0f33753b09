//! Length-delimited framing for [`TunnelFrame`]s.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::v1::TunnelFrame;

/// Largest frame accepted by default (collected job logs travel in one frame).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode frame: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Encodes and decodes protobuf tunnel frames behind a 4-byte length prefix.
#[derive(Debug)]
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max)
                .new_codec(),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = TunnelFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<TunnelFrame>, CodecError> {
        match self.inner.decode(src)? {
            Some(buf) => Ok(Some(TunnelFrame::decode(buf)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<TunnelFrame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: TunnelFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.inner.encode(Bytes::from(frame.encode_to_vec()), dst)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::v1::FrameType;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    #[tokio::test]
    async fn frames_survive_the_wire() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = Framed::new(a, FrameCodec::new());
        let mut rx = Framed::new(b, FrameCodec::new());

        tx.send(TunnelFrame::open(1)).await.unwrap();
        tx.send(TunnelFrame::stream_data(1, b"hello".to_vec()))
            .await
            .unwrap();

        let open = rx.next().await.unwrap().unwrap();
        assert_eq!(open.frame_type(), FrameType::Open);
        let data = rx.next().await.unwrap().unwrap();
        assert_eq!(data.data, b"hello");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(4096);
        let mut tx = Framed::new(a, FrameCodec::new());
        let mut rx = Framed::new(b, FrameCodec::with_max_frame_length(16));

        tx.send(TunnelFrame::stream_data(1, vec![0u8; 64]))
            .await
            .unwrap();

        let result = rx.next().await.unwrap();
        assert!(matches!(result, Err(CodecError::Io(_))));
    }
}
