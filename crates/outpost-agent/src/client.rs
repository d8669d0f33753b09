//! Edge agent: check-in loop and tunnel dial-out.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use outpost_proto::tunnel_frame::Payload;
use outpost_proto::{
    CheckinResponse, EdgeJobSchedule, FrameCodec, TunnelError as ErrorFrame, TunnelFrame,
    TunnelState,
};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::logs::LogSource;
use crate::session::Session;

pub(crate) type FramedConn = Framed<TcpStream, FrameCodec>;

/// An edge agent bound to one endpoint identity.
pub struct EdgeAgent {
    config: AgentConfig,
    logs: Arc<dyn LogSource>,
    schedules: RwLock<Vec<EdgeJobSchedule>>,
}

impl EdgeAgent {
    pub fn new(config: AgentConfig, logs: Arc<dyn LogSource>) -> Self {
        Self {
            config,
            logs,
            schedules: RwLock::new(Vec::new()),
        }
    }

    pub const fn endpoint_id(&self) -> i64 {
        self.config.edge_key.endpoint_id
    }

    /// Job schedules received on the last successful check-in.
    pub fn schedules(&self) -> Vec<EdgeJobSchedule> {
        self.schedules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Report to the relay once and record the schedules it returns.
    pub async fn checkin(&self) -> Result<CheckinResponse, AgentError> {
        let mut framed = self.dial().await?;
        framed.send(TunnelFrame::checkin(self.endpoint_id(), self.config.edge_id.as_str())).await?;

        match self.reply(&mut framed).await?.payload {
            Some(Payload::CheckinResponse(response)) => {
                *self
                    .schedules
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = response.schedules.clone();
                Ok(response)
            }
            Some(Payload::Error(error)) => Err(rejected(error)),
            _ => Err(AgentError::Protocol("expected checkin response".into())),
        }
    }

    /// Open a tunnel with the credentials from a REQUIRED check-in.
    ///
    /// Returns the connection and the relay-side port assigned to it.
    pub(crate) async fn connect(&self, credentials: &str) -> Result<(FramedConn, u16), AgentError> {
        let mut framed = self.dial().await?;
        framed
            .send(TunnelFrame::connect(self.endpoint_id(), credentials))
            .await?;

        match self.reply(&mut framed).await?.payload {
            Some(Payload::Connected(ack)) => {
                let port = u16::try_from(ack.port)
                    .ok()
                    .filter(|port| *port != 0)
                    .ok_or_else(|| AgentError::Protocol(format!("invalid port {}", ack.port)))?;
                Ok((framed, port))
            }
            Some(Payload::Error(error)) => Err(rejected(error)),
            _ => Err(AgentError::Protocol("expected connect ack".into())),
        }
    }

    /// Connect a tunnel and serve it until it closes or `shutdown` fires.
    pub async fn open_tunnel(
        &self,
        credentials: &str,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let (framed, port) = self.connect(credentials).await?;
        info!(endpoint_id = self.endpoint_id(), port, "Tunnel established");

        let uploads = self.collected_logs().await;
        Session::new(
            self.config.target_addr.clone(),
            self.config.heartbeat_interval,
        )
        .run(framed, uploads, shutdown)
        .await
    }

    /// Check in on the relay's interval until `shutdown` fires, opening a
    /// tunnel whenever the relay asks for one.
    ///
    /// Failed check-ins back off according to the reconnect policy; the loop
    /// gives up once the policy's attempt limit is reached.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), AgentError> {
        let mut attempt: u32 = 0;
        let mut tunnel: Option<JoinHandle<()>> = None;

        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }
            if tunnel.as_ref().is_some_and(JoinHandle::is_finished) {
                tunnel = None;
            }

            let wait = match self.checkin().await {
                Ok(response) => {
                    attempt = 0;
                    debug!(
                        endpoint_id = self.endpoint_id(),
                        status = ?response.status(),
                        schedules = response.schedules.len(),
                        "Checked in"
                    );
                    if response.status() == TunnelState::Required && tunnel.is_none() {
                        tunnel = Some(self.spawn_tunnel(response.credentials, shutdown.clone()));
                    }
                    self.checkin_interval(response.checkin_interval_secs)
                }
                Err(e) => {
                    if !self.config.reconnect.should_retry(attempt) {
                        warn!(attempt, error = %e, "Giving up on relay");
                        break Err(e);
                    }
                    let delay = self.config.reconnect.jittered_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    warn!(attempt, delay_ms = delay.as_millis(), error = %e, "Check-in failed");
                    delay
                }
            };

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => break Ok(()),
            }
        };

        if let Some(handle) = tunnel {
            if result.is_err() {
                handle.abort();
            }
            let _ = handle.await;
        }
        result
    }

    fn spawn_tunnel(
        self: &Arc<Self>,
        credentials: String,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let agent = Arc::clone(self);
        tokio::spawn(async move {
            match agent.open_tunnel(&credentials, shutdown).await {
                Ok(()) => info!(endpoint_id = agent.endpoint_id(), "Tunnel closed"),
                Err(e) => warn!(endpoint_id = agent.endpoint_id(), error = %e, "Tunnel failed"),
            }
        })
    }

    /// LOGS frames for every schedule the relay wants output from.
    async fn collected_logs(&self) -> Vec<TunnelFrame> {
        let mut frames = Vec::new();
        for schedule in self.schedules().iter().filter(|s| s.collect_logs) {
            match self.logs.job_logs(schedule.id).await {
                Ok(Some(data)) => frames.push(TunnelFrame::logs(schedule.id, data)),
                Ok(None) => debug!(job_id = schedule.id, "No output for job yet"),
                Err(e) => warn!(job_id = schedule.id, error = %e, "Failed to read job logs"),
            }
        }
        frames
    }

    fn checkin_interval(&self, secs: u32) -> Duration {
        if secs == 0 {
            self.config.default_checkin_interval
        } else {
            Duration::from_secs(u64::from(secs))
        }
    }

    async fn dial(&self) -> Result<FramedConn, AgentError> {
        let addr = self.config.edge_key.tunnel_addr();
        let stream = tokio::time::timeout(self.config.request_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| AgentError::Connection(format!("timed out connecting to {addr}")))?
            .map_err(|e| AgentError::Connection(format!("{addr}: {e}")))?;
        Ok(Framed::new(stream, FrameCodec::new()))
    }

    async fn reply(&self, framed: &mut FramedConn) -> Result<TunnelFrame, AgentError> {
        match tokio::time::timeout(self.config.request_timeout, framed.next()).await {
            Ok(Some(frame)) => Ok(frame?),
            Ok(None) => Err(AgentError::Connection("relay closed the connection".into())),
            Err(_) => Err(AgentError::Connection("timed out waiting for relay".into())),
        }
    }
}

pub(crate) fn rejected(error: ErrorFrame) -> AgentError {
    AgentError::Rejected {
        code: error.code(),
        message: error.message,
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use tokio::net::TcpListener;

    use outpost_proto::{EdgeKey, ErrorCode};

    use super::*;
    use crate::logs::DirLogSource;

    /// One-shot relay: reads a frame, answers with `reply`.
    async fn fake_relay(reply: TunnelFrame) -> (EdgeKey, JoinHandle<TunnelFrame>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, FrameCodec::new());
            let request = framed.next().await.unwrap().unwrap();
            framed.send(reply).await.unwrap();
            request
        });
        (EdgeKey::new("127.0.0.1", port, 7), handle)
    }

    fn agent(edge_key: EdgeKey) -> EdgeAgent {
        let mut config = AgentConfig::new(edge_key, "host-a", "127.0.0.1:1");
        config.request_timeout = Duration::from_secs(2);
        EdgeAgent::new(config, Arc::new(DirLogSource::new("/nonexistent")))
    }

    #[tokio::test]
    async fn checkin_records_schedules() {
        let response = CheckinResponse {
            status: TunnelState::Required as i32,
            port: 0,
            credentials: "secret".into(),
            checkin_interval_secs: 9,
            schedules: vec![EdgeJobSchedule {
                id: 3,
                cron_expression: "* * * * *".into(),
                script: b"echo hi".to_vec(),
                collect_logs: true,
                version: 1,
                recurring: true,
            }],
        };
        let (key, relay) = fake_relay(TunnelFrame::checkin_response(response)).await;
        let agent = agent(key);

        let got = agent.checkin().await.unwrap();
        assert_eq!(got.status(), TunnelState::Required);
        assert_eq!(got.credentials, "secret");
        assert_eq!(agent.schedules().len(), 1);
        assert_eq!(agent.schedules()[0].id, 3);

        let request = relay.await.unwrap();
        assert!(matches!(
            request.payload,
            Some(Payload::Checkin(ref c)) if c.endpoint_id == 7 && c.edge_id == "host-a"
        ));
    }

    #[tokio::test]
    async fn checkin_rejection_carries_code() {
        let (key, _relay) =
            fake_relay(TunnelFrame::error(ErrorCode::Unauthorized, "unauthorized")).await;
        let err = agent(key).checkin().await.unwrap_err();
        match err {
            AgentError::Rejected { code, message } => {
                assert_eq!(code, ErrorCode::Unauthorized);
                assert_eq!(message, "unauthorized");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn connect_rejects_zero_port() {
        let (key, _relay) = fake_relay(TunnelFrame::connected(0)).await;
        let err = agent(key).connect("secret").await.unwrap_err();
        assert!(matches!(err, AgentError::Protocol(_)));
    }

    #[tokio::test]
    async fn connect_returns_assigned_port() {
        let (key, relay) = fake_relay(TunnelFrame::connected(41000)).await;
        let (_framed, port) = agent(key).connect("secret").await.unwrap();
        assert_eq!(port, 41000);

        let request = relay.await.unwrap();
        assert!(matches!(
            request.payload,
            Some(Payload::Connect(ref c)) if c.credentials == "secret"
        ));
    }

    #[tokio::test]
    async fn unreachable_relay_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = agent(EdgeKey::new("127.0.0.1", port, 7))
            .checkin()
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Connection(_)));
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let agent = agent(EdgeKey::new("relay", 8000, 7));
        assert_eq!(agent.checkin_interval(0), Duration::from_secs(5));
        assert_eq!(agent.checkin_interval(12), Duration::from_secs(12));
    }
}
