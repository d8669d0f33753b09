//! Accept loop and handshake handling.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

use outpost_core::config::RelayConfig;
use outpost_core::db::DatabaseError;
use outpost_proto::tunnel_frame::Payload;
use outpost_proto::{
    CheckinRequest, CheckinResponse, ConnectRequest, ErrorCode, FrameCodec, TunnelFrame,
    TunnelState,
};

use super::error::TunnelError;
use super::session::{ActiveTunnel, Session};
use crate::jobs::EdgeJobDispatcher;
use crate::registry::{TunnelRegistry, TunnelStatus};
use crate::storage::RelayDatabase;

pub(crate) type FramedConn = Framed<TcpStream, FrameCodec>;

#[derive(Debug, Clone)]
pub struct TunnelServerConfig {
    pub max_tunnels: usize,
    pub idle_timeout: Duration,
    /// Default interval sent to agents whose endpoint has none configured.
    pub checkin_interval_secs: u32,
    pub handshake_timeout: Duration,
}

impl Default for TunnelServerConfig {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for TunnelServerConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_tunnels: config.max_tunnels,
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            checkin_interval_secs: config.checkin_interval_secs,
            handshake_timeout: Duration::from_secs(config.handshake_timeout_secs),
        }
    }
}

impl TunnelServerConfig {
    /// How often sessions and the sweep look at the registry.
    pub(crate) fn check_interval(&self) -> Duration {
        (self.idle_timeout / 4).clamp(Duration::from_millis(20), Duration::from_secs(5))
    }
}

pub struct TunnelServer {
    pub(crate) registry: TunnelRegistry,
    db: RelayDatabase,
    pub(crate) dispatcher: Arc<EdgeJobDispatcher>,
    pub(crate) config: TunnelServerConfig,
    slots: Arc<Semaphore>,
}

impl TunnelServer {
    pub fn new(
        registry: TunnelRegistry,
        db: RelayDatabase,
        dispatcher: Arc<EdgeJobDispatcher>,
        config: TunnelServerConfig,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_tunnels));
        Self {
            registry,
            db,
            dispatcher,
            config,
            slots,
        }
    }

    /// Accept agent connections until `shutdown` flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        info!(addr = %listener.local_addr()?, max_tunnels = self.config.max_tunnels, "Tunnel server listening");

        let sweep = tokio::spawn(Arc::clone(&self).idle_sweep(shutdown.clone()));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept agent connection");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer, shutdown).await {
                            debug!(peer = %peer, error = %e, "Agent connection ended with error");
                        }
                    });
                }
                _ = shutdown.changed() => break,
            }
        }

        sweep.abort();
        info!("Tunnel server stopped");
        Ok(())
    }

    /// Close active tunnels with no traffic within the idle timeout.
    pub fn sweep_idle(&self) -> usize {
        let Some(cutoff) = SystemTime::now().checked_sub(self.config.idle_timeout) else {
            return 0;
        };
        let mut closed = 0;
        for endpoint in self.registry.idle_since(cutoff) {
            let port = self.registry.details(endpoint).port;
            if self.registry.release(endpoint, port) {
                info!(endpoint_id = endpoint, port, "Idle tunnel closed");
                closed += 1;
            }
        }
        closed
    }

    async fn idle_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.check_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep_idle();
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    #[instrument(skip(self, stream, shutdown), fields(peer = %peer))]
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let mut framed = Framed::new(stream, FrameCodec::new());

        let first = match tokio::time::timeout(self.config.handshake_timeout, framed.next()).await
        {
            Ok(Some(frame)) => frame?,
            Ok(None) => return Err(TunnelError::Handshake("closed before handshake".into())),
            Err(_) => {
                reject(&mut framed, ErrorCode::BadHandshake, "handshake timed out").await;
                return Err(TunnelError::Handshake("timed out".into()));
            }
        };

        match first.payload {
            Some(Payload::Checkin(request)) => self.handle_checkin(&mut framed, request).await,
            Some(Payload::Connect(request)) => {
                self.handle_connect(framed, request, shutdown).await
            }
            _ => {
                reject(&mut framed, ErrorCode::BadHandshake, "expected checkin or connect").await;
                Err(TunnelError::Handshake(format!(
                    "unexpected first frame type {}",
                    first.frame_type
                )))
            }
        }
    }

    async fn handle_checkin(
        &self,
        framed: &mut FramedConn,
        request: CheckinRequest,
    ) -> Result<(), TunnelError> {
        let endpoint_id = request.endpoint_id;
        let endpoint = match self.db.get_endpoint(endpoint_id).await {
            Ok(endpoint) if endpoint.kind().is_some_and(|k| k.is_edge()) => endpoint,
            Ok(_) | Err(DatabaseError::NotFound(_)) => {
                reject(framed, ErrorCode::Unauthorized, "unauthorized").await;
                return Err(TunnelError::Unauthorized);
            }
            Err(e) => {
                reject(framed, ErrorCode::Internal, "internal error").await;
                return Err(e.into());
            }
        };

        if request.edge_id.is_empty() {
            reject(framed, ErrorCode::Unauthorized, "missing edge id").await;
            return Err(TunnelError::Unauthorized);
        }
        match self.db.record_checkin(endpoint_id, &request.edge_id).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(endpoint_id, edge_id = %request.edge_id, "Check-in from a different edge");
                reject(framed, ErrorCode::Unauthorized, "unauthorized").await;
                return Err(TunnelError::Unauthorized);
            }
            Err(e) => {
                reject(framed, ErrorCode::Internal, "internal error").await;
                return Err(e.into());
            }
        }

        let details = self.registry.details(endpoint_id);
        let checkin_interval_secs = u32::try_from(endpoint.checkin_interval_secs)
            .ok()
            .filter(|secs| *secs > 0)
            .unwrap_or(self.config.checkin_interval_secs);
        let schedules = self.dispatcher.schedules_for(endpoint_id).await;

        debug!(
            endpoint_id,
            status = %details.status,
            schedules = schedules.len(),
            "Agent checked in"
        );

        let response = CheckinResponse {
            status: TunnelState::from(details.status) as i32,
            port: u32::from(details.port),
            credentials: if details.status == TunnelStatus::Required {
                details.credentials
            } else {
                String::new()
            },
            checkin_interval_secs,
            schedules,
        };
        framed.send(TunnelFrame::checkin_response(response)).await?;
        Ok(())
    }

    async fn handle_connect(
        self: Arc<Self>,
        mut framed: FramedConn,
        request: ConnectRequest,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let endpoint_id = request.endpoint_id;

        if !self
            .registry
            .verify_credentials(endpoint_id, &request.credentials)
        {
            warn!(endpoint_id, "Tunnel connect rejected");
            reject(&mut framed, ErrorCode::Unauthorized, "unauthorized").await;
            return Err(TunnelError::Unauthorized);
        }

        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            let max = self.config.max_tunnels;
            warn!(endpoint_id, max_tunnels = max, "Tunnel capacity exceeded");
            reject(&mut framed, ErrorCode::CapacityExceeded, "tunnel capacity exceeded").await;
            return Err(TunnelError::CapacityExceeded { max });
        };

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        if !self.registry.activate(endpoint_id, port) {
            reject(&mut framed, ErrorCode::Unauthorized, "unauthorized").await;
            return Err(TunnelError::Unauthorized);
        }
        let active = ActiveTunnel::new(self.registry.clone(), endpoint_id, port, permit);

        framed.send(TunnelFrame::connected(port)).await?;

        Session::new(self, active).run(framed, listener, shutdown).await
    }
}

/// Best effort: tell the agent why before dropping the connection.
async fn reject(framed: &mut FramedConn, code: ErrorCode, message: &str) {
    if let Err(e) = framed.send(TunnelFrame::error(code, message)).await {
        debug!(error = %e, "Failed to send error frame");
    }
}
