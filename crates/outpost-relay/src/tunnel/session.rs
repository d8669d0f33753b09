//! An established tunnel: loopback listener plus stream multiplexing.

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, mpsc, watch};
use tracing::{debug, info, warn};

use outpost_proto::stream::OUTBOUND_BUFFER;
use outpost_proto::tunnel_frame::Payload;
use outpost_proto::{Delivery, FrameType, StreamMux, TunnelFrame};

use super::error::TunnelError;
use super::server::{FramedConn, TunnelServer};
use crate::registry::{EndpointId, TunnelRegistry, TunnelStatus};

/// Holds a tunnel slot and returns the registry entry to IDLE when dropped,
/// whichever way the session ends.
pub(crate) struct ActiveTunnel {
    registry: TunnelRegistry,
    endpoint: EndpointId,
    port: u16,
    _permit: OwnedSemaphorePermit,
}

impl ActiveTunnel {
    pub(crate) const fn new(
        registry: TunnelRegistry,
        endpoint: EndpointId,
        port: u16,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            registry,
            endpoint,
            port,
            _permit: permit,
        }
    }

    fn still_active(&self) -> bool {
        let details = self.registry.details(self.endpoint);
        details.status == TunnelStatus::Active && details.port == self.port
    }
}

impl Drop for ActiveTunnel {
    fn drop(&mut self) {
        self.registry.release(self.endpoint, self.port);
    }
}

pub(crate) struct Session {
    server: Arc<TunnelServer>,
    tunnel: ActiveTunnel,
    next_stream_id: u64,
}

impl Session {
    pub(crate) const fn new(server: Arc<TunnelServer>, tunnel: ActiveTunnel) -> Self {
        Self {
            server,
            tunnel,
            next_stream_id: 1,
        }
    }

    pub(crate) async fn run(
        mut self,
        framed: FramedConn,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TunnelError> {
        let endpoint = self.tunnel.endpoint;
        let (mut sink, mut frames) = framed.split();
        let (out_tx, mut out_rx) = mpsc::channel::<TunnelFrame>(OUTBOUND_BUFFER);

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let registry = self.server.registry.clone();
        let mut streams = StreamMux::new(
            out_tx.clone(),
            Arc::new(move || {
                registry.touch(endpoint);
            }),
        );
        let mut check = tokio::time::interval(self.server.config.check_interval());
        check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((conn, _)) => self.open_stream(conn, &out_tx, &mut streams).await,
                    Err(e) => warn!(endpoint_id = endpoint, error = %e, "Tunnel port accept failed"),
                },
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => self.handle_frame(frame, &out_tx, &streams).await,
                    Some(Err(e)) => break format!("frame error: {e}"),
                    None => break "agent disconnected".to_string(),
                },
                _ = check.tick() => {
                    if !self.tunnel.still_active() {
                        break "released".to_string();
                    }
                }
                _ = &mut writer => break "write side closed".to_string(),
                _ = shutdown.changed() => break "server shutdown".to_string(),
            }
        };

        streams.shutdown().await;
        writer.abort();
        info!(endpoint_id = endpoint, port = self.tunnel.port, reason = %reason, "Tunnel closed");
        Ok(())
    }

    async fn open_stream(
        &mut self,
        conn: TcpStream,
        out_tx: &mpsc::Sender<TunnelFrame>,
        streams: &mut StreamMux,
    ) {
        let stream_id = self.next_stream_id;
        self.next_stream_id += 1;
        self.server.registry.touch(self.tunnel.endpoint);

        if out_tx.send(TunnelFrame::open(stream_id)).await.is_err() {
            return;
        }
        streams.open(stream_id, conn);
        debug!(endpoint_id = self.tunnel.endpoint, stream_id, "Stream opened");
    }

    async fn handle_frame(
        &self,
        frame: TunnelFrame,
        out_tx: &mpsc::Sender<TunnelFrame>,
        streams: &StreamMux,
    ) {
        let endpoint = self.tunnel.endpoint;
        match frame.frame_type() {
            FrameType::Data => {
                if streams.deliver(frame.stream_id, frame.data).await == Delivery::Queued {
                    self.server.registry.touch(endpoint);
                }
            }
            FrameType::Eof => streams.finish(frame.stream_id),
            FrameType::Close => streams.reset(frame.stream_id),
            FrameType::Ping => {
                let _ = out_tx.send(TunnelFrame::pong()).await;
            }
            FrameType::Logs => {
                if let Some(Payload::Logs(logs)) = frame.payload {
                    if let Err(e) = self
                        .server
                        .dispatcher
                        .store_log(logs.job_id, endpoint, &logs.data)
                        .await
                    {
                        warn!(endpoint_id = endpoint, job_id = logs.job_id, error = %e, "Rejected job logs");
                    }
                }
            }
            other => {
                debug!(endpoint_id = endpoint, frame_type = ?other, "Ignoring frame");
            }
        }
    }
}
