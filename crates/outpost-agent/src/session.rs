//! Agent side of an open tunnel: forwards each stream to the local target.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use outpost_proto::stream::OUTBOUND_BUFFER;
use outpost_proto::tunnel_frame::Payload;
use outpost_proto::{FrameType, StreamMux, TunnelFrame};

use crate::client::{FramedConn, rejected};
use crate::error::AgentError;

pub(crate) struct Session {
    target_addr: String,
    heartbeat: Duration,
}

impl Session {
    pub(crate) const fn new(target_addr: String, heartbeat: Duration) -> Self {
        Self {
            target_addr,
            heartbeat,
        }
    }

    /// Serve the tunnel, sending `initial` frames first.
    pub(crate) async fn run(
        self,
        framed: FramedConn,
        initial: Vec<TunnelFrame>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), AgentError> {
        let (mut sink, mut frames) = framed.split();
        let (out_tx, mut out_rx) = mpsc::channel::<TunnelFrame>(OUTBOUND_BUFFER);

        let mut writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        for frame in initial {
            if out_tx.send(frame).await.is_err() {
                break;
            }
        }

        let mut streams = StreamMux::new(out_tx.clone(), Arc::new(|| {}));
        let start = tokio::time::Instant::now() + self.heartbeat;
        let mut heartbeat = tokio::time::interval_at(start, self.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let result = loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        if let Err(e) = self.handle_frame(frame, &out_tx, &mut streams).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
                _ = heartbeat.tick() => {
                    if out_tx.send(TunnelFrame::ping()).await.is_err() {
                        break Ok(());
                    }
                }
                _ = &mut writer => break Ok(()),
                _ = shutdown.changed() => break Ok(()),
            }
        };

        streams.shutdown().await;
        writer.abort();
        result
    }

    async fn handle_frame(
        &self,
        frame: TunnelFrame,
        out_tx: &mpsc::Sender<TunnelFrame>,
        streams: &mut StreamMux,
    ) -> Result<(), AgentError> {
        match frame.frame_type() {
            FrameType::Open => self.open_stream(frame.stream_id, out_tx, streams).await,
            FrameType::Data => {
                streams.deliver(frame.stream_id, frame.data).await;
            }
            FrameType::Eof => streams.finish(frame.stream_id),
            FrameType::Close => streams.reset(frame.stream_id),
            FrameType::Pong => {}
            FrameType::Error => {
                if let Some(Payload::Error(error)) = frame.payload {
                    return Err(rejected(error));
                }
                return Err(AgentError::Protocol("error frame without payload".into()));
            }
            other => debug!(frame_type = ?other, "Ignoring frame"),
        }
        Ok(())
    }

    async fn open_stream(
        &self,
        stream_id: u64,
        out_tx: &mpsc::Sender<TunnelFrame>,
        streams: &mut StreamMux,
    ) {
        match TcpStream::connect(&self.target_addr).await {
            Ok(conn) => {
                streams.open(stream_id, conn);
                debug!(stream_id, "Stream opened");
            }
            Err(e) => {
                warn!(stream_id, target = %self.target_addr, error = %e, "Target unreachable");
                let _ = out_tx.send(TunnelFrame::close(stream_id)).await;
            }
        }
    }
}
