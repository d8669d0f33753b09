//! Stream multiplexing shared by both ends of a tunnel.
//!
//! Each local TCP connection is bridged to one tunnel stream by a pump task.
//! A stream closes in two steps: each side sends EOF once its local reader
//! is exhausted and the pump ends when both directions are done. CLOSE and
//! inbound overflow tear the stream down at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{debug, warn};

use crate::TunnelFrame;

/// Inbound chunks buffered per stream before it is reset.
pub const STREAM_BUFFER: usize = 64;
/// Frames queued for the tunnel writer.
pub const OUTBOUND_BUFFER: usize = 256;
const READ_CHUNK: usize = 16 * 1024;

/// Called whenever a stream carries traffic.
pub type Activity = Arc<dyn Fn() + Send + Sync>;

struct StreamHandle {
    /// `None` once the peer has sent EOF.
    inbound: Option<mpsc::Sender<Vec<u8>>>,
    pump: AbortHandle,
}

type StreamTable = Arc<Mutex<HashMap<u64, StreamHandle>>>;

/// What happened to an inbound DATA frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// No open stream with that id accepts data.
    Unknown,
    /// The stream's buffer was full; it has been reset.
    Reset,
}

/// Open streams of one tunnel connection.
pub struct StreamMux {
    streams: StreamTable,
    pumps: JoinSet<()>,
    out_tx: mpsc::Sender<TunnelFrame>,
    activity: Activity,
}

impl StreamMux {
    pub fn new(out_tx: mpsc::Sender<TunnelFrame>, activity: Activity) -> Self {
        Self {
            streams: Arc::new(Mutex::new(HashMap::new())),
            pumps: JoinSet::new(),
            out_tx,
            activity,
        }
    }

    /// Start pumping `conn` as `stream_id`.
    pub fn open(&mut self, stream_id: u64, conn: TcpStream) {
        while self.pumps.try_join_next().is_some() {}

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let mut streams = lock(&self.streams);
        let pump = self.pumps.spawn(pump_stream(
            stream_id,
            conn,
            rx,
            self.out_tx.clone(),
            Arc::clone(&self.streams),
            Arc::clone(&self.activity),
        ));
        if let Some(previous) = streams.insert(
            stream_id,
            StreamHandle {
                inbound: Some(tx),
                pump,
            },
        ) {
            previous.pump.abort();
        }
    }

    /// Queue peer data for the local connection without waiting.
    ///
    /// A stream that cannot take the data is reset and the peer gets CLOSE.
    pub async fn deliver(&self, stream_id: u64, data: Vec<u8>) -> Delivery {
        let sender = lock(&self.streams)
            .get(&stream_id)
            .and_then(|s| s.inbound.clone());
        let Some(sender) = sender else {
            return Delivery::Unknown;
        };

        match sender.try_send(data) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(stream_id, "Stream buffer full, resetting stream");
                self.reset(stream_id);
                let _ = self.out_tx.send(TunnelFrame::close(stream_id)).await;
                Delivery::Reset
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.reset(stream_id);
                Delivery::Unknown
            }
        }
    }

    /// Peer EOF: flush what is buffered, then shut down the local write side.
    pub fn finish(&self, stream_id: u64) {
        if let Some(stream) = lock(&self.streams).get_mut(&stream_id) {
            stream.inbound = None;
        }
    }

    /// Peer CLOSE: drop the stream in both directions.
    pub fn reset(&self, stream_id: u64) {
        if let Some(stream) = lock(&self.streams).remove(&stream_id) {
            stream.pump.abort();
            debug!(stream_id, "Stream reset");
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.streams).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Abort every pump.
    pub async fn shutdown(&mut self) {
        lock(&self.streams).clear();
        self.pumps.shutdown().await;
    }
}

fn lock(streams: &StreamTable) -> MutexGuard<'_, HashMap<u64, StreamHandle>> {
    streams.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Copy bytes between one local connection and its tunnel stream.
async fn pump_stream(
    stream_id: u64,
    conn: TcpStream,
    inbound: mpsc::Receiver<Vec<u8>>,
    out_tx: mpsc::Sender<TunnelFrame>,
    streams: StreamTable,
    activity: Activity,
) {
    let (reader, writer) = conn.into_split();
    let upstream = read_local(stream_id, reader, &out_tx, &activity);
    let downstream = write_local(writer, inbound);
    tokio::pin!(upstream, downstream);

    let (mut reading, mut writing) = (true, true);
    let clean = loop {
        tokio::select! {
            ok = &mut upstream, if reading => {
                if !ok {
                    break false;
                }
                reading = false;
            }
            ok = &mut downstream, if writing => {
                if !ok {
                    break false;
                }
                writing = false;
            }
        }
        if !reading && !writing {
            break true;
        }
    };

    lock(&streams).remove(&stream_id);
    if !clean {
        let _ = out_tx.send(TunnelFrame::close(stream_id)).await;
    }
    debug!(stream_id, clean, "Stream closed");
}

/// Local connection to tunnel; ends with EOF once the local reader is done.
async fn read_local(
    stream_id: u64,
    mut reader: OwnedReadHalf,
    out_tx: &mpsc::Sender<TunnelFrame>,
    activity: &Activity,
) -> bool {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return out_tx.send(TunnelFrame::eof(stream_id)).await.is_ok(),
            Ok(n) => {
                activity();
                let frame = TunnelFrame::stream_data(stream_id, buf[..n].to_vec());
                if out_tx.send(frame).await.is_err() {
                    return false;
                }
            }
            Err(_) => return false,
        }
    }
}

/// Tunnel to local connection; a closed channel means peer EOF.
async fn write_local(mut writer: OwnedWriteHalf, mut inbound: mpsc::Receiver<Vec<u8>>) -> bool {
    while let Some(data) = inbound.recv().await {
        if writer.write_all(&data).await.is_err() {
            return false;
        }
    }
    let _ = writer.shutdown().await;
    true
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::FrameType;

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    fn mux() -> (StreamMux, mpsc::Receiver<TunnelFrame>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        (StreamMux::new(tx, Arc::new(|| {})), rx)
    }

    async fn next_frame(rx: &mut mpsc::Receiver<TunnelFrame>) -> TunnelFrame {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("frame in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn local_eof_half_closes_and_keeps_receiving() {
        let (mut mux, mut frames) = mux();
        let (mut local, pumped) = connected_pair().await;
        mux.open(1, pumped);

        local.write_all(b"request").await.unwrap();
        local.shutdown().await.unwrap();

        let data = next_frame(&mut frames).await;
        assert_eq!(data.frame_type(), FrameType::Data);
        assert_eq!(data.data, b"request");
        let eof = next_frame(&mut frames).await;
        assert_eq!(eof.frame_type(), FrameType::Eof);
        assert_eq!(eof.stream_id, 1);

        assert_eq!(mux.deliver(1, b"reply".to_vec()).await, Delivery::Queued);
        mux.finish(1);

        let mut reply = Vec::new();
        local.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"reply");

        tokio::time::timeout(Duration::from_secs(5), async {
            while !mux.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stream released");
        assert!(frames.try_recv().is_err(), "clean close sends no CLOSE");
    }

    #[tokio::test]
    async fn full_stream_is_reset_without_blocking() {
        let (mut mux, mut frames) = mux();
        let (_local, pumped) = connected_pair().await;
        mux.open(1, pumped);
        let (_other_local, other_pumped) = connected_pair().await;
        mux.open(2, other_pumped);

        // Nobody reads `_local`, so the pump eventually stops draining.
        let chunk = vec![0u8; READ_CHUNK];
        let reset = tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match mux.deliver(1, chunk.clone()).await {
                    Delivery::Queued => {}
                    other => break other,
                }
            }
        })
        .await
        .expect("deliver never blocks");
        assert_eq!(reset, Delivery::Reset);

        let close = next_frame(&mut frames).await;
        assert_eq!(close.frame_type(), FrameType::Close);
        assert_eq!(close.stream_id, 1);

        assert_eq!(mux.deliver(1, b"late".to_vec()).await, Delivery::Unknown);
        assert_eq!(mux.deliver(2, b"ok".to_vec()).await, Delivery::Queued);
        assert_eq!(mux.len(), 1);
    }

    #[tokio::test]
    async fn reset_closes_local_connection() {
        let (mut mux, _frames) = mux();
        let (mut local, pumped) = connected_pair().await;
        mux.open(7, pumped);

        mux.reset(7);
        assert!(mux.is_empty());

        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), local.read(&mut buf))
            .await
            .expect("local side notified");
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn unknown_stream_data_is_reported() {
        let (mux, _frames) = mux();
        assert_eq!(mux.deliver(42, b"x".to_vec()).await, Delivery::Unknown);
    }
}
