//! Live connection handles
//!
//! A `Connection` is the typed owner of everything that used to be an
//! ad-hoc property of a raw socket: the outbound frame channel, the
//! liveness flags, the buffered-byte gauge, and the background tasks
//! (heartbeat timer, TTS chain worker) bound to this socket's lifetime.
//!
//! The actual WebSocket sink lives in a writer task owned by the
//! handler; this handle only talks to it through the bounded channel.
//! The gauge counts bytes enqueued minus bytes flushed by the writer and
//! stands in for the kernel send buffer as the transport-side congestion
//! signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use super::device::now_ms;
use crate::errors::{GatewayError, GatewayResult};
use crate::router::frames::OutboundFrame;

/// Outbound channel capacity per connection.
const OUTBOUND_CAPACITY: usize = 256;

/// One serialized frame handed to the writer task. `cost` is the byte
/// count the writer subtracts from the gauge after flushing.
pub struct WireMessage {
    pub payload: String,
    pub cost: usize,
}

/// Handle to one live socket.
pub struct Connection {
    conn_id: String,
    remote_addr: Option<String>,
    outbound_tx: Mutex<Option<mpsc::Sender<WireMessage>>>,
    buffered: Arc<AtomicUsize>,
    open: AtomicBool,
    last_pong_ms: AtomicU64,
    /// Heartbeat timer and TTS chain worker; aborted on shutdown.
    tasks: Mutex<Vec<JoinHandle<()>>>,
    tts_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl Connection {
    /// Create a handle plus the receiving half for the writer task and a
    /// clone of the buffered-byte gauge the writer decrements.
    pub fn channel(
        remote_addr: Option<String>,
    ) -> (Arc<Self>, mpsc::Receiver<WireMessage>, Arc<AtomicUsize>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let buffered = Arc::new(AtomicUsize::new(0));
        let connection = Arc::new(Self {
            conn_id: Uuid::new_v4().to_string(),
            remote_addr,
            outbound_tx: Mutex::new(Some(tx)),
            buffered: buffered.clone(),
            open: AtomicBool::new(true),
            last_pong_ms: AtomicU64::new(now_ms()),
            tasks: Mutex::new(Vec::new()),
            tts_tx: Mutex::new(None),
        });
        (connection, rx, buffered)
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Bytes enqueued for this socket but not yet flushed by the writer.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Refresh the liveness pong timestamp.
    pub fn mark_pong(&self) {
        self.last_pong_ms.store(now_ms(), Ordering::Release);
    }

    /// Age of the last liveness pong in milliseconds.
    pub fn pong_age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_pong_ms.load(Ordering::Acquire))
    }

    /// Serialize and enqueue one frame for transmission.
    pub async fn send(&self, frame: &OutboundFrame) -> GatewayResult<()> {
        if !self.is_open() {
            return Err(GatewayError::ConnectionClosed(self.conn_id.clone()));
        }
        let payload = frame.to_wire()?;
        let cost = payload.len();

        let tx = self
            .outbound_tx
            .lock()
            .clone()
            .ok_or_else(|| GatewayError::ConnectionClosed(self.conn_id.clone()))?;

        self.buffered.fetch_add(cost, Ordering::AcqRel);
        if tx.send(WireMessage { payload, cost }).await.is_err() {
            self.buffered.fetch_sub(cost, Ordering::AcqRel);
            self.open.store(false, Ordering::Release);
            return Err(GatewayError::ConnectionClosed(self.conn_id.clone()));
        }
        Ok(())
    }

    /// Attach a background task bound to this connection's lifetime.
    pub fn attach_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Install the per-device TTS chain sender.
    pub fn set_tts_sender(&self, tx: mpsc::Sender<Bytes>) {
        *self.tts_tx.lock() = Some(tx);
    }

    /// The TTS chain sender, if a chain worker is bound.
    pub fn tts_sender(&self) -> Option<mpsc::Sender<Bytes>> {
        self.tts_tx.lock().clone()
    }

    /// Tear the connection down: cancel the heartbeat and chain tasks
    /// first, then close the outbound channel so the writer task drains
    /// and shuts the socket. Idempotent.
    pub fn shutdown(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.tts_tx.lock() = None;
        *self.outbound_tx.lock() = None;
        debug!(conn_id = %self.conn_id, "connection shut down");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::frames::OutboundFrame;

    #[tokio::test]
    async fn test_send_tracks_buffered_bytes() {
        let (conn, mut rx, gauge) = Connection::channel(None);

        conn.send(&OutboundFrame::HeartbeatRequest { timestamp: 1 })
            .await
            .unwrap();
        assert!(conn.buffered_bytes() > 0);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.cost, msg.payload.len());
        gauge.fetch_sub(msg.cost, Ordering::AcqRel);
        assert_eq!(conn.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (conn, _rx, _gauge) = Connection::channel(None);
        conn.shutdown();
        let err = conn
            .send(&OutboundFrame::HeartbeatRequest { timestamp: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::ConnectionClosed(_)));
    }

    #[tokio::test]
    async fn test_shutdown_closes_writer_channel() {
        let (conn, mut rx, _gauge) = Connection::channel(None);
        conn.shutdown();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (conn, _rx, _gauge) = Connection::channel(None);
        conn.shutdown();
        conn.shutdown();
        assert!(!conn.is_open());
    }
}
