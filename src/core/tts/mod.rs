//! TTS backpressure sender
//!
//! Synthesized audio is delivered through one serialized chain per
//! device, so chunks always reach the socket in submission order even
//! though every send is asynchronous. Before each send the chain waits
//! while either congestion signal is high:
//!
//! - the client-reported playback queue depth (from the most recent
//!   `tts_queue_status` frame, trusted only within a staleness window);
//! - the connection's outbound buffered-byte gauge.
//!
//! The wait polls at a fixed cadence and releases as soon as both
//! signals drop to their low watermarks, or unconditionally once the
//! maximum wait elapses, so a dead signal can never stall the chain
//! forever. A short fixed pause before transmit smooths spikes while
//! the buffer is still draining.

pub mod backend;

use std::sync::{Arc, Weak};
use std::time::Instant;

use base64::Engine;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use backend::{SilentTtsBackend, TtsBackend};

use crate::config::GatewayConfig;
use crate::core::registry::{Connection, DeviceRegistry};
use crate::errors::{GatewayError, GatewayResult};
use crate::router::frames::{OutboundFrame, TtsQueueStatusParams};

/// Chain channel capacity per device.
const CHAIN_CAPACITY: usize = 64;

/// Last client-reported playback queue state for one device.
#[derive(Debug, Clone)]
struct StatusSample {
    queue_len: u32,
    playing: bool,
    active_sources: u32,
    received_at: Instant,
}

/// Per-device serialized audio delivery with dual-signal flow control.
pub struct TtsSender {
    statuses: DashMap<String, StatusSample>,
    registry: Arc<DeviceRegistry>,
    config: Arc<GatewayConfig>,
    me: Weak<TtsSender>,
}

impl TtsSender {
    pub fn new(registry: Arc<DeviceRegistry>, config: Arc<GatewayConfig>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            statuses: DashMap::new(),
            registry,
            config,
            me: me.clone(),
        })
    }

    /// Record a `tts_queue_status` report.
    pub fn record_status(&self, device_id: &str, status: &TtsQueueStatusParams) {
        self.statuses.insert(
            device_id.to_string(),
            StatusSample {
                queue_len: status.queue_len,
                playing: status.playing,
                active_sources: status.active_sources,
                received_at: Instant::now(),
            },
        );
    }

    /// The client-reported queue depth, if a fresh report exists.
    pub fn client_queue_len(&self, device_id: &str) -> Option<u32> {
        let sample = self.statuses.get(device_id)?;
        if sample.received_at.elapsed() > self.config.tts.status_staleness() {
            return None;
        }
        Some(sample.queue_len)
    }

    /// Whether the client reports active playback (fresh reports only).
    pub fn client_playing(&self, device_id: &str) -> bool {
        self.statuses
            .get(device_id)
            .filter(|s| s.received_at.elapsed() <= self.config.tts.status_staleness())
            .map(|s| s.playing || s.active_sources > 0)
            .unwrap_or(false)
    }

    /// Attach the serialized chain worker to a freshly bound connection.
    pub fn bind_connection(&self, device_id: &str, conn: &Arc<Connection>) {
        let (tx, mut rx) = mpsc::channel::<Bytes>(CHAIN_CAPACITY);
        conn.set_tts_sender(tx);

        let sender = self.me.upgrade().expect("tts sender still referenced");
        let device_id = device_id.to_string();
        let worker_conn = conn.clone();
        let handle = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                sender.wait_for_clearance(&device_id, &worker_conn).await;
                let frame = OutboundFrame::TtsChunk {
                    data: base64::engine::general_purpose::STANDARD.encode(&chunk),
                };
                match worker_conn.send(&frame).await {
                    Ok(()) => sender.registry.record_message_sent(&device_id),
                    Err(e) => {
                        // One failed chunk never breaks the chain for
                        // the ones behind it.
                        warn!(device_id = %device_id, error = %e, "tts chunk send failed");
                        sender.registry.record_error(&device_id);
                    }
                }
            }
        });
        conn.attach_task(handle);
    }

    /// Submit one audio chunk onto the device's chain.
    pub async fn send_audio_chunk(&self, device_id: &str, chunk: Bytes) -> GatewayResult<()> {
        let conn = self
            .registry
            .connection(device_id)
            .ok_or_else(|| GatewayError::UnknownDevice(device_id.to_string()))?;
        let tx = conn
            .tts_sender()
            .ok_or_else(|| GatewayError::ConnectionClosed(device_id.to_string()))?;
        tx.send(chunk)
            .await
            .map_err(|_| GatewayError::ConnectionClosed(device_id.to_string()))
    }

    /// Block until both congestion signals clear, or the maximum wait
    /// elapses.
    async fn wait_for_clearance(&self, device_id: &str, conn: &Connection) {
        let settings = &self.config.tts;
        let started = Instant::now();

        let queue_high = self
            .client_queue_len(device_id)
            .is_some_and(|q| q >= settings.queue_high_water);
        let buffer_high = conn.buffered_bytes() >= settings.buffer_high_water;

        if queue_high || buffer_high {
            debug!(
                device_id = %device_id,
                queue_high,
                buffer_high,
                buffered = conn.buffered_bytes(),
                "backpressure engaged"
            );
            loop {
                if started.elapsed() >= settings.max_wait() {
                    debug!(device_id = %device_id, "backpressure max wait reached, forcing progress");
                    break;
                }
                tokio::time::sleep(settings.poll_interval()).await;
                // Stale reports stop counting against the client.
                let queue = self.client_queue_len(device_id).unwrap_or(0);
                let buffered = conn.buffered_bytes();
                if queue <= settings.queue_low_water && buffered <= settings.buffer_low_water {
                    break;
                }
            }
        }

        if conn.buffered_bytes() > settings.buffer_low_water {
            tokio::time::sleep(settings.spike_pause()).await;
        }
    }
}
