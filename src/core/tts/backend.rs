//! Synthesis backend interface
//!
//! Speech synthesis is an opaque streaming service: hand it text, get a
//! stream of audio chunks back. The chunks flow through the
//! backpressure sender; this trait never touches the socket itself.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::GatewayResult;

/// Opaque streaming synthesis service.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize `text` and return the audio chunk stream.
    async fn synthesize(&self, text: &str) -> GatewayResult<mpsc::Receiver<Bytes>>;
}

/// Backend used when no synthesis service is configured: produces no
/// audio, so replies stay text-only.
pub struct SilentTtsBackend;

#[async_trait]
impl TtsBackend for SilentTtsBackend {
    async fn synthesize(&self, _text: &str) -> GatewayResult<mpsc::Receiver<Bytes>> {
        warn!("no synthesis backend configured, reply will not be spoken");
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }
}
