//! Recognition backend interface
//!
//! The gateway treats speech recognition as an opaque streaming service:
//! open an utterance with a negotiated sample format, push binary PCM at
//! it, end the utterance, and consume a stream of partial/final text
//! updates. The concrete client (cloud API, local model, test double)
//! lives behind this trait.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::warn;

use crate::errors::GatewayResult;

/// Negotiated PCM format for one utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits: u16,
    pub channels: u16,
}

/// One text update from the backend. Non-final updates are best-effort
/// live captions; final updates close the utterance's transcript.
#[derive(Debug, Clone)]
pub struct TranscriptUpdate {
    pub text: String,
    pub is_final: bool,
}

/// Opaque streaming recognition service.
#[async_trait]
pub trait AsrBackend: Send + Sync {
    /// Open an utterance and return the update stream for it.
    async fn open_utterance(
        &self,
        session_id: &str,
        format: AudioFormat,
    ) -> GatewayResult<mpsc::Receiver<TranscriptUpdate>>;

    /// Push one chunk of binary PCM into the utterance.
    async fn push_audio(&self, session_id: &str, audio: Bytes) -> GatewayResult<()>;

    /// Signal end-of-utterance; the backend should flush its final text.
    async fn end_utterance(&self, session_id: &str) -> GatewayResult<()>;
}

/// Backend used when no recognition service is configured: accepts all
/// input and never produces a transcript, so every session runs into the
/// finalize timeout and the device gets the error notification instead
/// of hanging.
pub struct DisabledAsrBackend;

#[async_trait]
impl AsrBackend for DisabledAsrBackend {
    async fn open_utterance(
        &self,
        session_id: &str,
        _format: AudioFormat,
    ) -> GatewayResult<mpsc::Receiver<TranscriptUpdate>> {
        warn!(
            session_id = %session_id,
            "no recognition backend configured, session will produce no transcript"
        );
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn push_audio(&self, _session_id: &str, _audio: Bytes) -> GatewayResult<()> {
        Ok(())
    }

    async fn end_utterance(&self, _session_id: &str) -> GatewayResult<()> {
        Ok(())
    }
}
