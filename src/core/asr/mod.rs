//! ASR session manager
//!
//! One state machine per active recognition utterance:
//! `Idle -> Started -> Receiving -> Stopped -> FinalizeWait -> Closed`.
//!
//! Chunked audio is normalized and forwarded to the recognition backend
//! while voice activity lasts; two consecutive `ending` VAD chunks end
//! the utterance early rather than waiting for the explicit stop frame.
//! After the end of an utterance a bounded finalize-wait polls for the
//! backend's final text; success pushes an `asr_final` frame and invokes
//! the reply pipeline, timeout sends an error notification so the device
//! never hangs. A background sweep reaps sessions abandoned by dropped
//! connections.

pub mod audio;
pub mod backend;
pub mod recording;
pub mod session;
#[cfg(test)]
mod tests;
pub mod transcript;

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use audio::decode_audio_payload;
pub use backend::{AsrBackend, AudioFormat, DisabledAsrBackend, TranscriptUpdate};
pub use session::AsrSession;
pub use transcript::reconcile;

use crate::config::GatewayConfig;
use crate::core::registry::DeviceRegistry;
use crate::errors::{GatewayError, GatewayResult};
use crate::pipeline::AiResponder;
use crate::router::frames::{
    AsrAudioChunkParams, AsrSessionStartParams, AsrSessionStopParams, OutboundFrame, VadState,
};
use recording::WavRecorder;

/// Session tables plus the recognition backend and reply hookup.
pub struct AsrSessionManager {
    sessions: DashMap<String, Arc<Mutex<AsrSession>>>,
    /// Device id -> its currently active session id.
    active_by_device: DashMap<String, String>,
    recorders: DashMap<String, Mutex<WavRecorder>>,
    backend: Arc<dyn AsrBackend>,
    responder: Arc<AiResponder>,
    registry: Arc<DeviceRegistry>,
    config: Arc<GatewayConfig>,
    me: Weak<AsrSessionManager>,
}

impl AsrSessionManager {
    pub fn new(
        backend: Arc<dyn AsrBackend>,
        responder: Arc<AiResponder>,
        registry: Arc<DeviceRegistry>,
        config: Arc<GatewayConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            sessions: DashMap::new(),
            active_by_device: DashMap::new(),
            recorders: DashMap::new(),
            backend,
            responder,
            registry,
            config,
            me: me.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.me.upgrade().expect("session manager still referenced")
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// The device's active session id, if one is open.
    pub fn active_session_id(&self, device_id: &str) -> Option<String> {
        self.active_by_device.get(device_id).map(|entry| entry.value().clone())
    }

    /// Handle `asr_session_start`.
    ///
    /// A still-open prior session on the same device is ended first
    /// (best-effort, short grace delay) so one backend connection never
    /// carries two concurrent utterances.
    pub async fn start_session(
        &self,
        device_id: &str,
        params: &AsrSessionStartParams,
    ) -> GatewayResult<()> {
        if let Some(prev_id) = self.active_session_id(device_id) {
            if prev_id != params.session_id {
                let still_open = self
                    .sessions
                    .get(&prev_id)
                    .map(|s| {
                        let mut prev = s.lock();
                        if prev.stopped {
                            false
                        } else {
                            prev.stopped = true;
                            true
                        }
                    })
                    .unwrap_or(false);
                if still_open {
                    warn!(
                        device_id = %device_id,
                        superseded = %prev_id,
                        new = %params.session_id,
                        "ending still-open session before starting a new one"
                    );
                    if let Err(e) = self.backend.end_utterance(&prev_id).await {
                        debug!(session_id = %prev_id, error = %e, "supersede end-utterance failed");
                    }
                    tokio::time::sleep(self.config.asr.supersede_grace()).await;
                }
                self.remove_session(&prev_id);
            }
        }

        let session = AsrSession::new(
            params.session_id.clone(),
            device_id.to_string(),
            params.sample_rate,
            params.bits,
            params.channels,
            params.session_number,
            self.config.asr.finalize_max_wait_ms,
        );
        let session = Arc::new(Mutex::new(session));
        self.sessions
            .insert(params.session_id.clone(), session.clone());
        self.active_by_device
            .insert(device_id.to_string(), params.session_id.clone());

        if self.config.recording.enabled {
            match WavRecorder::create(
                &self.config.recording.dir,
                device_id,
                &params.session_id,
                params.sample_rate,
                params.bits,
                params.channels,
            ) {
                Ok(recorder) => {
                    self.recorders
                        .insert(params.session_id.clone(), Mutex::new(recorder));
                }
                Err(e) => {
                    warn!(session_id = %params.session_id, error = %e, "recording disabled for session");
                }
            }
        }

        let format = AudioFormat {
            sample_rate: params.sample_rate,
            bits: params.bits,
            channels: params.channels,
        };
        match self.backend.open_utterance(&params.session_id, format).await {
            Ok(updates) => {
                session.lock().asr_started = true;
                self.spawn_update_pump(params.session_id.clone(), device_id.to_string(), updates);
                info!(
                    device_id = %device_id,
                    session_id = %params.session_id,
                    sample_rate = params.sample_rate,
                    session_number = params.session_number,
                    "recognition session started"
                );
            }
            Err(e) => {
                // The session stays; its finalize-wait will time out and
                // the device gets the error notification.
                warn!(
                    device_id = %device_id,
                    session_id = %params.session_id,
                    error = %e,
                    "recognition backend refused utterance"
                );
                self.registry.record_error(device_id);
            }
        }
        Ok(())
    }

    /// Handle `asr_audio_chunk`.
    pub async fn ingest_chunk(
        &self,
        device_id: &str,
        params: &AsrAudioChunkParams,
    ) -> GatewayResult<()> {
        let Some(session) = self.sessions.get(&params.session_id).map(|entry| entry.value().clone()) else {
            // Stale chunk from a closed session; common after reconnects.
            debug!(
                device_id = %device_id,
                session_id = %params.session_id,
                "chunk for unknown session, dropping"
            );
            return Ok(());
        };

        let Some((payload, hint)) = params.audio_payload() else {
            return Err(GatewayError::Protocol(
                "asr_audio_chunk missing audio data".into(),
            ));
        };
        let pcm = decode_audio_payload(payload, hint)?;

        self.ingest_pcm(device_id, &params.session_id, session, params.vad_state, pcm)
            .await
    }

    /// Handle a raw binary WebSocket frame: audio for the device's
    /// active session, voice activity assumed active.
    pub async fn ingest_binary(
        &self,
        device_id: &str,
        pcm: bytes::Bytes,
    ) -> GatewayResult<()> {
        let Some(session_id) = self.active_session_id(device_id) else {
            debug!(device_id = %device_id, "binary audio without active session, dropping");
            return Ok(());
        };
        let Some(session) = self.sessions.get(&session_id).map(|entry| entry.value().clone()) else {
            return Ok(());
        };
        self.ingest_pcm(device_id, &session_id, session, VadState::Active, pcm)
            .await
    }

    async fn ingest_pcm(
        &self,
        device_id: &str,
        session_id: &str,
        session: Arc<Mutex<AsrSession>>,
        vad_state: VadState,
        pcm: bytes::Bytes,
    ) -> GatewayResult<()> {
        let decision = session.lock().observe_chunk(
            vad_state,
            pcm.len(),
            self.config.asr.ending_run_threshold,
        );

        if decision.forward {
            if let Some(recorder) = self.recorders.get(session_id) {
                recorder.lock().write_pcm(&pcm);
            }
            if let Err(e) = self.backend.push_audio(session_id, pcm).await {
                warn!(session_id = %session_id, error = %e, "audio forward failed");
                self.registry.record_error(device_id);
            }
        }

        if decision.end_early {
            info!(
                device_id = %device_id,
                session_id = %session_id,
                "consecutive ending chunks, ending utterance early"
            );
            self.strong().end_and_finalize(session_id.to_string()).await;
        }
        Ok(())
    }

    /// Handle `asr_session_stop`. Idempotent: a repeated stop for an
    /// already-stopped or unknown session is a no-op.
    pub async fn stop_session(
        &self,
        device_id: &str,
        params: &AsrSessionStopParams,
    ) -> GatewayResult<()> {
        if !self.sessions.contains_key(&params.session_id) {
            debug!(
                device_id = %device_id,
                session_id = %params.session_id,
                "stop for unknown session, ignoring"
            );
            return Ok(());
        }
        self.strong().end_and_finalize(params.session_id.clone()).await;
        Ok(())
    }

    /// End the utterance (once) and run the finalize-wait. Shared by the
    /// early-end path and the explicit stop frame; the second caller
    /// finds `stopped` already set and returns.
    async fn end_and_finalize(self: Arc<Self>, session_id: String) {
        let Some(session) = self.sessions.get(&session_id).map(|entry| entry.value().clone()) else {
            return;
        };
        let (device_id, early) = {
            let mut s = session.lock();
            if s.finalize_started {
                return;
            }
            s.stopped = true;
            s.finalize_started = true;
            (s.device_id.clone(), s.early_end_sent)
        };

        if let Err(e) = self.backend.end_utterance(&session_id).await {
            warn!(session_id = %session_id, error = %e, "end-utterance failed");
        }
        debug!(session_id = %session_id, early_end = early, "entering finalize wait");

        let manager = self.clone();
        tokio::spawn(async move {
            let poll = manager.config.asr.finalize_poll_interval();
            let budget = Duration::from_millis(session.lock().max_wait_ms);
            let started = Instant::now();

            let finalized = loop {
                if session.lock().finalized() {
                    break true;
                }
                if started.elapsed() >= budget {
                    break false;
                }
                tokio::time::sleep(poll).await;
            };

            if finalized {
                let text = session.lock().final_text.clone().unwrap_or_default();
                info!(
                    device_id = %device_id,
                    session_id = %session_id,
                    chars = text.len(),
                    "utterance finalized"
                );
                if let Some(conn) = manager.registry.connection(&device_id) {
                    let _ = conn
                        .send(&OutboundFrame::AsrFinal {
                            session_id: session_id.clone(),
                            text: text.clone(),
                        })
                        .await;
                    manager.registry.record_message_sent(&device_id);
                }
                manager.remove_session(&session_id);
                manager.responder.respond(&device_id, &text).await;
            } else {
                warn!(
                    device_id = %device_id,
                    session_id = %session_id,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "finalize wait timed out"
                );
                manager.registry.record_error(&device_id);
                manager.remove_session(&session_id);
                manager
                    .responder
                    .notify_error(&device_id, "speech recognition produced no transcript")
                    .await;
            }
        });
    }

    /// Forward one backend update stream into the session: interim text
    /// goes straight to the device, every update reconciles into the
    /// transcript.
    fn spawn_update_pump(
        &self,
        session_id: String,
        device_id: String,
        mut updates: tokio::sync::mpsc::Receiver<TranscriptUpdate>,
    ) {
        let manager = self.strong();
        tokio::spawn(async move {
            while let Some(update) = updates.recv().await {
                let Some(session) = manager.sessions.get(&session_id).map(|entry| entry.value().clone()) else {
                    break;
                };
                session.lock().apply_update(&update.text, update.is_final);
                if !update.is_final {
                    if let Some(conn) = manager.registry.connection(&device_id) {
                        let _ = conn
                            .send(&OutboundFrame::AsrInterim {
                                session_id: session_id.clone(),
                                text: update.text.clone(),
                            })
                            .await;
                    }
                }
            }
            debug!(session_id = %session_id, "update stream closed");
        });
    }

    /// Drop all session state; finalize any recording.
    fn remove_session(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            let device_id = session.lock().device_id.clone();
            if let Some(active) = self.active_by_device.get(&device_id) {
                if *active == session_id {
                    drop(active);
                    self.active_by_device.remove(&device_id);
                }
            }
        }
        if let Some((_, recorder)) = self.recorders.remove(session_id) {
            match recorder.into_inner().finalize() {
                Ok(path) => debug!(path = %path.display(), "recording finalized"),
                Err(e) => warn!(session_id = %session_id, error = %e, "recording finalize failed"),
            }
        }
    }

    /// Start the abandoned-session sweep.
    pub fn spawn_sweep(&self) -> JoinHandle<()> {
        let manager = self.strong();
        tokio::spawn(async move {
            let settings = manager.config.asr.clone();
            let mut ticker = tokio::time::interval(settings.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let idle: Vec<String> = manager
                    .sessions
                    .iter()
                    .filter(|entry| entry.value().lock().idle_ms() > settings.idle_timeout_ms)
                    .map(|entry| entry.key().clone())
                    .collect();
                for session_id in idle {
                    warn!(session_id = %session_id, "reaping abandoned recognition session");
                    if let Err(e) = manager.backend.end_utterance(&session_id).await {
                        debug!(session_id = %session_id, error = %e, "sweep end-utterance failed");
                    }
                    manager.remove_session(&session_id);
                }
            }
        })
    }
}
