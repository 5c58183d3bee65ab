//! Session manager tests with a scripted recognition backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::core::dispatch::CommandDispatcher;
use crate::core::registry::{Connection, WireMessage};
use crate::core::tts::{SilentTtsBackend, TtsSender};
use crate::events::EventBus;
use crate::pipeline::EchoPipeline;
use crate::router::frames::RegisterParams;

/// Backend double: records pushes/ends, lets tests inject updates, and
/// optionally emits a final transcript on end-of-utterance.
struct ScriptedBackend {
    update_txs: Mutex<HashMap<String, mpsc::Sender<TranscriptUpdate>>>,
    pushed: Mutex<Vec<(String, usize)>>,
    ended: Mutex<Vec<String>>,
    final_text: Option<String>,
}

impl ScriptedBackend {
    fn new(final_text: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            update_txs: Mutex::new(HashMap::new()),
            pushed: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            final_text: final_text.map(str::to_string),
        })
    }

    async fn inject(&self, session_id: &str, text: &str, is_final: bool) {
        let tx = self.update_txs.lock().get(session_id).cloned().unwrap();
        tx.send(TranscriptUpdate {
            text: text.to_string(),
            is_final,
        })
        .await
        .unwrap();
    }

    fn pushed_chunks(&self, session_id: &str) -> usize {
        self.pushed
            .lock()
            .iter()
            .filter(|(s, _)| s == session_id)
            .count()
    }

    fn end_count(&self, session_id: &str) -> usize {
        self.ended.lock().iter().filter(|s| *s == session_id).count()
    }
}

#[async_trait]
impl AsrBackend for ScriptedBackend {
    async fn open_utterance(
        &self,
        session_id: &str,
        _format: AudioFormat,
    ) -> crate::errors::GatewayResult<mpsc::Receiver<TranscriptUpdate>> {
        let (tx, rx) = mpsc::channel(16);
        self.update_txs.lock().insert(session_id.to_string(), tx);
        Ok(rx)
    }

    async fn push_audio(
        &self,
        session_id: &str,
        audio: Bytes,
    ) -> crate::errors::GatewayResult<()> {
        self.pushed
            .lock()
            .push((session_id.to_string(), audio.len()));
        Ok(())
    }

    async fn end_utterance(&self, session_id: &str) -> crate::errors::GatewayResult<()> {
        self.ended.lock().push(session_id.to_string());
        if let Some(text) = &self.final_text {
            if let Some(tx) = self.update_txs.lock().get(session_id).cloned() {
                let update = TranscriptUpdate {
                    text: text.clone(),
                    is_final: true,
                };
                let _ = tx.try_send(update);
            }
        }
        Ok(())
    }
}

struct Fixture {
    manager: Arc<AsrSessionManager>,
    backend: Arc<ScriptedBackend>,
    _registry: Arc<crate::core::registry::DeviceRegistry>,
    frames: mpsc::Receiver<WireMessage>,
}

fn fixture(final_text: Option<&str>) -> Fixture {
    let mut config = crate::config::GatewayConfig::default();
    config.asr.finalize_poll_interval_ms = 10;
    config.asr.finalize_max_wait_ms = 300;
    config.asr.supersede_grace_ms = 10;
    let config = Arc::new(config);

    let registry = crate::core::registry::DeviceRegistry::new(config.clone(), EventBus::new());
    let dispatcher = CommandDispatcher::new(registry.clone(), config.clone());
    let tts = TtsSender::new(registry.clone(), config.clone());
    let responder = crate::pipeline::AiResponder::new(
        Arc::new(EchoPipeline),
        Arc::new(SilentTtsBackend),
        tts,
        registry.clone(),
        dispatcher,
        config.clone(),
    );

    let backend = ScriptedBackend::new(final_text);
    let manager = AsrSessionManager::new(
        backend.clone(),
        responder,
        registry.clone(),
        config,
    );

    let (conn, frames, _gauge) = Connection::channel(None);
    registry
        .register(
            &RegisterParams {
                device_id: "esp32-1".to_string(),
                device_type: "display".to_string(),
                device_name: None,
                capabilities: Vec::new(),
                metadata: None,
                firmware_version: None,
            },
            conn,
        )
        .unwrap();

    Fixture {
        manager,
        backend,
        _registry: registry,
        frames,
    }
}

fn start_params(session_id: &str) -> crate::router::frames::AsrSessionStartParams {
    crate::router::frames::AsrSessionStartParams {
        session_id: session_id.to_string(),
        sample_rate: 16_000,
        bits: 16,
        channels: 1,
        session_number: 1,
        audio_format: None,
        model: None,
    }
}

fn chunk(session_id: &str, index: u64, vad: VadState) -> crate::router::frames::AsrAudioChunkParams {
    crate::router::frames::AsrAudioChunkParams {
        session_id: session_id.to_string(),
        chunk_index: index,
        vad_state: vad,
        data: Some(json!(hex::encode([0u8; 320]))),
        audio: None,
    }
}

fn stop_params(session_id: &str) -> crate::router::frames::AsrSessionStopParams {
    crate::router::frames::AsrSessionStopParams {
        session_id: session_id.to_string(),
        duration: Some(1.2),
        session_number: Some(1),
    }
}

/// Read frames until one of the given type arrives.
async fn wait_for_frame(frames: &mut mpsc::Receiver<WireMessage>, frame_type: &str) -> Value {
    loop {
        let msg = timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap_or_else(|_| panic!("no `{frame_type}` frame arrived"))
            .expect("connection closed");
        let value: Value = serde_json::from_str(&msg.payload).unwrap();
        if value["type"] == frame_type {
            return value;
        }
    }
}

#[tokio::test]
async fn test_end_to_end_early_end_pushes_final() {
    let mut fx = fixture(Some("turn on the lights"));
    fx.manager
        .start_session("esp32-1", &start_params("sess-1"))
        .await
        .unwrap();

    for i in 0..3 {
        fx.manager
            .ingest_chunk("esp32-1", &chunk("sess-1", i, VadState::Active))
            .await
            .unwrap();
    }
    fx.manager
        .ingest_chunk("esp32-1", &chunk("sess-1", 3, VadState::Ending))
        .await
        .unwrap();
    assert_eq!(fx.backend.end_count("sess-1"), 0);
    fx.manager
        .ingest_chunk("esp32-1", &chunk("sess-1", 4, VadState::Ending))
        .await
        .unwrap();

    // The second ending chunk ended the utterance without a stop frame.
    assert_eq!(fx.backend.end_count("sess-1"), 1);
    assert_eq!(fx.backend.pushed_chunks("sess-1"), 5);

    let final_frame = wait_for_frame(&mut fx.frames, "asr_final").await;
    assert_eq!(final_frame["text"], "turn on the lights");
    assert_eq!(final_frame["session_id"], "sess-1");

    // The echo reply follows the final frame; once it arrived, the
    // session entry is gone.
    wait_for_frame(&mut fx.frames, "reply").await;

    // A late explicit stop is a no-op.
    fx.manager
        .stop_session("esp32-1", &stop_params("sess-1"))
        .await
        .unwrap();
    assert_eq!(fx.backend.end_count("sess-1"), 1);
    assert_eq!(fx.manager.session_count(), 0);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let fx = fixture(Some("ok"));
    fx.manager
        .start_session("esp32-1", &start_params("sess-1"))
        .await
        .unwrap();

    fx.manager
        .stop_session("esp32-1", &stop_params("sess-1"))
        .await
        .unwrap();
    fx.manager
        .stop_session("esp32-1", &stop_params("sess-1"))
        .await
        .unwrap();

    assert_eq!(fx.backend.end_count("sess-1"), 1);
}

#[tokio::test]
async fn test_silent_chunks_not_forwarded() {
    let fx = fixture(Some("ok"));
    fx.manager
        .start_session("esp32-1", &start_params("sess-1"))
        .await
        .unwrap();
    fx.manager
        .ingest_chunk("esp32-1", &chunk("sess-1", 0, VadState::Silent))
        .await
        .unwrap();
    assert_eq!(fx.backend.pushed_chunks("sess-1"), 0);
}

#[tokio::test]
async fn test_finalize_timeout_notifies_device() {
    let mut fx = fixture(None);
    fx.manager
        .start_session("esp32-1", &start_params("sess-1"))
        .await
        .unwrap();
    fx.manager
        .stop_session("esp32-1", &stop_params("sess-1"))
        .await
        .unwrap();

    let frame = wait_for_frame(&mut fx.frames, "ai_error").await;
    assert!(frame["message"].as_str().unwrap().contains("transcript"));
    assert_eq!(fx.manager.session_count(), 0);
}

#[tokio::test]
async fn test_interim_updates_forwarded_and_reconciled() {
    let mut fx = fixture(None);
    fx.manager
        .start_session("esp32-1", &start_params("sess-1"))
        .await
        .unwrap();

    fx.backend.inject("sess-1", "he", false).await;
    let interim = wait_for_frame(&mut fx.frames, "asr_interim").await;
    assert_eq!(interim["text"], "he");

    fx.backend.inject("sess-1", "hello", false).await;
    wait_for_frame(&mut fx.frames, "asr_interim").await;
    // Regressing partial, then the final flag.
    fx.backend.inject("sess-1", "hell", true).await;

    fx.manager
        .stop_session("esp32-1", &stop_params("sess-1"))
        .await
        .unwrap();
    let final_frame = wait_for_frame(&mut fx.frames, "asr_final").await;
    assert_eq!(final_frame["text"], "hello");
}

#[tokio::test]
async fn test_new_session_supersedes_open_one() {
    let fx = fixture(None);
    fx.manager
        .start_session("esp32-1", &start_params("sess-1"))
        .await
        .unwrap();
    fx.manager
        .start_session("esp32-1", &start_params("sess-2"))
        .await
        .unwrap();

    assert_eq!(fx.backend.end_count("sess-1"), 1);
    assert_eq!(
        fx.manager.active_session_id("esp32-1").as_deref(),
        Some("sess-2")
    );
    assert_eq!(fx.manager.session_count(), 1);
}

#[tokio::test]
async fn test_unknown_session_chunk_is_dropped() {
    let fx = fixture(None);
    fx.manager
        .ingest_chunk("esp32-1", &chunk("ghost", 0, VadState::Active))
        .await
        .unwrap();
    assert_eq!(fx.backend.pushed_chunks("ghost"), 0);
}

#[tokio::test]
async fn test_binary_audio_feeds_active_session() {
    let fx = fixture(None);
    fx.manager
        .start_session("esp32-1", &start_params("sess-1"))
        .await
        .unwrap();
    fx.manager
        .ingest_binary("esp32-1", Bytes::from(vec![0u8; 640]))
        .await
        .unwrap();
    assert_eq!(fx.backend.pushed_chunks("sess-1"), 1);
}
