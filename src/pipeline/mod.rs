//! Reply pipeline interface and delivery
//!
//! The text-generation subsystem is an external collaborator: the
//! gateway hands it a transcribed utterance and gets `{text, emotion}`
//! back, opaque in between. `AiResponder` owns the full round trip:
//! invoke the pipeline, show the emotion, push the reply frame, and
//! stream synthesized speech through the backpressure sender. It
//! guarantees every failure becomes a device-visible `ai_error` frame
//! instead of a silent stall.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::config::GatewayConfig;
use crate::core::dispatch::CommandDispatcher;
use crate::core::registry::DeviceRegistry;
use crate::core::tts::{TtsBackend, TtsSender};
use crate::errors::GatewayResult;
use crate::proxy::DeviceProxy;
use crate::router::frames::OutboundFrame;

/// One generated reply.
#[derive(Debug, Clone)]
pub struct AiReply {
    pub text: String,
    /// Emotion tag accompanying the text, if the pipeline produced one.
    pub emotion: Option<String>,
}

/// Opaque text-generation collaborator.
#[async_trait]
pub trait ReplyPipeline: Send + Sync {
    async fn generate(&self, device_id: &str, text: &str) -> GatewayResult<AiReply>;
}

/// Fallback pipeline used when no upstream is wired: answers with the
/// input text so the loop stays demonstrably alive.
pub struct EchoPipeline;

#[async_trait]
impl ReplyPipeline for EchoPipeline {
    async fn generate(&self, _device_id: &str, text: &str) -> GatewayResult<AiReply> {
        Ok(AiReply {
            text: text.to_string(),
            emotion: None,
        })
    }
}

/// Drives the reply pipeline and delivers its output to a device.
pub struct AiResponder {
    pipeline: Arc<dyn ReplyPipeline>,
    tts_backend: Arc<dyn TtsBackend>,
    tts: Arc<TtsSender>,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    config: Arc<GatewayConfig>,
}

impl AiResponder {
    pub fn new(
        pipeline: Arc<dyn ReplyPipeline>,
        tts_backend: Arc<dyn TtsBackend>,
        tts: Arc<TtsSender>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        config: Arc<GatewayConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            tts_backend,
            tts,
            registry,
            dispatcher,
            config,
        })
    }

    /// Run one utterance through the pipeline and deliver the answer.
    pub async fn respond(&self, device_id: &str, text: &str) {
        debug!(device_id = %device_id, "invoking reply pipeline");
        match self.pipeline.generate(device_id, text).await {
            Ok(reply) => self.deliver(device_id, reply).await,
            Err(e) => {
                error!(device_id = %device_id, error = %e, "reply pipeline failed");
                self.registry.record_error(device_id);
                self.notify_error(device_id, "reply generation failed").await;
            }
        }
    }

    /// Deliver a generated reply: emotion first, then the reply frame,
    /// then synthesized speech through the backpressure chain.
    pub async fn deliver(&self, device_id: &str, reply: AiReply) {
        let proxy = self.proxy(device_id);

        if let Some(emotion) = &reply.emotion {
            if let Err(e) = proxy.emotion(emotion).await {
                // An unknown tag is the pipeline's problem, not the device's.
                warn!(device_id = %device_id, emotion = %emotion, error = %e, "emotion delivery skipped");
            }
        }

        if !proxy.reply(reply.text.clone().into()).await {
            debug!(device_id = %device_id, "reply frame not delivered");
        }

        let _ = self.speak(device_id, &reply.text).await;
    }

    /// Synthesize text and stream it through the device's backpressure
    /// chain. Returns the number of chunks streamed.
    pub async fn speak(&self, device_id: &str, text: &str) -> GatewayResult<usize> {
        let mut chunks = match self.tts_backend.synthesize(text).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(device_id = %device_id, error = %e, "speech synthesis failed");
                self.registry.record_error(device_id);
                return Err(e);
            }
        };
        let mut streamed = 0usize;
        while let Some(chunk) = chunks.recv().await {
            if let Err(e) = self.tts.send_audio_chunk(device_id, chunk).await {
                debug!(device_id = %device_id, error = %e, "speech delivery stopped");
                break;
            }
            streamed += 1;
        }
        if streamed > 0 {
            info!(device_id = %device_id, chunks = streamed, "reply speech streamed");
        }
        Ok(streamed)
    }

    /// Push a generic AI-failure notification so the client never hangs
    /// waiting for an answer.
    pub async fn notify_error(&self, device_id: &str, message: &str) {
        if let Some(conn) = self.registry.connection(device_id) {
            let _ = conn
                .send(&OutboundFrame::AiError {
                    message: message.to_string(),
                })
                .await;
        }
    }

    fn proxy(&self, device_id: &str) -> DeviceProxy {
        DeviceProxy::new(
            device_id,
            self.registry.clone(),
            self.dispatcher.clone(),
            self.config.media.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::Connection;
    use crate::core::tts::SilentTtsBackend;
    use crate::errors::GatewayError;
    use crate::events::EventBus;
    use crate::router::frames::RegisterParams;
    use serde_json::Value;

    struct FailingPipeline;

    #[async_trait]
    impl ReplyPipeline for FailingPipeline {
        async fn generate(&self, _device_id: &str, _text: &str) -> GatewayResult<AiReply> {
            Err(GatewayError::Backend("model unavailable".into()))
        }
    }

    fn fixture(pipeline: Arc<dyn ReplyPipeline>) -> (Arc<DeviceRegistry>, Arc<AiResponder>) {
        let config = Arc::new(GatewayConfig::default());
        let registry = DeviceRegistry::new(config.clone(), EventBus::new());
        let dispatcher = CommandDispatcher::new(registry.clone(), config.clone());
        let tts = TtsSender::new(registry.clone(), config.clone());
        let responder = AiResponder::new(
            pipeline,
            Arc::new(SilentTtsBackend),
            tts,
            registry.clone(),
            dispatcher,
            config,
        );
        (registry, responder)
    }

    fn register(registry: &Arc<DeviceRegistry>) -> tokio::sync::mpsc::Receiver<crate::core::registry::WireMessage> {
        let (conn, rx, _gauge) = Connection::channel(None);
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
        rx
    }

    #[tokio::test]
    async fn test_pipeline_failure_notifies_device() {
        let (registry, responder) = fixture(Arc::new(FailingPipeline));
        let mut rx = register(&registry);

        responder.respond("esp32-1", "hello").await;

        let msg = rx.recv().await.unwrap();
        let frame: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(frame["type"], "ai_error");
        assert_eq!(registry.device("esp32-1").unwrap().stats.errors, 1);
    }

    #[tokio::test]
    async fn test_echo_pipeline_delivers_reply_frame() {
        let (registry, responder) = fixture(Arc::new(EchoPipeline));
        let mut rx = register(&registry);

        responder.respond("esp32-1", "status report").await;

        let msg = rx.recv().await.unwrap();
        let frame: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(frame["type"], "reply");
        assert_eq!(frame["segments"][0]["data"]["text"], "status report");
    }
}
