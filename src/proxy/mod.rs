//! Device proxy facade
//!
//! A per-device object exposing the domain operations (display text,
//! show emotion, camera/microphone control, reboot) as thin calls into
//! the command dispatcher, plus the `reply` adapter that pushes
//! normalized segment payloads straight down the device's socket.

pub mod reply;

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use tracing::{debug, warn};

pub use reply::{NormalizedReply, ReplyPayload, Segment, flatten_text, normalize_reply};

use crate::config::MediaSettings;
use crate::core::dispatch::{CommandDispatcher, CommandOutcome, CommandPriority};
use crate::core::registry::DeviceRegistry;
use crate::errors::{GatewayError, GatewayResult};
use crate::router::frames::OutboundFrame;

/// The fixed set of emotions display firmwares implement.
pub const SUPPORTED_EMOTIONS: &[&str] = &[
    "neutral",
    "happy",
    "sad",
    "angry",
    "surprised",
    "thinking",
    "sleepy",
    "love",
];

/// Keyword patterns that substitute an emotion command for plain text.
static EMOTION_KEYWORDS: Lazy<Vec<(&'static str, Regex)>> = Lazy::new(|| {
    vec![
        (
            "happy",
            Regex::new(r"(?i)\b(yay|hooray|great|awesome|wonderful)\b").unwrap(),
        ),
        (
            "sad",
            Regex::new(r"(?i)\b(sorry|sadly|unfortunately)\b").unwrap(),
        ),
        ("angry", Regex::new(r"(?i)\b(grr+|angry|furious)\b").unwrap()),
        (
            "surprised",
            Regex::new(r"(?i)\b(wow|whoa|amazing|incredible)\b").unwrap(),
        ),
        (
            "thinking",
            Regex::new(r"(?i)\b(hmm+|let me think|thinking)\b").unwrap(),
        ),
        ("sleepy", Regex::new(r"(?i)\b(yawn|sleepy|good night)\b").unwrap()),
    ]
});

/// First emotion whose keyword pattern matches the text.
pub fn match_emotion_keyword(text: &str) -> Option<&'static str> {
    EMOTION_KEYWORDS
        .iter()
        .find(|(_, pattern)| pattern.is_match(text))
        .map(|(emotion, _)| *emotion)
}

/// Domain operations for one device.
pub struct DeviceProxy {
    device_id: String,
    registry: Arc<DeviceRegistry>,
    dispatcher: Arc<CommandDispatcher>,
    media: MediaSettings,
}

impl DeviceProxy {
    pub fn new(
        device_id: impl Into<String>,
        registry: Arc<DeviceRegistry>,
        dispatcher: Arc<CommandDispatcher>,
        media: MediaSettings,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            registry,
            dispatcher,
            media,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Show text on the device display.
    pub async fn display(&self, text: &str) -> GatewayResult<CommandOutcome> {
        self.dispatch("display", json!({ "text": text }), CommandPriority::Normal)
            .await
    }

    /// Show an emotion, validated against the supported set.
    pub async fn emotion(&self, name: &str) -> GatewayResult<CommandOutcome> {
        let name = name.trim().to_ascii_lowercase();
        if !SUPPORTED_EMOTIONS.contains(&name.as_str()) {
            return Err(GatewayError::UnsupportedEmotion(name));
        }
        self.dispatch("emotion", json!({ "emotion": name }), CommandPriority::Normal)
            .await
    }

    /// Clear the display.
    pub async fn clear(&self) -> GatewayResult<CommandOutcome> {
        self.dispatch("clear", json!({}), CommandPriority::Normal)
            .await
    }

    pub async fn camera(&self, on: bool) -> GatewayResult<CommandOutcome> {
        let command = if on { "camera_on" } else { "camera_off" };
        self.dispatch(command, json!({}), CommandPriority::Normal)
            .await
    }

    pub async fn microphone(&self, on: bool) -> GatewayResult<CommandOutcome> {
        let command = if on { "microphone_on" } else { "microphone_off" };
        self.dispatch(command, json!({}), CommandPriority::Normal)
            .await
    }

    /// Reboot jumps the offline queue if the device is unreachable.
    pub async fn reboot(&self) -> GatewayResult<CommandOutcome> {
        self.dispatch("reboot", json!({}), CommandPriority::High)
            .await
    }

    /// Send a text message, substituting an emotion command when the
    /// text matches an emotion keyword.
    pub async fn send_msg(&self, text: &str) -> GatewayResult<CommandOutcome> {
        if let Some(emotion) = match_emotion_keyword(text) {
            debug!(
                device_id = %self.device_id,
                emotion = %emotion,
                "emotion keyword matched, substituting emotion command"
            );
            return self.emotion(emotion).await;
        }
        self.display(text).await
    }

    /// Normalize any reply payload and transmit it as one outbound
    /// frame. Returns false (logged) when the socket is not open or
    /// normalization yields zero segments.
    pub async fn reply(&self, payload: ReplyPayload) -> bool {
        let normalized = normalize_reply(payload, &self.media);
        if normalized.segments.is_empty() {
            warn!(device_id = %self.device_id, "reply normalized to zero segments, dropping");
            return false;
        }

        let Some(conn) = self.registry.connection(&self.device_id) else {
            warn!(device_id = %self.device_id, "reply to device without live connection, dropping");
            return false;
        };
        if !conn.is_open() {
            warn!(device_id = %self.device_id, "reply to closed connection, dropping");
            return false;
        }

        let frame = match normalized.as_forward() {
            Some((title, description, content)) => OutboundFrame::Forward {
                title,
                description,
                content,
            },
            None => OutboundFrame::Reply {
                segments: normalized.segments,
                title: normalized.title,
                description: normalized.description,
            },
        };

        match conn.send(&frame).await {
            Ok(()) => {
                self.registry.record_message_sent(&self.device_id);
                true
            }
            Err(e) => {
                warn!(device_id = %self.device_id, error = %e, "reply transmission failed");
                self.registry.record_error(&self.device_id);
                false
            }
        }
    }

    async fn dispatch(
        &self,
        command: &str,
        parameters: serde_json::Value,
        priority: CommandPriority,
    ) -> GatewayResult<CommandOutcome> {
        self.dispatcher
            .send_command(&self.device_id, command, parameters, priority)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewayConfig;
    use crate::core::registry::Connection;
    use crate::events::EventBus;
    use crate::router::frames::RegisterParams;
    use serde_json::Value;

    fn fixture() -> (Arc<DeviceRegistry>, Arc<CommandDispatcher>, MediaSettings) {
        let config = Arc::new(GatewayConfig::default());
        let registry = DeviceRegistry::new(config.clone(), EventBus::new());
        let dispatcher = CommandDispatcher::new(registry.clone(), config.clone());
        (registry, dispatcher, config.media.clone())
    }

    fn register(registry: &Arc<DeviceRegistry>, device_id: &str) -> (Arc<Connection>, tokio::sync::mpsc::Receiver<crate::core::registry::WireMessage>) {
        let (conn, rx, _gauge) = Connection::channel(None);
        registry
            .register(
                &RegisterParams {
                    device_id: device_id.to_string(),
                    device_type: "display".to_string(),
                    device_name: None,
                    capabilities: Vec::new(),
                    metadata: None,
                    firmware_version: None,
                },
                conn.clone(),
            )
            .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn test_unsupported_emotion_rejected() {
        let (registry, dispatcher, media) = fixture();
        let proxy = DeviceProxy::new("esp32-1", registry, dispatcher, media);
        let err = proxy.emotion("vengeful").await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedEmotion(_)));
    }

    #[tokio::test]
    async fn test_offline_operations_queue() {
        let (registry, dispatcher, media) = fixture();
        let proxy = DeviceProxy::new("esp32-1", registry, dispatcher.clone(), media);
        let outcome = proxy.display("hello").await.unwrap();
        assert!(matches!(outcome, CommandOutcome::Queued { depth: 1 }));
        // Reboot is high priority: it lands ahead of the display command.
        proxy.reboot().await.unwrap();
        let drained = dispatcher.drain("esp32-1", 10);
        assert_eq!(drained[0].command, "reboot");
    }

    #[tokio::test]
    async fn test_send_msg_substitutes_emotion() {
        let (registry, dispatcher, media) = fixture();
        let proxy = DeviceProxy::new("esp32-1", registry, dispatcher.clone(), media);
        proxy.send_msg("wow, that worked!").await.unwrap();
        let drained = dispatcher.drain("esp32-1", 10);
        assert_eq!(drained[0].command, "emotion");
        assert_eq!(drained[0].parameters["emotion"], "surprised");
    }

    #[tokio::test]
    async fn test_send_msg_without_keyword_displays() {
        let (registry, dispatcher, media) = fixture();
        let proxy = DeviceProxy::new("esp32-1", registry, dispatcher.clone(), media);
        proxy.send_msg("the door is open").await.unwrap();
        let drained = dispatcher.drain("esp32-1", 10);
        assert_eq!(drained[0].command, "display");
    }

    #[tokio::test]
    async fn test_reply_requires_open_connection() {
        let (registry, dispatcher, media) = fixture();
        let proxy = DeviceProxy::new("esp32-1", registry, dispatcher, media);
        assert!(!proxy.reply("hello".into()).await);
    }

    #[tokio::test]
    async fn test_reply_rejects_zero_segments() {
        let (registry, dispatcher, media) = fixture();
        let (_conn, _rx) = register(&registry, "esp32-1");
        let proxy = DeviceProxy::new("esp32-1", registry, dispatcher, media);
        assert!(!proxy.reply("   ".into()).await);
    }

    #[tokio::test]
    async fn test_reply_transmits_segments() {
        let (registry, dispatcher, media) = fixture();
        let (_conn, mut rx) = register(&registry, "esp32-1");
        let proxy = DeviceProxy::new("esp32-1", registry.clone(), dispatcher, media);

        assert!(proxy.reply("hello device".into()).await);
        let msg = rx.recv().await.unwrap();
        let frame: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(frame["type"], "reply");
        assert_eq!(frame["segments"][0]["data"]["text"], "hello device");
        assert_eq!(registry.device("esp32-1").unwrap().stats.messages_sent, 1);
    }

    #[tokio::test]
    async fn test_forward_payload_uses_forward_frame() {
        let (registry, dispatcher, media) = fixture();
        let (_conn, mut rx) = register(&registry, "esp32-1");
        let proxy = DeviceProxy::new("esp32-1", registry, dispatcher, media);

        let payload: ReplyPayload = serde_json::from_value(serde_json::json!({
            "type": "forward",
            "data": {"title": "chat log", "content": [{"text": "hi"}]}
        }))
        .unwrap();
        assert!(proxy.reply(payload).await);

        let msg = rx.recv().await.unwrap();
        let frame: Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(frame["type"], "forward");
        assert_eq!(frame["title"], "chat log");
    }
}
