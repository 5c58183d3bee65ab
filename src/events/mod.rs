//! Domain event bus
//!
//! The gateway does not decide what to answer a device; it publishes
//! normalized events (device online/offline, inbound chat messages) and
//! lets upstream subscribers react. Events are broadcast fan-out: a slow
//! subscriber only loses its own backlog, never anyone else's.
//!
//! Chat messages are published twice, once on a type-qualified topic
//! (`message.<device_type>`) and once on the generic `message` topic, so
//! subscribers can bind narrowly or broadly.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use crate::proxy::Segment;

/// Broadcast capacity. Subscribers that lag behind this many events
/// observe a `Lagged` error and resume from the current head.
const EVENT_BUS_CAPACITY: usize = 256;

/// Topic for device online transitions.
pub const TOPIC_ONLINE: &str = "device.online";
/// Topic for device offline transitions.
pub const TOPIC_OFFLINE: &str = "device.offline";
/// Generic topic every chat message is published on.
pub const TOPIC_MESSAGE: &str = "message";

/// A normalized inbound chat message from a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMessage {
    pub device_id: String,
    pub device_type: String,
    /// Flattened plain-text rendering of the message.
    pub text: String,
    /// Structured message segments, when the client sent them.
    #[serde(default)]
    pub segments: Vec<Segment>,
    /// Sender identity as reported by the device (user id, nickname...).
    #[serde(default)]
    pub sender: Option<Value>,
    /// Logical channel the message arrived on.
    #[serde(default)]
    pub channel: Option<String>,
    /// Whether the sender is the configured master user.
    #[serde(default)]
    pub master: bool,
}

/// Events published by the gateway core.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// Device transitioned absent/offline -> online.
    Online { device_id: String },
    /// Device transitioned online -> offline.
    Offline { device_id: String },
    /// Inbound chat message.
    Message(DeviceMessage),
}

/// A published event together with the topic it was published on.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    pub topic: String,
    pub event: DeviceEvent,
}

/// Fan-out bus for gateway domain events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events. Filter by `topic` on the receiving side.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }

    /// Publish a single event on one topic. Lost sends (no subscribers)
    /// are normal during startup and tests.
    pub fn publish(&self, topic: impl Into<String>, event: DeviceEvent) {
        let topic = topic.into();
        debug!(topic = %topic, "publishing gateway event");
        let _ = self.tx.send(GatewayEvent { topic, event });
    }

    /// Publish a device-online transition.
    pub fn publish_online(&self, device_id: &str) {
        self.publish(
            TOPIC_ONLINE,
            DeviceEvent::Online {
                device_id: device_id.to_string(),
            },
        );
    }

    /// Publish a device-offline transition.
    pub fn publish_offline(&self, device_id: &str) {
        self.publish(
            TOPIC_OFFLINE,
            DeviceEvent::Offline {
                device_id: device_id.to_string(),
            },
        );
    }

    /// Publish an inbound message on its type-qualified topic and on the
    /// generic `message` topic.
    pub fn publish_message(&self, message: DeviceMessage) {
        let qualified = format!("{}.{}", TOPIC_MESSAGE, message.device_type);
        self.publish(qualified, DeviceEvent::Message(message.clone()));
        self.publish(TOPIC_MESSAGE, DeviceEvent::Message(message));
    }
}
