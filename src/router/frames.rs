//! Wire protocol frames
//!
//! JSON frames over WebSocket, discriminated by a required `type` field.
//! Inbound frames are parsed in two steps (read the discriminator, then
//! deserialize the matching parameter struct) so an unknown type is an
//! ignorable event, not a parse failure. Outbound frames serialize from
//! one tagged enum.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::dispatch::Command;
use crate::core::registry::Device;
use crate::errors::{GatewayError, GatewayResult};
use crate::proxy::Segment;

/// Voice-activity state reported with each audio chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadState {
    #[default]
    Active,
    Ending,
    /// Any other value: the chunk carries no usable speech signal.
    #[serde(other)]
    Silent,
}

/// `register` frame parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterParams {
    pub device_id: String,
    pub device_type: String,
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

/// `asr_session_start` frame parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AsrSessionStartParams {
    pub session_id: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_bits")]
    pub bits: u16,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default)]
    pub session_number: u64,
    #[serde(default)]
    pub audio_format: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

fn default_sample_rate() -> u32 {
    16_000
}
fn default_bits() -> u16 {
    16
}
fn default_channels() -> u16 {
    1
}

/// Nested audio envelope some firmwares send instead of a flat `data`.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioEnvelope {
    pub data: Value,
    #[serde(default)]
    pub format: Option<String>,
}

/// `asr_audio_chunk` frame parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AsrAudioChunkParams {
    pub session_id: String,
    #[serde(default)]
    pub chunk_index: u64,
    #[serde(default)]
    pub vad_state: VadState,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub audio: Option<AudioEnvelope>,
}

impl AsrAudioChunkParams {
    /// The audio payload, wherever the client put it, plus any explicit
    /// encoding hint.
    pub fn audio_payload(&self) -> Option<(&Value, Option<&str>)> {
        if let Some(data) = &self.data {
            let hint = self.audio.as_ref().and_then(|a| a.format.as_deref());
            return Some((data, hint));
        }
        self.audio
            .as_ref()
            .map(|envelope| (&envelope.data, envelope.format.as_deref()))
    }
}

/// `asr_session_stop` frame parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct AsrSessionStopParams {
    pub session_id: String,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub session_number: Option<u64>,
}

/// `tts_queue_status` frame parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TtsQueueStatusParams {
    pub queue_len: u32,
    #[serde(default)]
    pub playing: bool,
    #[serde(default)]
    pub active_sources: u32,
    #[serde(default)]
    pub ts: Option<u64>,
}

/// `log` frame parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct LogParams {
    #[serde(default = "default_log_level")]
    pub level: String,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

fn default_log_level() -> String {
    "info".to_string()
}

/// `command_result` frame parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandResultParams {
    pub command_id: String,
    #[serde(default)]
    pub result: Value,
}

/// `message` frame parameters (chat-style payload).
#[derive(Debug, Clone, Deserialize)]
pub struct MessageParams {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub segments: Option<Vec<Segment>>,
    #[serde(default)]
    pub sender: Option<Value>,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub master: bool,
}

/// A parsed inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Register(RegisterParams),
    /// Covers both `heartbeat` and `heartbeat_response` wire types.
    Heartbeat,
    AsrSessionStart(AsrSessionStartParams),
    AsrAudioChunk(AsrAudioChunkParams),
    AsrSessionStop(AsrSessionStopParams),
    TtsQueueStatus(TtsQueueStatusParams),
    Log(LogParams),
    CommandResult(CommandResultParams),
    Message(MessageParams),
    /// Unrecognized `type`; logged and ignored by the router.
    Unknown(String),
}

impl InboundFrame {
    /// Parse a raw text frame. Fails only on malformed JSON, a missing
    /// `type` discriminator, or bad parameters for a known type.
    pub fn parse(raw: &str) -> GatewayResult<Self> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| GatewayError::Protocol(format!("invalid JSON frame: {e}")))?;
        let frame_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Protocol("frame missing required `type` field".into()))?
            .to_string();

        fn params<T: serde::de::DeserializeOwned>(
            frame_type: &str,
            value: Value,
        ) -> GatewayResult<T> {
            serde_json::from_value(value)
                .map_err(|e| GatewayError::Protocol(format!("bad `{frame_type}` frame: {e}")))
        }

        Ok(match frame_type.as_str() {
            "register" => InboundFrame::Register(params(&frame_type, value)?),
            "heartbeat" | "heartbeat_response" => InboundFrame::Heartbeat,
            "asr_session_start" => InboundFrame::AsrSessionStart(params(&frame_type, value)?),
            "asr_audio_chunk" => InboundFrame::AsrAudioChunk(params(&frame_type, value)?),
            "asr_session_stop" => InboundFrame::AsrSessionStop(params(&frame_type, value)?),
            "tts_queue_status" => InboundFrame::TtsQueueStatus(params(&frame_type, value)?),
            "log" => InboundFrame::Log(params(&frame_type, value)?),
            "command_result" => InboundFrame::CommandResult(params(&frame_type, value)?),
            "message" => InboundFrame::Message(params(&frame_type, value)?),
            _ => InboundFrame::Unknown(frame_type),
        })
    }

    /// Wire name of the frame, for logging and error replies.
    pub fn frame_type(&self) -> &str {
        match self {
            InboundFrame::Register(_) => "register",
            InboundFrame::Heartbeat => "heartbeat",
            InboundFrame::AsrSessionStart(_) => "asr_session_start",
            InboundFrame::AsrAudioChunk(_) => "asr_audio_chunk",
            InboundFrame::AsrSessionStop(_) => "asr_session_stop",
            InboundFrame::TtsQueueStatus(_) => "tts_queue_status",
            InboundFrame::Log(_) => "log",
            InboundFrame::CommandResult(_) => "command_result",
            InboundFrame::Message(_) => "message",
            InboundFrame::Unknown(t) => t,
        }
    }

    /// Heartbeat-class frames are exempt from verbose logging.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, InboundFrame::Heartbeat)
    }
}

/// Every frame the gateway sends to a device.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    RegisterResponse {
        success: bool,
        device: Device,
    },
    HeartbeatRequest {
        timestamp: u64,
    },
    HeartbeatResponse {
        timestamp: u64,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        commands: Vec<Command>,
    },
    Command {
        #[serde(flatten)]
        command: Command,
    },
    AsrInterim {
        session_id: String,
        text: String,
    },
    AsrFinal {
        session_id: String,
        text: String,
    },
    /// One unit of synthesized speech, base64 PCM.
    TtsChunk {
        data: String,
    },
    Reply {
        segments: Vec<Segment>,
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    Forward {
        #[serde(skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
        content: Vec<Value>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        frame_type: Option<String>,
    },
    /// Generic AI-pipeline failure notification; the client stops waiting.
    AiError {
        message: String,
    },
}

impl OutboundFrame {
    /// Serialize for transmission.
    pub fn to_wire(&self) -> GatewayResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::CommandPriority;
    use serde_json::json;

    #[test]
    fn test_parse_register() {
        let frame = InboundFrame::parse(
            r#"{"type":"register","device_id":"esp32-1","device_type":"display"}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::Register(params) => {
                assert_eq!(params.device_id, "esp32-1");
                assert!(params.capabilities.is_empty());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_missing_type_is_protocol_error() {
        let err = InboundFrame::parse(r#"{"device_id":"esp32-1"}"#).unwrap_err();
        assert!(err.to_string().contains("type"));
    }

    #[test]
    fn test_unknown_type_is_not_an_error() {
        let frame = InboundFrame::parse(r#"{"type":"telemetry_v2"}"#).unwrap();
        match frame {
            InboundFrame::Unknown(t) => assert_eq!(t, "telemetry_v2"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_heartbeat_aliases() {
        assert!(InboundFrame::parse(r#"{"type":"heartbeat"}"#).unwrap().is_heartbeat());
        assert!(
            InboundFrame::parse(r#"{"type":"heartbeat_response","ts":1}"#)
                .unwrap()
                .is_heartbeat()
        );
    }

    #[test]
    fn test_vad_state_unknown_value_is_silent() {
        let frame = InboundFrame::parse(
            r#"{"type":"asr_audio_chunk","session_id":"s1","vad_state":"mumble","data":"00ff"}"#,
        )
        .unwrap();
        match frame {
            InboundFrame::AsrAudioChunk(params) => {
                assert_eq!(params.vad_state, VadState::Silent);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_audio_payload_prefers_flat_data() {
        let frame = InboundFrame::parse(
            r#"{"type":"asr_audio_chunk","session_id":"s1","vad_state":"active",
                "data":"abcd","audio":{"data":"ffff","format":"hex"}}"#,
        )
        .unwrap();
        let InboundFrame::AsrAudioChunk(params) = frame else {
            panic!("wrong frame");
        };
        let (payload, hint) = params.audio_payload().unwrap();
        assert_eq!(payload, &json!("abcd"));
        assert_eq!(hint, Some("hex"));
    }

    #[test]
    fn test_command_frame_flattens() {
        let command = Command::new("display", json!({"text": "hi"}), CommandPriority::Normal);
        let id = command.id.clone();
        let wire = OutboundFrame::Command { command }.to_wire().unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["type"], "command");
        assert_eq!(value["id"], id.as_str());
        assert_eq!(value["command"], "display");
        assert_eq!(value["priority"], "normal");
    }

    #[test]
    fn test_heartbeat_response_omits_empty_commands() {
        let wire = OutboundFrame::HeartbeatResponse {
            timestamp: 1,
            commands: Vec::new(),
        }
        .to_wire()
        .unwrap();
        assert!(!wire.contains("commands"));
    }

    #[test]
    fn test_error_frame_names_offending_type() {
        let wire = OutboundFrame::Error {
            message: "device not registered".into(),
            frame_type: Some("message".into()),
        }
        .to_wire()
        .unwrap();
        let value: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(value["frame_type"], "message");
    }
}
