//! Audio payload decoding
//!
//! Clients ship microphone audio in whatever container their firmware
//! found convenient: hex strings, base64 strings, raw binary WebSocket
//! frames, or arrays of numeric PCM samples. Everything normalizes to
//! one little-endian binary PCM representation before it reaches the
//! recognition backend.

use bytes::Bytes;
use serde_json::Value;

use crate::errors::{GatewayError, GatewayResult};

/// Decode a JSON-carried audio payload into binary PCM.
///
/// An explicit encoding hint (`hex`, `base64`, `pcm`) always wins; with
/// no hint, an even-length all-hex-digit string decodes as hex and
/// anything else as base64.
pub fn decode_audio_payload(payload: &Value, hint: Option<&str>) -> GatewayResult<Bytes> {
    match payload {
        Value::String(text) => decode_string(text, hint),
        Value::Array(samples) => decode_samples(samples),
        other => Err(GatewayError::InvalidAudio(format!(
            "unsupported audio payload type: {}",
            type_name(other)
        ))),
    }
}

fn decode_string(text: &str, hint: Option<&str>) -> GatewayResult<Bytes> {
    match hint.map(str::to_ascii_lowercase).as_deref() {
        Some("hex") => decode_hex(text),
        Some("base64") | Some("b64") => decode_base64(text),
        Some("pcm") | Some("raw") | None => {
            if looks_like_hex(text) {
                decode_hex(text)
            } else {
                decode_base64(text)
            }
        }
        Some(other) => Err(GatewayError::InvalidAudio(format!(
            "unknown audio format hint: {other}"
        ))),
    }
}

fn looks_like_hex(text: &str) -> bool {
    !text.is_empty() && text.len() % 2 == 0 && text.bytes().all(|b| b.is_ascii_hexdigit())
}

fn decode_hex(text: &str) -> GatewayResult<Bytes> {
    hex::decode(text)
        .map(Bytes::from)
        .map_err(|e| GatewayError::InvalidAudio(format!("bad hex audio payload: {e}")))
}

fn decode_base64(text: &str) -> GatewayResult<Bytes> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE.decode(text))
        .map(Bytes::from)
        .map_err(|e| GatewayError::InvalidAudio(format!("bad base64 audio payload: {e}")))
}

/// Numeric PCM sample array -> 16-bit little-endian bytes. Out-of-range
/// samples clamp rather than wrap.
fn decode_samples(samples: &[Value]) -> GatewayResult<Bytes> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for (i, sample) in samples.iter().enumerate() {
        let value = sample.as_i64().ok_or_else(|| {
            GatewayError::InvalidAudio(format!("non-numeric PCM sample at index {i}"))
        })?;
        let clamped = value.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
        pcm.extend_from_slice(&clamped.to_le_bytes());
    }
    Ok(Bytes::from(pcm))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
