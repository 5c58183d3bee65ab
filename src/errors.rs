//! Gateway error types
//!
//! One error enum for the whole library. Handlers convert errors into the
//! JSON error envelope via `IntoResponse`; protocol-level failures are
//! additionally answered in-band on the WebSocket as `error` frames and
//! never close the connection.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Errors produced by the gateway core.
///
/// Nothing here is fatal to the process: every variant is scoped to one
/// device, one session, or one request.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or out-of-order protocol frame from a client.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The referenced device has never registered.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The referenced ASR session does not exist (or was already closed).
    #[error("unknown session: {0}")]
    UnknownSession(String),

    /// Audio payload could not be normalized to PCM bytes.
    #[error("invalid audio payload: {0}")]
    InvalidAudio(String),

    /// Emotion name outside the supported set.
    #[error("unsupported emotion: {0}")]
    UnsupportedEmotion(String),

    /// The device's outbound channel is gone (socket closed or superseded).
    #[error("connection closed for device {0}")]
    ConnectionClosed(String),

    /// Failure reported by an external collaborator (ASR/TTS/reply pipeline).
    #[error("backend error: {0}")]
    Backend(String),

    /// Invalid or inconsistent configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience result alias used throughout the gateway.
pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Protocol(_)
            | GatewayError::InvalidAudio(_)
            | GatewayError::UnsupportedEmotion(_) => StatusCode::BAD_REQUEST,
            GatewayError::UnknownDevice(_) | GatewayError::UnknownSession(_) => {
                StatusCode::NOT_FOUND
            }
            GatewayError::ConnectionClosed(_) => StatusCode::CONFLICT,
            GatewayError::Backend(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Configuration(_)
            | GatewayError::Io(_)
            | GatewayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}
