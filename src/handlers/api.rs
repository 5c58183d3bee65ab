//! REST surface
//!
//! Thin wrappers over the core: registry listings, ad-hoc command / AI /
//! TTS triggers, and recording listings. Every handler answers the
//! shared `{success, ...}` envelope; failures go through the
//! `GatewayError` -> response conversion.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::core::asr::recording;
use crate::core::dispatch::CommandPriority;
use crate::errors::{GatewayError, GatewayResult};
use crate::state::AppState;

/// `GET /health`
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<Value> {
    let devices = state.registry.devices_snapshot();
    Json(json!({
        "status": "ok",
        "devices": devices.len(),
        "online": state.registry.online_count(),
        "asr_sessions": state.asr.session_count(),
    }))
}

/// `GET /api/devices`
pub async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Value> {
    let mut devices = state.registry.devices_snapshot();
    devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
    Json(json!({
        "success": true,
        "devices": devices,
    }))
}

/// `GET /api/devices/{id}`
pub async fn device_detail(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> GatewayResult<Json<Value>> {
    let device = state
        .registry
        .device(&device_id)
        .ok_or_else(|| GatewayError::UnknownDevice(device_id.clone()))?;
    let logs = device.recent_logs();
    Ok(Json(json!({
        "success": true,
        "device": device,
        "logs": logs,
        "queued_commands": state.dispatcher.queue_depth(&device_id),
        "active_session": state.asr.active_session_id(&device_id),
        "tts_playing": state.tts.client_playing(&device_id),
    })))
}

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: CommandPriority,
}

/// `POST /api/devices/{id}/command`
pub async fn device_command(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> GatewayResult<Json<Value>> {
    state
        .registry
        .device(&device_id)
        .ok_or_else(|| GatewayError::UnknownDevice(device_id.clone()))?;
    let outcome = state
        .dispatcher
        .send_command(
            &device_id,
            request.command,
            request.parameters,
            request.priority,
        )
        .await?;
    Ok(Json(outcome.to_json()))
}

#[derive(Debug, Deserialize)]
pub struct TextRequest {
    pub text: String,
}

/// `POST /api/devices/{id}/ai`: run text through the reply pipeline as
/// if it had been transcribed from the device.
pub async fn device_ai(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(request): Json<TextRequest>,
) -> GatewayResult<Json<Value>> {
    state
        .registry
        .device(&device_id)
        .ok_or_else(|| GatewayError::UnknownDevice(device_id.clone()))?;
    state.responder.respond(&device_id, &request.text).await;
    Ok(Json(json!({ "success": true })))
}

/// `POST /api/devices/{id}/tts`: synthesize text and stream it through
/// the backpressure sender.
pub async fn device_tts(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(request): Json<TextRequest>,
) -> GatewayResult<Json<Value>> {
    if !state.registry.is_connected(&device_id) {
        return Err(GatewayError::ConnectionClosed(device_id));
    }
    let chunks = state.responder.speak(&device_id, &request.text).await?;
    Ok(Json(json!({ "success": true, "chunks": chunks })))
}

/// `GET /api/devices/{id}/recordings`
pub async fn device_recordings(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> GatewayResult<Json<Value>> {
    let recordings = recording::list_recordings(&state.config.recording.dir, &device_id)?;
    Ok(Json(json!({
        "success": true,
        "recordings": recordings,
    })))
}
