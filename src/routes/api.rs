//! REST route assembly

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::handlers::api;
use crate::state::AppState;

/// Admin API routes (mounted behind the auth middleware).
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/devices", get(api::list_devices))
        .route("/api/devices/{device_id}", get(api::device_detail))
        .route("/api/devices/{device_id}/command", post(api::device_command))
        .route("/api/devices/{device_id}/ai", post(api::device_ai))
        .route("/api/devices/{device_id}/tts", post(api::device_tts))
        .route(
            "/api/devices/{device_id}/recordings",
            get(api::device_recordings),
        )
}
