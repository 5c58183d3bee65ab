//! WebSocket route assembly

use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use crate::handlers::ws_device_handler;
use crate::state::AppState;

/// Device WebSocket route.
pub fn create_ws_router() -> Router<Arc<AppState>> {
    Router::new().route("/ws", get(ws_device_handler))
}
