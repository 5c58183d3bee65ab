//! HTTP and WebSocket request handlers
//!
//! - `api` - health check and the admin REST surface
//! - `ws` - WebSocket device endpoint

pub mod api;
pub mod ws;

pub use ws::ws_device_handler;
