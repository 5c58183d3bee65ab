//! Heartbeat monitor
//!
//! Two layers of liveness detection. Each connection runs its own timer
//! task: when the device's `last_seen` age or the socket's pong age
//! crosses the configured thresholds the connection is torn down,
//! otherwise a `heartbeat_request` probe goes out. Independently, a
//! global sweep re-checks every online device against the timeout to
//! catch sockets that vanished without ever delivering a close event.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::DeviceRegistry;
use super::connection::Connection;
use super::device::now_ms;
use crate::router::frames::OutboundFrame;

/// Spawn the per-connection heartbeat timer.
pub(super) fn spawn_monitor(
    registry: Arc<DeviceRegistry>,
    device_id: String,
    conn: Arc<Connection>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let settings = registry.config().heartbeat.clone();
        let mut ticker = tokio::time::interval(settings.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; skip it so the first
        // probe goes out one full interval after registration.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if !conn.is_open() {
                break;
            }
            // Exit once this connection is no longer the device's
            // authoritative binding (supersede or identity change).
            let bound = registry
                .connection(&device_id)
                .map(|current| current.conn_id() == conn.conn_id())
                .unwrap_or(false);
            if !bound {
                break;
            }
            let Some(device) = registry.device(&device_id) else {
                break;
            };

            let seen_age = device.last_seen_age_ms();
            let pong_age = conn.pong_age_ms();
            if seen_age > settings.timeout_ms || pong_age > settings.pong_timeout_ms {
                warn!(
                    device_id = %device_id,
                    seen_age_ms = seen_age,
                    pong_age_ms = pong_age,
                    "heartbeat timeout, disconnecting"
                );
                registry.handle_disconnect(&device_id, Some(conn.conn_id()));
                break;
            }

            if let Err(e) = conn
                .send(&OutboundFrame::HeartbeatRequest {
                    timestamp: now_ms(),
                })
                .await
            {
                debug!(device_id = %device_id, error = %e, "heartbeat probe failed, disconnecting");
                registry.handle_disconnect(&device_id, Some(conn.conn_id()));
                break;
            }
        }
    })
}

/// Spawn the global offline sweep.
pub(super) fn spawn_sweep(registry: Arc<DeviceRegistry>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let settings = registry.config().heartbeat.clone();
        let mut ticker = tokio::time::interval(settings.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            for device_id in registry.stale_online_devices(settings.timeout_ms) {
                warn!(device_id = %device_id, "offline sweep reaping silent device");
                registry.handle_disconnect(&device_id, None);
            }
        }
    })
}
