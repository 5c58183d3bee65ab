//! Connection registry
//!
//! The authoritative mapping of device identity → device record → live
//! connection. At most one connection is authoritative per device id at
//! any time; a newer registration for the same id supersedes the older
//! connection, cancelling its heartbeat before detaching it. Device
//! records survive disconnects; they are only ever marked offline.
//!
//! Online/offline domain events fire exactly once per transition:
//! re-registering while already online bumps the reconnect counter
//! without a second `online` event.

pub mod connection;
pub mod device;
mod heartbeat;

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub use connection::{Connection, WireMessage};
pub use device::{Device, DeviceLogEntry, DeviceStats};

use crate::config::GatewayConfig;
use crate::errors::{GatewayError, GatewayResult};
use crate::events::EventBus;
use crate::router::frames::RegisterParams;

/// Device and connection tables, keyed by device id.
pub struct DeviceRegistry {
    devices: DashMap<String, Device>,
    connections: DashMap<String, Arc<Connection>>,
    events: EventBus,
    config: Arc<GatewayConfig>,
    /// Self-handle for spawning tasks that outlive the caller's borrow.
    me: Weak<DeviceRegistry>,
}

impl DeviceRegistry {
    pub fn new(config: Arc<GatewayConfig>, events: EventBus) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            devices: DashMap::new(),
            connections: DashMap::new(),
            events,
            config,
            me: me.clone(),
        })
    }

    fn strong(&self) -> Arc<Self> {
        self.me.upgrade().expect("registry still referenced")
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Register a device on a freshly accepted connection.
    ///
    /// Validates the registration, supersedes any existing connection for
    /// the same id, creates or updates the device record, binds the new
    /// connection, and starts its heartbeat timer. Emits an `online`
    /// event only when the device was previously absent or offline.
    pub fn register(
        &self,
        params: &RegisterParams,
        conn: Arc<Connection>,
    ) -> GatewayResult<Device> {
        if params.device_id.trim().is_empty() {
            return Err(GatewayError::Protocol(
                "register frame missing device_id".into(),
            ));
        }
        if params.device_type.trim().is_empty() {
            return Err(GatewayError::Protocol(
                "register frame missing device_type".into(),
            ));
        }
        let device_id = params.device_id.as_str();

        // Supersede: the heartbeat of the old connection must be
        // cancelled before the socket mapping is replaced. A re-register
        // on the same socket keeps its existing heartbeat timer.
        let mut fresh_binding = true;
        if let Some((_, old)) = self.connections.remove(device_id) {
            if old.conn_id() == conn.conn_id() {
                fresh_binding = false;
            } else {
                info!(
                    device_id = %device_id,
                    old_conn = %old.conn_id(),
                    new_conn = %conn.conn_id(),
                    "superseding existing connection"
                );
                old.shutdown();
            }
        }

        let remote_addr = conn.remote_addr().map(str::to_string);
        let was_online = self
            .devices
            .get(device_id)
            .map(|d| d.online)
            .unwrap_or(false);

        let device = match self.devices.entry(device_id.to_string()) {
            dashmap::Entry::Occupied(mut entry) => {
                entry.get_mut().apply_registration(params, remote_addr);
                entry.get().clone()
            }
            dashmap::Entry::Vacant(entry) => {
                entry.insert(Device::new(params, remote_addr)).clone()
            }
        };

        self.connections
            .insert(device_id.to_string(), conn.clone());
        if fresh_binding {
            conn.attach_task(heartbeat::spawn_monitor(
                self.strong(),
                device_id.to_string(),
                conn.clone(),
            ));
        }

        if was_online {
            debug!(device_id = %device_id, "reconnect while already online, no event");
        } else {
            self.events.publish_online(device_id);
        }
        info!(
            device_id = %device_id,
            device_type = %device.device_type,
            reconnects = device.stats.reconnects,
            "device registered"
        );
        Ok(device)
    }

    /// Tear down a device's connection and mark it offline.
    ///
    /// `expected_conn` guards against a stale disconnect from a
    /// superseded socket tearing down its successor: when set, the
    /// teardown only proceeds if that connection is still the bound one.
    /// The `offline` event fires exactly once per online→offline
    /// transition no matter how many callers race here.
    pub fn handle_disconnect(&self, device_id: &str, expected_conn: Option<&str>) {
        if let Some(entry) = self.connections.get(device_id) {
            if let Some(expected) = expected_conn {
                if entry.value().conn_id() != expected {
                    debug!(
                        device_id = %device_id,
                        stale_conn = %expected,
                        "ignoring disconnect from superseded connection"
                    );
                    return;
                }
            }
        } else if expected_conn.is_some() {
            // Already detached; fall through only for sweep calls so a
            // lingering online flag still gets cleared.
            return;
        }

        if let Some((_, conn)) = self.connections.remove(device_id) {
            conn.shutdown();
        }
        self.mark_offline(device_id);
    }

    /// Detach a device's connection mapping WITHOUT tearing the socket
    /// down: the socket re-registered under a different identity and
    /// now belongs to that device.
    pub fn detach_binding(&self, device_id: &str, conn_id: &str) {
        let bound = self
            .connections
            .get(device_id)
            .map(|entry| entry.value().conn_id() == conn_id)
            .unwrap_or(false);
        if !bound {
            return;
        }
        self.connections.remove(device_id);
        info!(device_id = %device_id, "binding detached after identity change");
        self.mark_offline(device_id);
    }

    /// Flip the online flag and emit `offline` exactly once.
    fn mark_offline(&self, device_id: &str) {
        let mut went_offline = false;
        if let Some(mut device) = self.devices.get_mut(device_id) {
            if device.online {
                device.online = false;
                went_offline = true;
            }
        }
        if went_offline {
            info!(device_id = %device_id, "device offline");
            self.events.publish_offline(device_id);
        }
    }

    /// The live connection for a device, if any.
    pub fn connection(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(device_id).map(|entry| entry.value().clone())
    }

    /// Whether a device has a live, open connection.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.connection(device_id)
            .map(|c| c.is_open())
            .unwrap_or(false)
    }

    /// Snapshot of one device record.
    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|entry| entry.value().clone())
    }

    /// Snapshot of every device record.
    pub fn devices_snapshot(&self) -> Vec<Device> {
        self.devices.iter().map(|d| d.value().clone()).collect()
    }

    pub fn online_count(&self) -> usize {
        self.devices.iter().filter(|d| d.online).count()
    }

    /// Refresh `last_seen` for any inbound frame.
    pub fn touch(&self, device_id: &str) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.touch();
        }
    }

    /// Handle a heartbeat-class frame: refresh `last_seen`, the liveness
    /// pong, and the online flag (a heartbeat can race the sweep).
    pub fn heartbeat_seen(&self, device_id: &str) {
        if let Some(conn) = self.connection(device_id) {
            conn.mark_pong();
        }
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.touch();
            if !device.online {
                device.online = true;
                drop(device);
                self.events.publish_online(device_id);
            }
        }
    }

    /// Append a client-submitted log entry to the device's capped ring.
    pub fn append_log(&self, device_id: &str, entry: DeviceLogEntry) {
        let cap = self.config.devices.log_cap;
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.push_log(entry, cap);
        }
    }

    pub fn record_message_received(&self, device_id: &str) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.stats.messages_received += 1;
            device.touch();
        }
    }

    pub fn record_message_sent(&self, device_id: &str) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.stats.messages_sent += 1;
        }
    }

    pub fn record_command_executed(&self, device_id: &str) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.stats.commands_executed += 1;
        }
    }

    pub fn record_error(&self, device_id: &str) {
        if let Some(mut device) = self.devices.get_mut(device_id) {
            device.stats.errors += 1;
        }
    }

    /// Online devices whose `last_seen` age exceeds `timeout_ms`.
    pub(crate) fn stale_online_devices(&self, timeout_ms: u64) -> Vec<String> {
        self.devices
            .iter()
            .filter(|d| d.online && d.last_seen_age_ms() > timeout_ms)
            .map(|d| d.device_id.clone())
            .collect()
    }

    /// Start the global offline sweep.
    pub fn spawn_sweep(&self) -> JoinHandle<()> {
        heartbeat::spawn_sweep(self.strong())
    }
}
