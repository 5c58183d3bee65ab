//! Device records
//!
//! A `Device` is the durable identity of a remote endpoint. Records are
//! created on first registration and never deleted afterwards, only
//! marked offline; a re-registration with the same id mutates the record
//! in place and bumps the reconnect counter, keeping `registered_at`
//! stable across the device's whole lifetime.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::router::frames::RegisterParams;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Per-device traffic and error counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceStats {
    /// Frames delivered to the device.
    pub messages_sent: u64,
    /// Frames received from the device.
    pub messages_received: u64,
    /// Commands transmitted through the direct dispatch path.
    pub commands_executed: u64,
    /// Errors attributed to this device (protocol, transport, backend).
    pub errors: u64,
    /// Successful re-registrations after the first.
    pub reconnects: u64,
}

/// One entry of the capped per-device log ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceLogEntry {
    pub level: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub timestamp: u64,
}

/// The durable record of a registered device.
#[derive(Debug, Clone, Serialize)]
pub struct Device {
    pub device_id: String,
    pub device_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Opaque client-supplied metadata, stored verbatim.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    /// Network origin of the most recent connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    pub online: bool,
    /// Last frame of any kind seen from this device (Unix ms).
    pub last_seen: u64,
    /// First registration time (Unix ms); stable across reconnects.
    pub registered_at: u64,
    pub stats: DeviceStats,
    /// Capped client log ring; newest at the back.
    #[serde(skip)]
    logs: VecDeque<DeviceLogEntry>,
}

impl Device {
    /// Create a fresh record from a registration frame.
    pub fn new(params: &RegisterParams, remote_addr: Option<String>) -> Self {
        let now = now_ms();
        Self {
            device_id: params.device_id.clone(),
            device_type: params.device_type.clone(),
            device_name: params.device_name.clone(),
            capabilities: params.capabilities.clone(),
            metadata: params.metadata.clone().unwrap_or(Value::Null),
            firmware_version: params.firmware_version.clone(),
            remote_addr,
            online: true,
            last_seen: now,
            registered_at: now,
            stats: DeviceStats::default(),
            logs: VecDeque::new(),
        }
    }

    /// Apply a re-registration in place. `registered_at` never moves.
    pub fn apply_registration(&mut self, params: &RegisterParams, remote_addr: Option<String>) {
        self.device_type = params.device_type.clone();
        if params.device_name.is_some() {
            self.device_name = params.device_name.clone();
        }
        if !params.capabilities.is_empty() {
            self.capabilities = params.capabilities.clone();
        }
        if let Some(metadata) = &params.metadata {
            self.metadata = metadata.clone();
        }
        if params.firmware_version.is_some() {
            self.firmware_version = params.firmware_version.clone();
        }
        self.remote_addr = remote_addr;
        self.online = true;
        self.last_seen = now_ms();
        self.stats.reconnects += 1;
    }

    /// Refresh the last-seen timestamp (any inbound frame).
    pub fn touch(&mut self) {
        self.last_seen = now_ms();
    }

    /// Append a client log entry, evicting the oldest past `cap`.
    pub fn push_log(&mut self, entry: DeviceLogEntry, cap: usize) {
        self.logs.push_back(entry);
        while self.logs.len() > cap {
            self.logs.pop_front();
        }
    }

    /// Most recent log entries, oldest first.
    pub fn recent_logs(&self) -> Vec<DeviceLogEntry> {
        self.logs.iter().cloned().collect()
    }

    /// Age of the last seen frame in milliseconds.
    pub fn last_seen_age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.last_seen)
    }
}
