//! Command records
//!
//! A `Command` is immutable once constructed. It is either transmitted
//! directly and correlated with a later `command_result` frame by id, or
//! parked in the per-device offline queue until a heartbeat drains it.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::core::registry::device::now_ms;

/// Delivery priority. High-priority commands jump to the head of the
/// offline queue and survive eviction ahead of normal ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandPriority {
    #[default]
    Normal,
    High,
}

/// One outbound device command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    /// Correlation id echoed back in `command_result`.
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: CommandPriority,
    /// Construction time (Unix ms).
    pub timestamp: u64,
}

impl Command {
    pub fn new(command: impl Into<String>, parameters: Value, priority: CommandPriority) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            parameters,
            priority,
            timestamp: now_ms(),
        }
    }
}

/// Result of a dispatch attempt.
///
/// A timeout is NOT an error: the transport cannot distinguish "device
/// busy" from "device lost the reply", so the dispatcher resolves with an
/// explicit marker and the caller treats it as fire-and-forget success.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    /// The device answered; carries the client-provided result payload.
    Delivered(Value),
    /// No `command_result` arrived within the timeout window.
    TimedOut,
    /// No live socket; the command was parked at this queue depth.
    Queued { depth: usize },
}

impl CommandOutcome {
    /// Wire/HTTP rendering of the outcome.
    pub fn to_json(&self) -> Value {
        match self {
            CommandOutcome::Delivered(result) => json!({
                "success": true,
                "result": result,
            }),
            CommandOutcome::TimedOut => json!({
                "success": true,
                "timeout": true,
            }),
            CommandOutcome::Queued { depth } => json!({
                "success": true,
                "queued": true,
                "queue_depth": depth,
            }),
        }
    }
}
