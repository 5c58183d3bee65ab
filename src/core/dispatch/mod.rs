//! Command dispatcher
//!
//! Two delivery paths. When the device has a live socket, the command
//! frame goes out immediately and the response is correlated by command
//! id through a pending table; if no `command_result` arrives within the
//! timeout the dispatch RESOLVES with a timeout marker, because the
//! transport cannot tell "device busy" from "device lost the reply".
//! When the device is offline, the command is parked in a bounded
//! per-device FIFO (high priority at the head) that the heartbeat path
//! drains in small batches.
//!
//! The dispatcher never retries; retry policy belongs to the caller.

pub mod command;

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub use command::{Command, CommandOutcome, CommandPriority};

use crate::config::GatewayConfig;
use crate::core::registry::DeviceRegistry;
use crate::errors::GatewayResult;
use crate::router::frames::OutboundFrame;

struct PendingCommand {
    tx: oneshot::Sender<Value>,
    created: Instant,
}

/// Direct-delivery correlation table plus per-device offline queues.
pub struct CommandDispatcher {
    pending: DashMap<String, PendingCommand>,
    queues: DashMap<String, VecDeque<Command>>,
    registry: Arc<DeviceRegistry>,
    config: Arc<GatewayConfig>,
    me: Weak<CommandDispatcher>,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<DeviceRegistry>, config: Arc<GatewayConfig>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pending: DashMap::new(),
            queues: DashMap::new(),
            registry,
            config,
            me: me.clone(),
        })
    }

    /// Dispatch one command to a device.
    ///
    /// Returns `Delivered` with the client result, `TimedOut` when no
    /// result arrived in time (still success, no confirmation), or
    /// `Queued` with the resulting depth when the device is offline.
    pub async fn send_command(
        &self,
        device_id: &str,
        command: impl Into<String>,
        parameters: Value,
        priority: CommandPriority,
    ) -> GatewayResult<CommandOutcome> {
        let cmd = Command::new(command, parameters, priority);

        if let Some(conn) = self.registry.connection(device_id) {
            if conn.is_open() {
                let (tx, rx) = oneshot::channel();
                self.pending.insert(
                    cmd.id.clone(),
                    PendingCommand {
                        tx,
                        created: Instant::now(),
                    },
                );

                let frame = OutboundFrame::Command {
                    command: cmd.clone(),
                };
                if let Err(e) = conn.send(&frame).await {
                    // Transport failure at send time: scoped to this
                    // command, fall back to the offline queue.
                    self.pending.remove(&cmd.id);
                    self.registry.record_error(device_id);
                    warn!(
                        device_id = %device_id,
                        command = %cmd.command,
                        error = %e,
                        "direct send failed, queueing command"
                    );
                    return Ok(self.enqueue(device_id, cmd));
                }

                self.registry.record_command_executed(device_id);
                debug!(
                    device_id = %device_id,
                    command_id = %cmd.id,
                    command = %cmd.command,
                    "command transmitted"
                );

                return Ok(
                    match tokio::time::timeout(self.config.commands.timeout(), rx).await {
                        Ok(Ok(result)) => CommandOutcome::Delivered(result),
                        Ok(Err(_)) => {
                            // Pending entry evicted (sweep or shutdown)
                            // before a result arrived.
                            CommandOutcome::TimedOut
                        }
                        Err(_) => {
                            self.pending.remove(&cmd.id);
                            debug!(
                                device_id = %device_id,
                                command_id = %cmd.id,
                                "command timed out, resolving without confirmation"
                            );
                            CommandOutcome::TimedOut
                        }
                    },
                );
            }
        }

        Ok(self.enqueue(device_id, cmd))
    }

    /// Resolve a pending dispatch from a `command_result` frame.
    pub fn complete(&self, command_id: &str, result: Value) -> bool {
        match self.pending.remove(command_id) {
            Some((_, pending)) => {
                let _ = pending.tx.send(result);
                true
            }
            None => {
                // Late result for a timed-out or heartbeat-flushed command.
                debug!(command_id = %command_id, "result for unknown command id, dropping");
                false
            }
        }
    }

    /// Park a command in the device's offline queue, evicting past the cap.
    fn enqueue(&self, device_id: &str, cmd: Command) -> CommandOutcome {
        let cap = self.config.commands.queue_max;
        let mut queue = self.queues.entry(device_id.to_string()).or_default();
        match cmd.priority {
            CommandPriority::High => queue.push_front(cmd),
            CommandPriority::Normal => queue.push_back(cmd),
        }
        while queue.len() > cap {
            // Evict the oldest entry: the front-most normal command
            // (normals are FIFO at the back section); an all-priority
            // queue evicts from the back, where its oldest entry sits.
            if let Some(idx) = queue
                .iter()
                .position(|c| c.priority == CommandPriority::Normal)
            {
                queue.remove(idx);
            } else {
                queue.pop_back();
            }
            debug!(device_id = %device_id, "offline queue full, evicted oldest command");
        }
        CommandOutcome::Queued { depth: queue.len() }
    }

    /// Drain up to `max` queued commands for delivery (heartbeat flush
    /// or reconnect). Drained commands are fire-and-forget: their
    /// callers already received the queued outcome.
    pub fn drain(&self, device_id: &str, max: usize) -> Vec<Command> {
        let Some(mut queue) = self.queues.get_mut(device_id) else {
            return Vec::new();
        };
        let take = max.min(queue.len());
        queue.drain(..take).collect()
    }

    /// Current offline queue depth for a device.
    pub fn queue_depth(&self, device_id: &str) -> usize {
        self.queues.get(device_id).map(|q| q.len()).unwrap_or(0)
    }

    /// Start the pending-table expiry sweep. Entries are normally
    /// removed by the timeout path; the sweep reclaims entries whose
    /// dispatch future was dropped mid-flight.
    pub fn spawn_sweep(&self) -> JoinHandle<()> {
        let dispatcher = self.me.upgrade().expect("dispatcher still referenced");
        tokio::spawn(async move {
            let settings = dispatcher.config.commands.clone();
            let max_age = settings.timeout() * 2;
            let mut ticker = tokio::time::interval(settings.sweep_interval());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let before = dispatcher.pending.len();
                dispatcher
                    .pending
                    .retain(|_, pending| pending.created.elapsed() < max_age);
                let evicted = before - dispatcher.pending.len();
                if evicted > 0 {
                    debug!(evicted, "pending-command sweep evicted stale entries");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::Connection;
    use crate::events::EventBus;
    use crate::router::frames::RegisterParams;
    use serde_json::json;
    use std::time::Duration;

    fn fixture(timeout_ms: u64, queue_max: usize) -> (Arc<DeviceRegistry>, Arc<CommandDispatcher>) {
        let mut config = GatewayConfig::default();
        config.commands.timeout_ms = timeout_ms;
        config.commands.queue_max = queue_max;
        let config = Arc::new(config);
        let registry = DeviceRegistry::new(config.clone(), EventBus::new());
        let dispatcher = CommandDispatcher::new(registry.clone(), config);
        (registry, dispatcher)
    }

    fn params(device_id: &str) -> RegisterParams {
        RegisterParams {
            device_id: device_id.to_string(),
            device_type: "display".to_string(),
            device_name: None,
            capabilities: Vec::new(),
            metadata: None,
            firmware_version: None,
        }
    }

    #[tokio::test]
    async fn test_offline_device_queues_command() {
        let (_registry, dispatcher) = fixture(5_000, 10);
        let outcome = dispatcher
            .send_command("esp32-1", "display", json!({"text": "hi"}), CommandPriority::Normal)
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Queued { depth: 1 });
        assert_eq!(dispatcher.queue_depth("esp32-1"), 1);
    }

    #[tokio::test]
    async fn test_queue_bound_evicts_oldest_first() {
        let (_registry, dispatcher) = fixture(5_000, 3);
        for i in 0..4 {
            dispatcher
                .send_command(
                    "esp32-1",
                    format!("cmd-{i}"),
                    Value::Null,
                    CommandPriority::Normal,
                )
                .await
                .unwrap();
        }
        let drained = dispatcher.drain("esp32-1", 10);
        let names: Vec<_> = drained.iter().map(|c| c.command.as_str()).collect();
        // cmd-0 was the oldest and fell off the cap.
        assert_eq!(names, vec!["cmd-1", "cmd-2", "cmd-3"]);
    }

    #[tokio::test]
    async fn test_priority_commands_stay_ahead_and_survive_eviction() {
        let (_registry, dispatcher) = fixture(5_000, 3);
        dispatcher
            .send_command("esp32-1", "normal-0", Value::Null, CommandPriority::Normal)
            .await
            .unwrap();
        dispatcher
            .send_command("esp32-1", "urgent", Value::Null, CommandPriority::High)
            .await
            .unwrap();
        dispatcher
            .send_command("esp32-1", "normal-1", Value::Null, CommandPriority::Normal)
            .await
            .unwrap();
        dispatcher
            .send_command("esp32-1", "normal-2", Value::Null, CommandPriority::Normal)
            .await
            .unwrap();

        let drained = dispatcher.drain("esp32-1", 10);
        let names: Vec<_> = drained.iter().map(|c| c.command.as_str()).collect();
        // normal-0 (oldest normal) evicted; the high command leads.
        assert_eq!(names, vec!["urgent", "normal-1", "normal-2"]);
    }

    #[tokio::test]
    async fn test_command_timeout_resolves_not_throws() {
        let (registry, dispatcher) = fixture(100, 10);
        let (conn, mut rx, _gauge) = Connection::channel(None);
        registry.register(&params("esp32-1"), conn).unwrap();

        let started = Instant::now();
        let outcome = dispatcher
            .send_command("esp32-1", "display", Value::Null, CommandPriority::Normal)
            .await
            .unwrap();

        assert_eq!(outcome, CommandOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_eq!(outcome.to_json()["timeout"], true);
        // The frame itself did go out.
        let msg = rx.recv().await.unwrap();
        assert!(msg.payload.contains("\"command\""));
    }

    #[tokio::test]
    async fn test_command_result_resolves_dispatch() {
        let (registry, dispatcher) = fixture(2_000, 10);
        let (conn, mut rx, _gauge) = Connection::channel(None);
        registry.register(&params("esp32-1"), conn).unwrap();

        let responder = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let msg = rx.recv().await.unwrap();
                let frame: Value = serde_json::from_str(&msg.payload).unwrap();
                let command_id = frame["id"].as_str().unwrap().to_string();
                dispatcher.complete(&command_id, json!({"status": "shown"}));
            })
        };

        let outcome = dispatcher
            .send_command("esp32-1", "display", json!({"text": "hi"}), CommandPriority::Normal)
            .await
            .unwrap();
        responder.await.unwrap();

        assert_eq!(outcome, CommandOutcome::Delivered(json!({"status": "shown"})));
        assert_eq!(
            registry.device("esp32-1").unwrap().stats.commands_executed,
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_command_result_is_dropped() {
        let (_registry, dispatcher) = fixture(5_000, 10);
        assert!(!dispatcher.complete("no-such-id", Value::Null));
    }

    #[tokio::test]
    async fn test_drain_respects_batch_size() {
        let (_registry, dispatcher) = fixture(5_000, 10);
        for i in 0..5 {
            dispatcher
                .send_command(
                    "esp32-1",
                    format!("cmd-{i}"),
                    Value::Null,
                    CommandPriority::Normal,
                )
                .await
                .unwrap();
        }
        assert_eq!(dispatcher.drain("esp32-1", 3).len(), 3);
        assert_eq!(dispatcher.queue_depth("esp32-1"), 2);
    }
}
