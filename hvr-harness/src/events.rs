//! Lifecycle event broadcast for runners, controllers and races.
//!
//! Events are observational only. Nothing in the harness waits on a
//! subscriber, and a bus with no receivers silently drops every event.

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_BUFFER: usize = 256;

pub const RUNNER_STARTING_FRESH: &str = "runner.starting_fresh";
pub const RUNNER_RESUMING: &str = "runner.resuming";
pub const RUNNER_STEP_SKIPPED: &str = "runner.step_skipped";
pub const RUNNER_STEP_STARTED: &str = "runner.step_started";
pub const RUNNER_STEP_COMPLETED: &str = "runner.step_completed";
pub const RUNNER_STEP_FAILED: &str = "runner.step_failed";
pub const RUNNER_REBOOT_REQUESTED: &str = "runner.reboot_requested";
pub const RUNNER_FINISHED: &str = "runner.finished";

pub const CONTROLLER_STATE: &str = "controller.state";
pub const CONTROLLER_OUTCOME: &str = "controller.outcome";

pub const RACE_STARTED: &str = "race.started";
pub const RACE_DECIDED: &str = "race.decided";
pub const RACE_TIMED_OUT: &str = "race.timed_out";
pub const RACE_ALL_COMPLETED: &str = "race.all_completed";

/// Broadcast channel for harness events (JSON lines).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<String>,
}

impl EventBus {
    /// Create a bus. The buffer is clamped to at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.sender.subscribe()
    }

    /// Emit a structured event with payload.
    pub fn emit<T: Serialize>(&self, event: &str, data: &T) {
        let payload = json!({
            "event": event,
            "data": data,
            "timestamp": Utc::now().to_rfc3339(),
        });
        match serde_json::to_string(&payload) {
            Ok(serialized) => {
                let _ = self.sender.send(serialized);
            }
            Err(err) => warn!(event, error = %err, "Failed to serialize event"),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receivers", &self.sender.receiver_count())
            .finish()
    }
}

/// Drain every event currently buffered in `rx` and return their names.
#[cfg(test)]
pub(crate) fn drain_names(rx: &mut broadcast::Receiver<String>) -> Vec<String> {
    let mut names = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&msg)
            && let Some(name) = value["event"].as_str()
        {
            names.push(name.to_string());
        }
    }
    names
}
