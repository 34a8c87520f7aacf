//! Process-wide scheduler events.
//!
//! Published on a broadcast channel; consumers are subsystems outside the
//! scheduling core (API layer, event log). Publishing never blocks and
//! never fails: with no subscribers the event is simply dropped.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::path::AppPath;

/// Events emitted by the deployment scheduling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    DeploymentStarted {
        plan_id: String,
        affected: Vec<AppPath>,
    },
    /// Announced before each step begins (1-based index).
    DeploymentStepInfo {
        plan_id: String,
        step_index: usize,
        total_steps: usize,
    },
    /// A step is executing.
    DeploymentStatus {
        plan_id: String,
        step_index: usize,
    },
    DeploymentStepSuccess {
        plan_id: String,
        step_index: usize,
    },
    DeploymentStepFailure {
        plan_id: String,
        step_index: usize,
    },
    DeploymentSuccess {
        plan_id: String,
    },
    DeploymentFailed {
        plan_id: String,
        reason: Option<String>,
    },
    /// A run spec was stopped and all its instances decommissioned.
    AppTerminated {
        run_spec: AppPath,
    },
    /// A restart (upgrade) of a run spec began.
    UpgradeStarted {
        run_spec: AppPath,
        plan_id: String,
    },
}

/// Broadcast bus for [`SchedulerEvent`]s.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// A bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    pub fn publish(&self, event: SchedulerEvent) {
        trace!(?event, "publishing event");
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
