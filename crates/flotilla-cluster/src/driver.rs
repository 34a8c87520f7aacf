//! The low-level cluster driver interface.
//!
//! The only operation the core needs from the offer-protocol driver is
//! explicit task reconciliation: submitting the task statuses we believe
//! are current, plus an empty call that solicits implicit statuses for
//! tasks we don't know about.

use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use flotilla_core::instance::TaskStatus;

use crate::error::ClusterResult;

/// Speaks the cluster's offer protocol; only reconciliation is exposed.
#[async_trait]
pub trait TaskReconciler: Send + Sync {
    /// Ask the cluster to re-report the given task statuses. An empty
    /// list solicits implicit statuses for all tasks.
    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> ClusterResult<()>;
}

/// In-memory driver that records every reconcile call.
#[derive(Default)]
pub struct MemoryReconciler {
    calls: Mutex<Vec<Vec<TaskStatus>>>,
}

impl MemoryReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every reconcile call made so far, in order.
    pub fn calls(&self) -> Vec<Vec<TaskStatus>> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskReconciler for MemoryReconciler {
    async fn reconcile_tasks(&self, statuses: Vec<TaskStatus>) -> ClusterResult<()> {
        debug!(count = statuses.len(), "task reconciliation requested");
        self.calls.lock().unwrap().push(statuses);
        Ok(())
    }
}
