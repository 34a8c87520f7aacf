//! The launch queue interface and its in-memory implementation.
//!
//! The launch queue is the component that actually requests new instance
//! launches and applies back-off delays between failed attempts. The
//! core adds launch demand, purges a spec's entry when stopping it, and
//! resets the back-off after a stop so a re-created spec launches
//! immediately.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tracing::debug;

use flotilla_core::instance::{Condition, Instance, InstanceId};
use flotilla_core::path::AppPath;
use flotilla_core::spec::RunSpec;

use crate::error::ClusterResult;
use crate::tracker::MemoryTracker;

/// Requests instance launches from the cluster.
#[async_trait]
pub trait LaunchQueue: Send + Sync {
    /// Request `count` additional instances of `spec`.
    async fn add(&self, spec: &RunSpec, count: u32) -> ClusterResult<()>;

    /// Drop all queued demand for a run spec.
    async fn purge(&self, id: &AppPath) -> ClusterResult<()>;

    /// Clear the launch back-off for a run spec.
    async fn reset_delay(&self, spec: &RunSpec) -> ClusterResult<()>;
}

/// In-memory launch queue that launches instantly into a
/// [`MemoryTracker`] (no back-off) and records every call.
pub struct MemoryLaunchQueue {
    tracker: Arc<MemoryTracker>,
    adds: Mutex<Vec<(AppPath, u32)>>,
    purges: Mutex<Vec<AppPath>>,
    resets: Mutex<Vec<(AppPath, u32)>>,
}

impl MemoryLaunchQueue {
    pub fn new(tracker: Arc<MemoryTracker>) -> Self {
        Self {
            tracker,
            adds: Mutex::new(Vec::new()),
            purges: Mutex::new(Vec::new()),
            resets: Mutex::new(Vec::new()),
        }
    }

    /// Every `add` call made so far: (run spec id, count).
    pub fn adds(&self) -> Vec<(AppPath, u32)> {
        self.adds.lock().unwrap().clone()
    }

    /// Every `purge` call made so far.
    pub fn purges(&self) -> Vec<AppPath> {
        self.purges.lock().unwrap().clone()
    }

    /// Every `reset_delay` call made so far: (run spec id, spec instance
    /// count at the time of the call).
    pub fn resets(&self) -> Vec<(AppPath, u32)> {
        self.resets.lock().unwrap().clone()
    }
}

#[async_trait]
impl LaunchQueue for MemoryLaunchQueue {
    async fn add(&self, spec: &RunSpec, count: u32) -> ClusterResult<()> {
        self.adds.lock().unwrap().push((spec.id.clone(), count));
        debug!(run_spec = %spec.id, count, "launching instances");

        for _ in 0..count {
            let instance = Instance {
                condition: Condition::Running,
                started_at: now_millis(),
                ..Instance::provisioned(
                    InstanceId::generate(spec.id.clone()),
                    spec.version,
                )
            };
            self.tracker.upsert(instance).await;
        }
        Ok(())
    }

    async fn purge(&self, id: &AppPath) -> ClusterResult<()> {
        self.purges.lock().unwrap().push(id.clone());
        debug!(run_spec = %id, "launch queue purged");
        Ok(())
    }

    async fn reset_delay(&self, spec: &RunSpec) -> ClusterResult<()> {
        self.resets
            .lock()
            .unwrap()
            .push((spec.id.clone(), spec.instances));
        debug!(run_spec = %spec.id, "launch delay reset");
        Ok(())
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
