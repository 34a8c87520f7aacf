//! Kill-stream watchers.
//!
//! A [`KillWatch`] subscribes to the instance update stream at
//! construction time, *before* the caller issues the goal changes that
//! trigger termination; the snapshot-first delivery of the stream then
//! guarantees no missed events. Dropping a watch detaches the
//! subscription without side effects.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, trace};

use flotilla_core::instance::{Goal, Instance, InstanceId};

use crate::error::{ClusterError, ClusterResult};
use crate::tracker::{InstanceChange, InstanceTracker};

/// What a watch waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WatchMode {
    /// Terminal condition, or gone from the tracker.
    Killed,
    /// Gone from the tracker, or decommissioned goal with a terminal
    /// condition.
    Decommissioned,
}

impl WatchMode {
    fn satisfied_by(self, instance: &Instance) -> bool {
        match self {
            WatchMode::Killed => instance.condition.is_terminal(),
            WatchMode::Decommissioned => {
                instance.goal == Goal::Decommissioned && instance.condition.is_terminal()
            }
        }
    }
}

/// A pending completion signal over a set of expected instances.
pub struct KillWatch {
    tracker: Arc<dyn InstanceTracker>,
    mode: WatchMode,
    pending: HashSet<InstanceId>,
    changes: tokio::sync::broadcast::Receiver<InstanceChange>,
}

impl KillWatch {
    /// Watch until every expected instance reaches a terminal condition
    /// or disappears from the tracker.
    pub async fn killed(
        tracker: Arc<dyn InstanceTracker>,
        expected: impl IntoIterator<Item = InstanceId>,
    ) -> ClusterResult<Self> {
        Self::subscribe(tracker, WatchMode::Killed, expected).await
    }

    /// Watch until every expected instance is absent from the tracker or
    /// has a decommissioned goal and a terminal condition.
    pub async fn decommissioned(
        tracker: Arc<dyn InstanceTracker>,
        expected: impl IntoIterator<Item = InstanceId>,
    ) -> ClusterResult<Self> {
        Self::subscribe(tracker, WatchMode::Decommissioned, expected).await
    }

    async fn subscribe(
        tracker: Arc<dyn InstanceTracker>,
        mode: WatchMode,
        expected: impl IntoIterator<Item = InstanceId>,
    ) -> ClusterResult<Self> {
        let mut pending: HashSet<InstanceId> = expected.into_iter().collect();
        let sub = tracker.instance_updates().await?;
        retain_unsatisfied(&mut pending, &sub.snapshot, mode);
        debug!(?mode, remaining = pending.len(), "kill watch subscribed");
        Ok(Self {
            tracker,
            mode,
            pending,
            changes: sub.changes,
        })
    }

    /// Number of instances still awaited.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// Resolve once every expected instance satisfies the watch mode.
    pub async fn wait(mut self) -> ClusterResult<()> {
        while !self.pending.is_empty() {
            match self.changes.recv().await {
                Ok(InstanceChange::Updated(instance)) => {
                    if self.pending.contains(&instance.id)
                        && self.mode.satisfied_by(&instance)
                    {
                        trace!(instance = %instance.id, "watched instance terminated");
                        self.pending.remove(&instance.id);
                    }
                }
                Ok(InstanceChange::Removed(id)) => {
                    self.pending.remove(&id);
                }
                Err(RecvError::Lagged(missed)) => {
                    // Fell behind the broadcast buffer; resynchronize
                    // from a fresh snapshot.
                    debug!(missed, "kill watch lagged, resubscribing");
                    let sub = self.tracker.instance_updates().await?;
                    retain_unsatisfied(&mut self.pending, &sub.snapshot, self.mode);
                    self.changes = sub.changes;
                }
                Err(RecvError::Closed) => return Err(ClusterError::StreamClosed),
            }
        }
        Ok(())
    }
}

/// Drop every pending id that the snapshot already satisfies — including
/// ids the snapshot no longer contains at all.
fn retain_unsatisfied(
    pending: &mut HashSet<InstanceId>,
    snapshot: &[Instance],
    mode: WatchMode,
) {
    pending.retain(|id| {
        snapshot
            .iter()
            .find(|instance| &instance.id == id)
            .is_some_and(|instance| !mode.satisfied_by(instance))
    });
}
