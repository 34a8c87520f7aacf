//! The instance tracker interface and its in-memory implementation.
//!
//! The tracker is the authoritative store of all known instances. The
//! core only mutates goals through it; it never deletes instances. The
//! update stream is durable-broadcast shaped: subscribing yields a
//! snapshot of all known instances followed by an append-only stream of
//! changes, so a watcher constructed before a goal change cannot miss
//! the resulting events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use flotilla_core::instance::{Condition, Goal, GoalReason, Instance, InstanceId};
use flotilla_core::path::AppPath;

use crate::error::ClusterResult;

/// One change on the instance update stream.
#[derive(Debug, Clone)]
pub enum InstanceChange {
    Updated(Instance),
    Removed(InstanceId),
}

impl InstanceChange {
    /// The id of the instance this change concerns.
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            InstanceChange::Updated(instance) => &instance.id,
            InstanceChange::Removed(id) => id,
        }
    }
}

/// A subscription to the instance update stream: the snapshot at
/// subscription time plus all changes after it.
pub struct InstanceSubscription {
    pub snapshot: Vec<Instance>,
    pub changes: broadcast::Receiver<InstanceChange>,
}

/// Authoritative store of all known instances.
#[async_trait]
pub trait InstanceTracker: Send + Sync {
    /// All instances of one run spec.
    async fn spec_instances(&self, id: &AppPath) -> ClusterResult<Vec<Instance>>;

    /// One instance by id.
    async fn get(&self, id: &InstanceId) -> ClusterResult<Option<Instance>>;

    /// All instances, grouped by run spec.
    async fn instances_by_spec(&self) -> ClusterResult<HashMap<AppPath, Vec<Instance>>>;

    /// Set the goal of an instance. Sticky: the tracker drives the
    /// instance toward the goal. Idempotent for repeated identical goals.
    async fn set_goal(&self, id: &InstanceId, goal: Goal, reason: GoalReason)
        -> ClusterResult<()>;

    /// Subscribe to the update stream (snapshot first).
    async fn instance_updates(&self) -> ClusterResult<InstanceSubscription>;
}

/// A recorded `set_goal` call, for test assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GoalChange {
    pub instance: InstanceId,
    pub goal: Goal,
    pub reason: GoalReason,
}

/// In-memory tracker. Applies halt goals immediately (the instance
/// transitions to `Killed` and the change is broadcast), standing in for
/// the cluster-side kill that a real tracker only initiates.
pub struct MemoryTracker {
    instances: RwLock<HashMap<InstanceId, Instance>>,
    changes: broadcast::Sender<InstanceChange>,
    goal_log: Mutex<Vec<GoalChange>>,
    auto_kill: AtomicBool,
}

impl MemoryTracker {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            instances: RwLock::new(HashMap::new()),
            changes,
            goal_log: Mutex::new(Vec::new()),
            auto_kill: AtomicBool::new(true),
        }
    }

    /// When disabled, halt goals only record the goal without moving the
    /// instance to a terminal condition — the cluster-faithful behavior,
    /// where termination arrives later as a separate change. Tests use
    /// this to keep instances alive across a controlled window.
    pub fn set_auto_kill(&self, enabled: bool) {
        self.auto_kill.store(enabled, Ordering::SeqCst);
    }

    /// Insert or replace an instance and broadcast the change.
    pub async fn upsert(&self, instance: Instance) {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.clone(), instance.clone());
        drop(instances);
        let _ = self.changes.send(InstanceChange::Updated(instance));
    }

    /// Forget an instance entirely and broadcast the removal.
    pub async fn remove(&self, id: &InstanceId) {
        let mut instances = self.instances.write().await;
        if instances.remove(id).is_some() {
            drop(instances);
            let _ = self.changes.send(InstanceChange::Removed(id.clone()));
        }
    }

    /// Every `set_goal` call made so far, in order.
    pub fn goal_changes(&self) -> Vec<GoalChange> {
        self.goal_log.lock().unwrap().clone()
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceTracker for MemoryTracker {
    async fn spec_instances(&self, id: &AppPath) -> ClusterResult<Vec<Instance>> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.run_spec_id() == id)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &InstanceId) -> ClusterResult<Option<Instance>> {
        let instances = self.instances.read().await;
        Ok(instances.get(id).cloned())
    }

    async fn instances_by_spec(&self) -> ClusterResult<HashMap<AppPath, Vec<Instance>>> {
        let instances = self.instances.read().await;
        let mut by_spec: HashMap<AppPath, Vec<Instance>> = HashMap::new();
        for instance in instances.values() {
            by_spec
                .entry(instance.run_spec_id().clone())
                .or_default()
                .push(instance.clone());
        }
        Ok(by_spec)
    }

    async fn set_goal(
        &self,
        id: &InstanceId,
        goal: Goal,
        reason: GoalReason,
    ) -> ClusterResult<()> {
        self.goal_log.lock().unwrap().push(GoalChange {
            instance: id.clone(),
            goal,
            reason,
        });

        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(id) else {
            // Already gone; a sticky goal on a forgotten instance is a no-op.
            warn!(instance = %id, ?goal, "goal change for unknown instance");
            return Ok(());
        };

        instance.goal = goal;
        if matches!(goal, Goal::Stopped | Goal::Decommissioned)
            && !instance.condition.is_terminal()
            && self.auto_kill.load(Ordering::SeqCst)
        {
            instance.condition = Condition::Killed;
        }
        let updated = instance.clone();
        drop(instances);

        debug!(instance = %id, ?goal, %reason, "goal set");
        let _ = self.changes.send(InstanceChange::Updated(updated));
        Ok(())
    }

    async fn instance_updates(&self) -> ClusterResult<InstanceSubscription> {
        // Subscribe while holding the read lock so no change can slip
        // between the snapshot and the stream.
        let instances = self.instances.read().await;
        let changes = self.changes.subscribe();
        let snapshot = instances.values().cloned().collect();
        Ok(InstanceSubscription { snapshot, changes })
    }
}
