//! Scheduler actions: per-run-spec scaling and fleet-wide task
//! reconciliation.
//!
//! Invoked from the scheduler core under a run-spec lock (scale) or the
//! in-flight reconcile marker (reconcile); the core serializes the
//! invocations, so the actions themselves just talk to the
//! collaborators.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use flotilla_cluster::{
    InstanceTracker, KillWatch, LaunchQueue, TaskReconciler,
};
use flotilla_core::instance::{Goal, GoalReason, TaskStatus};
use flotilla_core::path::AppPath;
use flotilla_core::spec::RunSpec;
use flotilla_deploy::propose;
use flotilla_state::PlanStore;

use crate::error::{SchedulerError, SchedulerResult};

/// The collaborators the actions run against. Cheap to clone into
/// spawned tasks.
#[derive(Clone)]
pub struct Actions {
    pub tracker: Arc<dyn InstanceTracker>,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub driver: Arc<dyn TaskReconciler>,
    pub store: PlanStore,
}

impl Actions {
    /// Scale a run spec toward its declared instance count. An unknown
    /// id logs and returns.
    pub async fn scale_by_id(&self, id: &AppPath) -> SchedulerResult<()> {
        let root = self.store.root().map_err(|e| {
            SchedulerError::CommandFailed(format!("group repository: {e}"))
        })?;
        match root.spec(id) {
            Some(spec) => self.scale(&spec.clone()).await,
            None => {
                info!(run_spec = %id, "scale requested for unknown run spec");
                Ok(())
            }
        }
    }

    /// Scale one run spec: decommission over-capacity instances
    /// (youngest/oldest per its policy), then top up the launch queue.
    pub async fn scale(&self, spec: &RunSpec) -> SchedulerResult<()> {
        let instances = match self.tracker.spec_instances(&spec.id).await {
            Ok(instances) => instances,
            Err(e) => {
                // An unavailable tracker reads as "no active instances".
                warn!(run_spec = %spec.id, error = %e, "tracker unavailable, assuming no instances");
                Vec::new()
            }
        };

        let active: Vec<_> = instances.iter().filter(|i| i.is_active()).cloned().collect();
        let scheduled = instances.iter().filter(|i| i.is_scheduled()).count() as u32;

        let proposition = propose(&active, &[], spec.instances, spec.kill_selection);

        if proposition.to_kill.is_none() && proposition.to_start.is_none() {
            debug!(run_spec = %spec.id, instances = active.len(), "already at target");
            return Ok(());
        }

        if let Some(to_kill) = &proposition.to_kill {
            info!(run_spec = %spec.id, count = to_kill.len(), "killing over-capacity instances");
            self.launch_queue
                .purge(&spec.id)
                .await
                .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;

            let watch = KillWatch::killed(
                self.tracker.clone(),
                to_kill.iter().map(|i| i.id.clone()),
            )
            .await
            .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;

            for instance in to_kill {
                let goal = if instance.has_reservation {
                    Goal::Stopped
                } else {
                    Goal::Decommissioned
                };
                self.tracker
                    .set_goal(&instance.id, goal, GoalReason::OverCapacity)
                    .await
                    .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;
            }
            watch
                .wait()
                .await
                .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;
        }

        if let Some(to_start) = proposition.to_start {
            let to_add = to_start.saturating_sub(scheduled);
            if to_add > 0 {
                info!(run_spec = %spec.id, to_add, "queueing additional instances");
                self.launch_queue
                    .add(spec, to_add)
                    .await
                    .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;
            } else {
                debug!(
                    run_spec = %spec.id,
                    to_start,
                    scheduled,
                    "enough instances already scheduled"
                );
            }
        }

        Ok(())
    }

    /// Reconcile the orchestrator's view of tasks with the cluster's:
    /// submit every non-terminal cluster-reported status for known run
    /// specs, decommission orphaned instances, and solicit implicit
    /// statuses with a final empty call.
    pub async fn reconcile(&self) -> SchedulerResult<()> {
        let root = self.store.root().map_err(|e| {
            SchedulerError::CommandFailed(format!("group repository: {e}"))
        })?;
        let known: HashSet<AppPath> = root.transitive_ids().into_iter().collect();

        let by_spec = self
            .tracker
            .instances_by_spec()
            .await
            .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;

        let mut statuses: Vec<TaskStatus> = Vec::new();
        let mut orphans = Vec::new();
        for (spec_id, instances) in &by_spec {
            if known.contains(spec_id) {
                for instance in instances {
                    statuses.extend(
                        instance
                            .tasks
                            .iter()
                            .filter_map(|t| t.status.clone())
                            .filter(|s| !s.condition.is_terminal()),
                    );
                }
            } else {
                orphans.extend(instances.iter().map(|i| i.id.clone()));
            }
        }

        for id in orphans {
            warn!(instance = %id, "decommissioning orphaned instance");
            if let Err(e) = self
                .tracker
                .set_goal(&id, Goal::Decommissioned, GoalReason::Orphaned)
                .await
            {
                warn!(instance = %id, error = %e, "failed to decommission orphan");
            }
        }

        info!(statuses = statuses.len(), "reconciling task statuses");
        if !statuses.is_empty() {
            self.driver
                .reconcile_tasks(statuses)
                .await
                .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;
        }
        // Empty call solicits implicit statuses for unknown tasks.
        self.driver
            .reconcile_tasks(Vec::new())
            .await
            .map_err(|e| SchedulerError::CommandFailed(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use flotilla_cluster::{MemoryLaunchQueue, MemoryReconciler, MemoryTracker};
    use flotilla_core::instance::{Condition, Instance, InstanceId, Task};
    use flotilla_core::spec::{Group, KillSelection};

    struct Rig {
        actions: Actions,
        tracker: Arc<MemoryTracker>,
        queue: Arc<MemoryLaunchQueue>,
        driver: Arc<MemoryReconciler>,
        store: PlanStore,
    }

    fn rig() -> Rig {
        let tracker = Arc::new(MemoryTracker::new());
        let queue = Arc::new(MemoryLaunchQueue::new(tracker.clone()));
        let driver = Arc::new(MemoryReconciler::new());
        let store = PlanStore::open_in_memory().unwrap();
        let actions = Actions {
            tracker: tracker.clone(),
            launch_queue: queue.clone(),
            driver: driver.clone(),
            store: store.clone(),
        };
        Rig {
            actions,
            tracker,
            queue,
            driver,
            store,
        }
    }

    fn path(raw: &str) -> AppPath {
        AppPath::parse(raw).unwrap()
    }

    fn running_instance(app: &str, token: &str, started_at: u64) -> Instance {
        Instance {
            condition: Condition::Running,
            started_at,
            ..Instance::provisioned(InstanceId::new(path(app), token), 0)
        }
    }

    #[tokio::test]
    async fn scale_up_adds_to_launch_queue() {
        let rig = rig();
        let spec = RunSpec::new(path("/app"), 3);
        rig.tracker.upsert(running_instance("/app", "i1", 0)).await;

        rig.actions.scale(&spec).await.unwrap();

        assert_eq!(rig.queue.adds(), vec![(spec.id.clone(), 2)]);
        assert!(rig.tracker.goal_changes().is_empty());
    }

    #[tokio::test]
    async fn scale_up_discounts_scheduled_instances() {
        let rig = rig();
        let spec = RunSpec::new(path("/app"), 3);
        rig.tracker.upsert(running_instance("/app", "i1", 0)).await;
        rig.tracker
            .upsert(Instance::provisioned(
                InstanceId::new(path("/app"), "pending"),
                0,
            ))
            .await;

        rig.actions.scale(&spec).await.unwrap();

        // Two to start, one already scheduled.
        assert_eq!(rig.queue.adds(), vec![(spec.id.clone(), 1)]);
    }

    #[tokio::test]
    async fn scale_down_purges_then_kills_youngest() {
        let rig = rig();
        let spec = RunSpec {
            kill_selection: KillSelection::YoungestFirst,
            ..RunSpec::new(path("/app"), 1)
        };
        rig.tracker.upsert(running_instance("/app", "old", 0)).await;
        let young = running_instance("/app", "young", 1000);
        rig.tracker.upsert(young.clone()).await;

        rig.actions.scale(&spec).await.unwrap();

        assert_eq!(rig.queue.purges(), vec![spec.id.clone()]);
        let changes = rig.tracker.goal_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].instance, young.id);
        assert_eq!(changes[0].goal, Goal::Decommissioned);
        assert_eq!(changes[0].reason, GoalReason::OverCapacity);
        assert!(rig.queue.adds().is_empty());
    }

    #[tokio::test]
    async fn scale_at_target_is_a_no_op() {
        let rig = rig();
        let spec = RunSpec::new(path("/app"), 2);
        rig.tracker.upsert(running_instance("/app", "i1", 0)).await;
        rig.tracker.upsert(running_instance("/app", "i2", 1)).await;

        rig.actions.scale(&spec).await.unwrap();

        assert!(rig.queue.adds().is_empty());
        assert!(rig.queue.purges().is_empty());
        assert!(rig.tracker.goal_changes().is_empty());
    }

    #[tokio::test]
    async fn scale_by_id_for_unknown_spec_returns_ok() {
        let rig = rig();
        rig.actions.scale_by_id(&path("/missing")).await.unwrap();
        assert!(rig.queue.adds().is_empty());
    }

    #[tokio::test]
    async fn scale_by_id_reads_the_group_tree() {
        let rig = rig();
        let mut root = Group::empty_root();
        root.put_spec(RunSpec::new(path("/app"), 2));
        rig.store.put_root(&root).unwrap();

        rig.actions.scale_by_id(&path("/app")).await.unwrap();
        assert_eq!(rig.queue.adds(), vec![(path("/app"), 2)]);
    }

    #[tokio::test]
    async fn reconcile_submits_non_terminal_statuses_then_empty() {
        let rig = rig();
        let mut root = Group::empty_root();
        root.put_spec(RunSpec::new(path("/app"), 1));
        rig.store.put_root(&root).unwrap();

        let mut instance = running_instance("/app", "i1", 0);
        instance.tasks = vec![
            Task {
                id: "t-running".to_string(),
                status: Some(TaskStatus {
                    task_id: "t-running".to_string(),
                    condition: Condition::Running,
                }),
            },
            Task {
                id: "t-finished".to_string(),
                status: Some(TaskStatus {
                    task_id: "t-finished".to_string(),
                    condition: Condition::Finished,
                }),
            },
            Task {
                id: "t-unreported".to_string(),
                status: None,
            },
        ];
        rig.tracker.upsert(instance).await;

        rig.actions.reconcile().await.unwrap();

        let calls = rig.driver.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].len(), 1);
        assert_eq!(calls[0][0].task_id, "t-running");
        assert!(calls[1].is_empty());
    }

    #[tokio::test]
    async fn reconcile_decommissions_orphans() {
        let rig = rig();
        // Empty group tree; the tracker still knows one instance.
        let orphan = running_instance("/deleted-app", "i1", 0);
        rig.tracker.upsert(orphan.clone()).await;

        rig.actions.reconcile().await.unwrap();

        let changes = rig.tracker.goal_changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].instance, orphan.id);
        assert_eq!(changes[0].goal, Goal::Decommissioned);
        assert_eq!(changes[0].reason, GoalReason::Orphaned);

        // No statuses to submit: only the empty solicitation call.
        let calls = rig.driver.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].is_empty());
    }

    #[tokio::test]
    async fn reconcile_without_statuses_makes_one_empty_call() {
        let rig = rig();
        rig.actions.reconcile().await.unwrap();
        let calls = rig.driver.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].is_empty());
    }
}
