//! The deployment manager.
//!
//! A single-worker actor owning the active-plans table. It accepts new
//! plans (resolving conflicts by affected-run-spec overlap), persists
//! them, spawns one step executor per plan, and finalizes entries when
//! executors report back. Forced plans cancel their conflicts and wait
//! for the cancellations to finish before starting.
//!
//! The manager owns executor lifetimes; executors only send messages
//! back — no mutual ownership.

use std::collections::{BTreeSet, HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use flotilla_core::event::SchedulerEvent;
use flotilla_core::path::AppPath;
use flotilla_core::plan::DeploymentPlan;
use flotilla_state::PlanStore;

use crate::error::{DeployError, DeployResult};
use crate::executor::{self, ExecutorHandle};
use crate::DeployContext;

/// Cancellation cause used when a forced deployment preempts conflicts.
const SUPERSEDED: &str = "superseded";

/// Messages handled by the manager: its API plus executor progress.
pub enum ManagerMsg {
    Start {
        plan: DeploymentPlan,
        force: bool,
        /// True during leadership recovery, when the plan is already in
        /// the repository and the write must be skipped.
        persisted: bool,
        /// Resolves when the plan is accepted (or rejected).
        started: oneshot::Sender<DeployResult<()>>,
        /// Resolves when the deployment finishes.
        done: oneshot::Sender<DeployResult<()>>,
    },
    Cancel {
        plan_id: String,
        reply: oneshot::Sender<DeployResult<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<DeploymentInfo>>,
    },
    /// Executor progress: a step is about to begin (1-based).
    StepInfo { plan_id: String, step_index: usize },
    /// Executor completion, successful or not.
    ExecutorFinished {
        plan_id: String,
        result: DeployResult<()>,
    },
}

/// Snapshot of one active deployment.
#[derive(Debug, Clone)]
pub struct DeploymentInfo {
    pub plan: DeploymentPlan,
    /// The step currently executing (1-based; 0 before the first step).
    pub current_step: usize,
}

struct ActiveEntry {
    plan: DeploymentPlan,
    affected: BTreeSet<AppPath>,
    handle: ExecutorHandle,
    done: Option<oneshot::Sender<DeployResult<()>>>,
    current_step: usize,
}

struct PendingStart {
    plan: DeploymentPlan,
    persisted: bool,
    started: oneshot::Sender<DeployResult<()>>,
    done: oneshot::Sender<DeployResult<()>>,
    /// Conflicting plan ids whose cancellation we are waiting out.
    waiting_on: HashSet<String>,
}

/// Cheap handle for talking to a spawned manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerMsg>,
}

impl ManagerHandle {
    /// Begin a new plan. Returns the acceptance result and a receiver
    /// resolving when the deployment finishes.
    pub async fn start(
        &self,
        plan: DeploymentPlan,
        force: bool,
        persisted: bool,
    ) -> (DeployResult<()>, oneshot::Receiver<DeployResult<()>>) {
        let (started_tx, started_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();
        let sent = self
            .tx
            .send(ManagerMsg::Start {
                plan,
                force,
                persisted,
                started: started_tx,
                done: done_tx,
            })
            .await;
        if sent.is_err() {
            return (Err(DeployError::ManagerUnavailable), done_rx);
        }
        let started = started_rx
            .await
            .unwrap_or(Err(DeployError::ManagerUnavailable));
        (started, done_rx)
    }

    /// Cancel a specific in-flight plan.
    pub async fn cancel(&self, plan_id: &str) -> DeployResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ManagerMsg::Cancel {
                plan_id: plan_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| DeployError::ManagerUnavailable)?;
        reply_rx.await.unwrap_or(Err(DeployError::ManagerUnavailable))
    }

    /// Snapshot of active plans.
    pub async fn list(&self) -> Vec<DeploymentInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(ManagerMsg::List { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }
}

/// The manager actor.
pub struct DeploymentManager {
    rx: mpsc::Receiver<ManagerMsg>,
    /// Sender cloned into executors for progress messages.
    self_tx: mpsc::Sender<ManagerMsg>,
    ctx: DeployContext,
    store: PlanStore,
    active: HashMap<String, ActiveEntry>,
    pending: Vec<PendingStart>,
}

impl DeploymentManager {
    /// Spawn the manager task and return a handle to it.
    pub fn spawn(ctx: DeployContext, store: PlanStore, capacity: usize) -> ManagerHandle {
        let (tx, rx) = mpsc::channel(capacity);
        let manager = Self {
            rx,
            self_tx: tx.clone(),
            ctx,
            store,
            active: HashMap::new(),
            pending: Vec::new(),
        };
        tokio::spawn(manager.run());
        ManagerHandle { tx }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                ManagerMsg::Start {
                    plan,
                    force,
                    persisted,
                    started,
                    done,
                } => self.handle_start(plan, force, persisted, started, done),
                ManagerMsg::Cancel { plan_id, reply } => {
                    let _ = reply.send(self.handle_cancel(&plan_id));
                }
                ManagerMsg::List { reply } => {
                    let infos = self
                        .active
                        .values()
                        .map(|entry| DeploymentInfo {
                            plan: entry.plan.clone(),
                            current_step: entry.current_step,
                        })
                        .collect();
                    let _ = reply.send(infos);
                }
                ManagerMsg::StepInfo {
                    plan_id,
                    step_index,
                } => {
                    if let Some(entry) = self.active.get_mut(&plan_id) {
                        entry.current_step = step_index;
                    }
                }
                ManagerMsg::ExecutorFinished { plan_id, result } => {
                    self.handle_finished(&plan_id, result);
                }
            }
        }
        debug!("deployment manager stopped");
    }

    fn handle_start(
        &mut self,
        plan: DeploymentPlan,
        force: bool,
        persisted: bool,
        started: oneshot::Sender<DeployResult<()>>,
        done: oneshot::Sender<DeployResult<()>>,
    ) {
        let affected = plan.affected_run_specs();

        let active_conflicts: Vec<String> = self
            .active
            .values()
            .filter(|entry| !entry.affected.is_disjoint(&affected))
            .map(|entry| entry.plan.id.clone())
            .collect();
        let pending_conflicts: Vec<String> = self
            .pending
            .iter()
            .filter(|p| !p.plan.affected_run_specs().is_disjoint(&affected))
            .map(|p| p.plan.id.clone())
            .collect();

        if active_conflicts.is_empty() && pending_conflicts.is_empty() {
            self.accept(plan, persisted, started, done);
            return;
        }

        // A plan waiting for its own conflicts cannot be preempted yet.
        if !force || !pending_conflicts.is_empty() {
            let conflicts: Vec<String> = active_conflicts
                .into_iter()
                .chain(pending_conflicts)
                .collect();
            let overlap = overlap_ids(&affected, &self.active, &self.pending);
            info!(
                plan_id = %plan.id,
                ?conflicts,
                "deployment rejected, run specs locked"
            );
            let err = DeployError::AppLocked { conflicts, overlap };
            let _ = started.send(Err(err.clone()));
            let _ = done.send(Err(err));
            return;
        }

        info!(
            plan_id = %plan.id,
            conflicts = active_conflicts.len(),
            "forced deployment, canceling conflicts"
        );
        for conflict_id in &active_conflicts {
            if let Some(entry) = self.active.get_mut(conflict_id) {
                entry.handle.cancel(SUPERSEDED);
            }
        }
        self.pending.push(PendingStart {
            plan,
            persisted,
            started,
            done,
            waiting_on: active_conflicts.into_iter().collect(),
        });
    }

    fn accept(
        &mut self,
        plan: DeploymentPlan,
        persisted: bool,
        started: oneshot::Sender<DeployResult<()>>,
        done: oneshot::Sender<DeployResult<()>>,
    ) {
        if !persisted {
            if let Err(e) = self.store.store_plan(&plan) {
                warn!(plan_id = %plan.id, error = %e, "failed to persist plan");
                let err = DeployError::from(e);
                let _ = started.send(Err(err.clone()));
                let _ = done.send(Err(err));
                return;
            }
        }

        let affected = plan.affected_run_specs();
        info!(plan_id = %plan.id, specs = affected.len(), "deployment starting");
        self.ctx.events.publish(SchedulerEvent::DeploymentStarted {
            plan_id: plan.id.clone(),
            affected: affected.iter().cloned().collect(),
        });

        let handle = executor::spawn(plan.clone(), self.ctx.clone(), self.self_tx.clone());
        self.active.insert(
            plan.id.clone(),
            ActiveEntry {
                plan,
                affected,
                handle,
                done: Some(done),
                current_step: 0,
            },
        );
        let _ = started.send(Ok(()));
    }

    fn handle_cancel(&mut self, plan_id: &str) -> DeployResult<()> {
        match self.active.get_mut(plan_id) {
            Some(entry) => {
                info!(plan_id = %plan_id, "canceling deployment");
                entry.handle.cancel("canceled");
                Ok(())
            }
            None => Err(DeployError::UnknownDeployment(plan_id.to_string())),
        }
    }

    fn handle_finished(&mut self, plan_id: &str, result: DeployResult<()>) {
        let Some(mut entry) = self.active.remove(plan_id) else {
            debug!(plan_id = %plan_id, "finish for unknown plan dropped");
            return;
        };

        if let Err(e) = self.store.delete_plan(plan_id) {
            warn!(plan_id = %plan_id, error = %e, "failed to delete finished plan");
        }
        if let Some(done) = entry.done.take() {
            let _ = done.send(result);
        }

        // Unblock forced plans that were waiting on this one.
        let mut ready = Vec::new();
        let mut still_pending = Vec::new();
        for mut pending in self.pending.drain(..) {
            pending.waiting_on.remove(plan_id);
            if pending.waiting_on.is_empty() {
                ready.push(pending);
            } else {
                still_pending.push(pending);
            }
        }
        self.pending = still_pending;
        for pending in ready {
            self.accept(pending.plan, pending.persisted, pending.started, pending.done);
        }
    }
}

/// The run specs of `affected` that overlap any active or pending plan.
fn overlap_ids(
    affected: &BTreeSet<AppPath>,
    active: &HashMap<String, ActiveEntry>,
    pending: &[PendingStart],
) -> Vec<AppPath> {
    let mut taken: BTreeSet<AppPath> = active
        .values()
        .flat_map(|e| e.affected.iter().cloned())
        .collect();
    taken.extend(
        pending
            .iter()
            .flat_map(|p| p.plan.affected_run_specs().into_iter()),
    );
    affected.intersection(&taken).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap as StdHashMap;
    use std::sync::Arc;

    use flotilla_cluster::{MemoryHealthChecks, MemoryLaunchQueue, MemoryTracker};
    use flotilla_core::event::EventBus;
    use flotilla_core::instance::{Condition, Instance, InstanceId};
    use flotilla_core::spec::{Group, RunSpec};

    struct Rig {
        handle: ManagerHandle,
        tracker: Arc<MemoryTracker>,
        store: PlanStore,
        events: EventBus,
    }

    fn rig() -> Rig {
        let tracker = Arc::new(MemoryTracker::new());
        let events = EventBus::default();
        let ctx = DeployContext {
            tracker: tracker.clone(),
            launch_queue: Arc::new(MemoryLaunchQueue::new(tracker.clone())),
            health_checks: Arc::new(MemoryHealthChecks::new()),
            events: events.clone(),
        };
        let store = PlanStore::open_in_memory().unwrap();
        let handle = DeploymentManager::spawn(ctx, store.clone(), 64);
        Rig {
            handle,
            tracker,
            store,
            events,
        }
    }

    fn path(raw: &str) -> AppPath {
        AppPath::parse(raw).unwrap()
    }

    fn running_instance(app: &str, token: &str) -> Instance {
        Instance {
            condition: Condition::Running,
            started_at: 100,
            ..Instance::provisioned(InstanceId::new(path(app), token), 0)
        }
    }

    fn scale_plan(app: &str, from: u32, to: u32) -> DeploymentPlan {
        let mut original = Group::empty_root();
        original.put_spec(RunSpec::new(path(app), from));
        let mut target = Group::empty_root();
        target.put_spec(RunSpec::new(path(app), to));
        DeploymentPlan::build(original, target, StdHashMap::new())
    }

    #[tokio::test]
    async fn start_executes_and_resolves_done() {
        let rig = rig();
        let plan = scale_plan("/app", 0, 2);
        let plan_id = plan.id.clone();

        let (started, done) = rig.handle.start(plan, false, false).await;
        started.unwrap();
        done.await.unwrap().unwrap();

        // Finished plans are removed from the repository and the table.
        assert!(rig.store.plan(&plan_id).unwrap().is_none());
        assert!(rig.handle.list().await.is_empty());
    }

    #[tokio::test]
    async fn accepted_plans_are_persisted_while_running() {
        let rig = rig();
        rig.tracker.set_auto_kill(false);
        rig.tracker.upsert(running_instance("/app", "i1")).await;
        rig.tracker.upsert(running_instance("/app", "i2")).await;

        // Scale-down blocks on the kill watcher while auto-kill is off.
        let plan = scale_plan("/app", 2, 1);
        let plan_id = plan.id.clone();
        let (started, _done) = rig.handle.start(plan, false, false).await;
        started.unwrap();

        assert!(rig.store.plan(&plan_id).unwrap().is_some());
        let infos = rig.handle.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].plan.id, plan_id);
    }

    #[tokio::test]
    async fn non_forced_conflict_is_rejected() {
        let rig = rig();
        rig.tracker.set_auto_kill(false);
        rig.tracker.upsert(running_instance("/app", "i1")).await;
        rig.tracker.upsert(running_instance("/app", "i2")).await;

        let blocked = scale_plan("/app", 2, 1);
        let blocked_id = blocked.id.clone();
        let (started, _p_done) = rig.handle.start(blocked, false, false).await;
        started.unwrap();

        let (started, done) = rig.handle.start(scale_plan("/app", 1, 3), false, false).await;
        match started {
            Err(DeployError::AppLocked { conflicts, overlap }) => {
                assert_eq!(conflicts, vec![blocked_id.clone()]);
                assert_eq!(overlap, vec![path("/app")]);
            }
            other => panic!("expected AppLocked, got {other:?}"),
        }
        // The awaited promise fails on the same path.
        assert!(done.await.unwrap().is_err());

        // The original deployment is unaffected.
        assert_eq!(rig.handle.list().await.len(), 1);
    }

    #[tokio::test]
    async fn disjoint_plans_run_concurrently() {
        let rig = rig();
        rig.tracker.set_auto_kill(false);
        rig.tracker.upsert(running_instance("/a", "i1")).await;
        rig.tracker.upsert(running_instance("/a", "i2")).await;

        let (started_a, _done_a) =
            rig.handle.start(scale_plan("/a", 2, 1), false, false).await;
        started_a.unwrap();

        let (started_b, done_b) =
            rig.handle.start(scale_plan("/b", 0, 1), false, false).await;
        started_b.unwrap();
        done_b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn forced_deploy_cancels_conflicts_and_starts() {
        let rig = rig();
        rig.tracker.set_auto_kill(false);
        rig.tracker.upsert(running_instance("/app", "i1")).await;
        rig.tracker.upsert(running_instance("/app", "i2")).await;

        let blocked = scale_plan("/app", 2, 1);
        let blocked_id = blocked.id.clone();
        let (started, p_done) = rig.handle.start(blocked, false, false).await;
        started.unwrap();

        let mut events = rig.events.subscribe();

        // Scale-up needs no kills, so the forced plan completes without
        // re-enabling auto-kill.
        let forced = scale_plan("/app", 2, 3);
        let forced_id = forced.id.clone();
        let (started, q_done) = rig.handle.start(forced, true, false).await;
        started.unwrap();

        // The preempted plan failed as superseded.
        match p_done.await.unwrap() {
            Err(DeployError::Canceled(cause)) => assert_eq!(cause, SUPERSEDED),
            other => panic!("expected superseded cancel, got {other:?}"),
        }
        q_done.await.unwrap().unwrap();
        assert!(rig.store.plan(&blocked_id).unwrap().is_none());
        assert!(rig.store.plan(&forced_id).unwrap().is_none());

        // The forced plan's start event comes after the conflict ended.
        let mut started_plans = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SchedulerEvent::DeploymentStarted { plan_id, .. } = event {
                started_plans.push(plan_id);
            }
        }
        assert_eq!(started_plans, vec![forced_id]);
    }

    #[tokio::test]
    async fn cancel_unknown_plan_errors() {
        let rig = rig();
        assert!(matches!(
            rig.handle.cancel("missing").await,
            Err(DeployError::UnknownDeployment(_))
        ));
    }

    #[tokio::test]
    async fn cancel_active_plan_fails_it() {
        let rig = rig();
        rig.tracker.set_auto_kill(false);
        rig.tracker.upsert(running_instance("/app", "i1")).await;
        rig.tracker.upsert(running_instance("/app", "i2")).await;

        let plan = scale_plan("/app", 2, 1);
        let plan_id = plan.id.clone();
        let (started, done) = rig.handle.start(plan, false, false).await;
        started.unwrap();

        rig.handle.cancel(&plan_id).await.unwrap();
        assert!(matches!(done.await.unwrap(), Err(DeployError::Canceled(_))));
        assert!(rig.store.plan(&plan_id).unwrap().is_none());
    }

    #[tokio::test]
    async fn recovery_start_skips_the_persistence_write() {
        let rig = rig();
        let plan = scale_plan("/app", 0, 1);
        let plan_id = plan.id.clone();
        rig.store.store_plan(&plan).unwrap();

        let (started, done) = rig.handle.start(plan, false, true).await;
        started.unwrap();
        done.await.unwrap().unwrap();

        // Deleted on completion like any other plan.
        assert!(rig.store.plan(&plan_id).unwrap().is_none());
    }
}
