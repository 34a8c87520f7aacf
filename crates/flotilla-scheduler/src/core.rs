//! The scheduler core.
//!
//! A single mpsc-driven worker that serializes every mutating command:
//! it owns the lock table, tracks the leadership lifecycle, dispatches
//! deployments to the manager and scale/reconcile work to the actions.
//! A handler runs to completion (spawning background tasks as needed)
//! before the next command is consumed, which is what makes the lock
//! table safe without further synchronization.
//!
//! While suspended (before election, and after losing leadership)
//! commands are buffered up to a configured capacity; overflow is
//! answered with `NotReady`. Completions of work spawned under an older
//! leadership epoch are recognized by their epoch stamp and dropped.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use flotilla_cluster::{
    HealthCheckManager, InstanceTracker, KillWatch, LaunchQueue, TaskReconciler,
};
use flotilla_core::event::{EventBus, SchedulerEvent};
use flotilla_core::instance::{Goal, GoalReason, InstanceId};
use flotilla_core::path::AppPath;
use flotilla_core::plan::DeploymentPlan;
use flotilla_core::spec::{RunSpec, RunSpecKind};
use flotilla_deploy::manager::DeploymentInfo;
use flotilla_deploy::{DeployContext, DeployError, DeploymentManager, ManagerHandle};
use flotilla_state::PlanStore;

use crate::actions::Actions;
use crate::error::{SchedulerError, SchedulerResult};
use crate::locks::LockTable;

/// Tunables for the scheduler core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Capacity of the command channel.
    pub command_capacity: usize,
    /// Maximum commands buffered while suspended.
    pub stash_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            command_capacity: 256,
            stash_capacity: 1024,
        }
    }
}

/// The collaborators the scheduler is wired to.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub tracker: Arc<dyn InstanceTracker>,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub health_checks: Arc<dyn HealthCheckManager>,
    pub driver: Arc<dyn TaskReconciler>,
    pub events: EventBus,
    pub store: PlanStore,
}

/// Commands processed by the scheduler core, one at a time.
enum Command {
    /// This node was elected leader and is ready to serve.
    Elected,
    /// This node lost (or gave up) leadership.
    Standby,
    Deploy {
        plan: DeploymentPlan,
        force: bool,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    CancelDeployment {
        plan_id: String,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    ListDeployments {
        reply: oneshot::Sender<Vec<DeploymentInfo>>,
    },
    /// Scale one run spec toward its target; dropped silently when the
    /// spec is locked.
    ScaleRunSpec { id: AppPath },
    KillInstances {
        id: AppPath,
        instances: Vec<InstanceId>,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    ReconcileTasks {
        reply: oneshot::Sender<SchedulerResult<()>>,
    },

    // Internal completions, stamped with the leadership epoch that
    // spawned them.
    DeploymentFinished {
        epoch: u64,
        plan_id: String,
        affected: Vec<AppPath>,
    },
    DeploymentFailed {
        epoch: u64,
        plan_id: String,
        affected: Vec<AppPath>,
        reason: String,
        /// True when the plan never started (conflict rejection): locks
        /// are released but no failure event is published.
        rejected: bool,
    },
    RunSpecScaled { epoch: u64, id: AppPath },
    TasksKilled { epoch: u64, id: AppPath },
    ReconcileFinished {
        epoch: u64,
        result: Result<(), String>,
    },
}

enum Lifecycle {
    Suspended { stash: VecDeque<Command> },
    Started,
}

/// Cheap, cloneable handle to a spawned scheduler.
#[derive(Clone)]
pub struct SchedulerRef {
    tx: mpsc::Sender<Command>,
}

impl SchedulerRef {
    pub async fn elected(&self) {
        let _ = self.tx.send(Command::Elected).await;
    }

    pub async fn standby(&self) {
        let _ = self.tx.send(Command::Standby).await;
    }

    /// Submit a deployment plan. Resolves once the plan is accepted and
    /// executing (or rejected); completion arrives as a
    /// `DeploymentSuccess` / `DeploymentFailed` event.
    pub async fn deploy(&self, plan: DeploymentPlan, force: bool) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::Deploy {
                plan,
                force,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        reply_rx.await.unwrap_or(Err(SchedulerError::Unavailable))
    }

    pub async fn cancel_deployment(&self, plan_id: &str) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::CancelDeployment {
                plan_id: plan_id.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        reply_rx.await.unwrap_or(Err(SchedulerError::Unavailable))
    }

    pub async fn list_deployments(&self) -> Vec<DeploymentInfo> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(Command::ListDeployments { reply: reply_tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Ask for one run spec to be scaled toward its target. Dropped
    /// silently when a conflicting deployment or command holds its lock.
    pub async fn scale_run_spec(&self, id: AppPath) {
        let _ = self.tx.send(Command::ScaleRunSpec { id }).await;
    }

    /// Decommission specific instances of one run spec; resolves when
    /// all of them are terminal.
    pub async fn kill_instances(
        &self,
        id: AppPath,
        instances: Vec<InstanceId>,
    ) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::KillInstances {
                id,
                instances,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        reply_rx.await.unwrap_or(Err(SchedulerError::Unavailable))
    }

    /// Reconcile task statuses with the cluster. Concurrent requests
    /// share one in-flight reconciliation.
    pub async fn reconcile_tasks(&self) -> SchedulerResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::ReconcileTasks { reply: reply_tx })
            .await
            .map_err(|_| SchedulerError::Unavailable)?;
        reply_rx.await.unwrap_or(Err(SchedulerError::Unavailable))
    }
}

/// The scheduler actor.
pub struct Scheduler {
    rx: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    deps: SchedulerDeps,
    manager: ManagerHandle,
    actions: Actions,
    locks: LockTable,
    lifecycle: Lifecycle,
    /// Bumped on every leadership loss; stale completions are dropped.
    epoch: u64,
    stash_capacity: usize,
    reconcile_active: bool,
    reconcile_waiters: Vec<oneshot::Sender<SchedulerResult<()>>>,
}

impl Scheduler {
    /// Spawn the scheduler (and its deployment manager) and return a
    /// handle. The scheduler starts suspended; an `elected` call brings
    /// it up.
    pub fn spawn(deps: SchedulerDeps, config: SchedulerConfig) -> SchedulerRef {
        let (tx, rx) = mpsc::channel(config.command_capacity);

        let ctx = DeployContext {
            tracker: deps.tracker.clone(),
            launch_queue: deps.launch_queue.clone(),
            health_checks: deps.health_checks.clone(),
            events: deps.events.clone(),
        };
        let manager = DeploymentManager::spawn(ctx, deps.store.clone(), config.command_capacity);
        let actions = Actions {
            tracker: deps.tracker.clone(),
            launch_queue: deps.launch_queue.clone(),
            driver: deps.driver.clone(),
            store: deps.store.clone(),
        };

        let scheduler = Self {
            rx,
            self_tx: tx.clone(),
            deps,
            manager,
            actions,
            locks: LockTable::new(),
            lifecycle: Lifecycle::Suspended {
                stash: VecDeque::new(),
            },
            epoch: 0,
            stash_capacity: config.stash_capacity,
            reconcile_active: false,
            reconcile_waiters: Vec::new(),
        };
        tokio::spawn(scheduler.run());
        SchedulerRef { tx }
    }

    async fn run(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            if matches!(self.lifecycle, Lifecycle::Started) {
                self.handle_started(cmd).await;
            } else {
                self.handle_suspended(cmd).await;
            }
        }
        debug!("scheduler stopped");
    }

    // ── Suspended ─────────────────────────────────────────────────

    async fn handle_suspended(&mut self, cmd: Command) {
        match cmd {
            Command::Elected => self.become_leader().await,
            Command::Standby => {}
            // Completions of work from a previous leadership.
            Command::DeploymentFinished { .. }
            | Command::DeploymentFailed { .. }
            | Command::RunSpecScaled { .. }
            | Command::TasksKilled { .. }
            | Command::ReconcileFinished { .. } => {
                debug!("completion dropped while suspended");
            }
            other => {
                let Lifecycle::Suspended { stash } = &mut self.lifecycle else {
                    unreachable!("suspended handler outside suspended state");
                };
                if stash.len() >= self.stash_capacity {
                    warn!("suspended command buffer full, rejecting command");
                    reject_not_ready(other);
                } else {
                    stash.push_back(other);
                }
            }
        }
    }

    async fn become_leader(&mut self) {
        info!("elected as leader, recovering deployments");

        let plans = self.deps.store.all_plans().unwrap_or_else(|e| {
            // Recovering nothing beats not leading at all.
            error!(error = %e, "failed to load persisted plans");
            Vec::new()
        });
        let recovered = plans.len();
        for plan in plans {
            self.start_deployment(plan, false, true, None).await;
        }

        let stash = match std::mem::replace(&mut self.lifecycle, Lifecycle::Started) {
            Lifecycle::Suspended { stash } => stash,
            Lifecycle::Started => VecDeque::new(),
        };
        info!(recovered, buffered = stash.len(), "scheduler started");

        self.reconcile_health_checks().await;

        for cmd in stash {
            self.handle_started(cmd).await;
        }
    }

    async fn reconcile_health_checks(&mut self) {
        let root = match self.deps.store.root() {
            Ok(root) => root,
            Err(e) => {
                error!(error = %e, "failed to read group tree for health checks");
                return;
            }
        };
        let apps: Vec<RunSpec> = root
            .transitive_specs()
            .into_iter()
            .filter(|s| s.kind == RunSpecKind::App)
            .cloned()
            .collect();
        if let Err(e) = self.deps.health_checks.reconcile(&apps).await {
            warn!(error = %e, "health check reconciliation failed");
        }
    }

    // ── Started ───────────────────────────────────────────────────

    async fn handle_started(&mut self, cmd: Command) {
        match cmd {
            Command::Elected => debug!("already leading"),
            Command::Standby => self.stand_by().await,
            Command::Deploy { plan, force, reply } => {
                self.start_deployment(plan, force, false, Some(reply)).await;
            }
            Command::CancelDeployment { plan_id, reply } => {
                let result = self.manager.cancel(&plan_id).await.map_err(Into::into);
                let _ = reply.send(result);
            }
            Command::ListDeployments { reply } => {
                let _ = reply.send(self.manager.list().await);
            }
            Command::ScaleRunSpec { id } => self.scale_run_spec(id),
            Command::KillInstances {
                id,
                instances,
                reply,
            } => self.kill_instances(id, instances, reply),
            Command::ReconcileTasks { reply } => self.reconcile_tasks(reply),

            Command::DeploymentFinished {
                epoch,
                plan_id,
                affected,
            } => {
                if epoch != self.epoch {
                    debug!(plan_id = %plan_id, "stale deployment completion dropped");
                    return;
                }
                self.locks.remove(affected.iter());
                info!(plan_id = %plan_id, "deployment succeeded");
                self.deps
                    .events
                    .publish(SchedulerEvent::DeploymentSuccess { plan_id });
            }
            Command::DeploymentFailed {
                epoch,
                plan_id,
                affected,
                reason,
                rejected,
            } => {
                if epoch != self.epoch {
                    debug!(plan_id = %plan_id, "stale deployment failure dropped");
                    return;
                }
                self.locks.remove(affected.iter());
                if rejected {
                    debug!(plan_id = %plan_id, %reason, "deployment rejected, locks released");
                    return;
                }
                warn!(plan_id = %plan_id, %reason, "deployment failed");
                for id in &affected {
                    if let Err(e) = self.deps.launch_queue.purge(id).await {
                        warn!(run_spec = %id, error = %e, "failed to purge after deployment failure");
                    }
                }
                self.deps.events.publish(SchedulerEvent::DeploymentFailed {
                    plan_id,
                    reason: Some(reason),
                });
            }
            Command::RunSpecScaled { epoch, id } => {
                if epoch == self.epoch {
                    self.locks.remove_one(&id);
                }
            }
            Command::TasksKilled { epoch, id } => {
                if epoch == self.epoch {
                    self.locks.remove_one(&id);
                }
            }
            Command::ReconcileFinished { epoch, result } => {
                if epoch != self.epoch {
                    debug!("stale reconciliation completion dropped");
                    return;
                }
                // Clear the marker before replying so a follow-up
                // request starts a fresh reconciliation.
                self.reconcile_active = false;
                let result = result.map_err(SchedulerError::CommandFailed);
                for waiter in std::mem::take(&mut self.reconcile_waiters) {
                    let _ = waiter.send(result.clone());
                }
            }
        }
    }

    async fn stand_by(&mut self) {
        info!("standing by, suspending the scheduler");
        self.epoch += 1;

        if let Err(e) = self.deps.health_checks.remove_all().await {
            warn!(error = %e, "failed to remove health checks on standby");
        }
        self.locks.clear();

        self.reconcile_active = false;
        for waiter in std::mem::take(&mut self.reconcile_waiters) {
            let _ = waiter.send(Err(SchedulerError::NotReady));
        }

        // In-flight deployments continue; their completions carry the
        // old epoch and will be dropped.
        self.lifecycle = Lifecycle::Suspended {
            stash: VecDeque::new(),
        };
    }

    /// Lock the affected run specs unconditionally, hand the plan to the
    /// manager, and arrange for the completion to come back as a
    /// self-message. The manager resolves conflicts; a rejection flows
    /// back through the same completion path and releases the locks.
    async fn start_deployment(
        &mut self,
        plan: DeploymentPlan,
        force: bool,
        persisted: bool,
        reply: Option<oneshot::Sender<SchedulerResult<()>>>,
    ) {
        let affected: Vec<AppPath> = plan.affected_run_specs().into_iter().collect();
        self.locks.add(affected.iter());

        let plan_id = plan.id.clone();
        let (started, done_rx) = self.manager.start(plan, force, persisted).await;

        let self_tx = self.self_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = done_rx
                .await
                .unwrap_or(Err(DeployError::ManagerUnavailable));
            let msg = match result {
                Ok(()) => Command::DeploymentFinished {
                    epoch,
                    plan_id,
                    affected,
                },
                Err(e) => Command::DeploymentFailed {
                    epoch,
                    plan_id,
                    affected,
                    rejected: matches!(e, DeployError::AppLocked { .. }),
                    reason: e.to_string(),
                },
            };
            let _ = self_tx.send(msg).await;
        });

        match reply {
            Some(reply) => {
                let _ = reply.send(started.map_err(SchedulerError::from));
            }
            None => {
                if let Err(e) = started {
                    warn!(error = %e, "recovered deployment failed to start");
                }
            }
        }
    }

    fn scale_run_spec(&mut self, id: AppPath) {
        if !self.locks.try_acquire([&id]) {
            debug!(run_spec = %id, "scale request dropped, run spec locked");
            return;
        }

        let actions = self.actions.clone();
        let self_tx = self.self_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            if let Err(e) = actions.scale_by_id(&id).await {
                warn!(run_spec = %id, error = %e, "scaling failed");
            }
            let _ = self_tx.send(Command::RunSpecScaled { epoch, id }).await;
        });
    }

    fn kill_instances(
        &mut self,
        id: AppPath,
        instances: Vec<InstanceId>,
        reply: oneshot::Sender<SchedulerResult<()>>,
    ) {
        if !self.locks.try_acquire([&id]) {
            let _ = reply.send(Err(SchedulerError::Locked(id)));
            return;
        }

        let tracker = self.deps.tracker.clone();
        let self_tx = self.self_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = kill_and_wait(tracker, &instances).await;
            // Release the lock before replying so a follow-up command
            // on the same spec is not spuriously dropped.
            let _ = self_tx
                .send(Command::TasksKilled {
                    epoch,
                    id: id.clone(),
                })
                .await;
            let _ = reply.send(result.map_err(|e| SchedulerError::CommandFailed(e.to_string())));
        });
    }

    fn reconcile_tasks(&mut self, reply: oneshot::Sender<SchedulerResult<()>>) {
        self.reconcile_waiters.push(reply);
        if self.reconcile_active {
            debug!("reconciliation already in flight, joining");
            return;
        }
        self.reconcile_active = true;

        let actions = self.actions.clone();
        let self_tx = self.self_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = actions.reconcile().await.map_err(|e| e.to_string());
            let _ = self_tx
                .send(Command::ReconcileFinished { epoch, result })
                .await;
        });
    }
}

async fn kill_and_wait(
    tracker: Arc<dyn InstanceTracker>,
    instances: &[InstanceId],
) -> Result<(), flotilla_cluster::ClusterError> {
    let watch = KillWatch::killed(tracker.clone(), instances.iter().cloned()).await?;
    for id in instances {
        tracker
            .set_goal(id, Goal::Decommissioned, GoalReason::UserRequest)
            .await?;
    }
    watch.wait().await
}

/// Answer a rejected command's reply channel, if it has one.
fn reject_not_ready(cmd: Command) {
    match cmd {
        Command::Deploy { reply, .. }
        | Command::CancelDeployment { reply, .. }
        | Command::KillInstances { reply, .. }
        | Command::ReconcileTasks { reply } => {
            let _ = reply.send(Err(SchedulerError::NotReady));
        }
        Command::ListDeployments { reply } => {
            let _ = reply.send(Vec::new());
        }
        Command::ScaleRunSpec { id } => {
            warn!(run_spec = %id, "scale request dropped, scheduler not ready");
        }
        _ => {}
    }
}
