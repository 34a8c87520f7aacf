//! The step executor.
//!
//! One executor task per deployment plan. Steps run strictly in order;
//! the actions inside a step run concurrently on a `JoinSet`. Progress
//! flows to the deployment manager as messages; `DeploymentStatus` and
//! step success/failure events go to the process-wide bus. A `Cancel`
//! finalizes immediately: in-flight action futures are aborted, not
//! awaited.

use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use flotilla_cluster::KillWatch;
use flotilla_core::event::SchedulerEvent;
use flotilla_core::instance::{Goal, GoalReason, InstanceId};
use flotilla_core::plan::{DeploymentAction, DeploymentPlan};
use flotilla_core::spec::{RunSpec, RunSpecKind};

use crate::error::{DeployError, DeployResult};
use crate::manager::ManagerMsg;
use crate::propose::propose;
use crate::workers::{replace_worker, start_worker, supervise};
use crate::DeployContext;

/// Handle the manager keeps for one running executor.
pub struct ExecutorHandle {
    cancel: Option<oneshot::Sender<String>>,
    join: JoinHandle<()>,
}

impl ExecutorHandle {
    /// Ask the executor to finalize with the given cause. In-flight
    /// actions are aborted; the executor still reports `Finished`.
    pub fn cancel(&mut self, cause: &str) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(cause.to_string());
        }
    }

    /// Abort the executor task outright (manager shutdown).
    pub fn abort(&self) {
        self.join.abort();
    }
}

/// Spawn the executor task for a plan. Step 0 begins immediately.
pub fn spawn(
    plan: DeploymentPlan,
    ctx: DeployContext,
    manager_tx: mpsc::Sender<ManagerMsg>,
) -> ExecutorHandle {
    let (cancel_tx, cancel_rx) = oneshot::channel();
    let join = tokio::spawn(run_plan(plan, ctx, manager_tx, cancel_rx));
    ExecutorHandle {
        cancel: Some(cancel_tx),
        join,
    }
}

async fn run_plan(
    plan: DeploymentPlan,
    ctx: DeployContext,
    manager_tx: mpsc::Sender<ManagerMsg>,
    mut cancel_rx: oneshot::Receiver<String>,
) {
    let plan_id = plan.id.clone();
    let result = drive(&plan, &ctx, &manager_tx, &mut cancel_rx).await;

    match &result {
        Ok(()) => info!(plan_id = %plan_id, "deployment finished"),
        Err(e) => warn!(plan_id = %plan_id, error = %e, "deployment failed"),
    }

    let _ = manager_tx
        .send(ManagerMsg::ExecutorFinished { plan_id, result })
        .await;
}

async fn drive(
    plan: &DeploymentPlan,
    ctx: &DeployContext,
    manager_tx: &mpsc::Sender<ManagerMsg>,
    cancel_rx: &mut oneshot::Receiver<String>,
) -> DeployResult<()> {
    let total_steps = plan.steps.len();

    for (idx, step) in plan.steps.iter().enumerate() {
        let step_index = idx + 1;

        // A cancel that arrived between steps.
        if let Ok(cause) = cancel_rx.try_recv() {
            return Err(DeployError::Canceled(cause));
        }

        manager_tx
            .send(ManagerMsg::StepInfo {
                plan_id: plan.id.clone(),
                step_index,
            })
            .await
            .map_err(|_| DeployError::ManagerUnavailable)?;
        ctx.events.publish(SchedulerEvent::DeploymentStepInfo {
            plan_id: plan.id.clone(),
            step_index,
            total_steps,
        });

        if step.is_empty() {
            continue;
        }

        debug!(plan_id = %plan.id, step_index, actions = step.actions.len(), "step starting");
        ctx.events.publish(SchedulerEvent::DeploymentStatus {
            plan_id: plan.id.clone(),
            step_index,
        });

        let mut actions = JoinSet::new();
        for action in &step.actions {
            let ctx = ctx.clone();
            let action = action.clone();
            let plan_id = plan.id.clone();
            actions.spawn(async move { perform_action(&ctx, &plan_id, action).await });
        }

        loop {
            tokio::select! {
                cause = &mut *cancel_rx => {
                    actions.abort_all();
                    let cause = cause.unwrap_or_else(|_| "canceled".to_string());
                    return Err(DeployError::Canceled(cause));
                }
                joined = actions.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        actions.abort_all();
                        ctx.events.publish(SchedulerEvent::DeploymentStepFailure {
                            plan_id: plan.id.clone(),
                            step_index,
                        });
                        return Err(DeployError::StepFailed {
                            step_index,
                            reason: e.to_string(),
                        });
                    }
                    Some(Err(join_error)) => {
                        actions.abort_all();
                        ctx.events.publish(SchedulerEvent::DeploymentStepFailure {
                            plan_id: plan.id.clone(),
                            step_index,
                        });
                        return Err(DeployError::StepFailed {
                            step_index,
                            reason: format!("action task failed: {join_error}"),
                        });
                    }
                }
            }
        }

        ctx.events.publish(SchedulerEvent::DeploymentStepSuccess {
            plan_id: plan.id.clone(),
            step_index,
        });
    }

    Ok(())
}

async fn perform_action(
    ctx: &DeployContext,
    plan_id: &str,
    action: DeploymentAction,
) -> DeployResult<()> {
    // Health checks are registered per action; pods carry none.
    let run = action.run_spec();
    if run.kind == RunSpecKind::App {
        ctx.health_checks.add_all_for(run).await?;
    }

    match action {
        DeploymentAction::Start { run } => {
            // Registration only; the spec scales up in a later step.
            debug!(run_spec = %run.id, "start action registered");
            Ok(())
        }
        DeploymentAction::Scale {
            run,
            scale_to,
            sentenced,
        } => scale_action(ctx, &run, scale_to, &sentenced).await,
        DeploymentAction::Restart { run } => {
            if run.instances == 0 {
                debug!(run_spec = %run.id, "restart of suspended spec is a no-op");
                return Ok(());
            }
            ctx.events.publish(SchedulerEvent::UpgradeStarted {
                run_spec: run.id.clone(),
                plan_id: plan_id.to_string(),
            });
            supervise("replace", || {
                let ctx = ctx.clone();
                let run = run.clone();
                async move { replace_worker(&ctx, &run).await }
            })
            .await
        }
        DeploymentAction::Stop { run } => stop_action(ctx, &run).await,
    }
}

/// Scale one run spec to `scale_to` instances, preferring `sentenced`
/// when killing. Kills are awaited through a watcher subscribed before
/// the goal changes; starts are delegated to the supervised launch
/// worker.
async fn scale_action(
    ctx: &DeployContext,
    run: &RunSpec,
    scale_to: u32,
    sentenced: &[InstanceId],
) -> DeployResult<()> {
    let instances = match ctx.tracker.spec_instances(&run.id).await {
        Ok(instances) => instances,
        Err(e) => {
            // Unavailable tracker reads as "no active instances".
            warn!(run_spec = %run.id, error = %e, "tracker unavailable, assuming no instances");
            Vec::new()
        }
    };
    let running: Vec<_> = instances.into_iter().filter(|i| i.is_active()).collect();

    let proposition = propose(&running, sentenced, scale_to, run.kill_selection);

    if let Some(to_kill) = &proposition.to_kill {
        info!(run_spec = %run.id, count = to_kill.len(), scale_to, "scaling down");
        let watch =
            KillWatch::killed(ctx.tracker.clone(), to_kill.iter().map(|i| i.id.clone()))
                .await?;
        for instance in to_kill {
            let goal = if instance.has_reservation {
                Goal::Stopped
            } else {
                Goal::Decommissioned
            };
            ctx.tracker
                .set_goal(&instance.id, goal, GoalReason::DeploymentScaling)
                .await?;
        }
        watch.wait().await?;
    }

    if proposition.to_start.is_some() {
        info!(run_spec = %run.id, scale_to, "scaling up");
        supervise("start", || {
            let ctx = ctx.clone();
            let run = run.clone();
            async move { start_worker(&ctx, &run, scale_to).await }
        })
        .await?;
    }

    Ok(())
}

/// Stop a run spec: remove its health checks, purge queued launches,
/// decommission every instance, reset the launch back-off, and announce
/// the termination. Cleanup failures are logged, never fatal — the
/// surrounding deployment must make progress even if some cleanup
/// misfires.
async fn stop_action(ctx: &DeployContext, run: &RunSpec) -> DeployResult<()> {
    info!(run_spec = %run.id, "stopping run spec");

    if let Err(e) = ctx.health_checks.remove_all_for(&run.id).await {
        warn!(run_spec = %run.id, error = %e, "failed to remove health checks");
    }
    if let Err(e) = ctx.launch_queue.purge(&run.id).await {
        warn!(run_spec = %run.id, error = %e, "failed to purge launch queue");
    }

    if let Err(e) = decommission_all(ctx, run).await {
        warn!(run_spec = %run.id, error = %e, "failed to decommission instances");
    }

    if let Err(e) = ctx.launch_queue.reset_delay(run).await {
        warn!(run_spec = %run.id, error = %e, "failed to reset launch delay");
    }

    ctx.events.publish(SchedulerEvent::AppTerminated {
        run_spec: run.id.clone(),
    });
    Ok(())
}

async fn decommission_all(ctx: &DeployContext, run: &RunSpec) -> DeployResult<()> {
    let instances = ctx.tracker.spec_instances(&run.id).await?;
    if instances.is_empty() {
        return Ok(());
    }

    let watch = KillWatch::decommissioned(
        ctx.tracker.clone(),
        instances.iter().map(|i| i.id.clone()),
    )
    .await?;
    for instance in &instances {
        ctx.tracker
            .set_goal(&instance.id, Goal::Decommissioned, GoalReason::DeletingApp)
            .await?;
    }
    watch.wait().await?;
    Ok(())
}
