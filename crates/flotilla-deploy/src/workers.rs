//! Launch and replacement workers.
//!
//! Both workers read remote state (tracker, launch queue) during
//! initialization, which can transiently fail; they are idempotent, so
//! the [`supervise`] wrapper restarts them with exponential back-off and
//! escalates only fatal errors to the enclosing deployment step.

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use flotilla_cluster::tracker::InstanceChange;
use flotilla_cluster::KillWatch;
use flotilla_core::instance::{Condition, Goal, GoalReason, Instance, InstanceId};
use flotilla_core::spec::RunSpec;

use crate::error::{DeployError, DeployResult};
use crate::DeployContext;

const BACKOFF_MIN: Duration = Duration::from_secs(5);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const BACKOFF_JITTER: f64 = 0.2;

/// A worker failure: transient failures are retried by the supervisor,
/// fatal ones fail the enclosing step.
#[derive(Debug)]
pub enum WorkerError {
    Transient(anyhow::Error),
    Fatal(anyhow::Error),
}

impl WorkerError {
    fn transient(e: impl Into<anyhow::Error>) -> Self {
        WorkerError::Transient(e.into())
    }
}

pub type WorkerResult = Result<(), WorkerError>;

/// Run `attempt` until it succeeds, retrying transient failures with
/// exponential back-off (5s..60s, 20% jitter). Fatal failures escalate.
pub async fn supervise<F, Fut>(name: &str, mut attempt: F) -> DeployResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WorkerResult>,
{
    let mut restarts = 0u32;
    loop {
        match attempt().await {
            Ok(()) => {
                if restarts > 0 {
                    info!(worker = name, restarts, "worker completed after restarts");
                }
                return Ok(());
            }
            Err(WorkerError::Fatal(e)) => {
                warn!(worker = name, error = %e, "worker failed fatally");
                return Err(DeployError::WorkerFailed(format!("{name}: {e}")));
            }
            Err(WorkerError::Transient(e)) => {
                restarts += 1;
                let delay = backoff_delay(restarts);
                warn!(
                    worker = name,
                    error = %e,
                    restarts,
                    delay_ms = delay.as_millis() as u64,
                    "worker failed, restarting"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Exponential back-off for the `n`-th restart, clamped to
/// [`BACKOFF_MIN`], [`BACKOFF_MAX`], with ±20% jitter.
fn backoff_delay(restart: u32) -> Duration {
    let exp = restart.saturating_sub(1).min(8);
    let base = BACKOFF_MIN
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_MAX);
    let factor = 1.0 + rand::thread_rng().gen_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
    base.mul_f64(factor)
}

/// Wait until `scale_to` instances of this spec version are running,
/// requesting any missing launches from the launch queue.
///
/// Idempotent: every (re)start re-reads the tracker and only requests
/// the launches still missing.
pub async fn start_worker(ctx: &DeployContext, run: &RunSpec, scale_to: u32) -> WorkerResult {
    loop {
        let sub = ctx
            .tracker
            .instance_updates()
            .await
            .map_err(WorkerError::transient)?;

        let mut running: HashSet<InstanceId> = HashSet::new();
        let mut scheduled: HashSet<InstanceId> = HashSet::new();
        for instance in &sub.snapshot {
            note_instance(instance, run, &mut running, &mut scheduled);
        }

        if running.len() >= scale_to as usize {
            debug!(run_spec = %run.id, running = running.len(), "start target already met");
            return Ok(());
        }

        let missing =
            (scale_to as usize).saturating_sub(running.len() + scheduled.len()) as u32;
        if missing > 0 {
            debug!(run_spec = %run.id, missing, "requesting launches");
            ctx.launch_queue
                .add(run, missing)
                .await
                .map_err(WorkerError::transient)?;
        }

        let mut changes = sub.changes;
        loop {
            match changes.recv().await {
                Ok(InstanceChange::Updated(instance)) => {
                    note_instance(&instance, run, &mut running, &mut scheduled);
                    if running.len() >= scale_to as usize {
                        info!(run_spec = %run.id, count = running.len(), "start target reached");
                        return Ok(());
                    }
                }
                Ok(InstanceChange::Removed(id)) => {
                    running.remove(&id);
                    scheduled.remove(&id);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => break,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(WorkerError::Fatal(anyhow::anyhow!(
                        "instance update stream closed"
                    )));
                }
            }
        }
        // Lagged: resubscribe and recount.
    }
}

/// Track one instance's contribution toward the start target.
fn note_instance(
    instance: &Instance,
    run: &RunSpec,
    running: &mut HashSet<InstanceId>,
    scheduled: &mut HashSet<InstanceId>,
) {
    if instance.run_spec_id() != &run.id || instance.run_spec_version != run.version {
        return;
    }
    match instance.condition {
        Condition::Running => {
            scheduled.remove(&instance.id);
            running.insert(instance.id.clone());
        }
        Condition::Provisioned | Condition::Staging | Condition::Starting => {
            scheduled.insert(instance.id.clone());
        }
        _ => {
            running.remove(&instance.id);
            scheduled.remove(&instance.id);
        }
    }
}

/// Replace every old-version instance of `run` with new-version ones:
/// decommission the old actives (reason `Upgrading`, `Stopped` for
/// reserved instances) and drive the new version to its target count.
///
/// Idempotent: instances already on the new version are left alone.
pub async fn replace_worker(ctx: &DeployContext, run: &RunSpec) -> WorkerResult {
    let instances = ctx
        .tracker
        .spec_instances(&run.id)
        .await
        .map_err(WorkerError::transient)?;

    let old_active: Vec<&Instance> = instances
        .iter()
        .filter(|i| i.is_active() && i.run_spec_version != run.version)
        .collect();

    // Subscribe before issuing the goal changes that will terminate them.
    let watch = KillWatch::killed(
        ctx.tracker.clone(),
        old_active.iter().map(|i| i.id.clone()),
    )
    .await
    .map_err(WorkerError::transient)?;

    for instance in &old_active {
        let goal = if instance.has_reservation {
            Goal::Stopped
        } else {
            Goal::Decommissioned
        };
        ctx.tracker
            .set_goal(&instance.id, goal, GoalReason::Upgrading)
            .await
            .map_err(WorkerError::transient)?;
    }

    if !old_active.is_empty() {
        info!(
            run_spec = %run.id,
            count = old_active.len(),
            "replacing old-version instances"
        );
        watch.wait().await.map_err(WorkerError::transient)?;
    }

    start_worker(ctx, run, run.instances).await
}
