//! Deployment plans.
//!
//! A [`DeploymentPlan`] is the immutable, ordered sequence of steps that
//! moves the cluster from one group tree to another. Steps execute
//! strictly in order; the actions inside one step are mutually
//! independent and run concurrently.

use std::collections::{BTreeSet, HashMap};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::instance::InstanceId;
use crate::path::AppPath;
use crate::spec::{RootGroup, RunSpec};

/// One action of a deployment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Register a new run spec (instances start at zero; scaling follows
    /// in a later step).
    Start { run: RunSpec },
    /// Scale a run spec to `scale_to` instances, optionally pinning the
    /// instances to kill.
    Scale {
        run: RunSpec,
        scale_to: u32,
        sentenced: Vec<InstanceId>,
    },
    /// Replace all old-version instances of a run spec.
    Restart { run: RunSpec },
    /// Stop a run spec and decommission all its instances.
    Stop { run: RunSpec },
}

impl DeploymentAction {
    /// The run spec this action targets.
    pub fn run_spec(&self) -> &RunSpec {
        match self {
            DeploymentAction::Start { run }
            | DeploymentAction::Scale { run, .. }
            | DeploymentAction::Restart { run }
            | DeploymentAction::Stop { run } => run,
        }
    }
}

/// An ordered list of independent actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

impl DeploymentStep {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// The ordered sequence of steps transitioning `original` to `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Unique plan id.
    pub id: String,
    pub original: RootGroup,
    pub target: RootGroup,
    pub steps: Vec<DeploymentStep>,
    /// Plan creation timestamp (epoch millis).
    pub version: u64,
    /// Instances pinned for killing during scale-downs, per run spec.
    pub to_kill: HashMap<AppPath, Vec<InstanceId>>,
}

impl DeploymentPlan {
    /// Compute a plan from the group-tree diff.
    ///
    /// Step order: starts, restarts, scales, stops. Added specs are
    /// registered with zero instances and scaled up in the scale step;
    /// definition changes become restarts (which also reach the new
    /// instance count); pure instance-count changes become scales;
    /// removed specs are stopped last. Empty steps are omitted.
    pub fn build(
        original: RootGroup,
        target: RootGroup,
        to_kill: HashMap<AppPath, Vec<InstanceId>>,
    ) -> Self {
        let original_specs: HashMap<AppPath, RunSpec> = original
            .transitive_specs()
            .into_iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        let target_specs: HashMap<AppPath, RunSpec> = target
            .transitive_specs()
            .into_iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();

        // BTreeSet for a deterministic action order inside each step.
        let all_ids: BTreeSet<AppPath> = original_specs
            .keys()
            .chain(target_specs.keys())
            .cloned()
            .collect();

        let mut starts = Vec::new();
        let mut restarts = Vec::new();
        let mut scales = Vec::new();
        let mut stops = Vec::new();

        for id in all_ids {
            let sentenced = to_kill.get(&id).cloned().unwrap_or_default();
            match (original_specs.get(&id), target_specs.get(&id)) {
                (None, Some(new)) => {
                    starts.push(DeploymentAction::Start {
                        run: new.with_instances(0),
                    });
                    if new.instances > 0 {
                        scales.push(DeploymentAction::Scale {
                            run: new.clone(),
                            scale_to: new.instances,
                            sentenced,
                        });
                    }
                }
                (Some(old), Some(new)) => {
                    if old.needs_restart(new) {
                        restarts.push(DeploymentAction::Restart { run: new.clone() });
                    } else if old.instances != new.instances {
                        scales.push(DeploymentAction::Scale {
                            run: new.clone(),
                            scale_to: new.instances,
                            sentenced,
                        });
                    }
                }
                (Some(old), None) => {
                    stops.push(DeploymentAction::Stop {
                        run: old.with_instances(0),
                    });
                }
                (None, None) => unreachable!(),
            }
        }

        let steps = [starts, restarts, scales, stops]
            .into_iter()
            .filter(|actions| !actions.is_empty())
            .map(|actions| DeploymentStep { actions })
            .collect();

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            original,
            target,
            steps,
            version: now_millis(),
            to_kill,
        }
    }

    /// Ids of every run spec referenced by any action of this plan.
    pub fn affected_run_specs(&self) -> BTreeSet<AppPath> {
        self.steps
            .iter()
            .flat_map(|step| step.actions.iter())
            .map(|action| action.run_spec().id.clone())
            .collect()
    }

    /// True when the plan has no work to do.
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(DeploymentStep::is_empty)
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
