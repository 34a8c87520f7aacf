//! Instances and their lifecycle vocabulary.
//!
//! An [`Instance`] is one live (or formerly-live) replica of a run spec.
//! Its observed [`Condition`] and desired [`Goal`] are orthogonal: a
//! terminal condition may occur under any goal, and reaching one under a
//! `Running` goal is a failure the launch pipeline will repair.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::path::AppPath;

/// Opaque instance identifier, tied to one run spec.
///
/// Displays as `{run_spec}.{token}`. The derived ordering (run spec, then
/// token, lexicographic) is total and is used as the final tie-breaker in
/// kill selection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub run_spec: AppPath,
    pub token: String,
}

impl InstanceId {
    pub fn new(run_spec: AppPath, token: impl Into<String>) -> Self {
        Self {
            run_spec,
            token: token.into(),
        }
    }

    /// A fresh id for the given run spec.
    pub fn generate(run_spec: AppPath) -> Self {
        Self::new(run_spec, uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.run_spec, self.token)
    }
}

/// Observed execution state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Provisioned,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Error,
    Gone,
    Dropped,
    Unknown,
    Unreachable,
}

impl Condition {
    /// Conditions in which the instance occupies (or is about to occupy)
    /// cluster resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Condition::Staging
                | Condition::Starting
                | Condition::Running
                | Condition::Killing
                | Condition::Unreachable
        )
    }

    /// Conditions from which the instance will not make further progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Condition::Killed
                | Condition::Finished
                | Condition::Failed
                | Condition::Error
                | Condition::Gone
                | Condition::Dropped
                | Condition::Unknown
        )
    }
}

/// Desired lifecycle target of an instance. Goals are sticky: once set,
/// the tracker drives the instance toward the goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    /// Keep the instance alive.
    Running,
    /// Halt the instance but keep its reservation.
    Stopped,
    /// Halt the instance and forget it.
    Decommissioned,
}

/// Why a goal change was issued; appears in events and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GoalReason {
    DeploymentScaling,
    Upgrading,
    DeletingApp,
    OverCapacity,
    Orphaned,
    UserRequest,
}

impl fmt::Display for GoalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GoalReason::DeploymentScaling => "deployment-scaling",
            GoalReason::Upgrading => "upgrading",
            GoalReason::DeletingApp => "deleting-app",
            GoalReason::OverCapacity => "over-capacity",
            GoalReason::Orphaned => "orphaned",
            GoalReason::UserRequest => "user-request",
        };
        f.write_str(s)
    }
}

/// A cluster-reported status for one task of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: String,
    pub condition: Condition,
}

/// One task of an instance. The status is present only once the cluster
/// has reported on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: Option<TaskStatus>,
}

/// One replica of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub condition: Condition,
    pub goal: Goal,
    pub has_reservation: bool,
    /// Epoch millis at which the instance started.
    pub started_at: u64,
    /// Version of the run spec this instance was launched from.
    pub run_spec_version: u64,
    pub tasks: Vec<Task>,
}

impl Instance {
    /// A freshly provisioned instance for the given spec version.
    pub fn provisioned(id: InstanceId, run_spec_version: u64) -> Self {
        Self {
            id,
            condition: Condition::Provisioned,
            goal: Goal::Running,
            has_reservation: false,
            started_at: 0,
            run_spec_version,
            tasks: Vec::new(),
        }
    }

    /// The id of the run spec this instance belongs to.
    pub fn run_spec_id(&self) -> &AppPath {
        &self.id.run_spec
    }

    pub fn is_active(&self) -> bool {
        self.condition.is_active()
    }

    /// Accepted for launch but not yet handed to the cluster.
    pub fn is_scheduled(&self) -> bool {
        self.condition == Condition::Provisioned
    }
}
