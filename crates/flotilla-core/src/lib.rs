//! flotilla-core — domain types for the Flotilla deployment scheduler.
//!
//! Run specs are identified by hierarchical [`AppPath`]s and organized in a
//! [`Group`] tree. Each spec desires a fixed number of running [`Instance`]s;
//! every instance carries an observed [`Condition`] and a desired [`Goal`],
//! which are deliberately orthogonal: terminal conditions may occur under any
//! goal.
//!
//! The process-wide [`EventBus`] is a broadcast channel of [`SchedulerEvent`]s
//! consumed by subsystems outside the scheduling core.

pub mod event;
pub mod instance;
pub mod path;
pub mod plan;
pub mod spec;

pub use event::{EventBus, SchedulerEvent};
pub use instance::{
    Condition, Goal, GoalReason, Instance, InstanceId, Task, TaskStatus,
};
pub use path::{AppPath, PathError};
pub use plan::{DeploymentAction, DeploymentPlan, DeploymentStep};
pub use spec::{
    Group, HealthCheckSpec, KillSelection, RootGroup, RunSpec, RunSpecKind,
};
