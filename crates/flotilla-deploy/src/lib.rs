//! flotilla-deploy — deployment planning and execution.
//!
//! A [`DeploymentManager`](manager::DeploymentManager) tracks all
//! in-flight plans, resolves conflicts between them, persists accepted
//! plans and spawns one [step executor](executor) task per plan. The
//! executor walks the plan's steps serially, runs the actions inside a
//! step concurrently, and delegates instance replacement and launch
//! waiting to supervised [workers].
//!
//! The [scaling proposition](propose) is the single source of truth for
//! "how many to kill, who to kill, how many to start" — both during
//! deployment scale steps and during background scale reconciliation.

pub mod error;
pub mod executor;
pub mod manager;
pub mod propose;
pub mod workers;

use std::sync::Arc;

use flotilla_cluster::{HealthCheckManager, InstanceTracker, LaunchQueue};
use flotilla_core::event::EventBus;

pub use error::{DeployError, DeployResult};
pub use manager::{DeploymentManager, ManagerHandle};
pub use propose::{propose, propose_with_selector, ScaleProposition};

/// Shared handles every deployment component works against.
#[derive(Clone)]
pub struct DeployContext {
    pub tracker: Arc<dyn InstanceTracker>,
    pub launch_queue: Arc<dyn LaunchQueue>,
    pub health_checks: Arc<dyn HealthCheckManager>,
    pub events: EventBus,
}
