//! Deployment error types.

use thiserror::Error;

use flotilla_core::path::AppPath;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors that can occur while starting or executing deployments.
#[derive(Debug, Error, Clone)]
pub enum DeployError {
    /// A non-forced deployment overlapped one or more active plans.
    #[error("run specs locked by deployments {conflicts:?}")]
    AppLocked {
        /// Ids of the conflicting plans.
        conflicts: Vec<String>,
        /// The overlapping run specs.
        overlap: Vec<AppPath>,
    },

    #[error("deployment canceled: {0}")]
    Canceled(String),

    #[error("step {step_index} failed: {reason}")]
    StepFailed { step_index: usize, reason: String },

    #[error("worker failed: {0}")]
    WorkerFailed(String),

    #[error("unknown deployment: {0}")]
    UnknownDeployment(String),

    #[error("deployment manager unavailable")]
    ManagerUnavailable,

    #[error("cluster error: {0}")]
    Cluster(String),

    #[error("state error: {0}")]
    State(String),
}

impl From<flotilla_cluster::ClusterError> for DeployError {
    fn from(e: flotilla_cluster::ClusterError) -> Self {
        DeployError::Cluster(e.to_string())
    }
}

impl From<flotilla_state::StateError> for DeployError {
    fn from(e: flotilla_state::StateError) -> Self {
        DeployError::State(e.to_string())
    }
}
