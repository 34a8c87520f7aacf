//! Scheduler error types.

use thiserror::Error;

use flotilla_core::path::AppPath;
use flotilla_deploy::DeployError;

/// Result type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors surfaced to scheduler callers.
#[derive(Debug, Error, Clone)]
pub enum SchedulerError {
    /// The scheduler is not leading (or its suspended-state buffer is
    /// full) and cannot take the command right now.
    #[error("scheduler is not ready")]
    NotReady,

    /// The scheduler task is gone.
    #[error("scheduler unavailable")]
    Unavailable,

    /// The run spec is locked by an active deployment or command.
    #[error("run spec locked: {0}")]
    Locked(AppPath),

    /// A deployment-level failure, including `AppLocked` conflicts.
    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("command failed: {0}")]
    CommandFailed(String),
}
