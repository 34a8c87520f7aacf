//! Error types for cluster collaborator calls.

use thiserror::Error;

/// Result type alias for collaborator operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors surfaced by the cluster collaborators.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("instance tracker unavailable: {0}")]
    TrackerUnavailable(String),

    #[error("instance update stream closed")]
    StreamClosed,

    #[error("launch queue error: {0}")]
    LaunchQueue(String),

    #[error("health check manager error: {0}")]
    HealthChecks(String),

    #[error("driver error: {0}")]
    Driver(String),
}
