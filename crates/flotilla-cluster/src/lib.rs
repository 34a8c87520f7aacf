//! flotilla-cluster — interfaces to the external cluster collaborators.
//!
//! The scheduling core never talks to the cluster directly; it consumes
//! the traits in this crate: the [`InstanceTracker`] (authoritative
//! instance store with a snapshot-first update stream), the
//! [`LaunchQueue`] (requests new launches), the [`HealthCheckManager`]
//! and the low-level [`TaskReconciler`] driver.
//!
//! Each trait ships an in-memory implementation that applies goals
//! immediately (a real cluster kills asynchronously), so the whole core
//! can be exercised in tests without a cluster.

pub mod driver;
pub mod error;
pub mod health;
pub mod launch;
pub mod tracker;
pub mod watcher;

pub use driver::{MemoryReconciler, TaskReconciler};
pub use error::{ClusterError, ClusterResult};
pub use health::{HealthCheckManager, MemoryHealthChecks};
pub use launch::{LaunchQueue, MemoryLaunchQueue};
pub use tracker::{
    GoalChange, InstanceChange, InstanceSubscription, InstanceTracker, MemoryTracker,
};
pub use watcher::KillWatch;
