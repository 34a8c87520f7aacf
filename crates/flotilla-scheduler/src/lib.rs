//! flotilla-scheduler — the deployment scheduling core.
//!
//! The [`Scheduler`](core::Scheduler) is the single serialization point
//! for all mutating control commands: deployments, per-spec scaling,
//! instance kills and task reconciliation all flow through it one at a
//! time. It owns the run-spec [lock table](locks), follows the
//! leadership lifecycle (suspended ↔ started), and recovers persisted
//! deployment plans when elected.
//!
//! Wiring: construct the collaborators (or their in-memory stand-ins
//! from `flotilla-cluster`), a `PlanStore` and an `EventBus`, then
//! `Scheduler::spawn` and drive it through the returned
//! [`SchedulerRef`](core::SchedulerRef).

pub mod actions;
pub mod core;
pub mod error;
pub mod locks;

pub use crate::core::{Scheduler, SchedulerConfig, SchedulerDeps, SchedulerRef};
pub use actions::Actions;
pub use error::{SchedulerError, SchedulerResult};
pub use locks::LockTable;
