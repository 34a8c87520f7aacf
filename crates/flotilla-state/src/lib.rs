//! flotilla-state — embedded persistence for the Flotilla scheduler.
//!
//! Backed by [redb](https://docs.rs/redb). Stores in-flight deployment
//! plans (recovered on leadership acquisition) and the declarative group
//! tree. All values are JSON-serialized into redb's `&[u8]` value columns.
//!
//! The [`PlanStore`] is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks. An in-memory
//! backend is available for testing.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::PlanStore;
