//! The health check manager interface.
//!
//! Health-check registration applies only to applications; pods carry no
//! registrable checks and calls for them are no-ops at the call sites.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use flotilla_core::path::AppPath;
use flotilla_core::spec::{HealthCheckSpec, RunSpec};

use crate::error::ClusterResult;

/// Registers and removes health checks for run specs.
#[async_trait]
pub trait HealthCheckManager: Send + Sync {
    /// Register all of an application's health checks, replacing any
    /// previous registration.
    async fn add_all_for(&self, app: &RunSpec) -> ClusterResult<()>;

    /// Remove all health checks of one run spec.
    async fn remove_all_for(&self, id: &AppPath) -> ClusterResult<()>;

    /// Remove every registered health check (leadership loss).
    async fn remove_all(&self) -> ClusterResult<()>;

    /// Align registrations with the given applications: register theirs,
    /// drop everything else.
    async fn reconcile(&self, apps: &[RunSpec]) -> ClusterResult<()>;
}

/// In-memory health check registry.
#[derive(Default)]
pub struct MemoryHealthChecks {
    registered: Mutex<HashMap<AppPath, Vec<HealthCheckSpec>>>,
}

impl MemoryHealthChecks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run spec ids with at least one registered check.
    pub fn registered_ids(&self) -> Vec<AppPath> {
        self.registered.lock().unwrap().keys().cloned().collect()
    }

    /// The checks registered for one run spec.
    pub fn checks_for(&self, id: &AppPath) -> Vec<HealthCheckSpec> {
        self.registered
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl HealthCheckManager for MemoryHealthChecks {
    async fn add_all_for(&self, app: &RunSpec) -> ClusterResult<()> {
        if app.health_checks.is_empty() {
            return Ok(());
        }
        debug!(run_spec = %app.id, count = app.health_checks.len(), "health checks registered");
        self.registered
            .lock()
            .unwrap()
            .insert(app.id.clone(), app.health_checks.clone());
        Ok(())
    }

    async fn remove_all_for(&self, id: &AppPath) -> ClusterResult<()> {
        if self.registered.lock().unwrap().remove(id).is_some() {
            debug!(run_spec = %id, "health checks removed");
        }
        Ok(())
    }

    async fn remove_all(&self) -> ClusterResult<()> {
        let mut registered = self.registered.lock().unwrap();
        if !registered.is_empty() {
            debug!(count = registered.len(), "all health checks removed");
        }
        registered.clear();
        Ok(())
    }

    async fn reconcile(&self, apps: &[RunSpec]) -> ClusterResult<()> {
        let mut next = HashMap::new();
        for app in apps {
            if !app.health_checks.is_empty() {
                next.insert(app.id.clone(), app.health_checks.clone());
            }
        }
        debug!(count = next.len(), "health checks reconciled");
        *self.registered.lock().unwrap() = next;
        Ok(())
    }
}
