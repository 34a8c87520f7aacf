//! PlanStore — redb-backed persistence for deployment plans and the
//! group tree.
//!
//! Plans are written when a deployment is accepted and deleted when it
//! finishes; `all_plans` is read on leadership recovery. The group root
//! is a single row that callers replace wholesale on every target-state
//! change.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use flotilla_core::plan::DeploymentPlan;
use flotilla_core::spec::RootGroup;

use crate::error::{StateError, StateResult};
use crate::tables::{GROUPS, GROUP_ROOT_KEY, PLANS};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe plan/group store backed by redb.
#[derive(Clone)]
pub struct PlanStore {
    db: Arc<Database>,
}

impl PlanStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "plan store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory plan store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(PLANS).map_err(map_err!(Table))?;
        txn.open_table(GROUPS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Deployment plans ───────────────────────────────────────────

    /// Persist a plan, overwriting any previous row with the same id.
    pub fn store_plan(&self, plan: &DeploymentPlan) -> StateResult<()> {
        let value = serde_json::to_vec(plan).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PLANS).map_err(map_err!(Table))?;
            table
                .insert(plan.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan_id = %plan.id, "plan stored");
        Ok(())
    }

    /// Get a plan by id.
    pub fn plan(&self, id: &str) -> StateResult<Option<DeploymentPlan>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLANS).map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let plan: DeploymentPlan =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(plan))
            }
            None => Ok(None),
        }
    }

    /// All persisted plans, ordered by id.
    pub fn all_plans(&self) -> StateResult<Vec<DeploymentPlan>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PLANS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let plan: DeploymentPlan =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(plan);
        }
        Ok(results)
    }

    /// Delete a plan by id. Returns true if it existed.
    pub fn delete_plan(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(PLANS).map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(plan_id = %id, existed, "plan deleted");
        Ok(existed)
    }

    // ── Group tree ────────────────────────────────────────────────

    /// Replace the stored group tree.
    pub fn put_root(&self, root: &RootGroup) -> StateResult<()> {
        let value = serde_json::to_vec(root).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
            table
                .insert(GROUP_ROOT_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!("group root stored");
        Ok(())
    }

    /// The stored group tree; an empty root when none has been written.
    pub fn root(&self) -> StateResult<RootGroup> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(GROUPS).map_err(map_err!(Table))?;
        match table.get(GROUP_ROOT_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let root: RootGroup =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(root)
            }
            None => Ok(RootGroup::empty_root()),
        }
    }
}
