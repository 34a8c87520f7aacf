//! The run-spec lock table.
//!
//! A reference-count per run spec, owned exclusively by the scheduler
//! core's single worker: a spec's count equals the number of active
//! plans whose affected set contains it, plus the number of in-flight
//! scale/kill commands targeting it. Counts are always ≥ 1; a spec is
//! absent exactly when its count would be 0.

use std::collections::HashMap;

use tracing::trace;

use flotilla_core::path::AppPath;

/// Reference-counted locks over run specs.
#[derive(Debug, Default)]
pub struct LockTable {
    counts: HashMap<AppPath, u32>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when any of `ids` is currently locked.
    pub fn any_locked<'a>(&self, ids: impl IntoIterator<Item = &'a AppPath>) -> bool {
        ids.into_iter().any(|id| self.counts.contains_key(id))
    }

    /// Acquire all of `ids` iff none is currently locked. Returns
    /// whether the locks were taken.
    pub fn try_acquire<'a>(
        &mut self,
        ids: impl IntoIterator<Item = &'a AppPath> + Clone,
    ) -> bool {
        if self.any_locked(ids.clone()) {
            return false;
        }
        self.add(ids);
        true
    }

    /// Unconditionally increment the count of every id.
    pub fn add<'a>(&mut self, ids: impl IntoIterator<Item = &'a AppPath>) {
        for id in ids {
            let count = self.counts.entry(id.clone()).or_insert(0);
            *count += 1;
            trace!(run_spec = %id, count = *count, "lock added");
        }
    }

    /// Decrement one id's count, deleting the entry at zero.
    pub fn remove_one(&mut self, id: &AppPath) {
        match self.counts.get_mut(id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                trace!(run_spec = %id, count = *count, "lock released");
            }
            Some(_) => {
                self.counts.remove(id);
                trace!(run_spec = %id, "lock cleared");
            }
            None => {
                trace!(run_spec = %id, "release of unheld lock ignored");
            }
        }
    }

    /// Decrement every id's count.
    pub fn remove<'a>(&mut self, ids: impl IntoIterator<Item = &'a AppPath>) {
        for id in ids {
            self.remove_one(id);
        }
    }

    /// Drop every lock (leadership loss).
    pub fn clear(&mut self) {
        self.counts.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// The count of one id, for assertions; 0 when unheld.
    pub fn count(&self, id: &AppPath) -> u32 {
        self.counts.get(id).copied().unwrap_or(0)
    }
}
