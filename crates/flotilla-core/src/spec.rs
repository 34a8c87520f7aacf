//! Run specs and the group tree.
//!
//! A [`RunSpec`] declares a workload (application or pod): how many
//! instances it wants, which instances to prefer when scaling down, and
//! enough of its definition to detect upgrades. Specs live in a
//! hierarchical [`Group`] tree rooted at `/`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::path::AppPath;

/// Policy for choosing which instances to terminate when scaling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KillSelection {
    /// Kill the most recently started instances first.
    #[default]
    YoungestFirst,
    /// Kill the longest-running instances first.
    OldestFirst,
}

/// The two kinds of run spec. The scheduling core treats them uniformly
/// except that health-check registration applies only to applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunSpecKind {
    #[default]
    App,
    Pod,
}

/// Health check parameters registered for an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    /// HTTP path to probe (e.g., "/healthz").
    pub endpoint: String,
    /// Check interval (e.g., "5s").
    pub interval: String,
    /// Consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,
}

/// Declarative description of a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub id: AppPath,
    /// Desired number of running instances.
    pub instances: u32,
    pub kill_selection: KillSelection,
    /// Version timestamp (epoch millis); bumped on every definition change.
    pub version: u64,
    pub kind: RunSpecKind,
    /// Command the instances run; part of the definition.
    pub cmd: Option<String>,
    pub health_checks: Vec<HealthCheckSpec>,
}

impl RunSpec {
    /// A minimal spec with the given id and instance count.
    pub fn new(id: AppPath, instances: u32) -> Self {
        Self {
            id,
            instances,
            kill_selection: KillSelection::default(),
            version: 0,
            kind: RunSpecKind::default(),
            cmd: None,
            health_checks: Vec::new(),
        }
    }

    /// Copy of this spec with a different instance count.
    pub fn with_instances(&self, instances: u32) -> Self {
        Self {
            instances,
            ..self.clone()
        }
    }

    /// True when moving from `self` to `to` changes the definition rather
    /// than just the instance count, so running instances must be replaced.
    pub fn needs_restart(&self, to: &RunSpec) -> bool {
        self.cmd != to.cmd
            || self.kind != to.kind
            || self.health_checks != to.health_checks
            || self.kill_selection != to.kill_selection
    }
}

/// A node in the group tree: run specs plus nested groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: AppPath,
    /// Run specs directly in this group, keyed by their full path.
    pub apps: BTreeMap<AppPath, RunSpec>,
    /// Child groups keyed by their full path.
    pub groups: BTreeMap<AppPath, Group>,
}

/// The tree root (`/`).
pub type RootGroup = Group;

impl Group {
    /// An empty group with the given id.
    pub fn empty(id: AppPath) -> Self {
        Self {
            id,
            apps: BTreeMap::new(),
            groups: BTreeMap::new(),
        }
    }

    /// An empty root group.
    pub fn empty_root() -> Self {
        Self::empty(AppPath::root())
    }

    /// Insert a run spec, creating intermediate groups as needed.
    pub fn put_spec(&mut self, spec: RunSpec) {
        let parent = spec.id.parent();
        if parent == self.id {
            self.apps.insert(spec.id.clone(), spec);
            return;
        }
        // Descend one segment past this group's id.
        let depth = self.id.segments().count();
        let segment = spec
            .id
            .segments()
            .nth(depth)
            .expect("spec path must be below the group");
        let child_id = self.id.join(segment);
        self.groups
            .entry(child_id.clone())
            .or_insert_with(|| Group::empty(child_id))
            .put_spec(spec);
    }

    /// Look up a run spec anywhere in the tree.
    pub fn spec(&self, id: &AppPath) -> Option<&RunSpec> {
        if let Some(spec) = self.apps.get(id) {
            return Some(spec);
        }
        self.groups.values().find_map(|g| g.spec(id))
    }

    /// All run specs in this group and every nested group.
    pub fn transitive_specs(&self) -> Vec<&RunSpec> {
        let mut out: Vec<&RunSpec> = self.apps.values().collect();
        for group in self.groups.values() {
            out.extend(group.transitive_specs());
        }
        out
    }

    /// Ids of all run specs in the tree.
    pub fn transitive_ids(&self) -> Vec<AppPath> {
        self.transitive_specs().iter().map(|s| s.id.clone()).collect()
    }
}
