//! The scaling proposition.
//!
//! A pure, deterministic function deciding which running instances to
//! kill and how many new ones to start to reach a target count. Used by
//! deployment scale steps and by background scale reconciliation alike.

use std::collections::HashSet;

use flotilla_core::instance::{Instance, InstanceId};
use flotilla_core::spec::KillSelection;

/// The outcome of a scaling proposition. Empty results are `None` so
/// callers can short-circuit.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScaleProposition {
    /// Instances to kill, or `None` when nothing needs killing.
    pub to_kill: Option<Vec<Instance>>,
    /// Number of instances to start, or `None` when zero.
    pub to_start: Option<u32>,
}

/// Decide which of `running` to kill and how many to start to reach
/// `scale_to`, preferring the `sentenced` hint (ids no longer running
/// are dropped) and selecting any further victims by `selection` order.
pub fn propose(
    running: &[Instance],
    sentenced: &[InstanceId],
    scale_to: u32,
    selection: KillSelection,
) -> ScaleProposition {
    propose_with_selector(running, sentenced, scale_to, &|candidates, count| {
        select_by_age(candidates, count, selection)
    })
}

/// [`propose`] with a custom victim selector, for run specs whose
/// constraint policy orders candidates differently.
pub fn propose_with_selector(
    running: &[Instance],
    sentenced: &[InstanceId],
    scale_to: u32,
    selector: &dyn Fn(&[Instance], usize) -> Vec<Instance>,
) -> ScaleProposition {
    let over_capacity = running.len().saturating_sub(scale_to as usize);

    let sentenced_ids: HashSet<&InstanceId> = sentenced.iter().collect();
    let mut to_kill: Vec<Instance> = running
        .iter()
        .filter(|i| sentenced_ids.contains(&i.id))
        .cloned()
        .collect();

    if to_kill.len() < over_capacity {
        let candidates: Vec<Instance> = running
            .iter()
            .filter(|i| !sentenced_ids.contains(&i.id))
            .cloned()
            .collect();
        to_kill.extend(selector(&candidates, over_capacity - to_kill.len()));
    }

    let to_start = (scale_to as usize).saturating_sub(running.len() - to_kill.len()) as u32;

    ScaleProposition {
        to_kill: if to_kill.is_empty() { None } else { Some(to_kill) },
        to_start: if to_start == 0 { None } else { Some(to_start) },
    }
}

/// Order candidates by start time (per the kill-selection policy), then
/// by instance id for a strictly total order, and take the first `count`.
fn select_by_age(candidates: &[Instance], count: usize, selection: KillSelection) -> Vec<Instance> {
    let mut ordered = candidates.to_vec();
    ordered.sort_by(|a, b| {
        let by_age = match selection {
            KillSelection::OldestFirst => a.started_at.cmp(&b.started_at),
            KillSelection::YoungestFirst => b.started_at.cmp(&a.started_at),
        };
        by_age.then_with(|| a.id.cmp(&b.id))
    });
    ordered.truncate(count);
    ordered
}
