//! Explicit set reconciliation: instead of deleting every member and
//! re-inserting the desired set, compute what to add and what to remove and
//! apply both.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetDiff<T> {
    pub added: Vec<T>,
    pub removed: Vec<T>,
}

impl<T> SetDiff<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff `current` against `desired`. Both halves come out sorted.
pub fn reconcile<T: Ord + Clone>(current: &BTreeSet<T>, desired: &BTreeSet<T>) -> SetDiff<T> {
    SetDiff {
        added: desired.difference(current).cloned().collect(),
        removed: current.difference(desired).cloned().collect(),
    }
}

/// Apply a diff to a set in place.
pub fn apply<T: Ord + Clone>(set: &mut BTreeSet<T>, diff: &SetDiff<T>) {
    for item in &diff.removed {
        set.remove(item);
    }
    for item in &diff.added {
        set.insert(item.clone());
    }
}
