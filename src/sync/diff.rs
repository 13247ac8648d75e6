// ABOUTME: Set-based diff engine for relationship reconciliation
// ABOUTME: Computes minimal insert/delete sets between source and persisted rows

use std::collections::BTreeSet;

/// One relationship row, identified by its full tuple. Two items with the
/// same tuple are the same logical row.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationshipItem {
    /// Parent document id
    pub parent: String,
    /// Child id extracted from the embedded array
    pub child: String,
    /// Which source array the row came from, for consolidated tables
    pub label: Option<String>,
}

impl RelationshipItem {
    pub fn new(parent: impl Into<String>, child: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            label: None,
        }
    }

    pub fn labeled(
        parent: impl Into<String>,
        child: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            label: Some(label.into()),
        }
    }
}

/// Result of diffing a source-derived set against the persisted set.
///
/// `additions` and `removals` are disjoint by construction: applying the
/// removals and then the additions to the persisted set yields exactly the
/// source set.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Present in source, absent in destination
    pub additions: BTreeSet<RelationshipItem>,
    /// Present in destination, absent in source
    pub removals: BTreeSet<RelationshipItem>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.removals.is_empty()
    }

    /// Total number of edits needed to reconcile the sets.
    pub fn change_count(&self) -> usize {
        self.additions.len() + self.removals.len()
    }

    /// Edits relative to the persisted set size. An empty persisted set
    /// counts as size 1 so a first-time import is always "fully changed".
    pub fn change_fraction(&self, persisted_len: usize) -> f64 {
        self.change_count() as f64 / persisted_len.max(1) as f64
    }
}

/// Diff the current (source-derived) set against the persisted set.
pub fn diff(
    current: &BTreeSet<RelationshipItem>,
    persisted: &BTreeSet<RelationshipItem>,
) -> DiffResult {
    DiffResult {
        additions: current.difference(persisted).cloned().collect(),
        removals: persisted.difference(current).cloned().collect(),
    }
}
