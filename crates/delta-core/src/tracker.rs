//! Deletion tracking shared by the projector, classifier and compactor.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

/// Logical ids known to be tombstoned.
///
/// Once an id is in here, no later record for it is recognised as a create or
/// update, whatever its timestamp. The set only grows; it is emptied only by
/// building a new session.
///
/// Clones share the same set, so one session hands the same tracker to every
/// component.
#[derive(Clone, Default)]
pub struct DeletionTracker {
    deleted: Arc<RwLock<HashSet<String>>>,
}

impl DeletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn was_deleted(&self, logical_id: &str) -> bool {
        self.deleted
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(logical_id)
    }

    /// Record a deletion. Returns true the first time an id is marked.
    pub fn mark_deleted(&self, logical_id: &str) -> bool {
        self.deleted
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(logical_id.to_string())
    }

    pub fn len(&self) -> usize {
        self.deleted.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_is_reported_once() {
        let tracker = DeletionTracker::new();
        assert!(!tracker.was_deleted("a"));

        assert!(tracker.mark_deleted("a"));
        assert!(!tracker.mark_deleted("a"));

        assert!(tracker.was_deleted("a"));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = DeletionTracker::new();
        let other = tracker.clone();

        other.mark_deleted("a");

        assert!(tracker.was_deleted("a"));
    }

    #[test]
    fn test_separate_trackers_are_isolated() {
        let first = DeletionTracker::new();
        let second = DeletionTracker::new();

        first.mark_deleted("a");

        assert!(!second.was_deleted("a"));
        assert!(second.is_empty());
    }
}
