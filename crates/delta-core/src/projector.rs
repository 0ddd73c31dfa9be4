//! Projection: folding physical records into logical documents.
//!
//! Records are applied oldest first. For each logical id, fields merge
//! last-writer-wins, and a tombstone is absorbing: it drops whatever was
//! accumulated and every record for that id after it is ignored.

use crate::record::{LogicalDocument, PhysicalRecord};
use crate::tracker::DeletionTracker;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use tracing::debug;

/// Order used everywhere records are replayed: `created_at`, then physical id.
pub fn record_order(a: &PhysicalRecord, b: &PhysicalRecord) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.physical_id.cmp(&b.physical_id))
}

/// Sort records into replay order (stable).
pub fn sort_records(records: &mut [PhysicalRecord]) {
    records.sort_by(record_order);
}

/// Fold `records` into the live documents they describe.
///
/// Tombstones found along the way are added to `tracker`, and ids already in
/// `tracker` contribute nothing. Applying the same record twice changes
/// nothing, so duplicates in the input are harmless.
pub fn project(
    records: &[PhysicalRecord],
    tracker: &DeletionTracker,
) -> BTreeMap<String, LogicalDocument> {
    let mut ordered: Vec<&PhysicalRecord> = records.iter().collect();
    ordered.sort_by(|a, b| record_order(a, b));

    let mut documents: BTreeMap<String, LogicalDocument> = BTreeMap::new();
    for record in ordered {
        let id = record.resolved_id();

        if record.deleted {
            documents.remove(id);
            if tracker.mark_deleted(id) {
                debug!("Projection found tombstone for {}", id);
            }
            continue;
        }

        if tracker.was_deleted(id) {
            continue;
        }

        match documents.get_mut(id) {
            Some(document) => document.apply(record),
            None => {
                documents.insert(id.to_string(), LogicalDocument::from_record(record));
            }
        }
    }

    documents
}
