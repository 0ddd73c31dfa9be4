//! Compaction: shrinking the physical record set without changing what it projects to.
//!
//! Planning runs over one snapshot of the store in replay order:
//!
//! **Pass 1**
//! - a tombstone, or any record of an id already seen tombstoned → remove
//! - the first record of an id becomes its base and is kept
//! - a later record is kept only if it still supplies a field value the
//!   final document needs; otherwise it is redundant and removed
//!
//! **Pass 2**
//! - sweep the whole snapshot again and remove every remaining record of a
//!   tombstoned id. Pass 1 keeps records it met before the tombstone (for
//!   example a replica updating after another replica deleted), so this pass
//!   is what guarantees nothing survives for a deleted id.
//!
//! Records written after the snapshot are left for the next run. Failed
//! removals are logged and retried on the next run; compaction is idempotent.

use crate::projector::record_order;
use crate::record::{Fields, PhysicalRecord, merge_into};
use crate::session::{DeltaError, DeltaSession, Result};
use crate::store::DocumentStore;
use crate::tracker::DeletionTracker;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use web_time::Instant;

/// Why a record is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Every field it carries is already captured or later overwritten.
    Redundant,
    /// It is, or follows, a tombstone of its logical id.
    Tombstoned,
    /// Kept by pass 1, but its logical id turned out to be tombstoned.
    Swept,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub physical_id: String,
    pub reason: RemovalReason,
}

/// Outcome of planning, before anything is removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionPlan {
    /// Physical ids that survive, in replay order.
    pub retained: Vec<String>,
    pub first_pass: Vec<Removal>,
    pub second_pass: Vec<Removal>,
    /// Logical ids tombstoned in the snapshot or already known deleted.
    pub deleted_ids: BTreeSet<String>,
}

impl CompactionPlan {
    pub fn removal_count(&self) -> usize {
        self.first_pass.len() + self.second_pass.len()
    }

    /// All removals, pass 1 first.
    pub fn removals(&self) -> impl Iterator<Item = &Removal> {
        self.first_pass.iter().chain(self.second_pass.iter())
    }
}

/// Decide which records a compaction keeps.
///
/// Ids already in `known_deleted` are treated as tombstoned even when their
/// tombstone record is gone, which lets a run finish what an earlier,
/// partially failed run started.
pub fn plan_compaction(
    records: &[PhysicalRecord],
    known_deleted: &DeletionTracker,
) -> CompactionPlan {
    let mut ordered: Vec<&PhysicalRecord> = records.iter().collect();
    ordered.sort_by(|a, b| record_order(a, b));

    // Last live record to write each (logical id, field)
    let mut last_writer: HashMap<(&str, &str), &str> = HashMap::new();
    for record in ordered.iter().filter(|r| !r.deleted) {
        for field in record.fields.keys() {
            last_writer.insert(
                (record.resolved_id(), field.as_str()),
                record.physical_id.as_str(),
            );
        }
    }

    let mut plan = CompactionPlan::default();
    let mut accumulated: HashMap<&str, Fields> = HashMap::new();
    let mut removed: HashSet<&str> = HashSet::new();

    for record in &ordered {
        let id = record.resolved_id();

        if record.deleted || plan.deleted_ids.contains(id) || known_deleted.was_deleted(id) {
            plan.deleted_ids.insert(id.to_string());
            removed.insert(record.physical_id.as_str());
            plan.first_pass.push(Removal {
                physical_id: record.physical_id.clone(),
                reason: RemovalReason::Tombstoned,
            });
            continue;
        }

        match accumulated.get_mut(id) {
            Some(fields) => {
                let load_bearing = record.fields.iter().any(|(field, value)| {
                    last_writer.get(&(id, field.as_str())) == Some(&record.physical_id.as_str())
                        && fields.get(field) != Some(value)
                });

                if load_bearing {
                    merge_into(fields, &record.fields);
                    plan.retained.push(record.physical_id.clone());
                } else {
                    removed.insert(record.physical_id.as_str());
                    plan.first_pass.push(Removal {
                        physical_id: record.physical_id.clone(),
                        reason: RemovalReason::Redundant,
                    });
                }
            }
            None => {
                accumulated.insert(id, record.fields.clone());
                plan.retained.push(record.physical_id.clone());
            }
        }
    }

    for record in &ordered {
        if plan.deleted_ids.contains(record.resolved_id())
            && !removed.contains(record.physical_id.as_str())
        {
            plan.second_pass.push(Removal {
                physical_id: record.physical_id.clone(),
                reason: RemovalReason::Swept,
            });
        }
    }

    let swept: HashSet<&str> = plan
        .second_pass
        .iter()
        .map(|r| r.physical_id.as_str())
        .collect();
    plan.retained.retain(|id| !swept.contains(id.as_str()));

    plan
}

/// Summary of one compaction run.
#[derive(Debug, Clone, Default)]
pub struct CompactionReport {
    /// Records in the snapshot.
    pub scanned: usize,
    /// Records the plan keeps.
    pub retained: usize,
    pub removed_redundant: usize,
    pub removed_tombstoned: usize,
    pub removed_swept: usize,
    /// Physical ids whose removal failed; they are retried next run.
    pub failed: Vec<String>,
    pub elapsed: Duration,
}

impl CompactionReport {
    pub fn removed(&self) -> usize {
        self.removed_redundant + self.removed_tombstoned + self.removed_swept
    }

    fn count(&mut self, reason: RemovalReason) {
        match reason {
            RemovalReason::Redundant => self.removed_redundant += 1,
            RemovalReason::Tombstoned => self.removed_tombstoned += 1,
            RemovalReason::Swept => self.removed_swept += 1,
        }
    }
}

impl<S: DocumentStore> DeltaSession<S> {
    /// Compact the store once.
    ///
    /// Returns `DeltaError::CompactionInProgress` if another compaction of this
    /// session is running.
    pub async fn compact(&self) -> Result<CompactionReport> {
        let _guard = self
            .compaction_lock
            .try_lock()
            .map_err(|_| DeltaError::CompactionInProgress)?;
        let started = Instant::now();

        let records = self.store.list().await?;
        let plan = plan_compaction(&records, &self.tracker);

        // Tombstones may be among the records about to disappear
        for id in &plan.deleted_ids {
            self.tracker.mark_deleted(id);
            self.classifier.forget(id);
        }

        let mut report = CompactionReport {
            scanned: records.len(),
            retained: plan.retained.len(),
            ..Default::default()
        };

        for removal in plan.removals() {
            match self.get_and_remove(&removal.physical_id).await {
                Ok(_) => {
                    debug!("Compaction removed {} ({:?})", removal.physical_id, removal.reason);
                    self.classifier.release([removal.physical_id.as_str()]);
                    report.count(removal.reason);
                }
                Err(e) => {
                    warn!("Compaction could not remove {}: {}", removal.physical_id, e);
                    report.failed.push(removal.physical_id.clone());
                }
            }
        }

        report.elapsed = started.elapsed();
        info!(
            "Compaction scanned {} records, removed {}, kept {}, {} failed",
            report.scanned,
            report.removed(),
            report.retained,
            report.failed.len()
        );
        Ok(report)
    }

    /// Remove a physical record if it exists. Returns whether it was there.
    pub async fn get_and_remove(&self, physical_id: &str) -> Result<bool> {
        match self.store.get(physical_id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        self.store.remove(physical_id).await?;
        Ok(true)
    }
}

impl<S: DocumentStore + 'static> DeltaSession<S> {
    /// Start periodic compaction as configured, if enabled.
    pub fn start_compaction(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let settings = &self.config.compaction;
        if !settings.enabled {
            return None;
        }
        Some(spawn_compaction_task(
            Arc::clone(self),
            Duration::from_secs(settings.interval_secs.max(1)),
        ))
    }
}

/// Compact `session` every `interval`, starting immediately.
pub fn spawn_compaction_task<S: DocumentStore + 'static>(
    session: Arc<DeltaSession<S>>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match session.compact().await {
                Ok(_) => {}
                Err(DeltaError::CompactionInProgress) => {
                    debug!("Skipping scheduled compaction, one is already running");
                }
                Err(e) => warn!("Scheduled compaction failed: {}", e),
            }
        }
    })
}
