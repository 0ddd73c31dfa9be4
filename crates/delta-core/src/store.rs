//! Physical store abstraction.
//!
//! The delta layer only needs a handful of primitives from the underlying
//! document store: point reads, append-style writes, idempotent removal, a
//! full scan, and a change feed of physical ids.
//!
//! Implementations:
//! - `InMemoryStore` - For testing, and as a reference for backend authors
//!
//! Replication between stores is the backend's business and is not modelled.

use crate::record::{PhysicalRecord, RecordDraft};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use thiserror::Error;
use uuid::Uuid;

/// Why a store rejected a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A record with the same physical id is already stored.
    AlreadyExists,
    /// The write carried a stale revision of an existing record.
    StaleRevision,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Write conflict on {id}: {kind:?}")]
    Conflict { id: String, kind: ConflictKind },

    #[error("Store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// One entry of the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Store sequence number; pass it back as `since` to resume after this change.
    pub seq: u64,
    /// The record that was written.
    pub physical_id: String,
}

/// Live feed of written physical ids, in store order.
pub type ChangeFeed = BoxStream<'static, Change>;

/// Append-capable document store holding physical records.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Read one record.
    async fn get(&self, physical_id: &str) -> Result<PhysicalRecord>;

    /// Write a record under its own physical id.
    async fn put(&self, record: &PhysicalRecord) -> Result<()>;

    /// Write a record and let the store choose its physical id.
    async fn post(&self, draft: RecordDraft) -> Result<String>;

    /// Physically delete a record. Missing records are not an error.
    async fn remove(&self, physical_id: &str) -> Result<()>;

    /// Every record currently stored, with fields.
    async fn list(&self) -> Result<Vec<PhysicalRecord>>;

    /// Changes with a sequence number greater than `since`, then live changes.
    async fn subscribe_changes(&self, since: u64) -> Result<ChangeFeed>;
}

#[derive(Default)]
struct FeedState {
    last_seq: u64,
    history: Vec<Change>,
    subscribers: Vec<mpsc::UnboundedSender<Change>>,
}

/// In-memory store for testing
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<String, PhysicalRecord>>,
    feed: Mutex<FeedState>,
    /// Physical ids whose removal fails, to exercise error paths
    failing_removals: RwLock<HashSet<String>>,
    /// Number of upcoming `get` calls that fail with a backend error
    failing_gets: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physical records stored.
    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every `remove` of `physical_id` fail with a backend error.
    pub fn fail_removal(&self, physical_id: &str) {
        self.failing_removals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(physical_id.to_string());
    }

    /// Undo `fail_removal`.
    pub fn heal_removal(&self, physical_id: &str) {
        self.failing_removals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(physical_id);
    }

    /// Make the next `count` calls to `get` fail with a backend error.
    pub fn fail_next_gets(&self, count: usize) {
        self.failing_gets.store(count, Ordering::SeqCst);
    }

    /// Sequence number of the latest change.
    pub fn last_seq(&self) -> u64 {
        self.feed.lock().unwrap_or_else(|e| e.into_inner()).last_seq
    }

    fn insert_new(&self, record: PhysicalRecord) -> Result<()> {
        let physical_id = record.physical_id.clone();
        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            if records.contains_key(&physical_id) {
                return Err(StoreError::Conflict {
                    id: physical_id,
                    kind: ConflictKind::AlreadyExists,
                });
            }
            records.insert(physical_id.clone(), record);
        }
        self.publish(physical_id);
        Ok(())
    }

    fn publish(&self, physical_id: String) {
        let mut feed = self.feed.lock().unwrap_or_else(|e| e.into_inner());
        feed.last_seq += 1;
        let change = Change {
            seq: feed.last_seq,
            physical_id,
        };
        feed.history.push(change.clone());
        // Closed receivers are pruned on the way
        feed.subscribers
            .retain(|tx| tx.unbounded_send(change.clone()).is_ok());
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn get(&self, physical_id: &str) -> Result<PhysicalRecord> {
        let failing = self
            .failing_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Backend(format!("refusing to read {}", physical_id)));
        }

        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(physical_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(physical_id.to_string()))
    }

    async fn put(&self, record: &PhysicalRecord) -> Result<()> {
        self.insert_new(record.clone())
    }

    async fn post(&self, draft: RecordDraft) -> Result<String> {
        let physical_id = Uuid::new_v4().to_string();
        self.insert_new(draft.into_record(physical_id.clone()))?;
        Ok(physical_id)
    }

    async fn remove(&self, physical_id: &str) -> Result<()> {
        let failing = self
            .failing_removals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(physical_id);
        if failing {
            return Err(StoreError::Backend(format!("refusing to remove {}", physical_id)));
        }

        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(physical_id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<PhysicalRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.values().cloned().collect())
    }

    async fn subscribe_changes(&self, since: u64) -> Result<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded();
        let mut feed = self.feed.lock().unwrap_or_else(|e| e.into_inner());
        for change in feed.history.iter().filter(|c| c.seq > since) {
            // Receiver is still in scope, cannot be closed
            let _ = tx.unbounded_send(change.clone());
        }
        feed.subscribers.push(tx);
        Ok(rx.boxed())
    }
}

// Lets tests keep a handle on the store they hand to a session
#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for std::sync::Arc<T> {
    async fn get(&self, physical_id: &str) -> Result<PhysicalRecord> {
        (**self).get(physical_id).await
    }

    async fn put(&self, record: &PhysicalRecord) -> Result<()> {
        (**self).put(record).await
    }

    async fn post(&self, draft: RecordDraft) -> Result<String> {
        (**self).post(draft).await
    }

    async fn remove(&self, physical_id: &str) -> Result<()> {
        (**self).remove(physical_id).await
    }

    async fn list(&self) -> Result<Vec<PhysicalRecord>> {
        (**self).list().await
    }

    async fn subscribe_changes(&self, since: u64) -> Result<ChangeFeed> {
        (**self).subscribe_changes(since).await
    }
}
