//! Live classification of newly observed physical records.
//!
//! Each record seen on the change feed (or read back after a local write) is
//! turned into at most one `DeltaEvent`:
//!
//! 1. its logical id is already tombstoned → nothing
//! 2. it is a tombstone → `Delete`, and the id joins the deletion tracker
//! 3. the id has a cached document → `Update` with the merged document
//! 4. otherwise → `Create`, with `logical_id` filled in
//!
//! The check and the state change happen under one lock, so two records for
//! the same id can never both be classified as the creation. A physical id is
//! classified once per session, which keeps the local read-back and the
//! change feed from reporting the same write twice.

use crate::events::DeltaEvent;
use crate::record::{LogicalDocument, PhysicalRecord};
use crate::session::{DeltaSession, Result};
use crate::store::DocumentStore;
use crate::tracker::DeletionTracker;

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const FEED_RETRY_INITIAL: Duration = Duration::from_millis(50);
const FEED_RETRY_MAX: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ClassifierState {
    /// Last known document per logical id
    documents: HashMap<String, LogicalDocument>,
    /// Physical ids already classified
    seen: HashSet<String>,
}

/// Create/update/delete state machine over observed records.
pub struct LiveClassifier {
    tracker: DeletionTracker,
    state: Mutex<ClassifierState>,
    /// Held from classification until listeners have seen the event
    delivery: Mutex<()>,
}

impl LiveClassifier {
    pub fn new(tracker: DeletionTracker) -> Self {
        Self {
            tracker,
            state: Mutex::new(ClassifierState::default()),
            delivery: Mutex::new(()),
        }
    }

    /// Classify a record and hand its event to `deliver` before any other
    /// record is classified.
    ///
    /// `deliver` runs without the cache lock, so it may call `cached`. It must
    /// not classify records itself.
    pub fn classify_and_deliver(
        &self,
        record: PhysicalRecord,
        deliver: impl FnOnce(&DeltaEvent),
    ) -> Option<DeltaEvent> {
        let _turn = self.delivery.lock().unwrap_or_else(|e| e.into_inner());
        let event = self.classify(record);
        if let Some(event) = &event {
            deliver(event);
        }
        event
    }

    /// Classify one record, updating the cache and deletion tracker.
    pub fn classify(&self, mut record: PhysicalRecord) -> Option<DeltaEvent> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if !state.seen.insert(record.physical_id.clone()) {
            debug!("Already classified {}, skipping", record.physical_id);
            return None;
        }

        let id = record.resolved_id().to_string();
        if self.tracker.was_deleted(&id) {
            debug!("Ignoring {} for deleted document {}", record.physical_id, id);
            return None;
        }

        if record.deleted {
            self.tracker.mark_deleted(&id);
            state.documents.remove(&id);
            return Some(DeltaEvent::Delete { id });
        }

        if let Some(document) = state.documents.get_mut(&id) {
            document.apply(&record);
            return Some(DeltaEvent::Update {
                document: document.clone(),
            });
        }

        record.logical_id = Some(id.clone());
        state
            .documents
            .insert(id, LogicalDocument::from_record(&record));
        Some(DeltaEvent::Create { record })
    }

    /// Cached document for a logical id.
    pub fn cached(&self, logical_id: &str) -> Option<LogicalDocument> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.documents.get(logical_id).cloned()
    }

    /// Replace cached documents with freshly projected ones.
    ///
    /// Cached documents whose id has since been tombstoned are evicted.
    pub fn seed(&self, documents: impl IntoIterator<Item = LogicalDocument>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .documents
            .retain(|id, _| !self.tracker.was_deleted(id));
        for document in documents {
            if !self.tracker.was_deleted(&document.id) {
                state.documents.insert(document.id.clone(), document);
            }
        }
    }

    /// Evict the cached document for a logical id.
    pub fn forget(&self, logical_id: &str) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.documents.remove(logical_id);
    }

    /// Stop remembering physical ids whose records no longer exist.
    pub fn release<'a>(&self, physical_ids: impl IntoIterator<Item = &'a str>) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for physical_id in physical_ids {
            state.seen.remove(physical_id);
        }
    }

    /// Number of physical ids currently remembered as classified.
    pub fn seen_len(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).seen.len()
    }
}

/// Handle to a running change-feed listener.
///
/// Stopping (or dropping the handle) ends the listener after the change it is
/// currently classifying, never halfway through one. A change whose record
/// cannot be read is retried with backoff until it succeeds or the listener
/// stops; in the latter case the cursor still points before it.
pub struct FeedHandle {
    stop: watch::Sender<bool>,
    cursor: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl FeedHandle {
    /// Sequence number of the last change processed; resume from here.
    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Stop listening and wait for the in-flight change to finish.
    pub async fn stop(self) -> u64 {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!("Change feed task ended abnormally: {}", e);
        }
        self.cursor.load(Ordering::Acquire)
    }
}

impl<S: DocumentStore> DeltaSession<S> {
    /// Fetch a physical record and classify it, notifying listeners.
    ///
    /// A record that no longer exists (compacted away) produces no event.
    pub async fn observe(&self, physical_id: &str) -> Result<Option<DeltaEvent>> {
        let record = match self.store.get(physical_id).await {
            Ok(record) => record,
            Err(e) if e.is_not_found() => {
                debug!("Observed record {} is gone", physical_id);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let event = self.classifier.classify_and_deliver(record, |event| {
            debug!("Classified {} as {}", physical_id, event_kind(event));
            self.dispatcher.dispatch(event);
        });
        Ok(event)
    }
}

impl<S: DocumentStore + 'static> DeltaSession<S> {
    /// Follow the store's change feed from `since`, classifying each change in order.
    pub async fn listen(self: &Arc<Self>, since: u64) -> Result<FeedHandle> {
        let mut feed = self.store.subscribe_changes(since).await?;
        let (stop, mut stopped) = watch::channel(false);
        let cursor = Arc::new(AtomicU64::new(since));

        let session = Arc::clone(self);
        let task_cursor = Arc::clone(&cursor);
        let task = tokio::spawn(async move {
            'feed: loop {
                let change = tokio::select! {
                    biased;
                    _ = stopped.changed() => break,
                    next = feed.next() => match next {
                        Some(change) => change,
                        None => break,
                    },
                };

                // The cursor never moves past a change that was not classified
                let mut backoff = FEED_RETRY_INITIAL;
                while let Err(e) = session.observe(&change.physical_id).await {
                    warn!(
                        "Failed to classify {}, retrying in {:?}: {}",
                        change.physical_id, backoff, e
                    );
                    tokio::select! {
                        biased;
                        _ = stopped.changed() => break 'feed,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(FEED_RETRY_MAX);
                }
                task_cursor.store(change.seq, Ordering::Release);
            }
            debug!("Change feed listener stopped");
        });

        Ok(FeedHandle { stop, cursor, task })
    }

    /// `listen` from the cursor in the session configuration.
    pub async fn listen_from_config(self: &Arc<Self>) -> Result<FeedHandle> {
        self.listen(self.config.feed.since).await
    }
}

fn event_kind(event: &DeltaEvent) -> &'static str {
    match event {
        DeltaEvent::Create { .. } => "create",
        DeltaEvent::Update { .. } => "update",
        DeltaEvent::Delete { .. } => "delete",
    }
}
