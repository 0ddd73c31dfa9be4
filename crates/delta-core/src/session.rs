//! DeltaSession: the per-store context every delta operation runs in.
//!
//! A session owns the store handle plus all state that must not leak between
//! stores: the deletion tracker, the classifier's document cache, the
//! listener registry and the compaction lock. Operations are spread over
//! several modules as `impl DeltaSession` blocks:
//! - `writer` - create / update / delete
//! - `classifier` - observe / listen
//! - `compactor` - compact

use crate::classifier::LiveClassifier;
use crate::clock::{Clock, SystemClock};
use crate::config::DeltaConfig;
use crate::events::{DeltaListener, Dispatcher, Subscription};
use crate::projector;
use crate::record::LogicalDocument;
use crate::store::{DocumentStore, StoreError};
use crate::tracker::DeletionTracker;

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("No logical id could be resolved")]
    MissingIdentifier,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Compaction already running")]
    CompactionInProgress,
}

pub type Result<T> = std::result::Result<T, DeltaError>;

/// Delta versioning over one physical store.
pub struct DeltaSession<S: DocumentStore> {
    pub(crate) store: S,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) tracker: DeletionTracker,
    pub(crate) classifier: LiveClassifier,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) config: DeltaConfig,
    /// Held for the whole of a compaction run
    pub(crate) compaction_lock: tokio::sync::Mutex<()>,
}

impl<S: DocumentStore> DeltaSession<S> {
    /// Session with default configuration and the system clock.
    pub fn new(store: S) -> Self {
        Self::with_config(store, DeltaConfig::default())
    }

    pub fn with_config(store: S, config: DeltaConfig) -> Self {
        let tracker = DeletionTracker::new();
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            classifier: LiveClassifier::new(tracker.clone()),
            tracker,
            dispatcher: Arc::new(Dispatcher::new()),
            config,
            compaction_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the clock used to stamp new records.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &DeltaConfig {
        &self.config
    }

    /// Deletion tracker shared by every component of this session.
    pub fn tracker(&self) -> &DeletionTracker {
        &self.tracker
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Register a listener for create/update/delete notifications.
    pub fn subscribe(&self, listener: Arc<dyn DeltaListener>) -> Subscription {
        self.dispatcher.subscribe(listener)
    }

    /// Drop every registered listener, e.g. before discarding the session.
    pub fn unsubscribe_all(&self) -> usize {
        let removed = self.dispatcher.clear();
        debug!("Removed {} listeners", removed);
        removed
    }

    /// Last known state of a logical document, as seen by the classifier.
    pub fn cached(&self, logical_id: &str) -> Option<LogicalDocument> {
        self.classifier.cached(logical_id)
    }

    /// Project every record in the store into live logical documents.
    ///
    /// The result also seeds the classifier cache, so records observed
    /// afterwards for these ids are reported as updates. Cached documents
    /// found tombstoned by the projection are evicted.
    pub async fn all(&self) -> Result<BTreeMap<String, LogicalDocument>> {
        let records = self.store.list().await?;
        let documents = projector::project(&records, &self.tracker);
        debug!(
            "Projected {} records into {} documents",
            records.len(),
            documents.len()
        );
        self.classifier.seed(documents.values().cloned());
        Ok(documents)
    }
}
