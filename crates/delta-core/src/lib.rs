//! delta-core: conflict-tolerant document versioning over an append-only store.
//!
//! Many writers can mutate the same logical document at once. Instead of
//! rewriting documents, every mutation appends an immutable delta record, and
//! readers fold those records back together. This crate provides:
//! - The delta writer (create / update / delete as appended records)
//! - Projection of physical records into logical documents
//! - Live create/update/delete classification of newly observed records
//! - Compaction of the physical record set
//! - A `DocumentStore` trait abstraction over the underlying store

pub mod classifier;
pub mod clock;
pub mod compactor;
pub mod config;
pub mod events;
pub mod projector;
pub mod record;
pub mod session;
pub mod store;
pub mod tracker;
pub mod writer;

pub use classifier::{FeedHandle, LiveClassifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use compactor::{CompactionPlan, CompactionReport, plan_compaction, spawn_compaction_task};
pub use config::{ConfigError, DeltaConfig};
pub use events::{DeltaEvent, DeltaListener, Dispatcher, Subscription};
pub use projector::project;
pub use record::{Fields, LogicalDocument, PhysicalRecord, RecordDraft, Timestamp};
pub use session::{DeltaError, DeltaSession};
pub use store::{Change, ChangeFeed, DocumentStore, InMemoryStore, StoreError};
pub use tracker::DeletionTracker;
pub use writer::{LogicalRef, WriteOutcome, WriteReceipt, is_benign_write_conflict};
