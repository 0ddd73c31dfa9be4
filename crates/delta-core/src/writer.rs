//! Delta writer: turns logical mutations into appended physical records.
//!
//! - `create` posts the full field set and lets the store pick the id, which
//!   becomes the logical id
//! - `update` writes only the fields that differ from the caller's last known
//!   state, under the derived id `<logical id>_<created at>`
//! - `delete` writes a tombstone the same way
//!
//! Every successful write is read back and fed to the classifier so local
//! listeners see the same notification a replicated read would produce.

use crate::record::{
    Fields, LogicalDocument, PhysicalRecord, RecordDraft, Timestamp, derive_physical_id,
};
use crate::session::{DeltaError, DeltaSession, Result};
use crate::store::{ConflictKind, DocumentStore, StoreError};

use tracing::{debug, warn};

/// What a write did.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// A new physical record was stored.
    Written(WriteReceipt),
    /// Nothing differed from the known state, so nothing was written.
    Unchanged,
    /// The store already held a record with this physical id; the write was dropped.
    ConflictIgnored { physical_id: String },
}

impl WriteOutcome {
    pub fn receipt(&self) -> Option<&WriteReceipt> {
        match self {
            WriteOutcome::Written(receipt) => Some(receipt),
            _ => None,
        }
    }

    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written(_))
    }
}

/// Identity of a stored record.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub physical_id: String,
    pub logical_id: String,
    pub created_at: Timestamp,
}

/// The one store error a delta write swallows.
///
/// Derived ids are fresh by construction, so an "already exists" conflict
/// means the same delta landed before (some stores also report it spuriously
/// for brand new ids). Any other failure is real.
pub fn is_benign_write_conflict(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::Conflict {
            kind: ConflictKind::AlreadyExists,
            ..
        }
    )
}

/// Fields of `next` whose value differs from `previous`, or `None` if there are none.
///
/// Fields missing from `next` are left alone; a delta never removes a field.
pub fn diff_fields(previous: &Fields, next: &Fields) -> Option<Fields> {
    let changes: Fields = next
        .iter()
        .filter(|(key, value)| previous.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    if changes.is_empty() { None } else { Some(changes) }
}

/// Anything a logical id can be resolved from.
pub trait LogicalRef {
    fn logical_id(&self) -> Option<&str>;
}

impl LogicalRef for str {
    fn logical_id(&self) -> Option<&str> {
        Some(self).filter(|id| !id.is_empty())
    }
}

impl LogicalRef for String {
    fn logical_id(&self) -> Option<&str> {
        self.as_str().logical_id()
    }
}

impl LogicalRef for LogicalDocument {
    fn logical_id(&self) -> Option<&str> {
        self.id.as_str().logical_id()
    }
}

impl LogicalRef for PhysicalRecord {
    fn logical_id(&self) -> Option<&str> {
        self.resolved_id().logical_id()
    }
}

impl<T: LogicalRef + ?Sized> LogicalRef for Option<&T> {
    fn logical_id(&self) -> Option<&str> {
        self.and_then(|inner| inner.logical_id())
    }
}

impl<S: DocumentStore> DeltaSession<S> {
    /// Store a new logical document. The receipt's `logical_id` is the new id.
    pub async fn create(&self, fields: Fields) -> Result<WriteReceipt> {
        let created_at = self.clock.now();
        let physical_id = self
            .store
            .post(RecordDraft::creation(fields, created_at))
            .await?;
        debug!("Created logical document {}", physical_id);

        self.read_back(&physical_id).await?;
        Ok(WriteReceipt {
            logical_id: physical_id.clone(),
            physical_id,
            created_at,
        })
    }

    /// Persist the fields of `next` that differ from `previous`.
    pub async fn update(&self, previous: &LogicalDocument, next: &Fields) -> Result<WriteOutcome> {
        let logical_id = previous.logical_id().ok_or(DeltaError::MissingIdentifier)?;
        match diff_fields(&previous.fields, next) {
            Some(changes) => self.append(logical_id, false, changes).await,
            None => {
                debug!("No field changes for {}, skipping write", logical_id);
                Ok(WriteOutcome::Unchanged)
            }
        }
    }

    /// Append `fields` as a delta for `logical_id` without comparing to any prior state.
    pub async fn write_delta(&self, logical_id: &str, fields: Fields) -> Result<WriteOutcome> {
        let logical_id = logical_id.logical_id().ok_or(DeltaError::MissingIdentifier)?;
        if fields.is_empty() {
            return Ok(WriteOutcome::Unchanged);
        }
        self.append(logical_id, false, fields).await
    }

    /// Tombstone a logical document.
    pub async fn delete<R: LogicalRef + ?Sized>(&self, target: &R) -> Result<WriteOutcome> {
        let logical_id = target.logical_id().ok_or(DeltaError::MissingIdentifier)?;
        self.append(logical_id, true, Fields::new()).await
    }

    async fn append(&self, logical_id: &str, deleted: bool, fields: Fields) -> Result<WriteOutcome> {
        let created_at = self.clock.now();
        let record = PhysicalRecord {
            physical_id: derive_physical_id(logical_id, created_at),
            logical_id: Some(logical_id.to_string()),
            created_at,
            deleted,
            fields,
        };

        match self.store.put(&record).await {
            Ok(()) => {}
            Err(e) if is_benign_write_conflict(&e) => {
                warn!("Ignoring write conflict for {}: {}", record.physical_id, e);
                return Ok(WriteOutcome::ConflictIgnored {
                    physical_id: record.physical_id,
                });
            }
            Err(e) => return Err(e.into()),
        }
        debug!(
            "Wrote {} for {} ({} fields)",
            if deleted { "tombstone" } else { "delta" },
            logical_id,
            record.fields.len()
        );

        self.read_back(&record.physical_id).await?;
        Ok(WriteOutcome::Written(WriteReceipt {
            physical_id: record.physical_id,
            logical_id: logical_id.to_string(),
            created_at,
        }))
    }

    async fn read_back(&self, physical_id: &str) -> Result<()> {
        if self.config.readback {
            self.observe(physical_id).await?;
        }
        Ok(())
    }
}
