//! Record types: the physical delta records kept in the store and the logical
//! documents folded from them.
//!
//! A logical document is never stored as such. Every mutation appends one
//! immutable [`PhysicalRecord`]:
//! - the creation record has no `$id`; its own `_id` becomes the logical id
//! - update records carry `$id` plus only the fields that changed
//! - a deletion record carries `$id` and `$deleted: true`, no fields
//!
//! Physical ids of non-creation records are derived as
//! `<logical id>_<created at>`, so records of one logical id sort the same way
//! by id as by timestamp.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Field name -> scalar value contributed by a record.
pub type Fields = BTreeMap<String, serde_json::Value>;

#[derive(Debug, Error)]
pub enum TimestampError {
    #[error("Invalid timestamp: {0}")]
    Invalid(String),

    #[error("Timestamp out of range: {0}ms")]
    OutOfRange(i64),
}

/// A UTC instant with millisecond precision.
///
/// Renders as ISO-8601 with exactly three fractional digits
/// (`2024-05-01T09:30:00.125Z`), which keeps lexical and chronological order
/// identical.
///
/// # Examples
/// ```
/// use delta_core::Timestamp;
///
/// let ts: Timestamp = "2024-05-01T09:30:00.125Z".parse().unwrap();
/// assert_eq!(ts.to_string(), "2024-05-01T09:30:00.125Z");
/// assert!(ts < ts.plus_millis(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(DateTime::<Utc>::UNIX_EPOCH);

    /// Build from milliseconds since the Unix epoch.
    pub fn from_millis(millis: i64) -> Result<Self, TimestampError> {
        DateTime::from_timestamp_millis(millis)
            .map(Self)
            .ok_or(TimestampError::OutOfRange(millis))
    }

    /// Milliseconds since the Unix epoch.
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// The instant `millis` milliseconds later (saturating at the end of the range).
    pub fn plus_millis(&self, millis: i64) -> Self {
        let target = self.as_millis().saturating_add(millis);
        Self::from_millis(target).unwrap_or(*self)
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.to_rfc3339_opts(SecondsFormat::Millis, true))
    }
}

impl FromStr for Timestamp {
    type Err = TimestampError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = DateTime::parse_from_rfc3339(s)
            .map_err(|e| TimestampError::Invalid(format!("{}: {}", s, e)))?;
        // Anything finer than a millisecond is dropped
        Self::from_millis(parsed.with_timezone(&Utc).timestamp_millis())
    }
}

impl serde::Serialize for Timestamp {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for Timestamp {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Physical id for a non-creation record of `logical_id` written at `created_at`.
pub fn derive_physical_id(logical_id: &str, created_at: Timestamp) -> String {
    format!("{}_{}", logical_id, created_at)
}

/// One immutable write in the underlying store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalRecord {
    /// Store-level identifier.
    #[serde(rename = "_id")]
    pub physical_id: String,

    /// Logical document this record belongs to. Absent on the creation record.
    #[serde(rename = "$id", default, skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<String>,

    /// Client clock at write time.
    #[serde(rename = "$createdAt")]
    pub created_at: Timestamp,

    /// Tombstone flag.
    #[serde(rename = "$deleted", default, skip_serializing_if = "is_false")]
    pub deleted: bool,

    /// Fields contributed by this record.
    #[serde(flatten)]
    pub fields: Fields,
}

impl PhysicalRecord {
    /// The logical id this record applies to.
    ///
    /// The creation record has no `logical_id`, so its physical id stands in.
    pub fn resolved_id(&self) -> &str {
        self.logical_id.as_deref().unwrap_or(&self.physical_id)
    }

    /// Whether this is the first record of its logical document.
    pub fn is_creation(&self) -> bool {
        self.logical_id.is_none()
    }
}

/// A record that has not been assigned a physical id yet.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub logical_id: Option<String>,
    pub created_at: Timestamp,
    pub deleted: bool,
    pub fields: Fields,
}

impl RecordDraft {
    /// Draft for a brand new logical document.
    pub fn creation(fields: Fields, created_at: Timestamp) -> Self {
        Self {
            logical_id: None,
            created_at,
            deleted: false,
            fields,
        }
    }

    /// Finalize with the physical id the store chose.
    pub fn into_record(self, physical_id: String) -> PhysicalRecord {
        PhysicalRecord {
            physical_id,
            logical_id: self.logical_id,
            created_at: self.created_at,
            deleted: self.deleted,
            fields: self.fields,
        }
    }
}

/// The merged, user-visible view of all records sharing a logical id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalDocument {
    pub id: String,
    /// Timestamp of the earliest record applied.
    pub created_at: Timestamp,
    /// Timestamp of the latest record applied.
    pub updated_at: Timestamp,
    pub fields: Fields,
}

impl LogicalDocument {
    /// Start a document from its first observed record.
    pub fn from_record(record: &PhysicalRecord) -> Self {
        Self {
            id: record.resolved_id().to_string(),
            created_at: record.created_at,
            updated_at: record.created_at,
            fields: record.fields.clone(),
        }
    }

    /// Merge a later record's fields over this document.
    pub fn apply(&mut self, record: &PhysicalRecord) {
        merge_into(&mut self.fields, &record.fields);
        self.created_at = self.created_at.min(record.created_at);
        self.updated_at = self.updated_at.max(record.created_at);
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field)
    }
}

/// Overlay `incoming` onto `target`; incoming values win.
pub fn merge_into(target: &mut Fields, incoming: &Fields) {
    for (key, value) in incoming {
        target.insert(key.clone(), value.clone());
    }
}
