//! Session configuration.
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```json
//! {
//!   "readback": true,
//!   "feed": { "since": 0 },
//!   "compaction": { "enabled": true, "intervalSecs": 300 }
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaConfig {
    /// Read every local write back through the classifier
    #[serde(default = "default_true")]
    pub readback: bool,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedConfig {
    /// Change-feed sequence number to start listening after
    #[serde(default)]
    pub since: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    /// Whether `start_compaction` spawns the periodic task
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between compaction runs (default: 5 minutes)
    #[serde(default = "default_compaction_interval")]
    pub interval_secs: u64,
}

impl Default for DeltaConfig {
    fn default() -> Self {
        Self {
            readback: true,
            feed: FeedConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_compaction_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_compaction_interval() -> u64 {
    300
}

impl DeltaConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }
}
