//! Metadata record for the sync timestamp and model bookkeeping
//!
//! Stored at `{model_prefix}config.json` and always read and written whole;
//! concurrent writers resolve last-writer-wins.

use super::{read_json, write_atomic};
use crate::error::Result;
use crate::models::TaskKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Contents of the metadata record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// When field series were last extended
    #[serde(default)]
    pub last_sync: Option<DateTime<Utc>>,
    /// Held-out accuracy per region, per task
    #[serde(default)]
    pub accuracy: BTreeMap<String, BTreeMap<TaskKind, f64>>,
    /// SHA-256 of each persisted artifact
    #[serde(default)]
    pub checksums: BTreeMap<String, BTreeMap<TaskKind, String>>,
}

impl ModelMetadata {
    /// Whole days elapsed since the last sync; `None` when never synced
    pub fn days_since_sync(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_sync.map(|t| (now - t).num_days())
    }

    /// True when data must be refreshed under a `min_data_days` policy
    pub fn is_stale(&self, now: DateTime<Utc>, min_data_days: i64) -> bool {
        self.days_since_sync(now)
            .map_or(true, |days| days >= min_data_days)
    }

    pub fn accuracy_of(&self, region: &str, task: TaskKind) -> Option<f64> {
        self.accuracy.get(region).and_then(|m| m.get(&task)).copied()
    }

    pub fn checksum_of(&self, region: &str, task: TaskKind) -> Option<&str> {
        self.checksums
            .get(region)
            .and_then(|m| m.get(&task))
            .map(String::as_str)
    }
}

/// Handle to the metadata file
#[derive(Debug)]
pub struct MetadataFile {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetadataFile {
    pub fn new(model_prefix: &str) -> Self {
        Self::at(PathBuf::from(format!("{}config.json", model_prefix)))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record; a missing file reads as empty metadata
    pub fn load(&self) -> Result<ModelMetadata> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "Metadata record missing, starting empty");
            return Ok(ModelMetadata::default());
        }
        read_json(&self.path)
    }

    /// Replace the record
    pub fn save(&self, metadata: &ModelMetadata) -> Result<()> {
        write_atomic(&self.path, metadata)
    }

    /// Load, modify and save the record as one step within this process
    pub fn update<F>(&self, f: F) -> Result<ModelMetadata>
    where
        F: FnOnce(&mut ModelMetadata),
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut metadata = self.load()?;
        f(&mut metadata);
        self.save(&metadata)?;
        Ok(metadata)
    }
}
