//! Append-only on-disk cache of per-region field series
//!
//! One JSON array per `(region, field)` at `{data_prefix}{region}{suffix}.json`.
//! A sync batch touches several files; it is committed through a journal so
//! that either every field grows or none does:
//!
//! 1. every touched series is written to `<file>.tmp` and synced
//! 2. the journal listing the touched fields is written atomically
//! 3. each `.tmp` is renamed over its target, then the journal is removed
//!
//! `load` finishes a commit whose journal survived a crash and discards
//! staged files that never got a journal.

mod metadata;

pub use metadata::{MetadataFile, ModelMetadata};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::{FieldKey, Region, RegionData};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk field series store
#[derive(Debug, Clone)]
pub struct PersistedStore {
    data_prefix: String,
    suffixes: BTreeMap<FieldKey, String>,
    regions: Vec<Region>,
}

impl PersistedStore {
    /// Create a store from the pipeline configuration
    pub fn new(cfg: &AppConfig) -> Self {
        let suffixes = FieldKey::ALL
            .into_iter()
            .map(|k| (k, cfg.suffix(k)))
            .collect();
        Self::with_layout(cfg.data_prefix.clone(), suffixes, cfg.regions())
    }

    /// Create a store with an explicit prefix and suffix table
    pub fn with_layout(
        data_prefix: impl Into<String>,
        suffixes: BTreeMap<FieldKey, String>,
        regions: Vec<Region>,
    ) -> Self {
        Self {
            data_prefix: data_prefix.into(),
            suffixes,
            regions,
        }
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Backing file of one field series
    pub fn field_path(&self, region: &Region, key: FieldKey) -> PathBuf {
        let suffix = self
            .suffixes
            .get(&key)
            .cloned()
            .unwrap_or_else(|| format!("_{}", key.as_str()));
        PathBuf::from(format!("{}{}{}.json", self.data_prefix, region.file_stem(), suffix))
    }

    fn journal_path(&self, region: &Region) -> PathBuf {
        PathBuf::from(format!("{}{}.journal", self.data_prefix, region.file_stem()))
    }

    /// True when the backing file of a field exists
    pub fn field_exists(&self, region: &Region, key: FieldKey) -> bool {
        self.field_path(region, key).is_file()
    }

    /// Read every known field series for a region; absent fields load empty
    pub fn load(&self, region: &Region) -> Result<RegionData> {
        self.recover(region)?;

        let data = RegionData {
            date: self.read_series(region, FieldKey::Date)?,
            ore_shown: self.read_series(region, FieldKey::OreShown)?,
            ore_hidden: self.read_series(region, FieldKey::OreHidden)?,
            feature: self.read_series(region, FieldKey::Feature)?,
            url: self.read_series(region, FieldKey::Url)?,
            y_label: self.read_series(region, FieldKey::YLabel)?,
            b_label: self.read_series(region, FieldKey::BLabel)?,
            label: self.read_series(region, FieldKey::Label)?,
        };

        debug!(
            region = %region,
            observations = data.observations(),
            "Loaded persisted series"
        );
        Ok(data)
    }

    /// Extend the region's series by every non-empty series in `batch`,
    /// committing all touched fields together. Returns the updated data.
    pub fn append(&self, region: &Region, batch: &RegionData) -> Result<RegionData> {
        let mut data = self.load(region)?;
        let touched = batch.populated_fields();
        if touched.is_empty() {
            return Ok(data);
        }

        data.extend_from(batch);

        for key in &touched {
            let staged = staged_path(&self.field_path(region, *key));
            match key {
                FieldKey::Date => write_json(&staged, &data.date)?,
                FieldKey::OreShown => write_json(&staged, &data.ore_shown)?,
                FieldKey::OreHidden => write_json(&staged, &data.ore_hidden)?,
                FieldKey::Feature => write_json(&staged, &data.feature)?,
                FieldKey::Url => write_json(&staged, &data.url)?,
                FieldKey::YLabel => write_json(&staged, &data.y_label)?,
                FieldKey::BLabel => write_json(&staged, &data.b_label)?,
                FieldKey::Label => write_json(&staged, &data.label)?,
            }
        }

        let journal = self.journal_path(region);
        write_atomic(&journal, &touched)?;
        self.commit(region, &touched)?;

        info!(
            region = %region,
            fields = touched.len(),
            observations = data.observations(),
            "Committed field batch"
        );
        Ok(data)
    }

    /// Delete the backing files of every region
    pub fn reset(&self) -> Result<()> {
        warn!("Resetting persisted data for all regions");
        for region in &self.regions {
            let mut paths: Vec<PathBuf> = FieldKey::ALL
                .into_iter()
                .flat_map(|k| {
                    let path = self.field_path(region, k);
                    [staged_path(&path), path]
                })
                .collect();
            paths.push(self.journal_path(region));

            for path in paths {
                match fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "Removed"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(Error::store(path, e)),
                }
            }
        }
        Ok(())
    }

    fn commit(&self, region: &Region, touched: &[FieldKey]) -> Result<()> {
        for key in touched {
            let target = self.field_path(region, *key);
            let staged = staged_path(&target);
            if staged.exists() {
                fs::rename(&staged, &target).map_err(|e| Error::store(&staged, e))?;
            }
        }

        let journal = self.journal_path(region);
        fs::remove_file(&journal).map_err(|e| Error::store(&journal, e))?;
        Ok(())
    }

    /// Finish or discard a commit interrupted by a crash
    fn recover(&self, region: &Region) -> Result<()> {
        let journal = self.journal_path(region);
        if journal.exists() {
            let touched: Vec<FieldKey> = read_json(&journal)?;
            warn!(region = %region, fields = touched.len(), "Completing interrupted commit");
            return self.commit(region, &touched);
        }

        for key in FieldKey::ALL {
            let staged = staged_path(&self.field_path(region, key));
            if staged.exists() {
                warn!(path = %staged.display(), "Discarding uncommitted staged series");
                fs::remove_file(&staged).map_err(|e| Error::store(&staged, e))?;
            }
        }
        Ok(())
    }

    fn read_series<T: DeserializeOwned>(&self, region: &Region, key: FieldKey) -> Result<Vec<T>> {
        let path = self.field_path(region, key);
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }
}

fn staged_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Serialize `value` to `path` and fsync it
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec(value).map_err(|e| Error::serde(path, e))?;
    write_bytes(path, &json)
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::store(parent, e))?;
        }
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::store(path, e))?;

    file.write_all(bytes).map_err(|e| Error::store(path, e))?;
    file.sync_all().map_err(|e| Error::store(path, e))?;
    Ok(())
}

/// Write through a temp file and rename over `path`
pub(crate) fn write_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec(value).map_err(|e| Error::serde(path, e))?;
    write_bytes_atomic(path, &json)
}

pub(crate) fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let temp_path = staged_path(path);
    write_bytes(&temp_path, bytes)?;
    fs::rename(&temp_path, path).map_err(|e| Error::store(path, e))?;
    Ok(())
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let mut file = File::open(path).map_err(|e| Error::store(path, e))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)
        .map_err(|e| Error::store(path, e))?;
    serde_json::from_slice(&data).map_err(|e| Error::serde(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store(dir: &TempDir) -> PersistedStore {
        let prefix = format!("{}/", dir.path().join("data").display());
        let suffixes = FieldKey::ALL
            .into_iter()
            .map(|k| (k, format!("_{}", k.as_str())))
            .collect();
        PersistedStore::with_layout(
            prefix,
            suffixes,
            vec![Region::new("Mondstadt", 0), Region::new("Liyue", 1)],
        )
    }

    fn batch(rows: usize, start_day: i32) -> RegionData {
        let mut data = RegionData::default();
        for i in 0..rows {
            data.date.push([2024, 3, start_day + i as i32]);
            data.ore_shown.push(vec![0, 4]);
            data.ore_hidden.push(vec![2]);
            data.y_label.push(1);
            data.b_label.push(3);
        }
        data
    }

    #[test]
    fn test_load_missing_region_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let data = store.load(&Region::new("Mondstadt", 0)).unwrap();
        assert_eq!(data, RegionData::default());
    }

    #[test]
    fn test_append_preserves_prior_contents() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let region = Region::new("Mondstadt", 0);

        store.append(&region, &batch(3, 1)).unwrap();
        let before = store.load(&region).unwrap();

        let after = store.append(&region, &batch(2, 10)).unwrap();
        assert_eq!(after.observations(), 5);
        assert_eq!(&after.date[..3], &before.date[..]);
        assert!(after.is_aligned(&FieldKey::TABULAR));

        let reloaded = store.load(&region).unwrap();
        assert_eq!(reloaded, after);
        assert!(!store.field_exists(&region, FieldKey::Feature));
        assert!(store.field_exists(&region, FieldKey::Date));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let region = Region::new("Mondstadt", 0);
        let data = store.append(&region, &RegionData::default()).unwrap();
        assert_eq!(data.observations(), 0);
        assert!(!store.field_exists(&region, FieldKey::Date));
    }

    #[test]
    fn test_interrupted_commit_rolls_forward() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let region = Region::new("Mondstadt", 0);
        store.append(&region, &batch(2, 1)).unwrap();

        // Simulate a crash after the journal was written and one rename done
        let touched = vec![FieldKey::Date, FieldKey::YLabel];
        let date_path = store.field_path(&region, FieldKey::Date);
        let label_path = store.field_path(&region, FieldKey::YLabel);
        write_json(&date_path, &vec![[2024, 3, 1], [2024, 3, 2], [2024, 3, 3]]).unwrap();
        write_json(&staged_path(&label_path), &vec![1, 1, 5]).unwrap();
        write_atomic(&store.journal_path(&region), &touched).unwrap();

        let data = store.load(&region).unwrap();
        assert_eq!(data.date.len(), 3);
        assert_eq!(data.y_label, vec![1, 1, 5]);
        assert!(!store.journal_path(&region).exists());
    }

    #[test]
    fn test_staged_files_without_journal_are_discarded() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let region = Region::new("Mondstadt", 0);
        store.append(&region, &batch(2, 1)).unwrap();

        let staged = staged_path(&store.field_path(&region, FieldKey::Date));
        write_json(&staged, &vec![[2024, 3, 1]; 5]).unwrap();

        let data = store.load(&region).unwrap();
        assert_eq!(data.date.len(), 2);
        assert!(!staged.exists());
    }

    #[test]
    fn test_reset_clears_every_region() {
        let dir = TempDir::new().unwrap();
        let store = test_store(&dir);
        let mondstadt = Region::new("Mondstadt", 0);
        let liyue = Region::new("Liyue", 1);
        store.append(&mondstadt, &batch(2, 1)).unwrap();
        store.append(&liyue, &batch(4, 1)).unwrap();

        store.reset().unwrap();

        assert_eq!(store.load(&mondstadt).unwrap().observations(), 0);
        assert_eq!(store.load(&liyue).unwrap().observations(), 0);
    }
}
