//! Pipeline configuration
//!
//! Loaded from a JSON file layered with `LEYLINE_*` environment overrides and
//! passed explicitly to each component's constructor.

use crate::classifier::EstimatorKind;
use crate::error::ConfigError;
use crate::store::write_bytes_atomic;
use crate::models::{FieldKey, Region, TaskKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "LEYLINE";

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Ordered region names; the ordinal is the position in this list
    pub regions: Vec<String>,

    /// Path prefix for persisted field series
    #[serde(default = "default_data_prefix")]
    pub data_prefix: String,

    /// Path prefix for model artifacts and the metadata record
    #[serde(default = "default_model_prefix")]
    pub model_prefix: String,

    /// File suffix per field key
    #[serde(default = "default_suffixes")]
    pub suffixes: BTreeMap<FieldKey, String>,

    /// Days after which persisted data is considered stale
    #[serde(default = "default_min_data_days")]
    pub min_data_days: i64,

    /// Spreadsheet id, or path to a JSON workbook snapshot
    pub sheet: String,

    /// Credential file holding a bearer token for the spreadsheet service
    #[serde(default = "default_credentials")]
    pub credentials: PathBuf,

    /// Base URL of the spreadsheet values API
    #[serde(default = "default_sheets_endpoint")]
    pub sheets_endpoint: String,

    #[serde(default)]
    pub force_data_reset: bool,

    #[serde(default)]
    pub force_model_reset: bool,

    /// Columns between the label block end and the `"Options:"` header
    #[serde(default = "default_label_end_offset")]
    pub label_end_offset: usize,

    /// Fixed delay between retries of a failed remote call
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Maximum concurrent image fetches during a sync
    #[serde(default = "default_fetch_concurrency")]
    pub fetch_concurrency: usize,

    /// Pause after each region's remote reads
    #[serde(default)]
    pub region_cooldown_secs: u64,

    /// User-agent sent with image requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Seed for train/test splits and ensemble sampling
    #[serde(default = "default_split_seed")]
    pub split_seed: u64,

    /// Held-out share of observations used for scoring
    #[serde(default = "default_test_fraction")]
    pub test_fraction: f64,

    /// Estimator family per task
    #[serde(default = "default_estimators")]
    pub estimators: BTreeMap<TaskKind, EstimatorKind>,

    /// Trees per random forest
    #[serde(default = "default_forest_trees")]
    pub forest_trees: usize,
}

fn default_data_prefix() -> String {
    "data/".to_string()
}

fn default_model_prefix() -> String {
    "models/".to_string()
}

fn default_suffixes() -> BTreeMap<FieldKey, String> {
    [
        (FieldKey::Date, "_date"),
        (FieldKey::OreShown, "_ore1"),
        (FieldKey::OreHidden, "_ore2"),
        (FieldKey::Feature, "_feature"),
        (FieldKey::Url, "_url"),
        (FieldKey::YLabel, "_ylabel"),
        (FieldKey::BLabel, "_blabel"),
        (FieldKey::Label, "_label"),
    ]
    .into_iter()
    .map(|(k, v)| (k, v.to_string()))
    .collect()
}

fn default_min_data_days() -> i64 {
    1
}

fn default_credentials() -> PathBuf {
    PathBuf::from("key.json")
}

fn default_sheets_endpoint() -> String {
    "https://sheets.googleapis.com".to_string()
}

fn default_label_end_offset() -> usize {
    3
}

fn default_retry_delay_secs() -> u64 {
    60
}

fn default_fetch_concurrency() -> usize {
    100
}

fn default_user_agent() -> String {
    "machasins".to_string()
}

fn default_split_seed() -> u64 {
    42
}

fn default_test_fraction() -> f64 {
    0.2
}

fn default_estimators() -> BTreeMap<TaskKind, EstimatorKind> {
    [
        (TaskKind::Leyline, EstimatorKind::LogisticRegression),
        (TaskKind::Location, EstimatorKind::RandomForest),
        (TaskKind::Mining, EstimatorKind::RandomForest),
    ]
    .into_iter()
    .collect()
}

fn default_forest_trees() -> usize {
    100
}

/// Where the remote workbook lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTarget {
    /// Local JSON snapshot of a workbook
    Snapshot(PathBuf),
    /// Spreadsheet id on the values API
    Spreadsheet(String),
}

impl AppConfig {
    /// Load configuration from `path` and `LEYLINE_*` environment overrides
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Json))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let cfg: AppConfig = settings.try_deserialize()?;
        Ok(cfg)
    }

    /// Reject configurations that cannot run
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.is_empty() {
            return Err(ConfigError::Invalid("no regions configured".into()));
        }

        let mut seen = HashSet::new();
        for name in &self.regions {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("empty region name".into()));
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(ConfigError::Invalid(format!("duplicate region {:?}", name)));
            }
        }

        if self.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid("fetch_concurrency must be at least 1".into()));
        }

        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(ConfigError::Invalid(format!(
                "test_fraction must be in (0, 1), got {}",
                self.test_fraction
            )));
        }

        if self.forest_trees == 0 {
            return Err(ConfigError::Invalid("forest_trees must be at least 1".into()));
        }

        for key in FieldKey::TABULAR.iter().chain(FieldKey::IMAGE.iter()) {
            if !self.suffixes.contains_key(key) {
                return Err(ConfigError::Invalid(format!("missing suffix for field {}", key)));
            }
        }

        match self.remote_target()? {
            RemoteTarget::Snapshot(path) => {
                if !path.is_file() {
                    return Err(ConfigError::MissingSnapshot(path));
                }
            }
            RemoteTarget::Spreadsheet(_) => {
                if !self.credentials.is_file() {
                    return Err(ConfigError::MissingCredentials(self.credentials.clone()));
                }
            }
        }

        Ok(())
    }

    /// Classify the `sheet` identifier
    pub fn remote_target(&self) -> Result<RemoteTarget, ConfigError> {
        let sheet = self.sheet.trim();
        if sheet.ends_with(".json") || Path::new(sheet).is_file() {
            return Ok(RemoteTarget::Snapshot(PathBuf::from(sheet)));
        }

        let valid_id = sheet.len() >= 10
            && sheet
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid_id {
            Ok(RemoteTarget::Spreadsheet(sheet.to_string()))
        } else {
            Err(ConfigError::InvalidRemote(self.sheet.clone()))
        }
    }

    /// Regions in configured order
    pub fn regions(&self) -> Vec<Region> {
        self.regions
            .iter()
            .enumerate()
            .map(|(i, name)| Region::new(name.clone(), i))
            .collect()
    }

    /// Look up a region by case-insensitive name
    pub fn region(&self, name: &str) -> Option<Region> {
        self.regions()
            .into_iter()
            .find(|r| r.name.eq_ignore_ascii_case(name))
    }

    pub fn suffix(&self, key: FieldKey) -> String {
        self.suffixes
            .get(&key)
            .cloned()
            .unwrap_or_else(|| format!("_{}", key.as_str()))
    }

    pub fn estimator(&self, task: TaskKind) -> EstimatorKind {
        self.estimators
            .get(&task)
            .copied()
            .unwrap_or_else(|| default_estimators()[&task])
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn region_cooldown(&self) -> Duration {
        Duration::from_secs(self.region_cooldown_secs)
    }

    /// Rewrite a one-shot boolean flag in the config file, preserving other keys
    pub fn clear_flag(path: &Path, key: &str) -> Result<(), ConfigError> {
        let read = |e: std::io::Error| ConfigError::Invalid(format!("{}: {}", path.display(), e));
        let content = std::fs::read_to_string(path).map_err(read)?;
        let mut value: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?;

        if let Some(obj) = value.as_object_mut() {
            obj.insert(key.to_string(), serde_json::Value::Bool(false));
        }

        let out = serde_json::to_vec_pretty(&value)
            .map_err(|e| ConfigError::Invalid(format!("{}: {}", path.display(), e)))?;
        write_bytes_atomic(path, &out).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}
