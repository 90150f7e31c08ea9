//! Trained model artifacts per (region, task)
//!
//! This module provides:
//! - Training-set construction from persisted field series
//! - The load-or-retrain decision for each (region, task) pair
//! - Checksummed artifact persistence and accuracy bookkeeping
//!
//! Artifacts are JSON files at `{model_prefix}{region}_{task}.json`. Their
//! SHA-256 and held-out accuracy live in the metadata record; an artifact
//! whose checksum no longer matches is retrained.

use crate::classifier::{
    dense, min_training_rows, train_test_split, EstimatorKind, FitParams, Matrix, MultiOutput,
};
use crate::config::AppConfig;
use crate::error::{DataMissingError, Error, Result};
use crate::models::{DateTriple, FieldKey, Region, RegionData, TaskKind, SENTINEL};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::store::{write_bytes_atomic, MetadataFile, PersistedStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Configuration for the model registry
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub model_prefix: String,
    pub split_seed: u64,
    pub test_fraction: f64,
    pub estimators: BTreeMap<TaskKind, EstimatorKind>,
    pub forest_trees: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            model_prefix: "models/".to_string(),
            split_seed: 42,
            test_fraction: 0.2,
            estimators: BTreeMap::new(),
            forest_trees: 100,
        }
    }
}

impl RegistryConfig {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            model_prefix: cfg.model_prefix.clone(),
            split_seed: cfg.split_seed,
            test_fraction: cfg.test_fraction,
            estimators: TaskKind::ALL
                .into_iter()
                .map(|t| (t, cfg.estimator(t)))
                .collect(),
            forest_trees: cfg.forest_trees,
        }
    }

    pub fn estimator(&self, task: TaskKind) -> EstimatorKind {
        self.estimators.get(&task).copied().unwrap_or(match task {
            TaskKind::Leyline => EstimatorKind::LogisticRegression,
            TaskKind::Location | TaskKind::Mining => EstimatorKind::RandomForest,
        })
    }
}

/// A fitted model for one (region, task) with its held-out scores
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub region: String,
    pub task: TaskKind,
    pub model: MultiOutput,
    /// Mean per-output held-out accuracy
    pub accuracy: f64,
    pub per_output: Vec<f64>,
    /// Number of input values a prediction row must carry
    pub input_width: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub trained_at: DateTime<Utc>,
}

impl ModelArtifact {
    /// Predict every target for one input row
    pub fn predict(&self, input: &[f64]) -> Result<Vec<i32>> {
        self.check_width(input)?;
        self.model.predict(input)
    }

    /// Estimator agreement for one input row; see `MultiOutput::agreement`
    pub fn agreement(&self, input: &[f64]) -> Option<f64> {
        if input.len() != self.input_width {
            return None;
        }
        self.model.agreement(input)
    }

    fn check_width(&self, input: &[f64]) -> Result<()> {
        if input.len() != self.input_width {
            return Err(Error::Model(format!(
                "{} {} model expects {} inputs, got {}",
                self.region,
                self.task,
                self.input_width,
                input.len()
            )));
        }
        Ok(())
    }
}

/// Assemble one input row for `task`
pub fn input_row(
    task: TaskKind,
    date: DateTriple,
    shown: &[i32],
    labels: [i32; 2],
    feature: &[f32],
) -> Vec<f64> {
    let as_f64 = |v: &i32| *v as f64;
    match task {
        TaskKind::Leyline => feature.iter().map(|v| *v as f64).collect(),
        TaskKind::Location => date.iter().chain(labels.iter()).map(as_f64).collect(),
        TaskKind::Mining => date
            .iter()
            .chain(shown)
            .chain(labels.iter())
            .map(as_f64)
            .collect(),
    }
}

/// Training matrix for one task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub x: Matrix,
    pub y: Vec<Vec<i32>>,
    /// Observation index behind each row of `x`
    pub rows: Vec<usize>,
    /// Observations left out: placeholders, legacy widths, missing features
    pub excluded: usize,
}

impl Dataset {
    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Most common length among `widths`
fn modal_width(widths: impl Iterator<Item = usize>) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for w in widths {
        *counts.entry(w).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(width, _)| width)
}

fn has_sentinel(values: &[i32]) -> bool {
    values.contains(&SENTINEL)
}

#[derive(Debug, Clone, Copy, Default)]
struct Widths {
    shown: Option<usize>,
    hidden: Option<usize>,
    feature: Option<usize>,
}

impl Widths {
    fn of(data: &RegionData) -> Self {
        let ore = |series: &[Vec<i32>]| {
            modal_width(
                series
                    .iter()
                    .filter(|v| !has_sentinel(v))
                    .map(Vec::len),
            )
        };
        Self {
            shown: ore(&data.ore_shown),
            hidden: ore(&data.ore_hidden),
            feature: modal_width(data.feature.iter().filter(|v| !v.is_empty()).map(Vec::len)),
        }
    }
}

fn ore_at<'a>(series: &'a [Vec<i32>], i: usize, width: Option<usize>) -> Option<&'a [i32]> {
    let ores = series.get(i)?;
    (!has_sentinel(ores) && Some(ores.len()) == width).then_some(ores.as_slice())
}

fn training_row(
    task: TaskKind,
    data: &RegionData,
    i: usize,
    widths: Widths,
) -> Option<(Vec<f64>, Vec<i32>)> {
    let labels = data.label_pair(i)?;
    if has_sentinel(&labels) {
        return None;
    }

    if task == TaskKind::Leyline {
        let feature = data.feature_of(i)?;
        if feature.is_empty() || Some(feature.len()) != widths.feature {
            return None;
        }
        let x = input_row(task, [0; 3], &[], labels, feature);
        return Some((x, labels.to_vec()));
    }

    let date = *data.date.get(i)?;
    if has_sentinel(&date) {
        return None;
    }
    let shown = ore_at(&data.ore_shown, i, widths.shown)?;
    match task {
        TaskKind::Location => Some((input_row(task, date, &[], labels, &[]), shown.to_vec())),
        _ => {
            let hidden = ore_at(&data.ore_hidden, i, widths.hidden)?;
            Some((input_row(task, date, shown, labels, &[]), hidden.to_vec()))
        }
    }
}

/// Build the training set for `task`, leaving out observations that carry
/// placeholders or a width other than the region's modal width
pub fn build_dataset(task: TaskKind, data: &RegionData) -> Dataset {
    let widths = Widths::of(data);
    let observations = match task {
        TaskKind::Leyline => data.date.len().max(data.feature.len()),
        TaskKind::Location | TaskKind::Mining => data.date.len(),
    };

    let mut dataset = Dataset::default();
    for i in 0..observations {
        match training_row(task, data, i, widths) {
            Some((x, y)) => {
                dataset.x.push(x);
                dataset.y.push(y);
                dataset.rows.push(i);
            }
            None => dataset.excluded += 1,
        }
    }
    dataset
}

/// Compute SHA256 checksum of data
fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Owns the trained artifacts for every (region, task)
pub struct ModelRegistry {
    store: Arc<PersistedStore>,
    metadata: Arc<MetadataFile>,
    config: RegistryConfig,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl ModelRegistry {
    pub fn new(
        store: Arc<PersistedStore>,
        metadata: Arc<MetadataFile>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            metadata,
            config,
            logger: StructuredLogger::new("registry"),
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn artifact_path(&self, region: &Region, task: TaskKind) -> PathBuf {
        PathBuf::from(format!(
            "{}{}_{}.json",
            self.config.model_prefix,
            region.file_stem(),
            task.as_str()
        ))
    }

    /// Reuse the persisted artifact unless `force_retrain` is set or it is
    /// absent or corrupt; otherwise fit a new one. The flag in the result is
    /// true when a fit happened.
    pub async fn get_or_train(
        &self,
        region: &Region,
        task: TaskKind,
        force_retrain: bool,
    ) -> Result<(ModelArtifact, bool)> {
        if !force_retrain {
            if let Some(artifact) = self.load_cached(region, task)? {
                self.logger.log_model_loaded(region, task, artifact.accuracy);
                self.metrics
                    .record_model(&region.name, task, artifact.accuracy, false);
                return Ok((artifact, false));
            }
        }

        let artifact = self.train(region, task).await?;
        Ok((artifact, true))
    }

    /// Read the persisted artifact if it exists and matches its checksum
    fn load_cached(&self, region: &Region, task: TaskKind) -> Result<Option<ModelArtifact>> {
        let path = self.artifact_path(region, task);
        if !path.is_file() {
            debug!(region = %region, task = %task, "No persisted model");
            return Ok(None);
        }

        let bytes = std::fs::read(&path).map_err(|e| Error::store(&path, e))?;
        let metadata = self.metadata.load()?;
        let checksum = compute_checksum(&bytes);
        if metadata.checksum_of(&region.name, task) != Some(checksum.as_str()) {
            warn!(
                region = %region,
                task = %task,
                path = %path.display(),
                "Model checksum does not match the recorded one, retraining"
            );
            return Ok(None);
        }

        let mut artifact: ModelArtifact = match serde_json::from_slice(&bytes) {
            Ok(artifact) => artifact,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable model, retraining");
                return Ok(None);
            }
        };
        if let Some(accuracy) = metadata.accuracy_of(&region.name, task) {
            artifact.accuracy = accuracy;
        }
        Ok(Some(artifact))
    }

    /// Fail with `DataMissingError` when a field the task reads was never
    /// persisted. Label fields may come from the legacy combined pair.
    fn check_required(&self, region: &Region, task: TaskKind) -> Result<()> {
        for &field in task.required_fields() {
            if self.store.field_exists(region, field) {
                continue;
            }
            let legacy_label = matches!(field, FieldKey::YLabel | FieldKey::BLabel)
                && self.store.field_exists(region, FieldKey::Label);
            if !legacy_label {
                return Err(DataMissingError {
                    region: region.name.clone(),
                    field,
                }
                .into());
            }
        }
        Ok(())
    }

    async fn train(&self, region: &Region, task: TaskKind) -> Result<ModelArtifact> {
        self.check_required(region, task)?;
        let data = self.store.load(region)?;
        let dataset = build_dataset(task, &data);

        if dataset.excluded > 0 {
            info!(
                region = %region,
                task = %task,
                excluded = dataset.excluded,
                "Left placeholder and legacy observations out of training"
            );
        }
        let needed = min_training_rows(self.config.test_fraction);
        if dataset.len() < needed {
            return Err(Error::InsufficientData {
                region: region.name.clone(),
                task,
                usable: dataset.len(),
                needed,
            });
        }

        let split = train_test_split(
            &dense(&dataset.x)?,
            self.config.test_fraction,
            self.config.split_seed,
        )?;
        let pick = |idx: &[usize]| -> (Matrix, Vec<Vec<i32>>) {
            idx.iter()
                .map(|&i| (dataset.x[i].clone(), dataset.y[i].clone()))
                .unzip()
        };
        let (x_train, y_train) = pick(&split.train);
        let (x_test, y_test) = pick(&split.test);
        let input_width = x_train[0].len();

        info!(
            region = %region,
            task = %task,
            train_rows = x_train.len(),
            test_rows = x_test.len(),
            "Training model"
        );

        let kind = self.config.estimator(task);
        let params = FitParams {
            seed: self.config.split_seed,
            forest_trees: self.config.forest_trees,
        };
        let start = Instant::now();
        let (model, per_output, train_rows) = tokio::task::spawn_blocking(move || -> Result<_> {
            let model = MultiOutput::fit(kind, &x_train, &y_train, params)?;
            let per_output = model.per_output_accuracy(&x_test, &y_test)?;
            Ok((model, per_output, x_train.len()))
        })
        .await??;
        self.metrics.observe_fit(start.elapsed().as_secs_f64());

        let accuracy = if per_output.is_empty() {
            0.0
        } else {
            per_output.iter().sum::<f64>() / per_output.len() as f64
        };

        let artifact = ModelArtifact {
            region: region.name.clone(),
            task,
            model,
            accuracy,
            per_output,
            input_width,
            train_rows,
            test_rows: split.test.len(),
            trained_at: Utc::now(),
        };
        self.save(region, &artifact)?;

        self.logger
            .log_model_trained(region, task, accuracy, train_rows, artifact.test_rows);
        self.metrics.record_model(&region.name, task, accuracy, true);
        Ok(artifact)
    }

    /// Persist the artifact atomically and record its checksum and accuracy
    fn save(&self, region: &Region, artifact: &ModelArtifact) -> Result<()> {
        let path = self.artifact_path(region, artifact.task);
        let bytes = serde_json::to_vec(artifact).map_err(|e| Error::serde(&path, e))?;
        let checksum = compute_checksum(&bytes);
        write_bytes_atomic(&path, &bytes)?;

        self.metadata.update(|m| {
            m.accuracy
                .entry(region.name.clone())
                .or_default()
                .insert(artifact.task, artifact.accuracy);
            m.checksums
                .entry(region.name.clone())
                .or_default()
                .insert(artifact.task, checksum.clone());
        })?;

        debug!(
            path = %path.display(),
            checksum = %checksum,
            "Model saved"
        );
        Ok(())
    }
}
