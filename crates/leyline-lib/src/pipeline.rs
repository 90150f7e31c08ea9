//! Top-level driver: refresh, train, predict and write back
//!
//! Region-level work goes through one shared `FanOut`, so batches launched
//! one after another (a refresh, then training, then an autofill) apply in
//! that order while the regions of one batch run side by side.

use crate::config::{AppConfig, RemoteTarget};
use crate::error::{Error, Result};
use crate::fanout::FanOut;
use crate::features::{FeatureSource, HogDescriptor, ImageFeatures, ImageFetcher};
use crate::models::{format_positions, FieldKey, Region, TaskKind, SENTINEL};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::registry::{input_row, ModelArtifact, ModelRegistry, RegistryConfig};
use crate::remote::{HttpWorkbook, MemoryWorkbook, RemoteSource, SheetSourceBuilder};
use crate::review::{rank, ReviewEntry};
use crate::store::{MetadataFile, PersistedStore};
use crate::sync::{SyncConfig, SyncEngine};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-run overrides from the command line
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Refresh data even when it is not stale
    pub force_update: bool,
    /// Retrain every model
    pub force_retrain: bool,
    /// Delete persisted data before refreshing
    pub reset: bool,
}

/// Outcome of a data refresh
#[derive(Debug, Clone, Default)]
pub struct RefreshReport {
    /// Regions whose series grew
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
}

/// Accuracy and provenance of a model made current
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSummary {
    pub accuracy: f64,
    pub retrained: bool,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Result of bringing one (region, task) model up
#[derive(Debug)]
pub struct TrainOutcome {
    pub region: Region,
    pub task: TaskKind,
    pub result: Result<ModelSummary>,
}

/// Today's predictions for one region
#[derive(Debug, Clone, PartialEq)]
pub struct TodayPrediction {
    pub region: Region,
    /// Leyline pair used as input; classified from the image when the
    /// combined sheet had none
    pub leyline: [i32; 2],
    pub leyline_classified: bool,
    pub hidden: Vec<i32>,
    /// Cells written to the combined sheet
    pub cells_written: usize,
}

/// The assembled synchronisation and model pipeline
pub struct Pipeline {
    config: AppConfig,
    store: Arc<PersistedStore>,
    metadata: Arc<MetadataFile>,
    remote: Arc<dyn RemoteSource>,
    features: Arc<dyn FeatureSource>,
    sync: Arc<SyncEngine>,
    registry: Arc<ModelRegistry>,
    fanout: FanOut,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl Pipeline {
    /// Wire the pipeline from explicit collaborators
    pub fn new(
        config: AppConfig,
        remote: Arc<dyn RemoteSource>,
        features: Arc<dyn FeatureSource>,
        fanout: FanOut,
    ) -> Self {
        let store = Arc::new(PersistedStore::new(&config));
        let metadata = Arc::new(MetadataFile::new(&config.model_prefix));
        let sync = Arc::new(SyncEngine::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&features),
            Arc::clone(&metadata),
            SyncConfig {
                fetch_concurrency: config.fetch_concurrency,
            },
        ));
        let registry = Arc::new(ModelRegistry::new(
            Arc::clone(&store),
            Arc::clone(&metadata),
            RegistryConfig::from_config(&config),
        ));

        Self {
            config,
            store,
            metadata,
            remote,
            features,
            sync,
            registry,
            fanout,
            logger: StructuredLogger::new("pipeline"),
            metrics: PipelineMetrics::new(),
        }
    }

    /// Build the remote backend and image pipeline named by the configuration
    pub fn from_config(config: AppConfig, sequential: bool) -> Result<Self> {
        config.validate()?;

        let builder = SheetSourceBuilder::new()
            .retry_delay(config.retry_delay())
            .label_end_offset(config.label_end_offset);
        let remote: Arc<dyn RemoteSource> = match config.remote_target()? {
            RemoteTarget::Snapshot(path) => {
                Arc::new(builder.build(MemoryWorkbook::from_snapshot(&path)?))
            }
            RemoteTarget::Spreadsheet(id) => Arc::new(builder.build(HttpWorkbook::new(
                &config.sheets_endpoint,
                &id,
                &config.credentials,
            )?)),
        };

        let features: Arc<dyn FeatureSource> = Arc::new(ImageFeatures::new(
            ImageFetcher::new(&config.user_agent)?,
            HogDescriptor::default(),
        ));

        let fanout = if sequential {
            FanOut::sequential(config.region_cooldown())
        } else {
            FanOut::parallel()
        };

        Ok(Self::new(config, remote, features, fanout))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &PersistedStore {
        &self.store
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn region(&self, name: &str) -> Result<Region> {
        self.config
            .region(name)
            .ok_or_else(|| Error::UnknownRegion(name.to_string()))
    }

    /// True when persisted data must be refreshed before use
    pub fn needs_refresh(&self, options: RunOptions) -> Result<bool> {
        if self.config.force_data_reset || options.force_update || options.reset {
            return Ok(true);
        }
        let metadata = self.metadata.load()?;
        Ok(metadata.is_stale(Utc::now(), self.config.min_data_days))
    }

    /// Synchronise every region, optionally from an empty store. The sync
    /// timestamp is touched afterwards even when nothing changed.
    pub async fn refresh(&self, reset: bool) -> Result<RefreshReport> {
        if reset || self.config.force_data_reset {
            self.store.reset()?;
            self.sync.mark_stale();
        }

        let sync = Arc::clone(&self.sync);
        let results = self
            .fanout
            .run(self.config.regions(), move |region: Region| {
                let sync = Arc::clone(&sync);
                async move {
                    let changed = sync.sync(&region).await;
                    (region, changed)
                }
            })
            .await?;

        let mut report = RefreshReport::default();
        let mut first_error = None;
        for (region, result) in results {
            match result {
                Ok(true) => report.changed.push(region.name),
                Ok(false) => report.unchanged.push(region.name),
                Err(e) => {
                    warn!(region = %region, error = %e, "Region refresh failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        self.metadata.update(|m| m.last_sync = Some(Utc::now()))?;
        info!(
            changed = report.changed.len(),
            unchanged = report.unchanged.len(),
            "Data refresh complete"
        );
        Ok(report)
    }

    /// Tasks a region can be trained for: the leyline task needs images
    fn tasks_for(&self, region: &Region) -> Vec<TaskKind> {
        TaskKind::ALL
            .into_iter()
            .filter(|task| {
                *task != TaskKind::Leyline || self.store.field_exists(region, FieldKey::Feature)
            })
            .collect()
    }

    /// Load or retrain every (region, task) model. Failures are reported
    /// per pair and never stop sibling regions or tasks.
    pub async fn train_all(&self, force: bool) -> Result<Vec<TrainOutcome>> {
        let units: Vec<(Region, Vec<TaskKind>)> = self
            .config
            .regions()
            .into_iter()
            .map(|r| {
                let tasks = self.tasks_for(&r);
                (r, tasks)
            })
            .collect();

        let registry = Arc::clone(&self.registry);
        let per_region = self
            .fanout
            .run(units, move |(region, tasks): (Region, Vec<TaskKind>)| {
                let registry = Arc::clone(&registry);
                async move {
                    let mut outcomes = Vec::with_capacity(tasks.len());
                    for task in tasks {
                        let result = registry
                            .get_or_train(&region, task, force)
                            .await
                            .map(|(artifact, retrained)| ModelSummary {
                                accuracy: artifact.accuracy,
                                retrained,
                                train_rows: artifact.train_rows,
                                test_rows: artifact.test_rows,
                            });
                        if let Err(e) = &result {
                            warn!(region = %region, task = %task, error = %e, "Model unavailable");
                        }
                        outcomes.push(TrainOutcome {
                            region: region.clone(),
                            task,
                            result,
                        });
                    }
                    outcomes
                }
            })
            .await?;

        Ok(per_region.into_iter().flatten().collect())
    }

    /// Refresh when stale or forced, then make every model current
    pub async fn run(&self, options: RunOptions) -> Result<Vec<TrainOutcome>> {
        let refresh = self.needs_refresh(options)?;
        self.logger.log_pipeline_started(
            env!("CARGO_PKG_VERSION"),
            self.config.regions.len(),
            refresh,
        );

        if refresh {
            self.refresh(options.reset).await?;
        } else {
            debug!("Persisted data is fresh");
        }

        let force = refresh || options.force_retrain || self.config.force_model_reset;
        self.train_all(force).await
    }

    /// Predict leyline positions for an image
    pub async fn classify(&self, region: &Region, url: &str) -> Result<[i32; 2]> {
        let (artifact, _) = self.registry.get_or_train(region, TaskKind::Leyline, false).await?;
        classify_with(&artifact, self.features.as_ref(), url).await
    }

    /// Predict today's hidden ores for one region, classifying the leyline
    /// pair from today's image when the sheet has none. With `write`, the
    /// predictions are written to the combined sheet.
    pub async fn mine(&self, region: &Region, write: bool) -> Result<TodayPrediction> {
        let prediction = predict_today(
            Arc::clone(&self.registry),
            Arc::clone(&self.remote),
            Arc::clone(&self.features),
            region.clone(),
            write,
        )
        .await?;

        if write {
            self.remote.flush().await;
        }
        Ok(prediction)
    }

    /// Predict and write today's values for every region
    pub async fn autofill(&self) -> Result<Vec<Result<TodayPrediction>>> {
        let registry = Arc::clone(&self.registry);
        let remote = Arc::clone(&self.remote);
        let features = Arc::clone(&self.features);

        let results = self
            .fanout
            .run(self.config.regions(), move |region: Region| {
                predict_today(
                    Arc::clone(&registry),
                    Arc::clone(&remote),
                    Arc::clone(&features),
                    region,
                    true,
                )
            })
            .await?;

        self.remote.flush().await;
        Ok(results)
    }

    /// Rank a region's observations by the agreement of its `task` model
    pub async fn review(&self, region: &Region, task: TaskKind) -> Result<Vec<ReviewEntry>> {
        let (artifact, _) = self.registry.get_or_train(region, task, false).await?;
        let data = self.store.load(region)?;
        rank(task, &data, &artifact)
    }

    /// Prometheus text exposition of this process's metrics
    pub fn metrics_text(&self) -> String {
        self.metrics.render()
    }
}

async fn classify_with(
    artifact: &ModelArtifact,
    features: &dyn FeatureSource,
    url: &str,
) -> Result<[i32; 2]> {
    let vector = features.features(url).await?;
    let row = input_row(TaskKind::Leyline, [0; 3], &[], [SENTINEL; 2], &vector);
    match artifact.predict(&row)?.as_slice() {
        [y, b] => Ok([*y, *b]),
        other => Err(Error::Model(format!(
            "leyline model returned {} outputs",
            other.len()
        ))),
    }
}

async fn predict_today(
    registry: Arc<ModelRegistry>,
    remote: Arc<dyn RemoteSource>,
    features: Arc<dyn FeatureSource>,
    region: Region,
    write: bool,
) -> Result<TodayPrediction> {
    let today = remote.read_today(&region).await?;
    let logger = StructuredLogger::new("predict");
    let metrics = PipelineMetrics::new();
    let mut cells_written = 0;

    let mut leyline = today.leyline;
    let mut leyline_classified = false;
    if leyline.contains(&SENTINEL) {
        let Some(url) = today.url.as_deref() else {
            return Err(Error::Model(format!(
                "today's leyline positions for {} are not filled in and there is no image",
                region
            )));
        };
        let (artifact, _) = registry.get_or_train(&region, TaskKind::Leyline, false).await?;
        leyline = classify_with(&artifact, features.as_ref(), url).await?;
        leyline_classified = true;

        if write {
            remote.write_leyline(&region, leyline).await?;
            cells_written += 2;
            metrics.add_predictions_written(2);
            logger.log_prediction_written(&region, TaskKind::Leyline, &format_positions(&leyline), 2);
        }
    }

    if today.ore_shown.contains(&SENTINEL) {
        return Err(Error::Model(format!(
            "today's shown ores for {} are not filled in",
            region
        )));
    }

    let (artifact, _) = registry.get_or_train(&region, TaskKind::Mining, false).await?;
    let row = input_row(TaskKind::Mining, today.date, &today.ore_shown, leyline, &[]);
    let hidden = artifact.predict(&row)?;

    if write {
        let written = remote.write_hidden_ores(&region, &hidden).await?;
        cells_written += written;
        metrics.add_predictions_written(written);
        logger.log_prediction_written(&region, TaskKind::Mining, &format_positions(&hidden), written);
    }

    Ok(TodayPrediction {
        region,
        leyline,
        leyline_classified,
        hidden,
        cells_written,
    })
}
