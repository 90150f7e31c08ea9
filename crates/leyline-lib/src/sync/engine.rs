//! Incremental synchronisation of one region

use crate::error::{ParseError, Result};
use crate::fanout::bounded_map;
use crate::features::FeatureSource;
use crate::models::{Region, RegionData, SENTINEL, SENTINEL_DATE};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::parse;
use crate::remote::{RawBatch, RemoteSource, FIRST_DATA_ROW};
use crate::store::{MetadataFile, PersistedStore};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Per-region synchronisation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Syncing,
    Synced,
}

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Concurrent image fetches per batch
    pub fetch_concurrency: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch_concurrency: 100,
        }
    }
}

/// Parsed rows ready to append, plus what was rejected
#[derive(Debug, Default)]
pub struct ParsedBatch {
    pub data: RegionData,
    pub errors: Vec<ParseError>,
}

/// Reconciles the persisted store with the remote source
pub struct SyncEngine {
    store: Arc<PersistedStore>,
    remote: Arc<dyn RemoteSource>,
    features: Arc<dyn FeatureSource>,
    metadata: Arc<MetadataFile>,
    config: SyncConfig,
    states: Mutex<HashMap<String, SyncState>>,
    logger: StructuredLogger,
    metrics: PipelineMetrics,
}

impl SyncEngine {
    pub fn new(
        store: Arc<PersistedStore>,
        remote: Arc<dyn RemoteSource>,
        features: Arc<dyn FeatureSource>,
        metadata: Arc<MetadataFile>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            features,
            metadata,
            config,
            states: Mutex::new(HashMap::new()),
            logger: StructuredLogger::new("sync"),
            metrics: PipelineMetrics::new(),
        }
    }

    pub fn store(&self) -> &PersistedStore {
        &self.store
    }

    pub fn state(&self, region: &Region) -> SyncState {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states
            .get(&region.name)
            .copied()
            .unwrap_or(SyncState::Unsynced)
    }

    fn set_state(&self, region: &Region, state: SyncState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(region.name.clone(), state);
    }

    /// Force every region back through a sync on its next call
    pub fn mark_stale(&self) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.clear();
    }

    /// Bring one region up to date. Returns true when rows were appended.
    pub async fn sync(&self, region: &Region) -> Result<bool> {
        let previous = self.state(region);
        self.set_state(region, SyncState::Syncing);

        let start = Instant::now();
        let result = self.sync_inner(region).await;
        self.metrics.observe_sync(start.elapsed().as_secs_f64());

        match &result {
            Ok(_) => self.set_state(region, SyncState::Synced),
            Err(e) => {
                warn!(region = %region, error = %e, "Sync failed");
                let restored = if previous == SyncState::Synced {
                    SyncState::Synced
                } else {
                    SyncState::Unsynced
                };
                self.set_state(region, restored);
            }
        }
        result
    }

    async fn sync_inner(&self, region: &Region) -> Result<bool> {
        let existing = self.store.load(region)?;
        let current = existing.observations();
        let available = self.remote.count_available(region).await?;

        if available <= current {
            if available < current {
                warn!(
                    region = %region,
                    persisted = current,
                    available = available,
                    "Remote holds fewer rows than persisted, treating as no new rows"
                );
            } else {
                info!(region = %region, observations = current, "Looks done already");
            }
            return Ok(false);
        }

        info!(region = %region, from = current, to = available, "Starting data retrieval");
        let batch = self.remote.read_new_rows(region, current).await?;
        if batch.is_empty() {
            return Ok(false);
        }

        let mut parsed = parse_batch(&batch);
        let skipped = parsed.errors.len();
        for error in &parsed.errors {
            debug!(region = %region, error = %error, "Row kept as placeholder");
        }
        self.logger
            .log_rows_skipped(region, skipped, "malformed date, ore or label cells");

        if batch.layout.is_image_based() {
            let failed = self.attach_features(region, &mut parsed.data).await?;
            self.logger
                .log_rows_skipped(region, failed, "image missing or feature extraction failed");
        }

        let padded = align_image_series(&existing, &mut parsed.data);
        if padded > 0 {
            info!(
                region = %region,
                padded = padded,
                "Filled image placeholders so url and feature follow the date series"
            );
        }

        let appended = parsed.data.observations();
        let data = self.store.append(region, &parsed.data)?;

        self.metadata.update(|m| m.last_sync = Some(Utc::now()))?;
        self.metrics.add_rows(appended, skipped);
        self.logger
            .log_sync_completed(region, appended, data.observations());
        Ok(true)
    }

    /// Resolve every new row's URL to a feature vector, keeping row order.
    /// Rows whose image cannot be processed get an empty vector. Returns the
    /// number of such rows.
    async fn attach_features(&self, region: &Region, data: &mut RegionData) -> Result<usize> {
        let features = Arc::clone(&self.features);
        let metrics = self.metrics.clone();
        let region_name = region.name.clone();

        let vectors = bounded_map(
            data.url.clone(),
            self.config.fetch_concurrency,
            move |url: String| {
                let features = Arc::clone(&features);
                let metrics = metrics.clone();
                let region_name = region_name.clone();
                async move {
                    if url.trim().is_empty() {
                        return Vec::new();
                    }
                    let start = Instant::now();
                    let result = features.features(&url).await;
                    metrics.observe_fetch(start.elapsed().as_secs_f64());
                    match result {
                        Ok(vector) => vector,
                        Err(e) => {
                            warn!(region = %region_name, url = %url, error = %e, "Feature extraction failed");
                            Vec::new()
                        }
                    }
                }
            },
        )
        .await?;

        let failed = vectors.iter().filter(|v| v.is_empty()).count();
        data.feature = vectors;
        Ok(failed)
    }
}

/// Pad the batch's url and feature series with placeholders (empty URL,
/// empty vector) so that, once appended, each covers every observation.
/// Series that were never populated stay empty. Returns the number of
/// placeholders added.
pub fn align_image_series(existing: &RegionData, batch: &mut RegionData) -> usize {
    let history = existing.observations();
    let rows = batch.observations();
    pad_series(&mut batch.url, existing.url.len(), history, rows)
        + pad_series(&mut batch.feature, existing.feature.len(), history, rows)
}

fn pad_series<T: Clone + Default>(
    series: &mut Vec<T>,
    persisted: usize,
    history: usize,
    rows: usize,
) -> usize {
    if persisted == 0 && series.is_empty() {
        return 0;
    }
    let gap = history.saturating_sub(persisted);
    let mut padded = vec![T::default(); gap];
    padded.append(series);
    *series = padded;
    let short = (gap + rows).saturating_sub(series.len());
    series.resize(series.len() + short, T::default());
    gap + short
}

/// Parse raw rows into field series. Malformed cells become sentinels so
/// that every row still yields exactly one observation.
pub fn parse_batch(batch: &RawBatch) -> ParsedBatch {
    let mut parsed = ParsedBatch::default();
    let image_based = batch.layout.is_image_based();

    for row in &batch.rows {
        let sheet_row = FIRST_DATA_ROW + row.index;
        let mut malformed = None;

        let date = parse::parse_date(sheet_row, &row.date).unwrap_or_else(|e| {
            malformed.get_or_insert(e);
            SENTINEL_DATE
        });

        let (shown, hidden) = parse::parse_ores(sheet_row, &row.ore_cells).unwrap_or_else(|e| {
            malformed.get_or_insert(e);
            (vec![SENTINEL], vec![SENTINEL])
        });

        let [y, b] = parse::parse_label_pair(sheet_row, &row.label_cells).unwrap_or_else(|e| {
            malformed.get_or_insert(e);
            [SENTINEL, SENTINEL]
        });

        let data = &mut parsed.data;
        data.date.push(date);
        data.ore_shown.push(shown);
        data.ore_hidden.push(hidden);
        data.y_label.push(y);
        data.b_label.push(b);
        if image_based {
            data.url.push(row.url.clone().unwrap_or_default());
        }

        if let Some(error) = malformed {
            parsed.errors.push(error);
        }
    }

    parsed
}
