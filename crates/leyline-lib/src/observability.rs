//! Observability for the pipeline
//!
//! Provides:
//! - Prometheus metrics (sync and fit latency, row counts, model accuracy)
//! - Structured logging of pipeline events with tracing

use crate::models::{Region, TaskKind};
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, GaugeVec, Histogram,
    IntCounter, Encoder, TextEncoder,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for sync, fetch and fit durations (in seconds)
const DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

static GLOBAL_METRICS: OnceLock<PipelineMetricsInner> = OnceLock::new();

struct PipelineMetricsInner {
    sync_duration_seconds: Histogram,
    fetch_duration_seconds: Histogram,
    fit_duration_seconds: Histogram,
    rows_appended: IntCounter,
    rows_skipped: IntCounter,
    remote_retries: IntCounter,
    models_trained: IntCounter,
    models_loaded: IntCounter,
    predictions_written: IntCounter,
    model_accuracy: GaugeVec,
}

impl PipelineMetricsInner {
    fn new() -> Self {
        Self {
            sync_duration_seconds: register_histogram!(
                "leyline_sync_duration_seconds",
                "Time spent synchronising one region",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register sync_duration_seconds"),

            fetch_duration_seconds: register_histogram!(
                "leyline_feature_fetch_duration_seconds",
                "Time spent fetching and extracting one image",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register feature_fetch_duration_seconds"),

            fit_duration_seconds: register_histogram!(
                "leyline_fit_duration_seconds",
                "Time spent fitting one model",
                DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register fit_duration_seconds"),

            rows_appended: register_int_counter!(
                "leyline_rows_appended_total",
                "Observations appended to the persisted store"
            )
            .expect("Failed to register rows_appended"),

            rows_skipped: register_int_counter!(
                "leyline_rows_skipped_total",
                "Malformed upstream rows stored as placeholders"
            )
            .expect("Failed to register rows_skipped"),

            remote_retries: register_int_counter!(
                "leyline_remote_retries_total",
                "Remote calls retried after a transient failure"
            )
            .expect("Failed to register remote_retries"),

            models_trained: register_int_counter!(
                "leyline_models_trained_total",
                "Models fitted from persisted data"
            )
            .expect("Failed to register models_trained"),

            models_loaded: register_int_counter!(
                "leyline_models_loaded_total",
                "Models reused from persisted artifacts"
            )
            .expect("Failed to register models_loaded"),

            predictions_written: register_int_counter!(
                "leyline_predictions_written_total",
                "Predicted cells written back to the workbook"
            )
            .expect("Failed to register predictions_written"),

            model_accuracy: register_gauge_vec!(
                "leyline_model_accuracy",
                "Held-out accuracy of the current model",
                &["region", "task"]
            )
            .expect("Failed to register model_accuracy"),
        }
    }
}

/// Handle to the process-wide pipeline metrics; clones share one registry
#[derive(Clone)]
pub struct PipelineMetrics {
    _private: (),
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &PipelineMetricsInner {
        GLOBAL_METRICS.get_or_init(PipelineMetricsInner::new)
    }

    pub fn observe_sync(&self, duration_secs: f64) {
        self.inner().sync_duration_seconds.observe(duration_secs);
    }

    pub fn observe_fetch(&self, duration_secs: f64) {
        self.inner().fetch_duration_seconds.observe(duration_secs);
    }

    pub fn observe_fit(&self, duration_secs: f64) {
        self.inner().fit_duration_seconds.observe(duration_secs);
    }

    pub fn add_rows(&self, appended: usize, skipped: usize) {
        self.inner().rows_appended.inc_by(appended as u64);
        self.inner().rows_skipped.inc_by(skipped as u64);
    }

    pub fn inc_remote_retries(&self) {
        self.inner().remote_retries.inc();
    }

    /// Record a model becoming current, fitted or loaded
    pub fn record_model(&self, region: &str, task: TaskKind, accuracy: f64, retrained: bool) {
        if retrained {
            self.inner().models_trained.inc();
        } else {
            self.inner().models_loaded.inc();
        }
        self.inner()
            .model_accuracy
            .with_label_values(&[region, task.as_str()])
            .set(accuracy);
    }

    pub fn add_predictions_written(&self, cells: usize) {
        self.inner().predictions_written.inc_by(cells as u64);
    }

    /// Render every registered metric in the Prometheus text format
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
            warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Structured logger for pipeline events
#[derive(Clone)]
pub struct StructuredLogger {
    session: String,
}

impl StructuredLogger {
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
        }
    }

    pub fn log_pipeline_started(&self, version: &str, regions: usize, refresh: bool) {
        info!(
            event = "pipeline_started",
            session = %self.session,
            version = %version,
            regions = regions,
            refresh = refresh,
            "Pipeline started"
        );
    }

    pub fn log_sync_completed(&self, region: &Region, appended: usize, observations: usize) {
        info!(
            event = "sync_completed",
            session = %self.session,
            region = %region,
            appended = appended,
            observations = observations,
            "Region synchronised"
        );
    }

    /// Malformed rows are kept as placeholders and excluded from training
    pub fn log_rows_skipped(&self, region: &Region, skipped: usize, reason: &str) {
        if skipped == 0 {
            return;
        }
        warn!(
            event = "rows_skipped",
            session = %self.session,
            region = %region,
            skipped = skipped,
            reason = %reason,
            "Skipped malformed rows"
        );
    }

    pub fn log_model_loaded(&self, region: &Region, task: TaskKind, accuracy: f64) {
        info!(
            event = "model_loaded",
            session = %self.session,
            region = %region,
            task = %task,
            accuracy = accuracy,
            "Reused persisted model"
        );
    }

    pub fn log_model_trained(
        &self,
        region: &Region,
        task: TaskKind,
        accuracy: f64,
        train_rows: usize,
        test_rows: usize,
    ) {
        info!(
            event = "model_trained",
            session = %self.session,
            region = %region,
            task = %task,
            accuracy = accuracy,
            train_rows = train_rows,
            test_rows = test_rows,
            "Model trained"
        );
    }

    pub fn log_prediction_written(&self, region: &Region, task: TaskKind, positions: &str, cells: usize) {
        info!(
            event = "prediction_written",
            session = %self.session,
            region = %region,
            task = %task,
            positions = %positions,
            cells = cells,
            "Prediction written to workbook"
        );
    }
}
