//! Refresh, training and autofill commands

use anyhow::{Context, Result};
use leyline_lib::pipeline::{TodayPrediction, TrainOutcome};
use leyline_lib::{format_positions, Pipeline, RunOptions};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    color_accuracy, color_status, print_info, print_success, print_table, print_warning,
    OutputFormat,
};

/// Row for the models table
#[derive(Tabled, Serialize)]
struct ModelRow {
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Task")]
    task: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Accuracy")]
    accuracy: String,
    #[tabled(rename = "Train")]
    train_rows: usize,
    #[tabled(rename = "Test")]
    test_rows: usize,
    #[tabled(rename = "Detail")]
    detail: String,
}

impl ModelRow {
    fn from_outcome(outcome: &TrainOutcome, format: OutputFormat) -> Self {
        let colored = matches!(format, OutputFormat::Table);
        let paint = |s: &str| if colored { color_status(s) } else { s.to_string() };

        match &outcome.result {
            Ok(summary) => Self {
                region: outcome.region.name.clone(),
                task: outcome.task.to_string(),
                status: paint(if summary.retrained { "trained" } else { "loaded" }),
                accuracy: if colored {
                    color_accuracy(summary.accuracy)
                } else {
                    format!("{:.4}", summary.accuracy)
                },
                train_rows: summary.train_rows,
                test_rows: summary.test_rows,
                detail: String::new(),
            },
            Err(e) => Self {
                region: outcome.region.name.clone(),
                task: outcome.task.to_string(),
                status: paint("failed"),
                accuracy: "-".to_string(),
                train_rows: 0,
                test_rows: 0,
                detail: e.to_string(),
            },
        }
    }
}

/// Row for the today predictions table
#[derive(Tabled, Serialize)]
pub(crate) struct PredictionRow {
    #[tabled(rename = "Region")]
    region: String,
    #[tabled(rename = "Leyline")]
    leyline: String,
    #[tabled(rename = "Classified")]
    classified: bool,
    #[tabled(rename = "Hidden Ores")]
    hidden: String,
    #[tabled(rename = "Cells Written")]
    cells_written: usize,
}

impl From<&TodayPrediction> for PredictionRow {
    fn from(p: &TodayPrediction) -> Self {
        Self {
            region: p.region.name.clone(),
            leyline: format_positions(&p.leyline),
            classified: p.leyline_classified,
            hidden: format_positions(&p.hidden),
            cells_written: p.cells_written,
        }
    }
}

fn print_models(outcomes: &[TrainOutcome], format: OutputFormat) {
    let rows: Vec<ModelRow> = outcomes
        .iter()
        .map(|o| ModelRow::from_outcome(o, format))
        .collect();
    print_table(&rows, format);

    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    if failed > 0 && matches!(format, OutputFormat::Table) {
        print_warning(&format!("{} of {} models unavailable", failed, outcomes.len()));
    }
}

/// Refresh stale data, make every model current and optionally fill in
/// today's predictions
pub async fn run(
    pipeline: &Pipeline,
    options: RunOptions,
    autofill: bool,
    format: OutputFormat,
) -> Result<()> {
    let outcomes = pipeline.run(options).await.context("Pipeline run failed")?;
    print_models(&outcomes, format);

    if !autofill {
        return Ok(());
    }

    let results = pipeline.autofill().await.context("Autofill failed")?;
    let mut rows = Vec::with_capacity(results.len());
    let mut failures = Vec::new();
    for (region, result) in pipeline.config().regions().iter().zip(&results) {
        match result {
            Ok(prediction) => rows.push(PredictionRow::from(prediction)),
            Err(e) => failures.push(format!("{}: {}", region, e)),
        }
    }
    print_table(&rows, format);

    if !failures.is_empty() {
        for failure in &failures {
            print_warning(failure);
        }
        anyhow::bail!(
            "{} of {} regions could not be filled in",
            failures.len(),
            results.len()
        );
    }
    Ok(())
}

/// Synchronise every region. Returns whether a refresh ran.
pub async fn sync(pipeline: &Pipeline, options: RunOptions, force: bool) -> Result<bool> {
    let forced = RunOptions {
        force_update: options.force_update || force,
        ..options
    };
    if !pipeline.needs_refresh(forced)? {
        print_info("Data is fresh; pass --force to synchronise anyway");
        return Ok(false);
    }

    let report = pipeline
        .refresh(options.reset)
        .await
        .context("Data refresh failed")?;
    print_success(&format!(
        "Synchronised {} regions ({} changed)",
        report.changed.len() + report.unchanged.len(),
        report.changed.len()
    ));
    for name in &report.changed {
        println!("  {}", name);
    }
    Ok(true)
}

/// Load or retrain every model without touching the data
pub async fn train(
    pipeline: &Pipeline,
    options: RunOptions,
    force: bool,
    format: OutputFormat,
) -> Result<()> {
    let force = force || options.force_retrain || pipeline.config().force_model_reset;
    let outcomes = pipeline.train_all(force).await.context("Training failed")?;
    print_models(&outcomes, format);
    Ok(())
}
