//! Review command: observations least supported by their model

use anyhow::Result;
use leyline_lib::parse::triple_to_date;
use leyline_lib::remote::DATE_FORMAT;
use leyline_lib::review::ReviewEntry;
use leyline_lib::{format_positions, Pipeline, TaskKind};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{color_status, format_agreement, print_table, OutputFormat};

/// Row for the review table
#[derive(Tabled, Serialize)]
struct ReviewRow {
    #[tabled(rename = "Row")]
    sheet_row: usize,
    #[tabled(rename = "Date")]
    date: String,
    #[tabled(rename = "Agreement")]
    agreement: String,
    #[tabled(rename = "Predicted")]
    predicted: String,
    #[tabled(rename = "Recorded")]
    recorded: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Image")]
    url: String,
}

impl ReviewRow {
    fn from_entry(entry: &ReviewEntry, colored: bool) -> Self {
        let status = if entry.matches() { "match" } else { "mismatch" };
        Self {
            sheet_row: entry.sheet_row,
            date: entry
                .date
                .and_then(triple_to_date)
                .map(|d| d.format(DATE_FORMAT).to_string())
                .unwrap_or_default(),
            agreement: format_agreement(entry.agreement),
            predicted: format_positions(&entry.predicted),
            recorded: format_positions(&entry.recorded),
            status: if colored {
                color_status(status)
            } else {
                status.to_string()
            },
            url: entry.url.clone().unwrap_or_default(),
        }
    }
}

/// Print a region's observations ranked by model agreement
pub async fn show(
    pipeline: &Pipeline,
    region: &str,
    task: TaskKind,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let region = pipeline.region(region)?;
    let entries = pipeline.review(&region, task).await?;

    let colored = matches!(format, OutputFormat::Table);
    let rows: Vec<ReviewRow> = entries
        .iter()
        .take(limit.unwrap_or(usize::MAX))
        .map(|e| ReviewRow::from_entry(e, colored))
        .collect();
    print_table(&rows, format);

    if colored {
        let mismatches = entries.iter().filter(|e| !e.matches()).count();
        println!(
            "\nTotal: {} observations, {} disagree with the {} model",
            entries.len(),
            mismatches,
            task
        );
    }
    Ok(())
}
