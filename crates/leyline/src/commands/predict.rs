//! Single-region prediction commands

use anyhow::Result;
use colored::Colorize;
use leyline_lib::{format_positions, Pipeline};

use super::workflow::PredictionRow;
use crate::output::{print_success, print_table, OutputFormat};

/// Predict the leyline positions shown in an image
pub async fn classify(pipeline: &Pipeline, region: &str, url: &str, format: OutputFormat) -> Result<()> {
    let region = pipeline.region(region)?;
    let leyline = pipeline.classify(&region, url).await?;

    match format {
        OutputFormat::Json => {
            let positions: Vec<i32> = leyline.iter().map(|p| p + 1).collect();
            let json = serde_json::json!({
                "region": region.name,
                "url": url,
                "leyline": positions,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Table => {
            println!("{} {}", "Region: ".bold(), region.name.cyan());
            println!("{} {}", "Leyline:".bold(), format_positions(&leyline));
        }
    }
    Ok(())
}

/// Predict today's hidden ores for a region
pub async fn mine(pipeline: &Pipeline, region: &str, write: bool, format: OutputFormat) -> Result<()> {
    let region = pipeline.region(region)?;
    let prediction = pipeline.mine(&region, write).await?;

    print_table(&[PredictionRow::from(&prediction)], format);
    if write && matches!(format, OutputFormat::Table) {
        print_success(&format!(
            "Wrote {} cells to row {} of the combined sheet",
            prediction.cells_written,
            region.combined_row()
        ));
    }
    Ok(())
}
