//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for command results
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => {
            if let Ok(json) = serde_json::to_string_pretty(&items) {
                println!("{}", json);
            }
        }
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format a held-out accuracy as a percentage
pub fn format_accuracy(accuracy: f64) -> String {
    format!("{:.1}%", accuracy * 100.0)
}

/// Color accuracy based on value
pub fn color_accuracy(accuracy: f64) -> String {
    let formatted = format_accuracy(accuracy);
    if accuracy >= 0.8 {
        formatted.green().to_string()
    } else if accuracy >= 0.5 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

/// Format an estimator agreement score, `-` when the model has none
pub fn format_agreement(agreement: Option<f64>) -> String {
    match agreement {
        Some(a) => format!("{:.2}", a),
        None => "-".to_string(),
    }
}

/// Color a status word
pub fn color_status(status: &str) -> String {
    match status.to_lowercase().as_str() {
        "trained" | "written" | "match" => status.green().to_string(),
        "loaded" | "predicted" => status.blue().to_string(),
        "skipped" => status.yellow().to_string(),
        "failed" | "mismatch" => status.red().to_string(),
        _ => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_accuracy() {
        assert_eq!(format_accuracy(0.875), "87.5%");
        assert_eq!(format_accuracy(1.0), "100.0%");
    }

    #[test]
    fn test_format_agreement() {
        assert_eq!(format_agreement(Some(0.5)), "0.50");
        assert_eq!(format_agreement(None), "-");
    }
}
