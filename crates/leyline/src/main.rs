//! Leyline CLI
//!
//! Drives the sync and model refresh pipeline: refreshes per-region data
//! from the spreadsheet, keeps one classifier per (region, task) current,
//! and predicts today's values.

mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use commands::{predict, review, workflow};
use leyline_lib::{Pipeline, TaskKind};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

/// Leyline CLI
#[derive(Parser)]
#[command(name = "leyline")]
#[command(author, version, about = "Leyline sync and model refresh pipeline", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(long, short, global = true, default_value = "config.json")]
    pub config: PathBuf,

    /// Log at info level regardless of --output
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Log level
    #[arg(long, short, global = true, default_value = "warning")]
    pub output: LogLevel,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    /// Result format
    #[arg(long, short, global = true, default_value = "table")]
    pub format: output::OutputFormat,

    /// Delete stored data, resync from scratch and retrain
    #[arg(long, short, global = true)]
    pub reset: bool,

    /// Refresh data even when it is not stale
    #[arg(long, short, global = true)]
    pub update: bool,

    /// Retrain every model
    #[arg(long, short, global = true)]
    pub model: bool,

    /// Process regions one at a time
    #[arg(long, global = true)]
    pub sequential: bool,

    /// Write the Prometheus text exposition here after the command
    #[arg(long, global = true)]
    pub metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn directive(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Refresh stale data and make every model current (default)
    Run {
        /// Predict today's hidden ores for every region and write them back
        #[arg(long)]
        autofill: bool,
    },

    /// Synchronise data only
    Sync {
        /// Synchronise even when the data is fresh
        #[arg(long)]
        force: bool,
    },

    /// Load or retrain models only
    Train {
        /// Retrain every model
        #[arg(long)]
        force: bool,
    },

    /// Predict leyline positions for an image
    Classify {
        /// Region name
        #[arg(long)]
        region: String,

        /// Image URL
        #[arg(long)]
        url: String,
    },

    /// Predict today's hidden ores for a region
    Mine {
        /// Region name
        #[arg(long)]
        region: String,

        /// Write the predictions to the combined sheet
        #[arg(long)]
        write: bool,
    },

    /// List a region's observations, least model agreement first
    Review {
        /// Region name
        #[arg(long)]
        region: String,

        /// Task whose model scores the observations
        #[arg(long, default_value = "mining")]
        task: TaskKind,

        /// Show at most this many entries
        #[arg(long)]
        limit: Option<usize>,
    },
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose {
        LogLevel::Info
    } else {
        cli.output
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directive()));

    let writer = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let layer = if cli.json {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer()
            .with_ansi(cli.log_file.is_none())
            .with_writer(writer)
            .boxed()
    };

    tracing_subscriber::registry().with(filter).with(layer).init();
    Ok(())
}

async fn execute(cli: Cli) -> Result<()> {
    let settings = config::Settings::load(&cli.config)?;
    let options = settings.run_options(cli.reset, cli.update, cli.model);
    let pipeline = Pipeline::from_config(settings.app.clone(), cli.sequential)
        .context("Failed to initialise the pipeline")?;

    let command = cli.command.unwrap_or(Commands::Run { autofill: false });
    match command {
        Commands::Run { autofill } => {
            workflow::run(&pipeline, options, autofill, cli.format).await?;
            settings.clear_one_shot_flags(true, true)?;
        }
        Commands::Sync { force } => {
            let forced = workflow::sync(&pipeline, options, force).await?;
            settings.clear_one_shot_flags(forced, false)?;
        }
        Commands::Train { force } => {
            workflow::train(&pipeline, options, force, cli.format).await?;
            settings.clear_one_shot_flags(false, true)?;
        }
        Commands::Classify { region, url } => {
            predict::classify(&pipeline, &region, &url, cli.format).await?;
        }
        Commands::Mine { region, write } => {
            predict::mine(&pipeline, &region, write, cli.format).await?;
        }
        Commands::Review {
            region,
            task,
            limit,
        } => {
            review::show(&pipeline, &region, task, limit, cli.format).await?;
        }
    }

    if let Some(path) = &cli.metrics_file {
        std::fs::write(path, pipeline.metrics_text())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        output::print_error(&format!("{:#}", e));
        return ExitCode::FAILURE;
    }

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            output::print_error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}
