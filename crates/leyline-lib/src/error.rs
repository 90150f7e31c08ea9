//! Error taxonomy for the synchronisation and model pipeline
//!
//! Transient remote failures never appear here as caller-visible errors:
//! `SheetSource` retries them with a fixed delay until they succeed.

use crate::models::{FieldKey, TaskKind};
use std::path::PathBuf;
use thiserror::Error;

/// Crate-wide result type
pub type Result<T> = std::result::Result<T, Error>;

/// Remote schema does not match what the pipeline reads; never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("sheet {sheet:?} has no {marker:?} header in row 1")]
    MissingMarker { sheet: String, marker: String },
    #[error("sheet {0:?} does not exist in the workbook")]
    MissingSheet(String),
    #[error("sheet {sheet:?}: {detail}")]
    Misplaced { sheet: String, detail: String },
}

/// Required cached field absent when building a training set
#[derive(Debug, Error)]
#[error("no persisted {field} data for region {region}; run a sync first")]
pub struct DataMissingError {
    pub region: String,
    pub field: FieldKey,
}

/// Malformed individual row; the row is skipped, the batch continues
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("row {row}: date {value:?} is not MM/DD/YY")]
    Date { row: usize, value: String },
    #[error("row {row}: leyline label pair is incomplete")]
    MissingLabels { row: usize },
    #[error("row {row}: ore cell {value:?} is neither 1 nor 2")]
    AmbiguousOre { row: usize, value: String },
}

/// Invalid or incomplete configuration; fatal at startup
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("credential file {0:?} is missing; create it with your spreadsheet credentials")]
    MissingCredentials(PathBuf),
    #[error("workbook snapshot {0:?} does not exist")]
    MissingSnapshot(PathBuf),
    #[error("invalid remote identifier {0:?}")]
    InvalidRemote(String),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Errors raised by a sheet backend; treated as transient by `SheetSource`
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("sheet {0:?} not found")]
    SheetNotFound(String),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected response: {0}")]
    Response(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    DataMissing(#[from] DataMissingError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("unknown region {0:?}")]
    UnknownRegion(String),

    #[error("not enough usable observations to train {task} for {region}: {usable} usable, need {needed}")]
    InsufficientData {
        region: String,
        task: TaskKind,
        usable: usize,
        needed: usize,
    },

    #[error("model error: {0}")]
    Model(String),

    #[error("feature extraction failed for {url}: {reason}")]
    Feature { url: String, reason: String },

    #[error("store error at {path:?}: {source}")]
    Store {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize {path:?}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub(crate) fn store(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Store {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serde(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Serde {
            path: path.into(),
            source,
        }
    }

    /// True for errors that must stop the process before any work begins
    pub fn is_startup_fatal(&self) -> bool {
        matches!(self, Error::Config(_))
    }
}
