//! Leyline library for incremental data sync and model refresh
//!
//! This crate provides the core functionality for:
//! - Append-only persistence of per-region field series
//! - Incremental synchronisation against a spreadsheet-like remote source
//! - Training, caching and reloading per-region classifiers
//! - Ticket-ordered region fan-out and bounded image fetching
//! - Review ranking and observability

pub mod classifier;
pub mod config;
pub mod error;
pub mod fanout;
pub mod features;
pub mod models;
pub mod observability;
pub mod parse;
pub mod pipeline;
pub mod registry;
pub mod remote;
pub mod review;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use error::{Error, Result};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use pipeline::{Pipeline, RunOptions};
pub use registry::{ModelArtifact, ModelRegistry};
pub use store::PersistedStore;
pub use sync::SyncEngine;
