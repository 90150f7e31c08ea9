//! Synchronisation of persisted series with the remote source
//!
//! This module provides:
//! - `SyncEngine`, which appends only rows added upstream since the last
//!   sync, resolving image URLs to features with a bounded fetch pool
//! - `parse_batch`, which turns raw rows into field series, keeping
//!   malformed rows as sentinel placeholders so fields stay aligned

mod engine;

#[cfg(test)]
mod tests;

pub use engine::{align_image_series, parse_batch, ParsedBatch, SyncConfig, SyncEngine, SyncState};
