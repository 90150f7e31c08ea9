//! Spreadsheet-like remote source
//!
//! This module provides:
//! - `SheetBackend`, a cell-level workbook abstraction with in-memory and
//!   HTTP values-API implementations
//! - `SheetSource`, which implements `RemoteSource` over any backend with
//!   layout discovery, incremental row reads and fixed-delay retry
//!
//! Sheet schema, 1-based: rows 1-2 are headers and data starts at row 3.
//! Column 1 holds the `MM/DD/YY` date, columns `2..leyline` the ore cells,
//! columns `leyline..label_end` the label cells. An optional column whose
//! header starts with `"Image"` holds screenshot URLs.

mod backend;
mod http;
mod source;

pub use backend::{CellRange, MemoryWorkbook, SheetBackend};
pub use http::HttpWorkbook;
pub use source::{SheetSource, SheetSourceBuilder, COMBINED_SHEET, DATE_FORMAT, FIRST_DATA_ROW};

use crate::error::LayoutError;
use crate::models::{Region, TodayRow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Column layout discovered from a sheet's header row (1-based columns)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetLayout {
    /// First label column, located by the `"Leyline"` header
    pub marker_column: usize,
    /// One past the last label column, from the `"Options:"` header
    pub label_end_column: usize,
    /// Column holding image URLs, when the sheet has one
    pub url_column: Option<usize>,
}

impl SheetLayout {
    /// First ore column
    pub const ORE_START: usize = 2;

    pub fn ore_width(&self) -> usize {
        self.marker_column - Self::ORE_START
    }

    pub fn label_width(&self) -> usize {
        self.label_end_column - self.marker_column
    }

    /// Last column any row read needs
    pub fn last_column(&self) -> usize {
        let label_last = self.label_end_column - 1;
        self.url_column.map_or(label_last, |c| c.max(label_last))
    }

    pub fn is_image_based(&self) -> bool {
        self.url_column.is_some()
    }
}

/// One upstream data row, still as raw cell strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRow {
    /// 0-based observation index; sheet row is `FIRST_DATA_ROW + index`
    pub index: usize,
    pub date: String,
    pub ore_cells: Vec<String>,
    pub label_cells: Vec<String>,
    pub url: Option<String>,
}

/// Rows `[start, start + rows.len())` read from a region's sheet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBatch {
    pub start: usize,
    pub layout: SheetLayout,
    pub rows: Vec<RawRow>,
}

impl RawBatch {
    pub fn empty(start: usize, layout: SheetLayout) -> Self {
        Self {
            start,
            layout,
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Contract of the external source the pipeline synchronises against.
///
/// Transient failures are retried inside the implementation and never
/// returned; only schema problems surface, as `LayoutError`.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Locate the marker headers of a region's sheet
    async fn discover_layout(&self, region: &Region) -> Result<SheetLayout, LayoutError>;

    /// Rows of history currently present upstream for a region
    async fn count_available(&self, region: &Region) -> Result<usize, LayoutError>;

    /// Raw rows `[since_index, count_available)`
    async fn read_new_rows(&self, region: &Region, since_index: usize)
        -> Result<RawBatch, LayoutError>;

    /// Idempotent single-cell update
    async fn write_back(
        &self,
        sheet: &str,
        row: usize,
        column: usize,
        value: &str,
    ) -> Result<(), LayoutError>;

    /// Today's inputs from the region's row of the combined sheet
    async fn read_today(&self, region: &Region) -> Result<TodayRow, LayoutError>;

    /// Mark hidden ore positions in the region's combined row; only blank
    /// cells are written
    async fn write_hidden_ores(&self, region: &Region, indices: &[i32]) -> Result<usize, LayoutError>;

    /// Write the yellow and blue leyline markers into the combined row
    async fn write_leyline(&self, region: &Region, pair: [i32; 2]) -> Result<(), LayoutError>;

    /// Persist pending writes, for backends that buffer them
    async fn flush(&self) {}
}
