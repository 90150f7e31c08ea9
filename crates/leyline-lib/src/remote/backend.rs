//! Cell-level workbook access

use crate::error::RemoteError;
use crate::store::write_bytes_atomic;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use tracing::{debug, info};

/// Inclusive rectangle of 1-based cells
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub first_row: usize,
    pub first_col: usize,
    pub last_row: usize,
    pub last_col: usize,
}

impl CellRange {
    pub fn new(first_row: usize, first_col: usize, last_row: usize, last_col: usize) -> Self {
        Self {
            first_row,
            first_col,
            last_row,
            last_col,
        }
    }

    /// Single row spanning `first_col..=last_col`
    pub fn row(row: usize, first_col: usize, last_col: usize) -> Self {
        Self::new(row, first_col, row, last_col)
    }

    pub fn height(&self) -> usize {
        self.last_row + 1 - self.first_row
    }

    pub fn width(&self) -> usize {
        self.last_col + 1 - self.first_col
    }

    /// A1 notation, e.g. `B3:F7`
    pub fn to_a1(&self) -> String {
        format!(
            "{}{}:{}{}",
            column_letter(self.first_col),
            self.first_row,
            column_letter(self.last_col),
            self.last_row
        )
    }
}

/// Spreadsheet column letters for a 1-based column: 1 -> A, 27 -> AA
pub fn column_letter(mut col: usize) -> String {
    let mut letters = Vec::new();
    while col > 0 {
        let rem = (col - 1) % 26;
        letters.push((b'A' + rem as u8) as char);
        col = (col - 1) / 26;
    }
    letters.iter().rev().collect()
}

/// Trait for workbook implementations
#[async_trait]
pub trait SheetBackend: Send + Sync {
    /// Cells of one 1-based row, trailing blanks trimmed
    async fn row_values(&self, sheet: &str, row: usize) -> Result<Vec<String>, RemoteError>;

    /// Cells of one 1-based column starting at row 1, trailing blanks trimmed
    async fn col_values(&self, sheet: &str, col: usize) -> Result<Vec<String>, RemoteError>;

    /// Rectangle of cells, padded with blanks to the full range size
    async fn range(&self, sheet: &str, range: CellRange) -> Result<Vec<Vec<String>>, RemoteError>;

    /// Overwrite one cell
    async fn update_cell(
        &self,
        sheet: &str,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<(), RemoteError>;

    /// Value of one cell, blank when outside the used area
    async fn cell(&self, sheet: &str, row: usize, col: usize) -> Result<String, RemoteError> {
        let rows = self.range(sheet, CellRange::new(row, col, row, col)).await?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|r| r.into_iter().next())
            .unwrap_or_default())
    }

    /// Persist buffered writes
    async fn flush(&self) -> Result<(), RemoteError> {
        Ok(())
    }
}

type Grid = Vec<Vec<String>>;

/// In-memory workbook, optionally backed by a JSON snapshot file
/// (`{ "Sheet name": [["A1", "B1"], ["A2"]] }`)
#[derive(Debug, Default)]
pub struct MemoryWorkbook {
    sheets: RwLock<BTreeMap<String, Grid>>,
    snapshot: Option<PathBuf>,
    failures: AtomicUsize,
}

impl MemoryWorkbook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a workbook snapshot; writes are saved back on `flush`
    pub fn from_snapshot(path: &Path) -> Result<Self, RemoteError> {
        let content = std::fs::read(path)?;
        let sheets: BTreeMap<String, Grid> = serde_json::from_slice(&content)
            .map_err(|e| RemoteError::Response(format!("{}: {}", path.display(), e)))?;

        info!(path = %path.display(), sheets = sheets.len(), "Loaded workbook snapshot");
        Ok(Self {
            sheets: RwLock::new(sheets),
            snapshot: Some(path.to_path_buf()),
            failures: AtomicUsize::new(0),
        })
    }

    /// Replace a sheet's contents
    pub fn set_sheet(&self, name: impl Into<String>, rows: Vec<Vec<String>>) {
        let mut sheets = self.sheets.write().unwrap_or_else(|e| e.into_inner());
        sheets.insert(name.into(), rows);
    }

    /// Builder-style `set_sheet`
    pub fn with_sheet(self, name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        self.set_sheet(name, rows);
        self
    }

    /// Append one row to a sheet, creating the sheet if needed
    pub fn push_row(&self, name: &str, row: Vec<String>) {
        let mut sheets = self.sheets.write().unwrap_or_else(|e| e.into_inner());
        sheets.entry(name.to_string()).or_default().push(row);
    }

    /// Make the next `n` calls fail as if the service were unreachable
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Copy of a sheet's grid
    pub fn sheet(&self, name: &str) -> Option<Grid> {
        let sheets = self.sheets.read().unwrap_or_else(|e| e.into_inner());
        sheets.get(name).cloned()
    }

    fn check_available(&self) -> Result<(), RemoteError> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(RemoteError::Response("service unavailable".into()));
        }
        Ok(())
    }

    fn with_grid<T>(&self, sheet: &str, f: impl FnOnce(&Grid) -> T) -> Result<T, RemoteError> {
        self.check_available()?;
        let sheets = self.sheets.read().unwrap_or_else(|e| e.into_inner());
        let grid = sheets
            .get(sheet)
            .ok_or_else(|| RemoteError::SheetNotFound(sheet.to_string()))?;
        Ok(f(grid))
    }
}

fn cell_at(grid: &Grid, row: usize, col: usize) -> String {
    grid.get(row - 1)
        .and_then(|r| r.get(col - 1))
        .cloned()
        .unwrap_or_default()
}

fn trim_trailing(mut values: Vec<String>) -> Vec<String> {
    while values.last().is_some_and(|v| v.is_empty()) {
        values.pop();
    }
    values
}

#[async_trait]
impl SheetBackend for MemoryWorkbook {
    async fn row_values(&self, sheet: &str, row: usize) -> Result<Vec<String>, RemoteError> {
        self.with_grid(sheet, |grid| {
            trim_trailing(grid.get(row - 1).cloned().unwrap_or_default())
        })
    }

    async fn col_values(&self, sheet: &str, col: usize) -> Result<Vec<String>, RemoteError> {
        self.with_grid(sheet, |grid| {
            trim_trailing((1..=grid.len()).map(|r| cell_at(grid, r, col)).collect())
        })
    }

    async fn range(&self, sheet: &str, range: CellRange) -> Result<Vec<Vec<String>>, RemoteError> {
        self.with_grid(sheet, |grid| {
            (range.first_row..=range.last_row)
                .map(|r| {
                    (range.first_col..=range.last_col)
                        .map(|c| cell_at(grid, r, c))
                        .collect()
                })
                .collect()
        })
    }

    async fn update_cell(
        &self,
        sheet: &str,
        row: usize,
        col: usize,
        value: &str,
    ) -> Result<(), RemoteError> {
        self.check_available()?;
        let mut sheets = self.sheets.write().unwrap_or_else(|e| e.into_inner());
        let grid = sheets
            .get_mut(sheet)
            .ok_or_else(|| RemoteError::SheetNotFound(sheet.to_string()))?;

        if grid.len() < row {
            grid.resize_with(row, Vec::new);
        }
        let cells = &mut grid[row - 1];
        if cells.len() < col {
            cells.resize(col, String::new());
        }
        cells[col - 1] = value.to_string();

        debug!(sheet = %sheet, row = row, col = col, value = %value, "Cell updated");
        Ok(())
    }

    async fn flush(&self) -> Result<(), RemoteError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let json = {
            let sheets = self.sheets.read().unwrap_or_else(|e| e.into_inner());
            serde_json::to_vec_pretty(&*sheets)
                .map_err(|e| RemoteError::Response(e.to_string()))?
        };
        write_bytes_atomic(path, &json).map_err(|e| RemoteError::Response(e.to_string()))?;
        debug!(path = %path.display(), "Workbook snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_column_letters() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(53), "BA");
        assert_eq!(CellRange::new(3, 2, 7, 6).to_a1(), "B3:F7");
    }

    #[tokio::test]
    async fn test_range_pads_blanks() {
        let book = MemoryWorkbook::new().with_sheet("S", vec![row(&["a", "b"]), row(&["c"])]);

        let cells = book.range("S", CellRange::new(1, 1, 3, 3)).await.unwrap();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0], row(&["a", "b", ""]));
        assert_eq!(cells[1], row(&["c", "", ""]));
        assert_eq!(cells[2], row(&["", "", ""]));

        assert_eq!(book.col_values("S", 1).await.unwrap(), row(&["a", "c"]));
        assert_eq!(book.row_values("S", 2).await.unwrap(), row(&["c"]));
    }

    #[tokio::test]
    async fn test_update_grows_grid() {
        let book = MemoryWorkbook::new().with_sheet("S", vec![]);
        book.update_cell("S", 3, 2, "y").await.unwrap();
        assert_eq!(book.cell("S", 3, 2).await.unwrap(), "y");
        assert_eq!(book.cell("S", 1, 1).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_missing_sheet_and_injected_failures() {
        let book = MemoryWorkbook::new().with_sheet("S", vec![row(&["a"])]);
        assert!(matches!(
            book.row_values("T", 1).await,
            Err(RemoteError::SheetNotFound(_))
        ));

        book.fail_next(2);
        assert!(book.row_values("S", 1).await.is_err());
        assert!(book.row_values("S", 1).await.is_err());
        assert!(book.row_values("S", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("workbook.json");
        std::fs::write(&path, r#"{ "DataEntry": [["Region", "Ore"]] }"#).unwrap();

        let book = MemoryWorkbook::from_snapshot(&path).unwrap();
        book.update_cell("DataEntry", 3, 2, "2").await.unwrap();
        book.flush().await.unwrap();

        let reloaded = MemoryWorkbook::from_snapshot(&path).unwrap();
        assert_eq!(reloaded.cell("DataEntry", 3, 2).await.unwrap(), "2");
        assert!(!dir.path().join("workbook.json.tmp").exists());
    }
}
