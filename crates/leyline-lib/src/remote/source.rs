//! `RemoteSource` over a sheet backend

use super::backend::{CellRange, SheetBackend};
use super::{RawBatch, RawRow, RemoteSource, SheetLayout};
use crate::error::{LayoutError, RemoteError};
use crate::models::{Region, TodayRow, SENTINEL};
use crate::observability::PipelineMetrics;
use crate::parse::{self, SHOWN};
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Sheet holding today's row for every region
pub const COMBINED_SHEET: &str = "DataEntry";

/// Date cell format
pub const DATE_FORMAT: &str = "%m/%d/%y";

/// First 1-based data row of every sheet
pub const FIRST_DATA_ROW: usize = 3;

const LEYLINE_MARKER: &str = "Leyline";
const OPTIONS_MARKER: &str = "Options:";
const IMAGE_MARKER: &str = "Image";

/// Remote source reading `"{Region} Data"` sheets and the combined sheet
pub struct SheetSource<B> {
    backend: B,
    retry_delay: Duration,
    label_end_offset: usize,
    today: Option<NaiveDate>,
}

impl<B: SheetBackend> SheetSource<B> {
    pub fn new(backend: B) -> Self {
        SheetSourceBuilder::new().build(backend)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Current local date, unless pinned by the builder
    pub fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| Local::now().date_naive())
    }

    /// Run a backend call until it succeeds.
    ///
    /// Transient failures wait `retry_delay` and try again without limit; a
    /// missing sheet is a schema problem and is returned immediately.
    async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, LayoutError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let mut attempt: u64 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(RemoteError::SheetNotFound(sheet)) => {
                    return Err(LayoutError::MissingSheet(sheet))
                }
                Err(e) => {
                    attempt += 1;
                    PipelineMetrics::new().inc_remote_retries();
                    warn!(
                        operation = %what,
                        attempt = attempt,
                        error = %e,
                        delay_secs = self.retry_delay.as_secs_f64(),
                        "Remote call failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Read marker positions from row 1 of `sheet`
    async fn layout_of(&self, sheet: &str) -> Result<SheetLayout, LayoutError> {
        let header = self
            .retry("read header", || self.backend.row_values(sheet, 1))
            .await?;

        let marker_column = column_of(&header, |h| h.starts_with(LEYLINE_MARKER)).ok_or_else(|| {
            LayoutError::MissingMarker {
                sheet: sheet.to_string(),
                marker: LEYLINE_MARKER.to_string(),
            }
        })?;
        let options_column = column_of(&header, |h| h == OPTIONS_MARKER).ok_or_else(|| {
            LayoutError::MissingMarker {
                sheet: sheet.to_string(),
                marker: OPTIONS_MARKER.to_string(),
            }
        })?;
        let url_column = column_of(&header, |h| h.starts_with(IMAGE_MARKER));

        if marker_column <= SheetLayout::ORE_START {
            return Err(LayoutError::Misplaced {
                sheet: sheet.to_string(),
                detail: format!("{LEYLINE_MARKER:?} header in column {marker_column} leaves no ore columns"),
            });
        }
        let label_end_column = options_column.saturating_sub(self.label_end_offset);
        if label_end_column <= marker_column {
            return Err(LayoutError::Misplaced {
                sheet: sheet.to_string(),
                detail: format!(
                    "{OPTIONS_MARKER:?} header in column {options_column} leaves no label columns after column {marker_column}"
                ),
            });
        }

        let layout = SheetLayout {
            marker_column,
            label_end_column,
            url_column,
        };
        debug!(sheet = %sheet, layout = ?layout, "Discovered sheet layout");
        Ok(layout)
    }

    /// Read one full row and split it by `layout`
    async fn read_row(
        &self,
        sheet: &str,
        row: usize,
        layout: &SheetLayout,
    ) -> Result<Vec<String>, LayoutError> {
        let range = CellRange::row(row, 1, layout.last_column());
        let mut rows = self
            .retry("read row", || self.backend.range(sheet, range))
            .await?;
        Ok(rows.pop().unwrap_or_default())
    }

    fn is_today(&self, cell: &str) -> bool {
        let today = self.today();
        cell.trim() == today.format(DATE_FORMAT).to_string()
            || NaiveDate::parse_from_str(cell.trim(), DATE_FORMAT).is_ok_and(|d| d == today)
    }
}

/// 1-based column of the first header cell matching `pred`
fn column_of(header: &[String], pred: impl Fn(&str) -> bool) -> Option<usize> {
    header.iter().position(|h| pred(h.trim())).map(|i| i + 1)
}

fn split_row(index: usize, cells: &[String], layout: &SheetLayout) -> RawRow {
    let cell = |col: usize| cells.get(col - 1).cloned().unwrap_or_default();
    RawRow {
        index,
        date: cell(1),
        ore_cells: (SheetLayout::ORE_START..layout.marker_column).map(cell).collect(),
        label_cells: (layout.marker_column..layout.label_end_column).map(cell).collect(),
        url: layout.url_column.map(cell),
    }
}

#[async_trait]
impl<B: SheetBackend> RemoteSource for SheetSource<B> {
    async fn discover_layout(&self, region: &Region) -> Result<SheetLayout, LayoutError> {
        self.layout_of(&region.sheet_name()).await
    }

    async fn count_available(&self, region: &Region) -> Result<usize, LayoutError> {
        let sheet = region.sheet_name();
        let dates = self
            .retry("read dates", || self.backend.col_values(&sheet, 1))
            .await?;

        let count = dates
            .iter()
            .skip(FIRST_DATA_ROW - 1)
            .take_while(|d| !d.trim().is_empty() && !self.is_today(d))
            .count();

        debug!(region = %region, available = count, "Counted upstream rows");
        Ok(count)
    }

    async fn read_new_rows(
        &self,
        region: &Region,
        since_index: usize,
    ) -> Result<RawBatch, LayoutError> {
        let layout = self.discover_layout(region).await?;
        let available = self.count_available(region).await?;
        if since_index >= available {
            return Ok(RawBatch::empty(since_index, layout));
        }

        let sheet = region.sheet_name();
        let range = CellRange::new(
            FIRST_DATA_ROW + since_index,
            1,
            FIRST_DATA_ROW + available - 1,
            layout.last_column(),
        );
        let grid = self
            .retry("read rows", || self.backend.range(&sheet, range))
            .await?;

        let rows = grid
            .iter()
            .enumerate()
            .map(|(offset, cells)| split_row(since_index + offset, cells, &layout))
            .collect();

        info!(
            region = %region,
            from = since_index,
            to = available,
            "Read new upstream rows"
        );
        Ok(RawBatch {
            start: since_index,
            layout,
            rows,
        })
    }

    async fn write_back(
        &self,
        sheet: &str,
        row: usize,
        column: usize,
        value: &str,
    ) -> Result<(), LayoutError> {
        let current = self
            .retry("read cell", || self.backend.cell(sheet, row, column))
            .await?;
        if current == value {
            debug!(sheet = %sheet, row = row, column = column, "Cell already up to date");
            return Ok(());
        }
        self.retry("write cell", || self.backend.update_cell(sheet, row, column, value))
            .await
    }

    async fn read_today(&self, region: &Region) -> Result<TodayRow, LayoutError> {
        let layout = self.layout_of(COMBINED_SHEET).await?;
        let cells = self
            .read_row(COMBINED_SHEET, region.combined_row(), &layout)
            .await?;
        let raw = split_row(0, &cells, &layout);

        Ok(TodayRow {
            date: parse::date_triple(self.today()),
            ore_shown: parse::ore_positions(&raw.ore_cells, SHOWN),
            leyline: parse::parse_labels(&raw.label_cells),
            url: raw.url.filter(|u| !u.trim().is_empty()),
        })
    }

    async fn write_hidden_ores(
        &self,
        region: &Region,
        indices: &[i32],
    ) -> Result<usize, LayoutError> {
        let layout = self.layout_of(COMBINED_SHEET).await?;
        let row = region.combined_row();
        let mut written = 0;

        for &index in indices.iter().filter(|&&i| i >= 0) {
            let column = SheetLayout::ORE_START + index as usize;
            if column >= layout.marker_column {
                warn!(region = %region, index = index, "Hidden ore index outside ore columns");
                continue;
            }
            let current = self
                .retry("read cell", || self.backend.cell(COMBINED_SHEET, row, column))
                .await?;
            if !current.trim().is_empty() {
                continue;
            }
            self.write_back(COMBINED_SHEET, row, column, parse::HIDDEN)
                .await?;
            written += 1;
        }

        info!(region = %region, written = written, "Hidden ores written");
        Ok(written)
    }

    async fn write_leyline(&self, region: &Region, pair: [i32; 2]) -> Result<(), LayoutError> {
        if pair.contains(&SENTINEL) {
            warn!(region = %region, "No leyline prediction to write");
            return Ok(());
        }
        let layout = self.layout_of(COMBINED_SHEET).await?;
        let row = region.combined_row();

        for (index, mark) in pair.into_iter().zip(["y", "b"]) {
            let column = layout.marker_column + index as usize;
            if index < 0 || column >= layout.label_end_column {
                return Err(LayoutError::Misplaced {
                    sheet: COMBINED_SHEET.to_string(),
                    detail: format!("leyline index {index} outside label columns"),
                });
            }
            self.write_back(COMBINED_SHEET, row, column, mark).await?;
        }
        Ok(())
    }

    async fn flush(&self) {
        if let Err(e) = self.retry("flush", || self.backend.flush()).await {
            warn!(error = %e, "Failed to flush workbook");
        }
    }
}

/// Builder for `SheetSource`
pub struct SheetSourceBuilder {
    retry_delay: Duration,
    label_end_offset: usize,
    today: Option<NaiveDate>,
}

impl SheetSourceBuilder {
    pub fn new() -> Self {
        Self {
            retry_delay: Duration::from_secs(60),
            label_end_offset: 3,
            today: None,
        }
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Columns between the last label column and the `"Options:"` header, plus one
    pub fn label_end_offset(mut self, offset: usize) -> Self {
        self.label_end_offset = offset;
        self
    }

    /// Pin "today" instead of reading the clock
    pub fn today(mut self, date: NaiveDate) -> Self {
        self.today = Some(date);
        self
    }

    pub fn build<B: SheetBackend>(self, backend: B) -> SheetSource<B> {
        SheetSource {
            backend,
            retry_delay: self.retry_delay,
            label_end_offset: self.label_end_offset,
            today: self.today,
        }
    }
}

impl Default for SheetSourceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
