//! Shared fixtures for unit tests

use crate::error::Result;
use crate::features::FeatureSource;
use crate::models::{FieldKey, Region};
use crate::remote::{MemoryWorkbook, SheetSource, SheetSourceBuilder, DATE_FORMAT};
use crate::store::{MetadataFile, PersistedStore};
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use std::collections::BTreeMap;
use std::path::Path;

/// Columns: A date, B-E ores, F-H labels, I-K spare, L "Options:", M image
pub(crate) fn header() -> Vec<String> {
    cells(&[
        "Date", "", "", "", "", "Leyline Positions", "", "", "", "", "", "Options:", "Image",
    ])
}

pub(crate) fn cells(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

pub(crate) fn day(offset: usize) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default() + Duration::days(offset as i64)
}

pub(crate) fn labels_for(d: usize) -> [usize; 2] {
    [d % 3, (d + 1) % 3]
}

/// One history row whose cells follow the day number
pub(crate) fn history_row(d: usize) -> Vec<String> {
    let mut row = vec![String::new(); 13];
    row[0] = day(d).format(DATE_FORMAT).to_string();
    row[1 + d % 4] = "1".into();
    row[1 + (d + 2) % 4] = "2".into();
    let [y, b] = labels_for(d);
    row[5 + y] = "y".into();
    row[5 + b] = "b".into();
    row[12] = format!("https://img.example/{d}.png");
    row
}

pub(crate) fn region_sheet(days: usize) -> Vec<Vec<String>> {
    let mut rows = vec![header(), cells(&["", "1", "2", "3", "4", "1", "2", "3"])];
    rows.extend((0..days).map(history_row));
    rows
}

pub(crate) fn workbook(regions: &[(&str, usize)]) -> MemoryWorkbook {
    let book = MemoryWorkbook::new();
    for (name, days) in regions {
        book.set_sheet(format!("{name} Data"), region_sheet(*days));
    }
    book
}

pub(crate) fn source(book: MemoryWorkbook) -> SheetSource<MemoryWorkbook> {
    SheetSourceBuilder::new()
        .retry_delay(std::time::Duration::from_millis(1))
        .today(day(10_000))
        .build(book)
}

pub(crate) fn store(dir: &Path, regions: &[&str]) -> PersistedStore {
    let suffixes: BTreeMap<FieldKey, String> = FieldKey::ALL
        .into_iter()
        .map(|k| (k, format!("_{}", k.as_str())))
        .collect();
    let regions = regions
        .iter()
        .enumerate()
        .map(|(i, name)| Region::new(*name, i))
        .collect();
    PersistedStore::with_layout(format!("{}/data/", dir.display()), suffixes, regions)
}

pub(crate) fn metadata(dir: &Path) -> MetadataFile {
    MetadataFile::new(&format!("{}/models/", dir.display()))
}

/// Features derived from the day number embedded in the URL
pub(crate) struct FixedFeatures;

pub(crate) fn features_for(d: usize) -> Vec<f32> {
    let [y, b] = labels_for(d);
    let mut v = vec![0.0; 6];
    v[y] = 1.0;
    v[3 + b] = 1.0;
    v
}

#[async_trait]
impl FeatureSource for FixedFeatures {
    async fn features(&self, url: &str) -> Result<Vec<f32>> {
        let d = url
            .trim_start_matches("https://img.example/")
            .trim_end_matches(".png")
            .parse::<usize>()
            .map_err(|e| crate::error::Error::Feature {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        Ok(features_for(d))
    }
}
