//! Integration tests for the sync module
//!
//! These tests verify:
//! - Incremental append from the persisted cursor
//! - Idempotent re-sync and shrinking remotes
//! - Malformed rows kept as aligned placeholders
//! - Image series kept aligned when fetches fail or the Image column is new

use super::*;
use crate::features::FeatureSource;
use crate::models::{FieldKey, Region, RegionData, SENTINEL, SENTINEL_DATE};
use crate::remote::{MemoryWorkbook, RemoteSource, SheetSource};
use crate::store::MetadataFile;
use crate::testing::{self, FixedFeatures};
use std::sync::Arc;
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    remote: Arc<SheetSource<MemoryWorkbook>>,
    metadata: Arc<MetadataFile>,
    engine: SyncEngine,
}

fn harness(days: usize) -> Harness {
    harness_with(testing::workbook(&[("Mondstadt", days)]), Arc::new(FixedFeatures))
}

fn harness_with(book: MemoryWorkbook, features: Arc<dyn FeatureSource>) -> Harness {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(testing::source(book));
    let metadata = Arc::new(testing::metadata(dir.path()));
    let engine = SyncEngine::new(
        Arc::new(testing::store(dir.path(), &["Mondstadt"])),
        Arc::clone(&remote) as Arc<dyn RemoteSource>,
        features,
        Arc::clone(&metadata),
        SyncConfig {
            fetch_concurrency: 4,
        },
    );
    Harness {
        _dir: dir,
        remote,
        metadata,
        engine,
    }
}

fn mondstadt() -> Region {
    Region::new("Mondstadt", 0)
}

fn add_days(remote: &SheetSource<MemoryWorkbook>, from: usize, to: usize) {
    for d in from..to {
        remote
            .backend()
            .push_row("Mondstadt Data", testing::history_row(d));
    }
}

mod incremental_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_sync_reads_everything() {
        let h = harness(5);
        let region = mondstadt();
        assert_eq!(h.engine.state(&region), SyncState::Unsynced);

        assert!(h.engine.sync(&region).await.unwrap());
        assert_eq!(h.engine.state(&region), SyncState::Synced);

        let data = h.engine.store().load(&region).unwrap();
        assert_eq!(data.observations(), 5);
        assert!(data.is_aligned(&[
            FieldKey::Date,
            FieldKey::OreShown,
            FieldKey::OreHidden,
            FieldKey::YLabel,
            FieldKey::BLabel,
            FieldKey::Url,
            FieldKey::Feature,
        ]));
        assert_eq!(data.date[0], [2024, 1, 1]);
        assert_eq!(data.ore_shown[1], vec![1]);
        assert_eq!(data.ore_hidden[1], vec![3]);
        assert_eq!(data.feature[2], testing::features_for(2));
    }

    #[tokio::test]
    async fn test_ten_persisted_twelve_available() {
        let h = harness(10);
        let region = mondstadt();
        h.engine.sync(&region).await.unwrap();

        let before = h.engine.store().load(&region).unwrap();
        let stamp_before = h.metadata.load().unwrap().last_sync.unwrap();
        assert_eq!(before.observations(), 10);

        add_days(&h.remote, 10, 12);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(h.engine.sync(&region).await.unwrap());

        let after = h.engine.store().load(&region).unwrap();
        for key in [
            FieldKey::Date,
            FieldKey::OreShown,
            FieldKey::OreHidden,
            FieldKey::YLabel,
            FieldKey::BLabel,
            FieldKey::Url,
            FieldKey::Feature,
        ] {
            assert_eq!(after.len_of(key), 12, "field {key}");
        }

        // Earlier observations are untouched
        assert_eq!(after.date[..10], before.date[..]);
        assert_eq!(after.feature[..10], before.feature[..]);
        assert!(after.feature[10..].iter().all(|f| f.len() == before.feature[0].len()));

        let stamp_after = h.metadata.load().unwrap().last_sync.unwrap();
        assert!(stamp_after > stamp_before);
    }

    #[tokio::test]
    async fn test_second_sync_is_noop() {
        let h = harness(4);
        let region = mondstadt();
        assert!(h.engine.sync(&region).await.unwrap());
        let before = h.engine.store().load(&region).unwrap();
        let stamp = h.metadata.load().unwrap().last_sync;

        assert!(!h.engine.sync(&region).await.unwrap());
        assert_eq!(h.engine.store().load(&region).unwrap(), before);
        assert_eq!(h.metadata.load().unwrap().last_sync, stamp);
    }

    #[tokio::test]
    async fn test_shrinking_remote_is_clamped() {
        let h = harness(6);
        let region = mondstadt();
        h.engine.sync(&region).await.unwrap();

        h.remote
            .backend()
            .set_sheet("Mondstadt Data", testing::region_sheet(3));
        assert!(!h.engine.sync(&region).await.unwrap());
        assert_eq!(h.engine.store().load(&region).unwrap().observations(), 6);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let h = harness(3);
        h.remote.backend().fail_next(3);
        assert!(h.engine.sync(&mondstadt()).await.unwrap());
        assert_eq!(
            h.engine.store().load(&mondstadt()).unwrap().observations(),
            3
        );
    }

    #[tokio::test]
    async fn test_missing_marker_surfaces_layout_error() {
        let h = harness(3);
        let mut sheet = testing::region_sheet(3);
        sheet[0][5] = "Positions".into();
        h.remote.backend().set_sheet("Mondstadt Data", sheet);

        let err = h.engine.sync(&mondstadt()).await.unwrap_err();
        assert!(matches!(err, crate::error::Error::Layout(_)));
        assert_eq!(h.engine.state(&mondstadt()), SyncState::Unsynced);
    }
}

mod image_tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;

    const ALL_FIELDS: [FieldKey; 7] = [
        FieldKey::Date,
        FieldKey::OreShown,
        FieldKey::OreHidden,
        FieldKey::YLabel,
        FieldKey::BLabel,
        FieldKey::Url,
        FieldKey::Feature,
    ];

    /// Fails for one image, delegates the rest
    struct FlakyFeatures {
        broken: String,
    }

    #[async_trait]
    impl FeatureSource for FlakyFeatures {
        async fn features(&self, url: &str) -> Result<Vec<f32>> {
            if url == self.broken {
                return Err(Error::Feature {
                    url: url.to_string(),
                    reason: "connection reset".into(),
                });
            }
            FixedFeatures.features(url).await
        }
    }

    /// A region sheet whose header has no Image column
    fn sheet_without_images(days: usize) -> Vec<Vec<String>> {
        let mut sheet = testing::region_sheet(days);
        for row in sheet.iter_mut() {
            row.truncate(12);
        }
        sheet
    }

    #[tokio::test]
    async fn test_failed_fetch_keeps_series_aligned() {
        let features = Arc::new(FlakyFeatures {
            broken: "https://img.example/3.png".into(),
        });
        let h = harness_with(testing::workbook(&[("Mondstadt", 6)]), features);
        let region = mondstadt();
        assert!(h.engine.sync(&region).await.unwrap());

        let data = h.engine.store().load(&region).unwrap();
        assert_eq!(data.observations(), 6);
        assert_eq!(data.feature.len(), 6);
        assert!(data.is_aligned(&ALL_FIELDS));

        assert!(data.feature[3].is_empty());
        assert_eq!(data.url[3], "https://img.example/3.png");
        assert_eq!(data.feature[2], testing::features_for(2));
        assert_eq!(data.feature[4], testing::features_for(4));
    }

    #[tokio::test]
    async fn test_image_column_added_after_history() {
        let book = MemoryWorkbook::new().with_sheet("Mondstadt Data", sheet_without_images(5));
        let h = harness_with(book, Arc::new(FixedFeatures));
        let region = mondstadt();
        assert!(h.engine.sync(&region).await.unwrap());

        let before = h.engine.store().load(&region).unwrap();
        assert_eq!(before.observations(), 5);
        assert!(before.url.is_empty());
        assert!(before.feature.is_empty());

        h.remote
            .backend()
            .set_sheet("Mondstadt Data", testing::region_sheet(12));
        assert!(h.engine.sync(&region).await.unwrap());

        let data = h.engine.store().load(&region).unwrap();
        assert_eq!(data.observations(), 12);
        assert!(data.is_aligned(&ALL_FIELDS));
        assert!(data.url[..5].iter().all(String::is_empty));
        assert!(data.feature[..5].iter().all(Vec::is_empty));
        for d in 5..12 {
            assert_eq!(data.url[d], format!("https://img.example/{d}.png"));
            assert_eq!(data.feature[d], testing::features_for(d));
        }

        let leyline = crate::registry::build_dataset(crate::models::TaskKind::Leyline, &data);
        assert_eq!(leyline.rows, (5..12).collect::<Vec<_>>());
        for (row, d) in leyline.y.iter().zip(5..12) {
            let [y, b] = testing::labels_for(d);
            assert_eq!(row, &vec![y as i32, b as i32]);
        }
    }

    #[tokio::test]
    async fn test_image_column_removed_pads_new_rows() {
        let h = harness(4);
        let region = mondstadt();
        h.engine.sync(&region).await.unwrap();

        h.remote
            .backend()
            .set_sheet("Mondstadt Data", sheet_without_images(7));
        assert!(h.engine.sync(&region).await.unwrap());

        let data = h.engine.store().load(&region).unwrap();
        assert_eq!(data.observations(), 7);
        assert!(data.is_aligned(&ALL_FIELDS));
        assert_eq!(data.feature[3], testing::features_for(3));
        assert!(data.feature[4..].iter().all(Vec::is_empty));
    }

    #[test]
    fn test_align_pads_only_populated_series() {
        let existing = RegionData {
            date: vec![[2024, 1, 1]; 3],
            ..RegionData::default()
        };
        let mut batch = RegionData {
            date: vec![[2024, 1, 4]; 2],
            ..RegionData::default()
        };
        assert_eq!(align_image_series(&existing, &mut batch), 0);
        assert!(batch.url.is_empty());

        batch.url = vec!["a".into(), "b".into()];
        assert_eq!(align_image_series(&existing, &mut batch), 3);
        assert_eq!(batch.url, vec!["", "", "", "a", "b"]);
        assert!(batch.feature.is_empty());
    }
}

mod parse_tests {
    use super::*;
    use crate::remote::{RawBatch, RawRow, SheetLayout};

    fn raw(index: usize, date: &str, ores: &[&str], labels: &[&str]) -> RawRow {
        RawRow {
            index,
            date: date.into(),
            ore_cells: testing::cells(ores),
            label_cells: testing::cells(labels),
            url: None,
        }
    }

    #[test]
    fn test_malformed_rows_become_placeholders() {
        let layout = SheetLayout {
            marker_column: 6,
            label_end_column: 9,
            url_column: None,
        };
        let batch = RawBatch {
            start: 0,
            layout,
            rows: vec![
                raw(0, "01/01/24", &["", "1", "", "2"], &["y", "", "b"]),
                raw(1, "not a date", &["1", "", "", ""], &["", "y", "b"]),
                raw(2, "01/03/24", &["1", "7", "", ""], &["b", "y", ""]),
                raw(3, "01/04/24", &["", "", "", ""], &["", "", ""]),
            ],
        };

        let parsed = parse_batch(&batch);
        let data = &parsed.data;

        assert_eq!(data.observations(), 4);
        assert_eq!(parsed.errors.len(), 3);
        assert_eq!(data.url.len(), 0);

        assert_eq!(data.ore_shown[0], vec![1]);
        assert_eq!(data.ore_hidden[0], vec![3]);
        assert_eq!([data.y_label[0], data.b_label[0]], [0, 2]);

        assert_eq!(data.date[1], SENTINEL_DATE);
        assert_eq!(data.ore_shown[1], vec![0]);

        assert_eq!(data.ore_shown[2], vec![SENTINEL]);
        assert_eq!([data.y_label[2], data.b_label[2]], [1, 0]);

        assert_eq!(data.ore_shown[3], vec![SENTINEL]);
        assert_eq!([data.y_label[3], data.b_label[3]], [SENTINEL, SENTINEL]);
    }
}
