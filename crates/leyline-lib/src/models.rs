//! Core data models for the synchronisation pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

/// Marker meaning "field absent / not found"; real indices are always >= 0
pub const SENTINEL: i32 = -2;

/// Day triple stored per observation: `[year, month, day]`
pub type DateTriple = [i32; 3];

/// Date stored for an observation whose date cell could not be parsed
pub const SENTINEL_DATE: DateTriple = [SENTINEL, SENTINEL, SENTINEL];

/// A named partition of the dataset with its own history and models
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    /// Position in the configured region list
    pub ordinal: usize,
}

impl Region {
    pub fn new(name: impl Into<String>, ordinal: usize) -> Self {
        Self {
            name: name.into(),
            ordinal,
        }
    }

    /// Lower-cased name used in file names
    pub fn file_stem(&self) -> String {
        self.name.to_lowercase()
    }

    /// Name of the region's dedicated sheet
    pub fn sheet_name(&self) -> String {
        format!("{} Data", self.name)
    }

    /// 1-based row of this region in the combined sheet
    pub fn combined_row(&self) -> usize {
        (self.ordinal + 1) * 3
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Semantic field persisted per region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKey {
    Date,
    OreShown,
    OreHidden,
    Feature,
    Url,
    YLabel,
    BLabel,
    /// Legacy combined `[y, b]` pair; loaded when present, never written
    Label,
}

impl FieldKey {
    pub const ALL: [FieldKey; 8] = [
        FieldKey::Date,
        FieldKey::OreShown,
        FieldKey::OreHidden,
        FieldKey::Feature,
        FieldKey::Url,
        FieldKey::YLabel,
        FieldKey::BLabel,
        FieldKey::Label,
    ];

    /// Fields every region writes on sync
    pub const TABULAR: [FieldKey; 5] = [
        FieldKey::Date,
        FieldKey::OreShown,
        FieldKey::OreHidden,
        FieldKey::YLabel,
        FieldKey::BLabel,
    ];

    /// Fields written only by image-based regions
    pub const IMAGE: [FieldKey; 2] = [FieldKey::Url, FieldKey::Feature];

    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKey::Date => "date",
            FieldKey::OreShown => "ore_shown",
            FieldKey::OreHidden => "ore_hidden",
            FieldKey::Feature => "feature",
            FieldKey::Url => "url",
            FieldKey::YLabel => "y_label",
            FieldKey::BLabel => "b_label",
            FieldKey::Label => "label",
        }
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predictive objective trained per region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Image features -> yellow and blue leyline positions
    Leyline,
    /// Date and leyline labels -> shown ore positions
    Location,
    /// Date, shown ores and leyline labels -> hidden ore positions
    Mining,
}

impl TaskKind {
    pub const ALL: [TaskKind; 3] = [TaskKind::Leyline, TaskKind::Location, TaskKind::Mining];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Leyline => "leyline",
            TaskKind::Location => "location",
            TaskKind::Mining => "mining",
        }
    }

    /// Fields that must be persisted before this task can be trained
    pub fn required_fields(&self) -> &'static [FieldKey] {
        match self {
            TaskKind::Leyline => &[FieldKey::Feature, FieldKey::YLabel, FieldKey::BLabel],
            TaskKind::Location => &[
                FieldKey::Date,
                FieldKey::YLabel,
                FieldKey::BLabel,
                FieldKey::OreShown,
            ],
            TaskKind::Mining => &[
                FieldKey::Date,
                FieldKey::OreShown,
                FieldKey::YLabel,
                FieldKey::BLabel,
                FieldKey::OreHidden,
            ],
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "leyline" => Ok(TaskKind::Leyline),
            "location" => Ok(TaskKind::Location),
            "mining" => Ok(TaskKind::Mining),
            other => Err(format!("unknown task {:?}", other)),
        }
    }
}

/// All field series for one region. Index `i` across fields is one observation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegionData {
    pub date: Vec<DateTriple>,
    pub ore_shown: Vec<Vec<i32>>,
    pub ore_hidden: Vec<Vec<i32>>,
    pub feature: Vec<Vec<f32>>,
    pub url: Vec<String>,
    pub y_label: Vec<i32>,
    pub b_label: Vec<i32>,
    pub label: Vec<[i32; 2]>,
}

impl RegionData {
    /// Length of one field series
    pub fn len_of(&self, key: FieldKey) -> usize {
        match key {
            FieldKey::Date => self.date.len(),
            FieldKey::OreShown => self.ore_shown.len(),
            FieldKey::OreHidden => self.ore_hidden.len(),
            FieldKey::Feature => self.feature.len(),
            FieldKey::Url => self.url.len(),
            FieldKey::YLabel => self.y_label.len(),
            FieldKey::BLabel => self.b_label.len(),
            FieldKey::Label => self.label.len(),
        }
    }

    /// Number of persisted observations; the sync cursor
    pub fn observations(&self) -> usize {
        self.date.len()
    }

    /// Fields holding at least one value
    pub fn populated_fields(&self) -> Vec<FieldKey> {
        FieldKey::ALL
            .into_iter()
            .filter(|k| self.len_of(*k) > 0)
            .collect()
    }

    /// True when all given fields have the same length
    pub fn is_aligned(&self, fields: &[FieldKey]) -> bool {
        let mut lens = fields.iter().map(|k| self.len_of(*k));
        match lens.next() {
            Some(first) => lens.all(|l| l == first),
            None => true,
        }
    }

    /// Extend every series by the matching series of `other`
    pub fn extend_from(&mut self, other: &RegionData) {
        self.date.extend_from_slice(&other.date);
        self.ore_shown.extend_from_slice(&other.ore_shown);
        self.ore_hidden.extend_from_slice(&other.ore_hidden);
        self.feature.extend_from_slice(&other.feature);
        self.url.extend_from_slice(&other.url);
        self.y_label.extend_from_slice(&other.y_label);
        self.b_label.extend_from_slice(&other.b_label);
        self.label.extend_from_slice(&other.label);
    }

    /// Feature vector of observation `index`. A feature series shorter than
    /// the date series covers the most recent observations.
    pub fn feature_of(&self, index: usize) -> Option<&[f32]> {
        let offset = self.date.len().saturating_sub(self.feature.len());
        self.feature
            .get(index.checked_sub(offset)?)
            .map(Vec::as_slice)
    }

    /// Image URL of observation `index`, aligned like `feature_of`
    pub fn url_of(&self, index: usize) -> Option<&str> {
        let offset = self.date.len().saturating_sub(self.url.len());
        self.url.get(index.checked_sub(offset)?).map(String::as_str)
    }

    /// Yellow/blue pair at `index`, falling back to the legacy label field
    pub fn label_pair(&self, index: usize) -> Option<[i32; 2]> {
        match (self.y_label.get(index), self.b_label.get(index)) {
            (Some(y), Some(b)) => Some([*y, *b]),
            _ => self.label.get(index).copied(),
        }
    }
}

/// Today's inputs read from a region's row of the combined sheet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TodayRow {
    pub date: DateTriple,
    pub ore_shown: Vec<i32>,
    pub leyline: [i32; 2],
    pub url: Option<String>,
}

/// Format 0-based indices as the 1-based list shown to users
pub fn format_positions(indices: &[i32]) -> String {
    let items: Vec<String> = indices.iter().map(|i| format!("{:2}", i + 1)).collect();
    format!("[{}]", items.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rows_and_names() {
        let region = Region::new("Mondstadt", 0);
        assert_eq!(region.combined_row(), 3);
        assert_eq!(Region::new("Liyue", 1).combined_row(), 6);
        assert_eq!(region.file_stem(), "mondstadt");
        assert_eq!(region.sheet_name(), "Mondstadt Data");
    }

    #[test]
    fn test_alignment() {
        let mut data = RegionData::default();
        assert!(data.is_aligned(&FieldKey::TABULAR));

        data.date.push([2024, 3, 14]);
        assert!(!data.is_aligned(&FieldKey::TABULAR));

        data.ore_shown.push(vec![1]);
        data.ore_hidden.push(vec![3]);
        data.y_label.push(1);
        data.b_label.push(3);
        assert!(data.is_aligned(&FieldKey::TABULAR));
        assert_eq!(data.observations(), 1);
    }

    #[test]
    fn test_label_pair_falls_back_to_legacy() {
        let data = RegionData {
            label: vec![[4, 6]],
            ..Default::default()
        };
        assert_eq!(data.label_pair(0), Some([4, 6]));
        assert_eq!(data.label_pair(1), None);
    }

    #[test]
    fn test_image_fields_by_observation() {
        let data = RegionData {
            date: vec![[2024, 1, 1], [2024, 1, 2], [2024, 1, 3]],
            feature: vec![vec![0.5]],
            url: vec!["a".into(), "b".into(), "c".into()],
            ..Default::default()
        };
        assert_eq!(data.feature_of(0), None);
        assert_eq!(data.feature_of(2), Some(&[0.5][..]));
        assert_eq!(data.url_of(1), Some("b"));
        assert_eq!(data.url_of(3), None);
    }

    #[test]
    fn test_task_from_str() {
        assert_eq!("Mining".parse::<TaskKind>(), Ok(TaskKind::Mining));
        assert!("nation".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_format_positions() {
        assert_eq!(format_positions(&[0, 6]), "[ 1,  7]");
        assert_eq!(format_positions(&[]), "[]");
    }
}
