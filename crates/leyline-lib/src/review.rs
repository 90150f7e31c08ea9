//! Ranking of persisted observations for human review
//!
//! Every usable observation is run back through its task's model and
//! ordered by estimator agreement, least first, so that the entries most
//! likely to be mislabelled come up for audit before the rest.

use crate::error::Result;
use crate::models::{DateTriple, RegionData, TaskKind};
use crate::parse::triple_to_date;
use crate::registry::{build_dataset, ModelArtifact};
use crate::remote::FIRST_DATA_ROW;
use serde::Serialize;

/// One observation as the model sees it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewEntry {
    /// 0-based observation index
    pub index: usize,
    pub date: Option<DateTriple>,
    /// Estimator agreement; `None` for models without class probabilities
    pub agreement: Option<f64>,
    pub predicted: Vec<i32>,
    pub recorded: Vec<i32>,
    pub url: Option<String>,
    /// Row of the observation in the region's dedicated sheet
    pub sheet_row: usize,
}

impl ReviewEntry {
    pub fn matches(&self) -> bool {
        self.predicted == self.recorded
    }

    /// Ranking key: the agreement, or 1/0 for a match/mismatch when the
    /// model has no probabilities
    pub fn score(&self) -> f64 {
        self.agreement
            .unwrap_or(if self.matches() { 1.0 } else { 0.0 })
    }
}

/// Score every usable observation of `data` with `artifact`, lowest first
pub fn rank(task: TaskKind, data: &RegionData, artifact: &ModelArtifact) -> Result<Vec<ReviewEntry>> {
    let dataset = build_dataset(task, data);
    let first_day = data.date.iter().find_map(|d| triple_to_date(*d));

    let mut entries = Vec::with_capacity(dataset.len());
    for ((x, recorded), &index) in dataset.x.iter().zip(&dataset.y).zip(&dataset.rows) {
        let date = data.date.get(index).copied();
        let day = date.and_then(triple_to_date);
        let sheet_row = match (day, first_day) {
            (Some(day), Some(first)) => FIRST_DATA_ROW + (day - first).num_days().max(0) as usize,
            _ => FIRST_DATA_ROW + index,
        };

        entries.push(ReviewEntry {
            index,
            date,
            agreement: artifact.agreement(x),
            predicted: artifact.predict(x)?,
            recorded: recorded.clone(),
            url: data.url_of(index).filter(|u| !u.is_empty()).map(str::to_string),
            sheet_row,
        });
    }

    entries.sort_by(|a, b| a.score().total_cmp(&b.score()).then(a.index.cmp(&b.index)));
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{EstimatorKind, FitParams, MultiOutput};
    use crate::models::SENTINEL;
    use crate::parse::date_triple;
    use crate::testing::day;
    use chrono::Utc;

    fn data() -> RegionData {
        let mut data = RegionData::default();
        for d in 0..12 {
            data.date.push(date_triple(day(d * 2)));
            data.ore_shown.push(vec![(d % 2) as i32]);
            data.ore_hidden.push(vec![(d % 2) as i32 + 2]);
            data.y_label.push(1);
            data.b_label.push(2);
            data.url.push(format!("https://img.example/{d}.png"));
        }
        data
    }

    fn artifact(kind: EstimatorKind, data: &RegionData) -> ModelArtifact {
        let dataset = build_dataset(TaskKind::Mining, data);
        let params = FitParams {
            seed: 42,
            forest_trees: 5,
        };
        let model = MultiOutput::fit(kind, &dataset.x, &dataset.y, params).unwrap();
        ModelArtifact {
            region: "Mondstadt".into(),
            task: TaskKind::Mining,
            model,
            accuracy: 1.0,
            per_output: vec![1.0],
            input_width: dataset.x[0].len(),
            train_rows: dataset.len(),
            test_rows: 0,
            trained_at: Utc::now(),
        }
    }

    #[test]
    fn test_sorted_by_agreement() {
        let data = data();
        let entries = rank(TaskKind::Mining, &data, &artifact(EstimatorKind::RandomForest, &data)).unwrap();
        assert_eq!(entries.len(), 12);
        assert!(entries.windows(2).all(|w| w[0].score() <= w[1].score()));
        assert!(entries.iter().all(|e| e.agreement.is_some()));
    }

    #[test]
    fn test_sheet_row_follows_calendar_days() {
        let mut data = data();
        data.y_label[0] = SENTINEL;
        let entries = rank(TaskKind::Mining, &data, &artifact(EstimatorKind::RandomForest, &data)).unwrap();

        let third = entries.iter().find(|e| e.index == 3).unwrap();
        assert_eq!(third.sheet_row, 3 + 6);
        assert_eq!(third.url.as_deref(), Some("https://img.example/3.png"));
        assert!(entries.iter().all(|e| e.index != 0));
    }

    #[test]
    fn test_mismatches_first_without_probabilities() {
        let data = data();
        let model = artifact(EstimatorKind::LogisticRegression, &data);
        let mut relabelled = data.clone();
        relabelled.ore_hidden[5] = vec![0];

        let entries = rank(TaskKind::Mining, &relabelled, &model).unwrap();
        assert!(entries.iter().all(|e| e.agreement.is_none()));
        let relabelled_entry = entries.iter().position(|e| e.index == 5).unwrap();
        assert!(!entries[relabelled_entry].matches());
        assert!(entries[..relabelled_entry].iter().all(|e| !e.matches()));
    }
}
