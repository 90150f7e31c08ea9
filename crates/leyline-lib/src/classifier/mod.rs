//! Classifiers used by the model registry
//!
//! This module provides:
//! - `Estimator`, the predict capability every fitted classifier offers
//! - `Classifier`, a smartcore random forest or multinomial logistic
//!   regression as persisted inside an artifact
//! - `MultiOutput`, one estimator per target column
//! - a seeded train/test split
//!
//! Fitting is deterministic for a given seed and fitted models serialise
//! with serde.

mod multi;
mod split;

pub use multi::MultiOutput;
pub use split::{min_training_rows, test_len, train_test_split, Split};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use smartcore::ensemble::random_forest_classifier::{
    RandomForestClassifier, RandomForestClassifierParameters,
};
use smartcore::error::Failed;
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;
use smartcore::linear::logistic_regression::{LogisticRegression, LogisticRegressionParameters};
use std::fmt;

/// Row-major feature matrix
pub type Matrix = Vec<Vec<f64>>;

type Forest = RandomForestClassifier<f64, i32, DenseMatrix<f64>, Vec<i32>>;
type Logistic = LogisticRegression<f64, i32, DenseMatrix<f64>, Vec<i32>>;

/// Which classifier family a task is trained with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorKind {
    LogisticRegression,
    RandomForest,
}

impl fmt::Display for EstimatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EstimatorKind::LogisticRegression => f.write_str("logistic_regression"),
            EstimatorKind::RandomForest => f.write_str("random_forest"),
        }
    }
}

/// Fit-time knobs shared by every estimator kind
#[derive(Debug, Clone, Copy)]
pub struct FitParams {
    pub seed: u64,
    pub forest_trees: usize,
}

/// Fitted single-output classifier over integer class labels
pub trait Estimator: Send + Sync {
    fn predict(&self, x: &DenseMatrix<f64>) -> Result<Vec<i32>>;

    /// Highest class probability per row; only ensembles provide one
    fn top_probability(&self, _x: &DenseMatrix<f64>) -> Result<Option<Vec<f64>>> {
        Ok(None)
    }
}

/// Any supported fitted estimator, as persisted inside an artifact
#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classifier {
    RandomForest(Forest),
    LogisticRegression(Logistic),
    /// A target column that only ever held one class
    Constant { kind: EstimatorKind, class: i32 },
}

impl Classifier {
    /// Fit an estimator of `kind` on one target column
    pub fn fit(kind: EstimatorKind, x: &DenseMatrix<f64>, y: &[i32], params: FitParams) -> Result<Self> {
        let classes = distinct_classes(y);
        match classes.as_slice() {
            [] => return Err(Error::Model("cannot fit on an empty training set".into())),
            [class] => {
                return Ok(Classifier::Constant {
                    kind,
                    class: *class,
                })
            }
            _ => {}
        }

        let y = y.to_vec();
        match kind {
            EstimatorKind::RandomForest => {
                let trees = u16::try_from(params.forest_trees.max(1)).unwrap_or(u16::MAX);
                let parameters = RandomForestClassifierParameters::default()
                    .with_n_trees(trees)
                    .with_seed(params.seed);
                Forest::fit(x, &y, parameters)
                    .map(Classifier::RandomForest)
                    .map_err(fit_failed)
            }
            EstimatorKind::LogisticRegression => {
                Logistic::fit(x, &y, LogisticRegressionParameters::default())
                    .map(Classifier::LogisticRegression)
                    .map_err(fit_failed)
            }
        }
    }

    pub fn kind(&self) -> EstimatorKind {
        match self {
            Classifier::RandomForest(_) => EstimatorKind::RandomForest,
            Classifier::LogisticRegression(_) => EstimatorKind::LogisticRegression,
            Classifier::Constant { kind, .. } => *kind,
        }
    }
}

impl Estimator for Classifier {
    fn predict(&self, x: &DenseMatrix<f64>) -> Result<Vec<i32>> {
        match self {
            Classifier::RandomForest(m) => m.predict(x).map_err(predict_failed),
            Classifier::LogisticRegression(m) => m.predict(x).map_err(predict_failed),
            Classifier::Constant { class, .. } => Ok(vec![*class; x.shape().0]),
        }
    }

    fn top_probability(&self, x: &DenseMatrix<f64>) -> Result<Option<Vec<f64>>> {
        match self {
            Classifier::RandomForest(m) => {
                let probs = m.predict_probs(x).map_err(predict_failed)?;
                let (rows, classes) = probs.shape();
                let top = (0..rows)
                    .map(|i| {
                        (0..classes)
                            .map(|j| *probs.get((i, j)))
                            .fold(0.0, f64::max)
                    })
                    .collect();
                Ok(Some(top))
            }
            // every tree of a single-class forest votes the same way
            Classifier::Constant {
                kind: EstimatorKind::RandomForest,
                ..
            } => Ok(Some(vec![1.0; x.shape().0])),
            _ => Ok(None),
        }
    }
}

fn fit_failed(e: Failed) -> Error {
    Error::Model(format!("fit failed: {e}"))
}

fn predict_failed(e: Failed) -> Error {
    Error::Model(format!("prediction failed: {e}"))
}

/// Sorted distinct labels
pub(crate) fn distinct_classes(y: &[i32]) -> Vec<i32> {
    let mut classes = y.to_vec();
    classes.sort_unstable();
    classes.dedup();
    classes
}

/// Dense matrix over `rows`, rejecting empty or ragged input
pub fn dense(rows: &[Vec<f64>]) -> Result<DenseMatrix<f64>> {
    let width = rows
        .first()
        .map(Vec::len)
        .ok_or_else(|| Error::Model("cannot build a matrix without rows".into()))?;
    if width == 0 || rows.iter().any(|row| row.len() != width) {
        return Err(Error::Model("feature rows differ in width".into()));
    }
    Ok(DenseMatrix::from_2d_vec(&rows.to_vec()))
}

/// Fraction of rows predicted correctly
pub fn accuracy(estimator: &dyn Estimator, x: &DenseMatrix<f64>, y: &[i32]) -> Result<f64> {
    if y.is_empty() {
        return Ok(0.0);
    }
    let predicted = estimator.predict(x)?;
    if predicted.len() != y.len() {
        return Err(Error::Model(format!(
            "{} predictions for {} targets",
            predicted.len(),
            y.len()
        )));
    }
    let truth: Vec<i32> = y.to_vec();
    Ok(smartcore::metrics::accuracy(&truth, &predicted))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: FitParams = FitParams {
        seed: 42,
        forest_trees: 10,
    };

    /// Three well-separated blobs at the corners of a triangle
    fn blobs() -> (DenseMatrix<f64>, Vec<i32>) {
        let mut x = Vec::new();
        let mut y = Vec::new();
        for i in 0..30 {
            let jx = (i % 5) as f64 * 0.1;
            let jy = (i % 3) as f64 * 0.1;
            x.push(vec![0.0 + jx, 0.0 + jy]);
            y.push(0);
            x.push(vec![10.0 + jx, 0.0 + jy]);
            y.push(3);
            x.push(vec![0.0 + jx, 10.0 + jy]);
            y.push(7);
        }
        (dense(&x).unwrap(), y)
    }

    #[test]
    fn test_both_kinds_learn_blobs() {
        let (x, y) = blobs();
        for kind in [EstimatorKind::LogisticRegression, EstimatorKind::RandomForest] {
            let model = Classifier::fit(kind, &x, &y, PARAMS).unwrap();
            assert_eq!(model.kind(), kind);
            assert!(accuracy(&model, &x, &y).unwrap() > 0.95, "{kind} underfits");
        }
    }

    #[test]
    fn test_only_forest_reports_probabilities() {
        let (x, y) = blobs();
        let logistic = Classifier::fit(EstimatorKind::LogisticRegression, &x, &y, PARAMS).unwrap();
        let forest = Classifier::fit(EstimatorKind::RandomForest, &x, &y, PARAMS).unwrap();

        assert!(logistic.top_probability(&x).unwrap().is_none());
        let top = forest.top_probability(&x).unwrap().unwrap();
        assert_eq!(top.len(), 90);
        assert!(top.iter().all(|p| *p >= 1.0 / 3.0 && *p <= 1.0));
    }

    #[test]
    fn test_single_class_column_is_constant() {
        let x = dense(&[vec![1.0], vec![2.0], vec![3.0]]).unwrap();
        let y = vec![4, 4, 4];
        for kind in [EstimatorKind::LogisticRegression, EstimatorKind::RandomForest] {
            let model = Classifier::fit(kind, &x, &y, PARAMS).unwrap();
            assert_eq!(model.kind(), kind);
            assert_eq!(model.predict(&x).unwrap(), vec![4, 4, 4]);
        }
    }

    #[test]
    fn test_serde_round_trip_preserves_predictions() {
        let (x, y) = blobs();
        let model = Classifier::fit(EstimatorKind::RandomForest, &x, &y, PARAMS).unwrap();

        let json = serde_json::to_string(&model).unwrap();
        let restored: Classifier = serde_json::from_str(&json).unwrap();
        assert_eq!(model.predict(&x).unwrap(), restored.predict(&x).unwrap());
    }

    #[test]
    fn test_rejects_ragged_input() {
        assert!(dense(&[]).is_err());
        assert!(dense(&[vec![1.0], vec![1.0, 2.0]]).is_err());
        assert!(dense(&[vec![], vec![]]).is_err());
    }
}
