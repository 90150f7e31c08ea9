//! One estimator per target column

use super::{accuracy, dense, Classifier, Estimator, EstimatorKind, FitParams};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Multi-output classifier: target column `j` is predicted by `estimators[j]`
#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct MultiOutput {
    kind: EstimatorKind,
    estimators: Vec<Classifier>,
}

impl MultiOutput {
    /// Fit one estimator per column of `y`; every row of `y` has the same width
    pub fn fit(kind: EstimatorKind, x: &[Vec<f64>], y: &[Vec<i32>], params: FitParams) -> Result<Self> {
        let width = y
            .first()
            .map(Vec::len)
            .ok_or_else(|| Error::Model("cannot fit on an empty training set".into()))?;
        if width == 0 || y.iter().any(|row| row.len() != width) {
            return Err(Error::Model("target rows differ in width".into()));
        }
        if x.len() != y.len() {
            return Err(Error::Model(format!(
                "{} feature rows but {} targets",
                x.len(),
                y.len()
            )));
        }

        let features = dense(x)?;
        let estimators = (0..width)
            .map(|j| {
                let column: Vec<i32> = y.iter().map(|row| row[j]).collect();
                Classifier::fit(kind, &features, &column, params)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { kind, estimators })
    }

    pub fn kind(&self) -> EstimatorKind {
        self.kind
    }

    pub fn outputs(&self) -> usize {
        self.estimators.len()
    }

    /// Predict every target column for one feature row
    pub fn predict(&self, row: &[f64]) -> Result<Vec<i32>> {
        let x = dense(&[row.to_vec()])?;
        let mut predicted = Vec::with_capacity(self.estimators.len());
        for estimator in &self.estimators {
            let column = estimator.predict(&x)?;
            predicted.push(column.first().copied().ok_or_else(|| {
                Error::Model("estimator returned no prediction".into())
            })?);
        }
        Ok(predicted)
    }

    /// Per-output held-out accuracy
    pub fn per_output_accuracy(&self, x: &[Vec<f64>], y: &[Vec<i32>]) -> Result<Vec<f64>> {
        if x.is_empty() {
            return Ok(vec![0.0; self.estimators.len()]);
        }
        let features = dense(x)?;
        self.estimators
            .iter()
            .enumerate()
            .map(|(j, e)| {
                let column: Vec<i32> = y.iter().map(|row| row[j]).collect();
                accuracy(e, &features, &column)
            })
            .collect()
    }

    /// Mean per-output accuracy
    pub fn score(&self, x: &[Vec<f64>], y: &[Vec<i32>]) -> Result<f64> {
        let per_output = self.per_output_accuracy(x, y)?;
        if per_output.is_empty() {
            return Ok(0.0);
        }
        Ok(per_output.iter().sum::<f64>() / per_output.len() as f64)
    }

    /// Ensemble-agreement proxy: the mean over output estimators of each
    /// one's highest class probability. This is not a calibrated
    /// probability. `None` when the estimators expose no probabilities.
    pub fn agreement(&self, row: &[f64]) -> Option<f64> {
        if self.estimators.is_empty() {
            return None;
        }
        let x = dense(&[row.to_vec()]).ok()?;
        let mut total = 0.0;
        for estimator in &self.estimators {
            let top = estimator.top_probability(&x).ok()??;
            total += top.first().copied()?;
        }
        Some(total / self.estimators.len() as f64)
    }
}
