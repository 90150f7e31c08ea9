//! Seeded train/test split

use crate::error::{Error, Result};
use smartcore::linalg::basic::arrays::Array;
use smartcore::linalg::basic::matrix::DenseMatrix;

/// Row indices of a train/test partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

/// Rows held out of `n`: `floor(n * test_fraction)` in single precision,
/// the way smartcore sizes its test set
pub fn test_len(n: usize, test_fraction: f64) -> usize {
    (n as f32 * test_fraction as f32) as usize
}

/// Fewest observations that leave at least one row on each side
pub fn min_training_rows(test_fraction: f64) -> usize {
    let mut n = 2;
    while n < 1_000_000 {
        let held_out = test_len(n, test_fraction);
        if held_out >= 1 && held_out < n {
            return n;
        }
        n += 1;
    }
    n
}

/// Shuffle the rows of `x` with `seed` and hold out `test_len` of them
pub fn train_test_split(x: &DenseMatrix<f64>, test_fraction: f64, seed: u64) -> Result<Split> {
    let n = x.shape().0;
    let held_out = test_len(n, test_fraction);
    if !(test_fraction > 0.0 && test_fraction < 1.0) || held_out == 0 || held_out >= n {
        return Err(Error::Model(format!(
            "cannot hold out {test_fraction} of {n} rows"
        )));
    }

    let rows: Vec<usize> = (0..n).collect();
    let (_, _, train, test) = smartcore::model_selection::train_test_split(
        x,
        &rows,
        test_fraction as f32,
        true,
        Some(seed),
    );
    Ok(Split { train, test })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::dense;

    fn rows(n: usize) -> DenseMatrix<f64> {
        dense(&(0..n).map(|i| vec![i as f64]).collect::<Vec<_>>()).unwrap()
    }

    #[test]
    fn test_eighty_twenty() {
        let split = train_test_split(&rows(50), 0.2, 42).unwrap();
        assert_eq!(split.test.len(), 10);
        assert_eq!(split.train.len(), 40);

        let mut all: Vec<usize> = split.train.iter().chain(&split.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_fixed_seed_is_reproducible() {
        let x = rows(30);
        assert_eq!(
            train_test_split(&x, 0.2, 42).unwrap(),
            train_test_split(&x, 0.2, 42).unwrap()
        );
    }

    #[test]
    fn test_too_few_rows_to_hold_out() {
        assert_eq!(min_training_rows(0.2), 5);
        assert_eq!(min_training_rows(0.5), 2);
        assert!(train_test_split(&rows(4), 0.2, 42).is_err());
        assert_eq!(train_test_split(&rows(5), 0.2, 42).unwrap().test.len(), 1);
    }
}
