//! Round-tagged storage of simulations.
//!
//! Batches are appended once and never mutated afterwards. Memory grows with every
//! call to [`SimulationStore::append`]; call [`SimulationStore::discard_rounds`] or
//! [`SimulationStore::clear`] to release old rounds.

use ndarray::{concatenate, Array2, ArrayView2, Axis};

use crate::error::{Result, SnreError};

/// One appended batch together with its round tag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBatch {
    pub theta: Array2<f32>,
    pub x: Array2<f32>,
    pub round: usize,
}

impl StoredBatch {
    /// Every row of a round-0 batch was drawn from the prior.
    pub fn from_prior(&self) -> bool {
        self.round == 0
    }
}

/// Simulations selected for a training call.
#[derive(Debug, Clone, PartialEq)]
pub struct Simulations {
    pub theta: Array2<f32>,
    pub x: Array2<f32>,
    /// `true` for rows that were drawn from the prior.
    pub prior_mask: Vec<bool>,
}

impl Simulations {
    pub fn len(&self) -> usize {
        self.theta.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.nrows() == 0
    }
}

/// Append-only sequence of simulation batches.
#[derive(Debug, Clone, Default)]
pub struct SimulationStore {
    batches: Vec<StoredBatch>,
}

impl SimulationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a batch produced in round `from_round`.
    ///
    /// Only shapes are validated here; non-finite `x` values are dealt with when the
    /// simulations are read back for training.
    pub fn append(&mut self, theta: Array2<f32>, x: Array2<f32>, from_round: usize) -> Result<()> {
        if theta.nrows() != x.nrows() {
            return Err(SnreError::BatchMismatch {
                theta: theta.nrows(),
                x: x.nrows(),
            });
        }
        if let Some(first) = self.batches.first() {
            if first.theta.ncols() != theta.ncols() || first.x.ncols() != x.ncols() {
                return Err(SnreError::invalid(
                    "theta/x",
                    format!(
                        "expected {} theta and {} x columns, got {} and {}",
                        first.theta.ncols(),
                        first.x.ncols(),
                        theta.ncols(),
                        x.ncols()
                    ),
                ));
            }
        }
        self.batches.push(StoredBatch {
            theta,
            x,
            round: from_round,
        });
        Ok(())
    }

    pub fn batches(&self) -> &[StoredBatch] {
        &self.batches
    }

    /// Total number of stored rows.
    pub fn len(&self) -> usize {
        self.batches.iter().map(|b| b.theta.nrows()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Highest round tag seen so far.
    pub fn max_round(&self) -> Option<usize> {
        self.batches.iter().map(|b| b.round).max()
    }

    /// Column counts `(dim_theta, dim_x)` of the stored batches.
    pub fn dims(&self) -> Option<(usize, usize)> {
        self.batches.first().map(|b| (b.theta.ncols(), b.x.ncols()))
    }

    /// Concatenates all batches from `starting_round` on.
    ///
    /// With `exclude_invalid_x`, rows whose `x` contains NaN or ±Inf are dropped and a
    /// warning is logged.
    pub fn simulations(&self, starting_round: usize, exclude_invalid_x: bool) -> Result<Simulations> {
        let selected: Vec<&StoredBatch> = self
            .batches
            .iter()
            .filter(|b| b.round >= starting_round)
            .collect();
        if selected.is_empty() {
            return Err(SnreError::NoSimulations);
        }

        let theta_views: Vec<ArrayView2<f32>> = selected.iter().map(|b| b.theta.view()).collect();
        let x_views: Vec<ArrayView2<f32>> = selected.iter().map(|b| b.x.view()).collect();
        let theta = concatenate(Axis(0), &theta_views)?;
        let x = concatenate(Axis(0), &x_views)?;
        let prior_mask: Vec<bool> = selected
            .iter()
            .flat_map(|b| std::iter::repeat(b.from_prior()).take(b.theta.nrows()))
            .collect();

        if !exclude_invalid_x {
            return Ok(Simulations {
                theta,
                x,
                prior_mask,
            });
        }

        let valid: Vec<usize> = x
            .axis_iter(Axis(0))
            .enumerate()
            .filter(|(_, row)| row.iter().all(|v| v.is_finite()))
            .map(|(i, _)| i)
            .collect();
        let num_invalid = x.nrows() - valid.len();
        if num_invalid == 0 {
            return Ok(Simulations {
                theta,
                x,
                prior_mask,
            });
        }

        let invalid_prior = prior_mask
            .iter()
            .enumerate()
            .filter(|&(i, &p)| p && valid.binary_search(&i).is_err())
            .count();
        tracing::warn!(
            num_invalid,
            from_prior = invalid_prior,
            total = x.nrows(),
            "found simulations with NaN or infinite x; they are excluded from training"
        );
        if valid.is_empty() {
            return Err(SnreError::NoSimulations);
        }

        Ok(Simulations {
            theta: theta.select(Axis(0), &valid),
            x: x.select(Axis(0), &valid),
            prior_mask: valid.iter().map(|&i| prior_mask[i]).collect(),
        })
    }

    /// Drops every batch tagged with a round `<= max_round` and returns the number
    /// of rows removed.
    pub fn discard_rounds(&mut self, max_round: usize) -> usize {
        let before = self.len();
        self.batches.retain(|b| b.round > max_round);
        before - self.len()
    }

    pub fn clear(&mut self) {
        self.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};

    fn batch(n: usize, fill: f32) -> (Array2<f32>, Array2<f32>) {
        (
            Array2::from_elem((n, 2), fill),
            Array2::from_elem((n, 3), fill),
        )
    }

    #[test]
    fn test_append_rejects_row_mismatch() {
        let mut store = SimulationStore::new();
        let err = store
            .append(Array2::zeros((4, 1)), Array2::zeros((5, 1)), 0)
            .unwrap_err();
        assert!(matches!(err, SnreError::BatchMismatch { theta: 4, x: 5 }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_append_rejects_column_change() {
        let mut store = SimulationStore::new();
        let (t, x) = batch(3, 0.0);
        store.append(t, x, 0).unwrap();
        let err = store
            .append(Array2::zeros((3, 1)), Array2::zeros((3, 3)), 1)
            .unwrap_err();
        assert!(matches!(err, SnreError::InvalidArgument { .. }));
    }

    #[test]
    fn test_simulations_respects_starting_round() {
        let mut store = SimulationStore::new();
        let (t0, x0) = batch(4, 0.0);
        let (t1, x1) = batch(3, 1.0);
        store.append(t0, x0, 0).unwrap();
        store.append(t1, x1, 1).unwrap();

        let all = store.simulations(0, true).unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all.prior_mask.iter().filter(|&&p| p).count(), 4);

        let later = store.simulations(1, true).unwrap();
        assert_eq!(later.len(), 3);
        assert!(later.prior_mask.iter().all(|&p| !p));
        assert!(later.theta.iter().all(|&v| v == 1.0));
        assert_eq!(store.max_round(), Some(1));
    }

    #[test]
    fn test_invalid_x_is_filtered() {
        let mut store = SimulationStore::new();
        let theta = array![[0.0_f32], [1.0], [2.0], [3.0]];
        let x = array![[0.0_f32], [f32::NAN], [2.0], [f32::INFINITY]];
        store.append(theta, x, 0).unwrap();

        let filtered = store.simulations(0, true).unwrap();
        assert_eq!(filtered.theta, array![[0.0_f32], [2.0]]);
        assert_eq!(filtered.prior_mask, vec![true, true]);

        let raw = store.simulations(0, false).unwrap();
        assert_eq!(raw.len(), 4);
    }

    #[test]
    fn test_empty_selection_is_an_error() {
        let mut store = SimulationStore::new();
        assert!(matches!(store.simulations(0, true), Err(SnreError::NoSimulations)));
        let (t, x) = batch(2, 0.0);
        store.append(t, x, 0).unwrap();
        assert!(matches!(store.simulations(1, true), Err(SnreError::NoSimulations)));
    }

    #[test]
    fn test_discard_and_clear() {
        let mut store = SimulationStore::new();
        for round in 0..3 {
            let (t, x) = batch(2 + round, round as f32);
            store.append(t, x, round).unwrap();
        }
        assert_eq!(store.len(), 9);
        assert_eq!(store.discard_rounds(0), 2);
        assert_eq!(store.len(), 7);
        assert_eq!(store.batches()[0].round, 1);
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.max_round(), None);
    }
}
