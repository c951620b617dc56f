//! Convergence diagnostics for multi-chain MCMC output.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use num_traits::ToPrimitive;

use crate::error::{Result, SnreError};

/// Online potential scale reduction factor (R-hat) for several chains.
///
/// Feed one `[n_chains, n_params]` draw per [`RhatMulti::step`]; the estimate uses
/// running means and second moments, so memory does not grow with the chain length.
#[derive(Debug, Clone, PartialEq)]
pub struct RhatMulti {
    n: usize,
    mean: Array2<f64>,    // n_chains x n_params
    mean_sq: Array2<f64>, // n_chains x n_params
    n_chains: usize,
    n_params: usize,
}

impl RhatMulti {
    pub fn new(n_chains: usize, n_params: usize) -> Self {
        Self {
            n: 0,
            mean: Array2::zeros((n_chains, n_params)),
            mean_sq: Array2::zeros((n_chains, n_params)),
            n_chains,
            n_params,
        }
    }

    /// Adds one draw per chain, flattened chain-major.
    pub fn step<T: ToPrimitive + Clone>(&mut self, x: &[T]) -> Result<()> {
        let x_arr = ArrayView2::from_shape((self.n_chains, self.n_params), x)?
            .mapv(|v| v.to_f64().unwrap_or(f64::NAN));

        self.n += 1;
        let n = self.n as f64;
        self.mean = (&self.mean * (n - 1.0) + &x_arr) / n;
        self.mean_sq = (&self.mean_sq * (n - 1.0) + x_arr.pow2()) / n;
        Ok(())
    }

    /// R-hat for every parameter.
    pub fn all(&self) -> Result<Array1<f64>> {
        if self.n < 2 || self.n_chains < 2 {
            return Err(SnreError::invalid(
                "rhat",
                "needs at least two chains and two draws per chain",
            ));
        }
        let n = self.n as f64;
        let n_chains = self.n_chains as f64;
        let grand_mean = self
            .mean
            .mean_axis(Axis(0))
            .ok_or_else(|| SnreError::invalid("rhat", "no chains"))?;
        let between = (&self.mean - &grand_mean.insert_axis(Axis(0)))
            .pow2()
            .sum_axis(Axis(0))
            * (n / (n_chains - 1.0));
        let sm2 = (&self.mean_sq - &self.mean.pow2()) * (n / (n - 1.0));
        let within = sm2
            .mean_axis(Axis(0))
            .ok_or_else(|| SnreError::invalid("rhat", "no chains"))?;
        let var = &within * ((n - 1.0) / n) + between * (1.0 / n);
        Ok((var / within).sqrt())
    }

    /// Largest R-hat over all parameters, ignoring NaNs.
    pub fn max(&self) -> Result<f64> {
        Ok(*self.all()?.max_skipnan())
    }
}

/// R-hat of samples laid out as `[n_chains, n_draws, n_params]`.
pub fn rhat(samples: &Array3<f32>) -> Result<Array1<f64>> {
    let (n_chains, n_draws, n_params) = samples.dim();
    let mut psr = RhatMulti::new(n_chains, n_params);
    for d in 0..n_draws {
        let draw = samples.slice(s![.., d, ..]).to_owned();
        psr.step(draw.as_slice().unwrap_or(&[]))?;
    }
    psr.all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rhat_of(data0: Array2<f64>, data1: Array2<f64>) -> Array1<f64> {
        let mut psr = RhatMulti::new(3, 4);
        psr.step(data0.as_slice().unwrap()).unwrap();
        psr.step(data1.as_slice().unwrap()).unwrap();
        psr.all().unwrap()
    }

    #[test]
    fn test_rhat_two_draws() {
        let step_0 = arr2(&[
            [0.0, 1.0, 0.0, 1.0],
            [1.0, 2.0, 0.0, 2.0],
            [0.0, 0.0, 0.0, 2.0],
        ]);
        let step_1 = arr2(&[
            [1.0, 2.0, 2.0, 0.0],
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 1.0, 0.0, 0.0],
        ]);
        let expected = array![std::f64::consts::SQRT_2, 1.08012345, 0.89442719, 0.8660254];
        let got = rhat_of(step_0, step_1);
        let diff = *(&got - &expected).abs().max().unwrap();
        assert!(diff < 1e-7, "Got {got:?}, expected {expected:?}");
    }

    #[test]
    fn test_rhat_from_chain_major_samples() {
        // Same draws as above, laid out as [chains, draws, params].
        let mut samples = Array3::<f32>::zeros((3, 2, 4));
        let step_0 = [[0.0, 1.0, 0.0, 1.0], [1.0, 2.0, 0.0, 2.0], [0.0, 0.0, 0.0, 2.0]];
        let step_1 = [[1.0, 2.0, 2.0, 0.0], [1.0, 1.0, 1.0, 1.0], [0.0, 1.0, 0.0, 0.0]];
        for c in 0..3 {
            for p in 0..4 {
                samples[[c, 0, p]] = step_0[c][p];
                samples[[c, 1, p]] = step_1[c][p];
            }
        }
        let got = rhat(&samples).unwrap();
        assert!((got[0] - std::f64::consts::SQRT_2).abs() < 1e-6);
        assert!((got[3] - 0.8660254).abs() < 1e-6);
    }

    #[test]
    fn test_rhat_needs_two_chains() {
        let mut psr = RhatMulti::new(1, 1);
        psr.step(&[1.0_f64]).unwrap();
        psr.step(&[2.0_f64]).unwrap();
        assert!(psr.all().is_err());
    }

    #[test]
    fn test_rhat_rejects_wrong_length() {
        let mut psr = RhatMulti::new(2, 2);
        assert!(matches!(psr.step(&[1.0_f64; 3]), Err(SnreError::Shape(_))));
    }
}
