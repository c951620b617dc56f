/*!
Target, proposal and prior distributions.

- [`Target`] and [`Proposal`] drive the random-walk Metropolis–Hastings sampler.
- [`Prior`] is the narrow contract the posterior needs from a prior: draw samples,
  evaluate log-densities on the host and on a batch of tensors.

# Examples

```rust
use mini_snre::distributions::{BoxUniform, IsotropicGaussian, Prior, Proposal};
use rand::rngs::SmallRng;
use rand::SeedableRng;

let prior = BoxUniform::new(vec![0.0, 0.0], vec![1.0, 2.0]).unwrap();
let mut rng = SmallRng::seed_from_u64(0);
let theta = prior.sample(&mut rng);
assert!(prior.log_prob(&theta).is_finite());

let mut proposal: IsotropicGaussian<f32> = IsotropicGaussian::new(0.5).set_seed(1);
let candidate = proposal.sample(&theta);
assert_eq!(candidate.len(), 2);
```
*/

use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::TensorData;
use num_traits::Float;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};
use std::f64::consts::PI;

use crate::error::{Result, SnreError};

/// Generates proposals for Metropolis–Hastings.
pub trait Proposal<T, F: Float> {
    /// Samples a new point from q(x' | x).
    fn sample(&mut self, current: &[T]) -> Vec<T>;

    /// Evaluates log q(x' | x).
    fn log_prob(&self, from: &[T], to: &[T]) -> F;

    /// Returns the proposal seeded with `seed`.
    fn set_seed(self, seed: u64) -> Self;
}

/// A density known up to a constant.
pub trait Target<T, F: Float> {
    /// Returns the log of the unnormalized density at `theta`.
    fn unnorm_log_prob(&self, theta: &[T]) -> F;
}

/**
A prior over the simulator parameters.

Host evaluation works on single `f32` rows; [`Prior::log_prob_tensor`] evaluates a
`[n, dim]` batch on any backend so that gradient-based samplers can differentiate
through it. Points outside the support evaluate to `-inf`.
*/
pub trait Prior: Clone + Send + Sync {
    /// Number of parameters.
    fn dim(&self) -> usize;

    /// Draws one parameter vector.
    fn sample(&self, rng: &mut SmallRng) -> Vec<f32>;

    /// Log-density of `theta`.
    fn log_prob(&self, theta: &[f32]) -> f32;

    /// Log-density of every row of `theta`, shape `[n]`.
    fn log_prob_tensor<B: Backend>(&self, theta: Tensor<B, 2>) -> Tensor<B, 1>;
}

/// Adds independent Gaussian noise with standard deviation `std` to every coordinate.
#[derive(Debug, Clone)]
pub struct IsotropicGaussian<T: Float> {
    pub std: T,
    rng: SmallRng,
}

impl<T: Float> IsotropicGaussian<T> {
    pub fn new(std: T) -> Self {
        Self {
            std,
            rng: SmallRng::from_entropy(),
        }
    }
}

impl<T: Float> Proposal<T, T> for IsotropicGaussian<T>
where
    StandardNormal: Distribution<T>,
{
    fn sample(&mut self, current: &[T]) -> Vec<T> {
        current
            .iter()
            .map(|&c| {
                let eps: T = StandardNormal.sample(&mut self.rng);
                c + eps * self.std
            })
            .collect()
    }

    fn log_prob(&self, from: &[T], to: &[T]) -> T {
        let var = self.std * self.std;
        let two = T::one() + T::one();
        let sq: T = from
            .iter()
            .zip(to)
            .fold(T::zero(), |acc, (&f, &t)| acc + (t - f) * (t - f));
        let d = T::from(from.len()).unwrap_or_else(T::zero);
        let log_2pi = T::from(2.0 * PI).unwrap_or_else(T::one).ln();
        -sq / (two * var) - d * (log_2pi + var.ln()) / two
    }

    fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }
}

fn row_tensor<B: Backend>(values: &[f32], device: &B::Device) -> Tensor<B, 2> {
    Tensor::<B, 1>::from_data(TensorData::new(values.to_vec(), [values.len()]), device)
        .unsqueeze_dim(0)
}

/// Uniform distribution on the box `[low, high]`.
#[derive(Debug, Clone, PartialEq)]
pub struct BoxUniform {
    low: Vec<f32>,
    high: Vec<f32>,
    log_volume: f32,
}

impl BoxUniform {
    /// Fails if the bounds have different lengths or `low >= high` anywhere.
    pub fn new(low: Vec<f32>, high: Vec<f32>) -> Result<Self> {
        if low.len() != high.len() || low.is_empty() {
            return Err(SnreError::invalid(
                "bounds",
                format!("low has {} entries, high has {}", low.len(), high.len()),
            ));
        }
        if low.iter().zip(&high).any(|(l, h)| !(l < h)) {
            return Err(SnreError::invalid("bounds", "every low must be below its high"));
        }
        let log_volume = low.iter().zip(&high).map(|(l, h)| (h - l).ln()).sum();
        Ok(Self {
            low,
            high,
            log_volume,
        })
    }

    pub fn low(&self) -> &[f32] {
        &self.low
    }

    pub fn high(&self) -> &[f32] {
        &self.high
    }
}

impl Prior for BoxUniform {
    fn dim(&self) -> usize {
        self.low.len()
    }

    fn sample(&self, rng: &mut SmallRng) -> Vec<f32> {
        self.low
            .iter()
            .zip(&self.high)
            .map(|(&l, &h)| rng.gen_range(l..h))
            .collect()
    }

    fn log_prob(&self, theta: &[f32]) -> f32 {
        let inside = theta
            .iter()
            .zip(self.low.iter().zip(&self.high))
            .all(|(t, (l, h))| l <= t && t <= h);
        if inside && theta.len() == self.dim() {
            -self.log_volume
        } else {
            f32::NEG_INFINITY
        }
    }

    fn log_prob_tensor<B: Backend>(&self, theta: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = theta.dims();
        let device = theta.device();
        let low = row_tensor::<B>(&self.low, &device);
        let high = row_tensor::<B>(&self.high, &device);
        let excess = relu(low - theta.clone()) + relu(theta - high);
        let outside = excess.sum_dim(1).reshape([n]).greater_elem(0.0);
        Tensor::<B, 1>::full([n], -self.log_volume, &device).mask_fill(outside, f32::NEG_INFINITY)
    }
}

/// Product of independent normals.
#[derive(Debug, Clone, PartialEq)]
pub struct DiagonalGaussian {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl DiagonalGaussian {
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(SnreError::invalid(
                "std",
                format!("mean has {} entries, std has {}", mean.len(), std.len()),
            ));
        }
        if std.iter().any(|&s| !(s > 0.0)) {
            return Err(SnreError::invalid("std", "standard deviations must be positive"));
        }
        Ok(Self { mean, std })
    }

    /// Standard normal in `dim` dimensions.
    pub fn standard(dim: usize) -> Result<Self> {
        Self::new(vec![0.0; dim], vec![1.0; dim])
    }

    fn log_normalizer(&self) -> f32 {
        let half_log_2pi = 0.5 * (2.0 * PI as f32).ln();
        -self.std.iter().map(|s| s.ln() + half_log_2pi).sum::<f32>()
    }
}

impl Prior for DiagonalGaussian {
    fn dim(&self) -> usize {
        self.mean.len()
    }

    fn sample(&self, rng: &mut SmallRng) -> Vec<f32> {
        self.mean
            .iter()
            .zip(&self.std)
            .map(|(&m, &s)| {
                let eps: f32 = StandardNormal.sample(rng);
                m + s * eps
            })
            .collect()
    }

    fn log_prob(&self, theta: &[f32]) -> f32 {
        let quad: f32 = theta
            .iter()
            .zip(self.mean.iter().zip(&self.std))
            .map(|(t, (m, s))| ((t - m) / s).powi(2))
            .sum();
        -0.5 * quad + self.log_normalizer()
    }

    fn log_prob_tensor<B: Backend>(&self, theta: Tensor<B, 2>) -> Tensor<B, 1> {
        let [n, _] = theta.dims();
        let device = theta.device();
        let mean = row_tensor::<B>(&self.mean, &device);
        let std = row_tensor::<B>(&self.std, &device);
        let z = (theta - mean) / std;
        z.powf_scalar(2.0)
            .sum_dim(1)
            .reshape([n])
            .mul_scalar(-0.5)
            .add_scalar(self.log_normalizer())
    }
}

impl Target<f32, f32> for DiagonalGaussian {
    fn unnorm_log_prob(&self, theta: &[f32]) -> f32 {
        self.log_prob(theta)
    }
}
