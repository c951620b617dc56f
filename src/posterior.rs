//! Posterior sampling with a trained ratio classifier.
//!
//! The unnormalized log-posterior ("potential") is
//!
//! ```text
//! φ(θ | x) = logit(θ, x) + log p(θ)
//! ```
//!
//! where `logit` is the classifier output. [`RatioPosterior`] samples φ either with a
//! Markov chain (random-walk Metropolis–Hastings or HMC) or by rejection sampling from
//! the prior.

use std::str::FromStr;

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use ndarray::{s, Array1, Array2, Array3, Axis};
use ndarray_stats::QuantileExt;
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::classifier::RatioClassifier;
use crate::core::ChainRunner;
use crate::distributions::{IsotropicGaussian, Prior, Target};
use crate::error::{self, SnreError};
use crate::hmc::{to_host, GradientTarget, HMC};
use crate::metropolis_hastings::MetropolisHastings;
use crate::stats;

/// How to draw from the posterior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleWith {
    Mcmc,
    Rejection,
    /// Variational inference. Accepted by the parser, rejected by the builder.
    Vi,
}

impl FromStr for SampleWith {
    type Err = SnreError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s {
            "mcmc" => Ok(SampleWith::Mcmc),
            "rejection" => Ok(SampleWith::Rejection),
            "vi" => Ok(SampleWith::Vi),
            other => Err(SnreError::NotImplemented(format!("sample_with=\"{other}\""))),
        }
    }
}

/// Inner kernel for `SampleWith::Mcmc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McmcMethod {
    RandomWalkMh,
    Hmc,
}

impl FromStr for McmcMethod {
    type Err = SnreError;

    fn from_str(s: &str) -> error::Result<Self> {
        match s {
            "mh" | "random_walk" | "metropolis_hastings" => Ok(McmcMethod::RandomWalkMh),
            "hmc" => Ok(McmcMethod::Hmc),
            other => Err(SnreError::NotImplemented(format!("mcmc_method=\"{other}\""))),
        }
    }
}

#[derive(Config, Debug)]
pub struct McmcParameters {
    /// Independent chains.
    #[config(default = 4)]
    pub num_chains: usize,
    /// Keep every `thin`-th draw.
    #[config(default = 1)]
    pub thin: usize,
    /// Burn-in steps per chain.
    #[config(default = 200)]
    pub warmup_steps: usize,
    /// Standard deviation of the random-walk proposal.
    #[config(default = 0.5)]
    pub proposal_std: f32,
    /// HMC leapfrog step size.
    #[config(default = 0.05)]
    pub step_size: f32,
    /// HMC leapfrog steps per update.
    #[config(default = 10)]
    pub n_leapfrog: usize,
    pub seed: Option<u64>,
}

#[derive(Config, Debug)]
pub struct RejectionParameters {
    /// Prior draws used to estimate the maximum log-ratio.
    #[config(default = 10_000)]
    pub num_samples_to_find_max: usize,
    /// Safety factor applied to the estimated maximum ratio.
    #[config(default = 1.2)]
    pub m_scaling: f32,
    /// Prior draws evaluated per classifier call.
    #[config(default = 10_000)]
    pub max_sampling_batch_size: usize,
    /// Give up after this many proposals.
    #[config(default = 10_000_000)]
    pub max_proposals: usize,
    pub seed: Option<u64>,
}

/// Sampling strategy of a built posterior.
#[derive(Debug, Clone)]
pub enum PosteriorMethod {
    Mcmc {
        method: McmcMethod,
        parameters: McmcParameters,
    },
    Rejection(RejectionParameters),
}

impl PosteriorMethod {
    /// Resolves the string options of `build_posterior`.
    ///
    /// Fails with [`SnreError::NotImplemented`] for variational inference and for
    /// unknown sampler or kernel names.
    pub fn from_options(
        sample_with: &str,
        mcmc_method: &str,
        mcmc_parameters: McmcParameters,
        rejection_parameters: RejectionParameters,
    ) -> error::Result<Self> {
        match sample_with.parse::<SampleWith>()? {
            SampleWith::Mcmc => Ok(PosteriorMethod::Mcmc {
                method: mcmc_method.parse()?,
                parameters: mcmc_parameters,
            }),
            SampleWith::Rejection => Ok(PosteriorMethod::Rejection(rejection_parameters)),
            SampleWith::Vi => Err(SnreError::NotImplemented(
                "variational inference (sample_with=\"vi\")".to_string(),
            )),
        }
    }
}

/// Unnormalized posterior `exp(logit(θ, x)) p(θ)`.
#[derive(Clone)]
pub struct RatioPosterior<B, P, M>
where
    B: AutodiffBackend,
{
    net: M,
    prior: P,
    method: PosteriorMethod,
    default_x: Option<Vec<f32>>,
    x_dim: Option<usize>,
    show_progress: bool,
    device: B::Device,
}

impl<B, P, M> RatioPosterior<B, P, M>
where
    B: AutodiffBackend,
    P: Prior + 'static,
    M: RatioClassifier<B> + AutodiffModule<B>,
    M::InnerModule: RatioClassifier<B::InnerBackend>,
{
    pub fn new(
        net: M,
        prior: P,
        method: PosteriorMethod,
        x_dim: Option<usize>,
        device: &B::Device,
    ) -> Self {
        Self {
            net,
            prior,
            method,
            default_x: None,
            x_dim,
            show_progress: false,
            device: device.clone(),
        }
    }

    /// Shows one progress bar per chain while MCMC sampling.
    pub fn with_progress_bars(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn net(&self) -> &M {
        &self.net
    }

    pub fn prior(&self) -> &P {
        &self.prior
    }

    pub fn method(&self) -> &PosteriorMethod {
        &self.method
    }

    pub fn default_x(&self) -> Option<&[f32]> {
        self.default_x.as_deref()
    }

    /// Stores the observation used when `sample`/`log_prob` get no `x`.
    pub fn set_default_x(&mut self, x: &[f32]) -> error::Result<&mut Self> {
        self.check_x(x)?;
        self.default_x = Some(x.to_vec());
        Ok(self)
    }

    /// Unnormalized log-posterior of every row of `theta`.
    pub fn log_prob(&self, theta: &Array2<f32>, x: Option<&[f32]>) -> error::Result<Array1<f32>> {
        let x = self.resolve_x(x)?;
        self.check_theta(theta)?;
        let net = self.net.valid();
        let device = self.device.clone();
        let mut out = Vec::with_capacity(theta.nrows());
        for chunk in theta.axis_chunks_iter(Axis(0), 10_000) {
            let theta_t = host_to_tensor::<B::InnerBackend>(&chunk.to_owned(), &device);
            let x_t = repeat_row::<B::InnerBackend>(&x, chunk.nrows(), &device);
            let potential = net.forward(theta_t.clone(), x_t) + self.prior.log_prob_tensor(theta_t);
            out.extend(to_host(potential)?);
        }
        Ok(Array1::from(out))
    }

    /// Draws `n` samples of `θ` given `x` (or the default observation).
    pub fn sample(&self, n: usize, x: Option<&[f32]>) -> error::Result<Array2<f32>> {
        let x = self.resolve_x(x)?;
        match &self.method {
            PosteriorMethod::Mcmc { method, parameters } => match method {
                McmcMethod::RandomWalkMh => self.sample_mh(n, &x, parameters),
                McmcMethod::Hmc => self.sample_hmc(n, &x, parameters),
            },
            PosteriorMethod::Rejection(parameters) => self.sample_rejection(n, &x, parameters),
        }
    }

    fn sample_mh(&self, n: usize, x: &[f32], params: &McmcParameters) -> error::Result<Array2<f32>> {
        let (num_chains, draws_per_chain) = chain_layout(n, params)?;
        let mut rng = seeded_rng(params.seed);
        let initial: Vec<Vec<f32>> = (0..num_chains).map(|_| self.prior.sample(&mut rng)).collect();

        let device = self.device.clone();
        let target = HostPotential {
            net: self.net.valid(),
            prior: self.prior.clone(),
            x: repeat_row::<B::InnerBackend>(x, 1, &device),
            device,
        };
        let proposal = IsotropicGaussian::new(params.proposal_std);
        let mut mh = MetropolisHastings::new(target, proposal, &initial[0], num_chains)
            .set_seed(rng.gen())
            .set_initial_states(initial);

        let n_collect = draws_per_chain * params.thin;
        let samples = if self.show_progress {
            mh.run_progress(n_collect, params.warmup_steps)?
        } else {
            mh.run(n_collect, params.warmup_steps)?
        };
        tracing::debug!(acceptance_rate = mh.acceptance_rate(), "random-walk MH finished");
        finish_chains(samples, n, params.thin)
    }

    fn sample_hmc(&self, n: usize, x: &[f32], params: &McmcParameters) -> error::Result<Array2<f32>> {
        let (num_chains, draws_per_chain) = chain_layout(n, params)?;
        let mut rng = seeded_rng(params.seed);
        let initial: Vec<Vec<f32>> = (0..num_chains).map(|_| self.prior.sample(&mut rng)).collect();
        let dim = self.prior.dim();

        let target = GradientPotential {
            net: self.net.clone(),
            prior: self.prior.clone(),
            x: repeat_row::<B>(x, 1, &self.device),
        };
        let mut hmc = HMC::new(target, initial, params.step_size, params.n_leapfrog, &self.device)?
            .set_seed(rng.gen());
        let n_collect = draws_per_chain * params.thin;
        let draws = if self.show_progress {
            hmc.run_progress(n_collect, params.warmup_steps)?
        } else {
            hmc.run(n_collect, params.warmup_steps)?
        };
        tracing::debug!(acceptance_rate = hmc.acceptance_rate(), "HMC finished");

        let n_draws = draws.dims()[0];
        let samples = Array3::from_shape_vec((n_draws, num_chains, dim), to_host(draws)?)?
            .permuted_axes([1, 0, 2]);
        finish_chains(samples, n, params.thin)
    }

    fn sample_rejection(
        &self,
        n: usize,
        x: &[f32],
        params: &RejectionParameters,
    ) -> error::Result<Array2<f32>> {
        if params.num_samples_to_find_max == 0 || params.max_sampling_batch_size == 0 {
            return Err(SnreError::invalid(
                "rejection_sampling_parameters",
                "num_samples_to_find_max and max_sampling_batch_size must be positive",
            ));
        }
        if !(params.m_scaling >= 1.0) {
            return Err(SnreError::invalid("m_scaling", "must be at least 1"));
        }
        let mut rng = seeded_rng(params.seed);
        let dim = self.prior.dim();

        // Under a prior proposal the acceptance ratio is exp(logit - log M).
        let pilot = self.draw_prior(params.num_samples_to_find_max, &mut rng)?;
        let max_logit = self
            .logits(&pilot, x, params.max_sampling_batch_size)?
            .into_iter()
            .fold(f32::NEG_INFINITY, f32::max);
        if !max_logit.is_finite() {
            return Err(SnreError::TensorData(format!(
                "classifier returned a non-finite maximum log-ratio ({max_logit})"
            )));
        }
        let log_m = max_logit + params.m_scaling.ln();

        let mut accepted: Vec<f32> = Vec::with_capacity(n * dim);
        let mut num_proposed = 0;
        let mut envelope_warned = false;
        while accepted.len() < n * dim {
            if num_proposed >= params.max_proposals {
                return Err(SnreError::invalid(
                    "max_proposals",
                    format!(
                        "only {} of {n} samples accepted after {num_proposed} proposals",
                        accepted.len() / dim
                    ),
                ));
            }
            let candidates = self.draw_prior(params.max_sampling_batch_size, &mut rng)?;
            num_proposed += candidates.nrows();
            let logits = self.logits(&candidates, x, params.max_sampling_batch_size)?;
            for (row, logit) in candidates.axis_iter(Axis(0)).zip(logits) {
                if logit > log_m && !envelope_warned {
                    tracing::warn!(logit, log_m, "log-ratio exceeds the rejection envelope; samples are biased, consider a larger m_scaling");
                    envelope_warned = true;
                }
                if rng.gen::<f32>().ln() < logit - log_m && accepted.len() < n * dim {
                    accepted.extend(row.iter().copied());
                }
            }
        }
        tracing::debug!(
            acceptance_rate = n as f64 / num_proposed as f64,
            "rejection sampling finished"
        );
        Ok(Array2::from_shape_vec((n, dim), accepted)?)
    }

    fn draw_prior(&self, n: usize, rng: &mut SmallRng) -> error::Result<Array2<f32>> {
        let dim = self.prior.dim();
        let flat: Vec<f32> = (0..n).flat_map(|_| self.prior.sample(rng)).collect();
        Ok(Array2::from_shape_vec((n, dim), flat)?)
    }

    /// Classifier logits of `(θ_i, x)` for every row of `theta`.
    fn logits(&self, theta: &Array2<f32>, x: &[f32], batch_size: usize) -> error::Result<Vec<f32>> {
        let net = self.net.valid();
        let mut out = Vec::with_capacity(theta.nrows());
        for chunk in theta.axis_chunks_iter(Axis(0), batch_size) {
            let theta_t = host_to_tensor::<B::InnerBackend>(&chunk.to_owned(), &self.device);
            let x_t = repeat_row::<B::InnerBackend>(x, chunk.nrows(), &self.device);
            out.extend(to_host(net.forward(theta_t, x_t))?);
        }
        Ok(out)
    }

    fn resolve_x(&self, x: Option<&[f32]>) -> error::Result<Vec<f32>> {
        let x = match x {
            Some(x) => x.to_vec(),
            None => self.default_x.clone().ok_or(SnreError::MissingObservation)?,
        };
        self.check_x(&x)?;
        Ok(x)
    }

    fn check_x(&self, x: &[f32]) -> error::Result<()> {
        match self.x_dim {
            Some(d) if d != x.len() => Err(SnreError::invalid(
                "x",
                format!("expected an observation with {d} entries, got {}", x.len()),
            )),
            _ => Ok(()),
        }
    }

    fn check_theta(&self, theta: &Array2<f32>) -> error::Result<()> {
        if theta.ncols() != self.prior.dim() {
            return Err(SnreError::invalid(
                "theta",
                format!("expected {} columns, got {}", self.prior.dim(), theta.ncols()),
            ));
        }
        Ok(())
    }
}

/// Potential evaluated one row at a time for Metropolis–Hastings.
#[derive(Debug, Clone)]
struct HostPotential<B: Backend, P, N> {
    net: N,
    prior: P,
    x: Tensor<B, 2>,
    device: B::Device,
}

impl<B, P, N> Target<f32, f32> for HostPotential<B, P, N>
where
    B: Backend,
    P: Prior,
    N: RatioClassifier<B>,
{
    fn unnorm_log_prob(&self, theta: &[f32]) -> f32 {
        let log_prior = self.prior.log_prob(theta);
        if !log_prior.is_finite() {
            return f32::NEG_INFINITY;
        }
        let theta_t = Tensor::<B, 1>::from_data(TensorData::new(theta.to_vec(), [theta.len()]), &self.device)
            .unsqueeze_dim::<2>(0);
        let logit: f32 = self.net.forward(theta_t, self.x.clone()).into_scalar().elem();
        logit + log_prior
    }
}

/// Differentiable potential for HMC.
#[derive(Debug, Clone)]
struct GradientPotential<B: Backend, P, M> {
    net: M,
    prior: P,
    x: Tensor<B, 2>,
}

impl<B, P, M> GradientTarget<B> for GradientPotential<B, P, M>
where
    B: AutodiffBackend,
    P: Prior,
    M: RatioClassifier<B>,
{
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1> {
        let n = positions.dims()[0];
        let dx = self.x.dims()[1];
        let x = self.x.clone().expand([n, dx]);
        self.net.forward(positions.clone(), x) + self.prior.log_prob_tensor(positions.clone())
    }
}

fn chain_layout(n: usize, params: &McmcParameters) -> error::Result<(usize, usize)> {
    if params.num_chains == 0 || params.thin == 0 {
        return Err(SnreError::invalid(
            "mcmc_parameters",
            "num_chains and thin must be positive",
        ));
    }
    Ok((params.num_chains, n.div_ceil(params.num_chains)))
}

/// Thins `[n_chains, n_draws, dim]` samples, logs R-hat and keeps the first `n` draws.
fn finish_chains(samples: Array3<f32>, n: usize, thin: usize) -> error::Result<Array2<f32>> {
    let thinned = samples.slice(s![.., ..;thin, ..]).to_owned();
    match stats::rhat(&thinned).map(|r| *r.max_skipnan()) {
        Ok(max_rhat) => {
            if max_rhat > 1.1 {
                tracing::warn!(max_rhat, "chains have not mixed; consider more warmup steps");
            } else {
                tracing::debug!(max_rhat, "MCMC convergence");
            }
        }
        Err(e) => tracing::debug!(error = %e, "R-hat unavailable"),
    }
    let (c, d, dim) = thinned.dim();
    let flat = thinned.into_shape_with_order((c * d, dim))?;
    Ok(flat.slice(s![..n.min(c * d), ..]).to_owned())
}

fn seeded_rng(seed: Option<u64>) -> SmallRng {
    SmallRng::seed_from_u64(seed.unwrap_or_else(|| thread_rng().gen()))
}

pub(crate) fn host_to_tensor<B: Backend>(values: &Array2<f32>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = values.dim();
    let flat: Vec<f32> = values.iter().copied().collect();
    Tensor::from_data(TensorData::new(flat, [rows, cols]), device)
}

fn repeat_row<B: Backend>(row: &[f32], n: usize, device: &B::Device) -> Tensor<B, 2> {
    Tensor::<B, 1>::from_data(TensorData::new(row.to_vec(), [row.len()]), device)
        .unsqueeze_dim::<2>(0)
        .expand([n, row.len()])
}
