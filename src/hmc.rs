//! A data-parallel Hamiltonian Monte Carlo sampler using `burn` for autodiff.
//!
//! All chains are advanced together: positions live in one `[n_chains, D]` tensor,
//! the leapfrog integrator differentiates the batched log-density of a
//! [`GradientTarget`], and every chain is accepted or rejected independently.
//! Momenta and acceptance draws come from the sampler's own seedable RNG.

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{Bool, TensorData};
use indicatif::{ProgressBar, ProgressStyle};
use rand::prelude::*;
use rand_distr::StandardNormal;
use std::collections::VecDeque;

use crate::error::{Result, SnreError};
use crate::stats::RhatMulti;

/// Batched log-density with gradients.
pub trait GradientTarget<B: AutodiffBackend> {
    /// Log-density of every row of `positions` (`[n_chains, D]`), shape `[n_chains]`.
    fn log_prob_batch(&self, positions: &Tensor<B, 2>) -> Tensor<B, 1>;
}

#[derive(Debug, Clone)]
pub struct HMC<B, G>
where
    B: AutodiffBackend,
{
    pub target: G,
    /// Leapfrog step size.
    pub step_size: f32,
    /// Leapfrog steps per update.
    pub n_leapfrog: usize,
    /// Current positions, `[n_chains, D]`.
    pub positions: Tensor<B, 2>,
    pub rng: SmallRng,
    device: B::Device,
    accepted: usize,
    proposed: usize,
}

impl<B, G> HMC<B, G>
where
    B: AutodiffBackend,
    G: GradientTarget<B>,
{
    /// Creates a sampler with one chain per entry of `initial_positions`.
    pub fn new(
        target: G,
        initial_positions: Vec<Vec<f32>>,
        step_size: f32,
        n_leapfrog: usize,
        device: &B::Device,
    ) -> Result<Self> {
        let n_chains = initial_positions.len();
        let dim = initial_positions.first().map_or(0, Vec::len);
        if n_chains == 0 || dim == 0 {
            return Err(SnreError::invalid(
                "initial_positions",
                "need at least one chain with a non-empty state",
            ));
        }
        if initial_positions.iter().any(|p| p.len() != dim) {
            return Err(SnreError::invalid(
                "initial_positions",
                "all chains must have the same dimension",
            ));
        }
        if !(step_size > 0.0) || n_leapfrog == 0 {
            return Err(SnreError::invalid(
                "step_size",
                "step size and number of leapfrog steps must be positive",
            ));
        }
        let td = TensorData::new(
            initial_positions.into_iter().flatten().collect::<Vec<f32>>(),
            [n_chains, dim],
        );
        Ok(Self {
            target,
            step_size,
            n_leapfrog,
            positions: Tensor::from_data(td, device),
            rng: SmallRng::seed_from_u64(thread_rng().gen::<u64>()),
            device: device.clone(),
            accepted: 0,
            proposed: 0,
        })
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    /// Fraction of accepted proposals across all chains and steps.
    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            0.0
        } else {
            self.accepted as f64 / self.proposed as f64
        }
    }

    /// Takes `n_discard` burn-in steps, then collects `n_collect` draws of shape
    /// `[n_collect, n_chains, D]`.
    pub fn run(&mut self, n_collect: usize, n_discard: usize) -> Result<Tensor<B, 3>> {
        for _ in 0..n_discard {
            self.step()?;
        }
        let mut draws = Vec::with_capacity(n_collect);
        for _ in 0..n_collect {
            self.step()?;
            draws.push(self.positions.clone());
        }
        self.stack(draws)
    }

    /// Like [`HMC::run`], with a progress bar reporting a windowed acceptance rate and
    /// the running maximum R-hat.
    pub fn run_progress(&mut self, n_collect: usize, n_discard: usize) -> Result<Tensor<B, 3>> {
        for _ in 0..n_discard {
            self.step()?;
        }
        let [n_chains, dim] = self.positions.dims();

        let pb = ProgressBar::new(n_collect as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}") {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_prefix("HMC");

        let window_size = 100;
        let mut accept_window: VecDeque<f64> = VecDeque::with_capacity(window_size);
        let mut psr = RhatMulti::new(n_chains, dim);
        let mut draws = Vec::with_capacity(n_collect);

        for _ in 0..n_collect {
            let accepted = self.step()?;
            accept_window.push_front(accepted as f64 / n_chains as f64);
            if accept_window.len() > window_size {
                accept_window.pop_back();
            }

            let host = to_host(self.positions.clone())?;
            psr.step(&host)?;
            draws.push(self.positions.clone());
            pb.inc(1);

            let avg_accept = accept_window.iter().sum::<f64>() / accept_window.len() as f64;
            match psr.max() {
                Ok(max_rhat) => pb.set_message(format!(
                    "p(accept)≈{avg_accept:.2} max(rhat)≈{max_rhat:.2}"
                )),
                Err(_) => pb.set_message(format!("p(accept)≈{avg_accept:.2}")),
            }
        }
        pb.finish_with_message("Done!");
        self.stack(draws)
    }

    /// One HMC update of every chain; returns the number of accepted proposals.
    pub fn step(&mut self) -> Result<usize> {
        let [n_chains, dim] = self.positions.dims();

        let momentum_0 = self.standard_normal([n_chains, dim]);
        let logp_current = self.target.log_prob_batch(&self.positions).detach();
        let h_current = -logp_current + kinetic_energy(momentum_0.clone());

        let (proposed_positions, proposed_momenta, logp_proposed) =
            self.leapfrog(self.positions.clone(), momentum_0)?;
        let h_proposed = -logp_proposed + kinetic_energy(proposed_momenta);

        // Accept where H(current) - H(proposed) >= ln(u).
        let uniforms: Vec<f32> = (0..n_chains).map(|_| self.rng.gen::<f32>()).collect();
        let ln_u = Tensor::<B, 1>::from_data(TensorData::new(uniforms, [n_chains]), &self.device).log();
        let accept_mask = (h_current - h_proposed).greater_equal(ln_u);
        let accepted: f64 = accept_mask.clone().int().sum().into_scalar().elem();

        let accept_mask: Tensor<B, 2, Bool> = accept_mask.unsqueeze_dim::<2>(1).expand([n_chains, dim]);
        self.positions = self
            .positions
            .clone()
            .mask_where(accept_mask, proposed_positions)
            .detach();

        self.accepted += accepted as usize;
        self.proposed += n_chains;
        Ok(accepted as usize)
    }

    /// `n_leapfrog` steps of the leapfrog integrator.
    ///
    /// Returns the final positions, momenta and log-density, all detached.
    fn leapfrog(
        &self,
        mut pos: Tensor<B, 2>,
        mut mom: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 1>)> {
        let half_step = 0.5 * self.step_size;
        for _ in 0..self.n_leapfrog {
            mom = mom + self.grad_log_prob(pos.clone())?.mul_scalar(half_step);
            pos = (pos + mom.clone().mul_scalar(self.step_size)).detach();
            mom = mom + self.grad_log_prob(pos.clone())?.mul_scalar(half_step);
        }
        let logp_final = self.target.log_prob_batch(&pos).detach();
        Ok((pos.detach(), mom.detach(), logp_final))
    }

    fn grad_log_prob(&self, pos: Tensor<B, 2>) -> Result<Tensor<B, 2>> {
        let pos = pos.detach().require_grad();
        let logp = self.target.log_prob_batch(&pos);
        let grads = logp.sum().backward();
        let grad = pos
            .grad(&grads)
            .ok_or_else(|| SnreError::TensorData("log-density does not depend on the positions".into()))?;
        Ok(Tensor::from_inner(grad))
    }

    fn standard_normal(&mut self, shape: [usize; 2]) -> Tensor<B, 2> {
        let values: Vec<f32> = (&mut self.rng)
            .sample_iter(StandardNormal)
            .take(shape[0] * shape[1])
            .collect();
        Tensor::from_data(TensorData::new(values, shape), &self.device)
    }

    fn stack(&self, draws: Vec<Tensor<B, 2>>) -> Result<Tensor<B, 3>> {
        if draws.is_empty() {
            let [n_chains, dim] = self.positions.dims();
            return Ok(Tensor::zeros([0, n_chains, dim], &self.device));
        }
        Ok(Tensor::stack(draws, 0))
    }
}

/// `0.5 * |p|^2` per chain.
fn kinetic_energy<B: Backend>(momentum: Tensor<B, 2>) -> Tensor<B, 1> {
    let n = momentum.dims()[0];
    momentum.powf_scalar(2.0).sum_dim(1).reshape([n]).mul_scalar(0.5)
}

pub(crate) fn to_host<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SnreError::TensorData(format!("{e:?}")))
}
