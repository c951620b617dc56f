/*!
# Random-walk Metropolis–Hastings

Runs several independent chains in parallel on any [`Target`] with any [`Proposal`].
A global seed makes runs reproducible: chain `i` (and its proposal) is seeded with
`seed + i`.

```rust
use mini_snre::core::ChainRunner;
use mini_snre::distributions::{DiagonalGaussian, IsotropicGaussian};
use mini_snre::metropolis_hastings::MetropolisHastings;

let target = DiagonalGaussian::standard(2).unwrap();
let proposal = IsotropicGaussian::new(1.0_f32);
let mut mh = MetropolisHastings::new(target, proposal, &[0.0, 0.0], 4).set_seed(42);
let samples = mh.run(500, 100).unwrap();
assert_eq!(samples.shape(), &[4, 500, 2]);
```
*/

use num_traits::Float;
use rand::prelude::*;
use std::marker::{PhantomData, Send};

use crate::core::{HasChains, MarkovChain};
use crate::distributions::{Proposal, Target};

/// Parallel Metropolis–Hastings sampler.
///
/// - `S`: element type of the state.
/// - `T`: float type of log-densities.
/// - `D`: target, `Q`: proposal.
#[derive(Debug, Clone)]
pub struct MetropolisHastings<S: Clone, T: Float, D: Clone, Q: Clone> {
    pub target: D,
    pub proposal: Q,
    pub chains: Vec<MHMarkovChain<S, T, D, Q>>,
    pub seed: u64,
}

/// A single chain with its own copy of the target and proposal.
#[derive(Debug, Clone)]
pub struct MHMarkovChain<S, T, D, Q> {
    pub target: D,
    pub proposal: Q,
    pub current_state: Vec<S>,
    pub seed: u64,
    pub rng: SmallRng,
    /// Number of accepted proposals so far.
    pub accepted: usize,
    /// Number of steps taken so far.
    pub steps: usize,
    phantom: PhantomData<T>,
}

impl<S, T, D, Q> MetropolisHastings<S, T, D, Q>
where
    D: Target<S, T> + Clone + Send,
    Q: Proposal<S, T> + Clone + Send,
    T: Float + Send,
    S: Clone + PartialEq + Send + 'static,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    /// Creates `n_chains` chains, all starting at `initial_state`.
    pub fn new(target: D, proposal: Q, initial_state: &[S], n_chains: usize) -> Self {
        let chains = (0..n_chains)
            .map(|_| MHMarkovChain::new(target.clone(), proposal.clone(), initial_state))
            .collect();
        let seed = thread_rng().gen::<u64>();

        Self {
            target,
            proposal,
            chains,
            seed,
        }
    }

    /// Sets the global seed; chain `i` and its proposal get `seed + i`.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        for (i, chain) in self.chains.iter_mut().enumerate() {
            let chain_seed = seed.wrapping_add(i as u64);
            chain.seed = chain_seed;
            chain.rng = SmallRng::seed_from_u64(chain_seed);
            chain.proposal = chain.proposal.clone().set_seed(chain_seed);
        }
        self
    }

    /// Overrides the starting state of every chain, one state per chain.
    pub fn set_initial_states(mut self, states: Vec<Vec<S>>) -> Self {
        for (chain, state) in self.chains.iter_mut().zip(states) {
            chain.current_state = state;
        }
        self
    }

    /// Fraction of accepted proposals across all chains.
    pub fn acceptance_rate(&self) -> f64 {
        let (accepted, steps) = self
            .chains
            .iter()
            .fold((0, 0), |(a, s), c| (a + c.accepted, s + c.steps));
        if steps == 0 {
            0.0
        } else {
            accepted as f64 / steps as f64
        }
    }
}

impl<S, T, D, Q> HasChains<S> for MetropolisHastings<S, T, D, Q>
where
    D: Target<S, T> + Clone + Send,
    Q: Proposal<S, T> + Clone + Send,
    T: Float + Send,
    S: Clone + PartialEq + Send + 'static,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    type Chain = MHMarkovChain<S, T, D, Q>;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain> {
        &mut self.chains
    }
}

impl<S, T, D, Q> MHMarkovChain<S, T, D, Q>
where
    D: Target<S, T> + Clone,
    Q: Proposal<S, T> + Clone,
    S: Clone,
    T: Float,
{
    pub fn new(target: D, proposal: Q, initial_state: &[S]) -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            target,
            proposal,
            current_state: initial_state.to_vec(),
            seed,
            rng: SmallRng::seed_from_u64(seed),
            accepted: 0,
            steps: 0,
            phantom: PhantomData,
        }
    }
}

impl<S, T, D, Q> MarkovChain<S> for MHMarkovChain<S, T, D, Q>
where
    D: Target<S, T> + Clone,
    Q: Proposal<S, T> + Clone,
    S: Clone,
    T: Float,
    rand_distr::Standard: rand_distr::Distribution<T>,
{
    /// One Metropolis–Hastings update.
    ///
    /// The candidate is accepted when
    /// `log u < [log p(x') + log q(x | x')] - [log p(x) + log q(x' | x)]`.
    fn step(&mut self) -> &Vec<S> {
        let proposed: Vec<S> = self.proposal.sample(&self.current_state);
        let current_lp = self.target.unnorm_log_prob(&self.current_state);
        let proposed_lp = self.target.unnorm_log_prob(&proposed);
        let log_q_forward = self.proposal.log_prob(&self.current_state, &proposed);
        let log_q_backward = self.proposal.log_prob(&proposed, &self.current_state);
        let log_accept_ratio = (proposed_lp + log_q_backward) - (current_lp + log_q_forward);
        let u: T = self.rng.gen();
        self.steps += 1;
        if log_accept_ratio > u.ln() {
            self.current_state = proposed;
            self.accepted += 1;
        }
        &self.current_state
    }

    fn current_state(&self) -> &Vec<S> {
        &self.current_state
    }
}
