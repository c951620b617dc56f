use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::{Array2, Array3};
use num_traits::Zero;
use rayon::prelude::*;

use crate::error::Result;

pub trait MarkovChain<T> {
    /// Does one iteration of the chain, returning the new current state.
    fn step(&mut self) -> &Vec<T>;

    /// Returns the current state without stepping.
    fn current_state(&self) -> &Vec<T>;
}

/// Takes `n_discard` burn-in steps, then collects `n_collect` states into a
/// `[n_collect, dim]` array.
pub fn run_chain<T, M>(chain: &mut M, n_collect: usize, n_discard: usize) -> Array2<T>
where
    M: MarkovChain<T>,
    T: Clone + Zero,
{
    run_chain_with_progress(chain, n_collect, n_discard, &ProgressBar::hidden())
}

pub fn run_chain_with_progress<T, M>(
    chain: &mut M,
    n_collect: usize,
    n_discard: usize,
    pb: &ProgressBar,
) -> Array2<T>
where
    M: MarkovChain<T>,
    T: Clone + Zero,
{
    let dim = chain.current_state().len();
    let mut out = Array2::<T>::zeros((n_collect, dim));

    pb.set_length((n_collect + n_discard) as u64);
    for _ in 0..n_discard {
        chain.step();
        pb.inc(1);
    }
    for mut row in out.rows_mut() {
        let state = chain.step();
        row.iter_mut().zip(state).for_each(|(o, s)| *o = s.clone());
        pb.inc(1);
    }

    out
}

/// Anything that owns several independent Markov chains.
pub trait HasChains<T> {
    type Chain: MarkovChain<T> + Send;

    fn chains_mut(&mut self) -> &mut Vec<Self::Chain>;
}

pub trait ChainRunner<T>: HasChains<T>
where
    T: Clone + Zero + Send + Sync + 'static,
{
    /// Runs every chain in parallel and returns samples of shape
    /// `[n_chains, n_collect, dim]`.
    fn run(&mut self, n_collect: usize, n_discard: usize) -> Result<Array3<T>> {
        let results: Vec<Array2<T>> = self
            .chains_mut()
            .par_iter_mut()
            .map(|chain| run_chain(chain, n_collect, n_discard))
            .collect();
        stack_chains(results)
    }

    /// Like [`ChainRunner::run`], with one progress bar per chain.
    fn run_progress(&mut self, n_collect: usize, n_discard: usize) -> Result<Array3<T>> {
        let multi = MultiProgress::new();
        let pb_style = ProgressStyle::default_bar()
            .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-");

        let results: Vec<Array2<T>> = self
            .chains_mut()
            .par_iter_mut()
            .enumerate()
            .map(|(i, chain)| {
                let pb = multi.add(ProgressBar::new((n_collect + n_discard) as u64));
                pb.set_prefix(format!("Chain {i}"));
                pb.set_style(pb_style.clone());
                let samples = run_chain_with_progress(chain, n_collect, n_discard, &pb);
                pb.finish_with_message("Done!");
                samples
            })
            .collect();
        stack_chains(results)
    }
}

impl<T: Clone + Zero + Send + Sync + 'static, R: HasChains<T>> ChainRunner<T> for R {}

fn stack_chains<T: Clone>(chains: Vec<Array2<T>>) -> Result<Array3<T>> {
    let views: Vec<_> = chains.iter().map(|c| c.view()).collect();
    Ok(ndarray::stack(ndarray::Axis(0), &views)?)
}
