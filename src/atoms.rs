//! Construction of contrastive atom sets.
//!
//! An atom set pairs one observation `x` with `K` candidate parameter rows. The
//! candidate at position 0 is always the anchor's own `θ`; the remaining `K - 1`
//! rows are drawn uniformly without replacement from the rest of the batch.
//!
//! Two layouts are produced:
//!
//! - the **primary** batch, `N * K` rows, used by the classification objective;
//! - the **correction** batch, `N * (N - 1) * K` rows laid out as `[N, N - 1, K]`,
//!   where anchor `i` is paired with every other observation `x_j` and the
//!   contrastive rows exclude both `i` and `j`.
//!
//! All draws go through an injected [`SmallRng`], so a fixed seed reproduces the
//! exact same atoms for the same batch ordering.

use burn::prelude::*;
use burn::tensor::{Int, TensorData};
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::{thread_rng, Rng, SeedableRng};

use crate::error::{Result, SnreError};

/// Flattened row indices into a `(theta, x)` batch.
///
/// `theta[r]` and `x[r]` form the `r`-th classifier input pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtomIndices {
    /// Row of `theta` used for each classifier input.
    pub theta: Vec<usize>,
    /// Row of `x` used for each classifier input.
    pub x: Vec<usize>,
    /// Number of anchors `N` in the source batch.
    pub num_anchors: usize,
    /// Number of atoms `K` per set.
    pub num_atoms: usize,
}

impl AtomIndices {
    pub fn len(&self) -> usize {
        self.theta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.theta.is_empty()
    }
}

/// Seedable sampler for primary and correction atom sets.
#[derive(Debug, Clone)]
pub struct AtomicSampler {
    rng: SmallRng,
    seed: u64,
}

impl Default for AtomicSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicSampler {
    /// Creates a sampler seeded from the thread RNG.
    pub fn new() -> Self {
        let seed = thread_rng().gen::<u64>();
        Self {
            rng: SmallRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Reseeds the sampler; two samplers with the same seed draw identical atoms.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Gives access to the underlying generator, e.g. to shuffle loaders from the
    /// same random stream.
    pub fn rng_mut(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Builds the primary atomic batch for `num_anchors` rows and `num_atoms` atoms.
    ///
    /// For anchor `i` the theta indices are `[i, c_1, ..., c_{K-1}]` with the `c`'s
    /// distinct and different from `i`. The x index is `i` repeated `K` times.
    pub fn primary(&mut self, num_anchors: usize, num_atoms: usize) -> Result<AtomIndices> {
        check_num_atoms(num_atoms)?;
        let total = num_anchors * num_atoms;
        let mut theta = Vec::with_capacity(total);
        let mut x = Vec::with_capacity(total);

        for i in 0..num_anchors {
            let contrast = draw_excluding(&mut self.rng, num_anchors, &[i], num_atoms - 1)?;
            theta.push(i);
            theta.extend(contrast);
            x.extend(std::iter::repeat(i).take(num_atoms));
        }

        Ok(AtomIndices {
            theta,
            x,
            num_anchors,
            num_atoms,
        })
    }

    /// Builds the leave-one-out correction batch.
    ///
    /// For every ordered pair `(i, j)` with `j != i`, `x_j` is paired with `θ_i`
    /// followed by `K - 1` rows drawn without replacement from the rows other than
    /// `i` and `j`. Output order is anchor-major: `[N, N - 1, K]`.
    pub fn correction(&mut self, num_anchors: usize, num_atoms: usize) -> Result<AtomIndices> {
        check_num_atoms(num_atoms)?;
        if num_anchors < 2 {
            return Err(SnreError::InsufficientAtoms {
                requested: 1,
                available: num_anchors.saturating_sub(1),
            });
        }
        let total = num_anchors * (num_anchors - 1) * num_atoms;
        let mut theta = Vec::with_capacity(total);
        let mut x = Vec::with_capacity(total);

        for i in 0..num_anchors {
            for j in (0..num_anchors).filter(|&j| j != i) {
                let excluded = if i < j { [i, j] } else { [j, i] };
                let contrast =
                    draw_excluding(&mut self.rng, num_anchors, &excluded, num_atoms - 1)?;
                theta.push(i);
                theta.extend(contrast);
                x.extend(std::iter::repeat(j).take(num_atoms));
            }
        }

        Ok(AtomIndices {
            theta,
            x,
            num_anchors,
            num_atoms,
        })
    }
}

fn check_num_atoms(num_atoms: usize) -> Result<()> {
    if num_atoms < 2 {
        return Err(SnreError::invalid(
            "num_atoms",
            format!("at least two atoms are required, got {num_atoms}"),
        ));
    }
    Ok(())
}

/// Draws `amount` distinct indices from `0..n` without the (sorted) `excluded` ones.
fn draw_excluding(
    rng: &mut SmallRng,
    n: usize,
    excluded: &[usize],
    amount: usize,
) -> Result<Vec<usize>> {
    let available = n.saturating_sub(excluded.len());
    if amount > available {
        return Err(SnreError::InsufficientAtoms {
            requested: amount,
            available,
        });
    }
    Ok(index::sample(rng, available, amount)
        .into_iter()
        .map(|mut c| {
            for &e in excluded {
                if c >= e {
                    c += 1;
                }
            }
            c
        })
        .collect())
}

/// Turns host indices into an `Int` tensor usable with [`Tensor::select`].
pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::<B, 1, Int>::from_data(TensorData::new(data, [indices.len()]), device)
}

/// Materializes the classifier inputs described by `indices`.
///
/// Returns `(theta_atoms, x_atoms)` with `indices.len()` rows each.
pub fn gather<B: Backend>(
    theta: &Tensor<B, 2>,
    x: &Tensor<B, 2>,
    indices: &AtomIndices,
) -> Result<(Tensor<B, 2>, Tensor<B, 2>)> {
    let (n_theta, n_x) = (theta.dims()[0], x.dims()[0]);
    if n_theta != n_x {
        return Err(SnreError::BatchMismatch {
            theta: n_theta,
            x: n_x,
        });
    }
    if n_theta != indices.num_anchors {
        return Err(SnreError::invalid(
            "indices",
            format!(
                "built for {} anchors but the batch has {n_theta} rows",
                indices.num_anchors
            ),
        ));
    }
    let device = theta.device();
    let theta_atoms = theta
        .clone()
        .select(0, index_tensor::<B>(&indices.theta, &device));
    let x_atoms = x.clone().select(0, index_tensor::<B>(&indices.x, &device));
    Ok((theta_atoms, x_atoms))
}
