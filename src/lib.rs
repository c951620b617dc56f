//! Sequential neural ratio estimation (SNRE) on top of `burn`.
//!
//! A classifier learns the likelihood-to-evidence ratio `p(x | θ) / p(x)` from
//! simulated `(θ, x)` pairs; the resulting unnormalized posterior is sampled with
//! Metropolis–Hastings, HMC or rejection sampling. See [`snre::Snre`] for the entry
//! point.

pub mod atoms;
pub mod classifier;
pub mod core;
pub mod distributions;
pub mod error;
pub mod hmc;
pub mod loss;
pub mod metropolis_hastings;
pub mod posterior;
pub mod snre;
pub mod stats;
pub mod store;
pub mod summary;
pub mod training;

pub use error::{Result, SnreError};
pub use loss::RatioVariant;
pub use snre::{Snre, SnreConfig};
pub use training::{AnnealConfig, TrainConfig};
