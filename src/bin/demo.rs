//! Infers `θ` of the toy simulator `x = θ + N(0, 0.1²)` with a uniform prior on
//! `[0, 1]`, then samples the posterior of one observation.
//!
//! Run with `RUST_LOG=debug` to see per-epoch diagnostics.

use burn::backend::{Autodiff, NdArray};
use mini_snre::classifier::{ClassifierConfig, ClassifierKind};
use mini_snre::distributions::{BoxUniform, Prior};
use mini_snre::posterior::{McmcParameters, RejectionParameters};
use mini_snre::summary::TracingSink;
use mini_snre::{RatioVariant, Snre, SnreConfig, TrainConfig};
use ndarray::{Array2, Axis};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::error::Error;
use tracing_subscriber::EnvFilter;

type Backend = Autodiff<NdArray>;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    const NUM_SIMULATIONS: usize = 1_000;
    const SEED: u64 = 42;

    let device = Default::default();
    let prior = BoxUniform::new(vec![0.0], vec![1.0])?;
    let mut rng = SmallRng::seed_from_u64(SEED);
    let noise = Normal::new(0.0_f32, 0.1)?;

    let draws: Vec<f32> = (0..NUM_SIMULATIONS)
        .flat_map(|_| prior.sample(&mut rng))
        .collect();
    let theta = Array2::from_shape_vec((NUM_SIMULATIONS, 1), draws)?;
    let x = theta.mapv(|t| t + noise.sample(&mut rng));

    let classifier = ClassifierConfig::new().with_kind(ClassifierKind::Resnet);
    let config = SnreConfig::new()
        .with_variant(RatioVariant::A)
        .with_seed(Some(SEED));
    let mut snre = Snre::<Backend, _>::with_default_classifier(
        Some(prior),
        classifier,
        config,
        &device,
    )
    .with_sink(Box::new(TracingSink));

    snre.append_simulations(theta, x, 0)?;
    snre.train(
        &TrainConfig::new()
            .with_max_num_epochs(Some(50))
            .with_show_train_summary(true),
    )?;

    let mut posterior = snre.build_posterior(
        None,
        None,
        "mcmc",
        "mh",
        McmcParameters::new().with_seed(Some(SEED)),
        RejectionParameters::new(),
    )?;
    let observation = [0.3_f32];
    posterior.set_default_x(&observation)?;
    let samples = posterior.sample(2_000, None)?;

    let mean = samples.mean_axis(Axis(0)).map(|m| m[0]).unwrap_or(f32::NAN);
    let std = samples.std_axis(Axis(0), 1.0)[0];
    println!("Observation x = {:.2}", observation[0]);
    println!("Posterior mean {mean:.3}, std {std:.3} ({} samples)", samples.nrows());
    Ok(())
}
