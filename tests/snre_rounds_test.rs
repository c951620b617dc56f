use burn::backend::{Autodiff, NdArray};
use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::TensorData;
use mini_snre::classifier::{ClassifierConfig, ClassifierKind, ClassifierNet, RatioClassifier};
use mini_snre::distributions::BoxUniform;
use mini_snre::posterior::{McmcParameters, RejectionParameters};
use mini_snre::summary::{InMemorySink, SummarySink};
use mini_snre::{AnnealConfig, RatioVariant, Snre, SnreConfig, SnreError, TrainConfig};
use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Uniform};

type TestBackend = Autodiff<NdArray>;

/// `θ ~ U(0, 1)`, `x = θ + N(0, 0.1²)`.
fn simulate(n: usize, seed: u64) -> (Array2<f32>, Array2<f32>) {
    let mut rng = SmallRng::seed_from_u64(seed);
    let uniform = Uniform::new(0.0_f32, 1.0);
    let noise = Normal::new(0.0_f32, 0.1).unwrap();
    let theta = Array2::from_shape_fn((n, 1), |_| uniform.sample(&mut rng));
    let x = theta.mapv(|t| t + noise.sample(&mut rng));
    (theta, x)
}

fn prior() -> BoxUniform {
    BoxUniform::new(vec![0.0], vec![1.0]).unwrap()
}

fn new_snre(variant: RatioVariant, with_prior: bool) -> Snre<TestBackend, BoxUniform> {
    let classifier = ClassifierConfig::new()
        .with_kind(ClassifierKind::Resnet)
        .with_hidden_features(32);
    let config = SnreConfig::new()
        .with_variant(variant)
        .with_seed(Some(11))
        .with_show_progress_bars(false);
    Snre::with_default_classifier(
        with_prior.then(prior),
        classifier,
        config,
        &Default::default(),
    )
}

fn logits(net: &ClassifierNet<TestBackend>, theta: &Array2<f32>, x: &Array2<f32>) -> Vec<f32> {
    let device = Default::default();
    let net = net.valid();
    let to_tensor = |a: &Array2<f32>| {
        Tensor::<NdArray, 2>::from_data(
            TensorData::new(a.iter().copied().collect::<Vec<f32>>(), [a.nrows(), a.ncols()]),
            &device,
        )
    };
    net.forward(to_tensor(theta), to_tensor(x))
        .into_data()
        .to_vec::<f32>()
        .unwrap()
}

#[test]
fn test_classifier_separates_joint_from_marginal_pairs() {
    let mut snre = new_snre(RatioVariant::A, true);
    let (theta, x) = simulate(1_000, 0);
    snre.append_simulations(theta, x, 0).unwrap();
    let net = snre
        .train(&TrainConfig::new().with_max_num_epochs(Some(20)))
        .unwrap();

    let (theta, x) = simulate(400, 1);
    let mut shuffled: Vec<usize> = (0..400).collect();
    shuffled.shuffle(&mut SmallRng::seed_from_u64(2));
    let x_marginal = x.select(ndarray::Axis(0), &shuffled);

    let joint = logits(&net, &theta, &x);
    let marginal = logits(&net, &theta, &x_marginal);
    let wins: usize = joint
        .iter()
        .map(|j| marginal.iter().filter(|m| j > m).count())
        .sum();
    let auc = wins as f64 / (joint.len() * marginal.len()) as f64;
    assert!(auc > 0.5, "AUC {auc} is not better than chance");
}

#[test]
fn test_resume_continues_epoch_counter() {
    let mut snre = new_snre(RatioVariant::A, true);
    let (theta, x) = simulate(300, 3);
    snre.append_simulations(theta, x, 0).unwrap();

    snre.train(&TrainConfig::new().with_max_num_epochs(Some(2)))
        .unwrap();
    assert_eq!(snre.epoch(), 2);
    let steps_per_epoch = snre.optimizer_steps() / 2;
    assert!(steps_per_epoch > 0);

    snre.train(
        &TrainConfig::new()
            .with_max_num_epochs(Some(5))
            .with_resume_training(true),
    )
    .unwrap();
    assert_eq!(snre.epoch(), 5);
    assert_eq!(snre.summary().epochs, vec![2, 5]);
    assert_eq!(snre.summary().validation_log_probs.len(), 5);
    // The optimizer from the first call kept stepping.
    assert_eq!(snre.optimizer_steps(), 5 * steps_per_epoch);

    // Without resuming the counter starts over, and so does the optimizer.
    snre.train(&TrainConfig::new().with_max_num_epochs(Some(1)))
        .unwrap();
    assert_eq!(snre.epoch(), 1);
    assert_eq!(snre.optimizer_steps(), steps_per_epoch);
}

#[test]
fn test_discard_prior_samples_uses_later_rounds_only() {
    let mut snre = new_snre(RatioVariant::A, true);
    let (theta, x) = simulate(200, 4);
    snre.append_simulations(theta, x, 0).unwrap();
    let (theta, x) = simulate(150, 5);
    snre.append_simulations(theta, x, 1).unwrap();
    assert_eq!(snre.round(), 1);

    let quick = TrainConfig::new().with_max_num_epochs(Some(1));
    snre.train(&quick.clone().with_discard_prior_samples(true))
        .unwrap();
    snre.train(&quick).unwrap();
    assert_eq!(snre.summary().num_simulations, vec![150, 350]);
}

#[test]
fn test_invalid_simulations_are_excluded() {
    let mut snre = new_snre(RatioVariant::A, true);
    let (theta, mut x) = simulate(200, 6);
    x[[3, 0]] = f32::NAN;
    x[[7, 0]] = f32::INFINITY;
    snre.append_simulations(theta, x, 0).unwrap();
    snre.train(&TrainConfig::new().with_max_num_epochs(Some(1)))
        .unwrap();
    assert_eq!(snre.summary().num_simulations, vec![198]);
}

#[test]
fn test_anneal_runs_every_epoch() {
    let mut snre = new_snre(RatioVariant::A, true);
    let (theta, x) = simulate(200, 7);
    snre.append_simulations(theta, x, 0).unwrap();
    let config = AnnealConfig::new()
        .with_max_num_epochs(4)
        .with_stop_after_epochs(1)
        .with_lagrange_multiplier(0.3);
    snre.anneal(&config).unwrap();

    assert_eq!(snre.epoch(), 4);
    let summary = snre.summary();
    assert_eq!(summary.validation_mixed_log_probs.len(), 4);
    assert!(summary.best_validation_log_probs[0].is_finite());
}

#[test]
fn test_anneal_rejects_non_positive_rate() {
    let mut snre = new_snre(RatioVariant::A, true);
    let (theta, x) = simulate(100, 8);
    snre.append_simulations(theta, x, 0).unwrap();
    let config = AnnealConfig::new().with_annealing_rate(-1.0);
    assert!(matches!(
        snre.anneal(&config),
        Err(SnreError::InvalidArgument { .. })
    ));
    assert!(snre.network().is_none());
}

#[test]
fn test_variant_b_posterior() {
    let mut snre = new_snre(RatioVariant::B, true);
    let (theta, x) = simulate(300, 9);
    snre.append_simulations(theta, x, 0).unwrap();
    snre.train(
        &TrainConfig::new()
            .with_num_atoms(5)
            .with_max_num_epochs(Some(3)),
    )
    .unwrap();

    let posterior = snre
        .build_posterior(
            None,
            None,
            "rejection",
            "mh",
            McmcParameters::new(),
            RejectionParameters::new().with_seed(Some(0)),
        )
        .unwrap();
    let samples = posterior.sample(50, Some(&[0.5_f32][..])).unwrap();
    assert_eq!(samples.dim(), (50, 1));
    assert!(samples.iter().all(|&t| (0.0..=1.0).contains(&t)));
    let log_prob = posterior.log_prob(&samples, Some(&[0.5_f32][..])).unwrap();
    assert!(log_prob.iter().all(|v| v.is_finite()));
}

#[test]
fn test_posterior_history() {
    let mut snre = new_snre(RatioVariant::A, true);
    let (theta, x) = simulate(200, 10);
    snre.append_simulations(theta, x, 0).unwrap();
    snre.train(&TrainConfig::new().with_max_num_epochs(Some(1)))
        .unwrap();

    let vi = snre.build_posterior(
        None,
        None,
        "vi",
        "mh",
        McmcParameters::new(),
        RejectionParameters::new(),
    );
    assert!(matches!(vi, Err(SnreError::NotImplemented(_))));
    assert!(snre.posteriors().is_empty());

    let slice = snre.build_posterior(
        None,
        None,
        "mcmc",
        "slice_np",
        McmcParameters::new(),
        RejectionParameters::new(),
    );
    assert!(matches!(slice, Err(SnreError::NotImplemented(_))));

    snre.build_posterior(
        None,
        None,
        "mcmc",
        "hmc",
        McmcParameters::new(),
        RejectionParameters::new(),
    )
    .unwrap();
    assert_eq!(snre.posteriors().len(), 1);
}

#[test]
fn test_prior_can_be_supplied_late() {
    let mut snre = new_snre(RatioVariant::A, false);
    let (theta, x) = simulate(200, 12);
    snre.append_simulations(theta, x, 0).unwrap();
    snre.train(&TrainConfig::new().with_max_num_epochs(Some(1)))
        .unwrap();

    let missing = snre.build_posterior(
        None,
        None,
        "rejection",
        "mh",
        McmcParameters::new(),
        RejectionParameters::new(),
    );
    assert!(matches!(missing, Err(SnreError::MissingPrior)));

    let posterior = snre
        .build_posterior(
            None,
            Some(prior()),
            "rejection",
            "mh",
            McmcParameters::new(),
            RejectionParameters::new(),
        )
        .unwrap();
    assert_eq!(posterior.prior().low(), &[0.0]);
}

#[test]
fn test_summary_sink_receives_round_scalars() {
    let sink = std::sync::Arc::new(std::sync::Mutex::new(InMemorySink::default()));

    struct Shared(std::sync::Arc<std::sync::Mutex<InMemorySink>>);
    impl SummarySink for Shared {
        fn add_scalar(&mut self, tag: &str, value: f64, step: usize) {
            self.0.lock().unwrap().add_scalar(tag, value, step);
        }
    }

    let mut snre = new_snre(RatioVariant::A, true).with_sink(Box::new(Shared(sink.clone())));
    let (theta, x) = simulate(200, 13);
    snre.append_simulations(theta, x, 0).unwrap();
    snre.train(&TrainConfig::new().with_max_num_epochs(Some(2)))
        .unwrap();

    let sink = sink.lock().unwrap();
    assert_eq!(sink.series["epochs_trained"], vec![(0, 2.0)]);
    assert_eq!(sink.series["num_simulations"], vec![(0, 200.0)]);
}
