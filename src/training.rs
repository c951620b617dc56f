//! Training configuration and bookkeeping shared by `train` and `anneal`.

use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::{Adam, AdamConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;

use crate::error::{self, SnreError};

/// Floor of the annealing schedule.
pub const ANNEALING_EPSILON: f64 = 0.01;

/// Minibatch iteration options.
#[derive(Config, Debug)]
pub struct DataLoaderConfig {
    /// Reshuffle the training rows every epoch.
    #[config(default = true)]
    pub shuffle: bool,
    /// Drop the last incomplete minibatch.
    #[config(default = true)]
    pub drop_last: bool,
}

/// Options of [`crate::snre::Snre::train`].
#[derive(Config, Debug)]
pub struct TrainConfig {
    /// Atoms per contrastive set; clamped to one less than the smallest batch size.
    #[config(default = 10)]
    pub num_atoms: usize,
    #[config(default = 50)]
    pub training_batch_size: usize,
    #[config(default = 5e-4)]
    pub learning_rate: f64,
    /// Weight `λ` of the regularizer in `[0, 1]`.
    #[config(default = 0.0)]
    pub lagrange_multiplier: f64,
    #[config(default = 0.1)]
    pub validation_fraction: f64,
    /// Epochs without improvement of the validation log-prob before stopping.
    #[config(default = 20)]
    pub stop_after_epochs: usize,
    /// Unbounded when `None`.
    pub max_num_epochs: Option<usize>,
    /// Gradient-norm clipping threshold.
    #[config(default = "Some(5.0)")]
    pub clip_max_norm: Option<f32>,
    #[config(default = true)]
    pub exclude_invalid_x: bool,
    /// Continue with the previous split, optimizer, epoch counter and best log-prob.
    #[config(default = false)]
    pub resume_training: bool,
    /// Train only on simulations from rounds after the prior round.
    #[config(default = false)]
    pub discard_prior_samples: bool,
    #[config(default = false)]
    pub retrain_from_scratch: bool,
    /// Print a digest of the round when training ends.
    #[config(default = false)]
    pub show_train_summary: bool,
    #[config(default = "DataLoaderConfig::new()")]
    pub dataloader: DataLoaderConfig,
}

/// Options of [`crate::snre::Snre::anneal`].
///
/// The regularizer weight follows
/// `λ(epoch) = λ_target + (ε - λ_target) * exp(-annealing_rate * epoch)` with `ε = 0.01`,
/// and training always runs for `max_num_epochs` epochs.
#[derive(Config, Debug)]
pub struct AnnealConfig {
    #[config(default = 10)]
    pub num_atoms: usize,
    #[config(default = 50)]
    pub training_batch_size: usize,
    #[config(default = 5e-4)]
    pub learning_rate: f64,
    /// Target weight `λ_target` in `[0, 1]`.
    #[config(default = 0.5)]
    pub lagrange_multiplier: f64,
    /// Cooling rate, must be positive.
    #[config(default = 0.1)]
    pub annealing_rate: f64,
    #[config(default = 0.1)]
    pub validation_fraction: f64,
    /// Only used for best-log-prob bookkeeping.
    #[config(default = "usize::MAX")]
    pub stop_after_epochs: usize,
    #[config(default = 100)]
    pub max_num_epochs: usize,
    #[config(default = "Some(5.0)")]
    pub clip_max_norm: Option<f32>,
    #[config(default = true)]
    pub exclude_invalid_x: bool,
    #[config(default = false)]
    pub resume_training: bool,
    #[config(default = false)]
    pub discard_prior_samples: bool,
    #[config(default = false)]
    pub retrain_from_scratch: bool,
    #[config(default = false)]
    pub show_train_summary: bool,
    #[config(default = "DataLoaderConfig::new()")]
    pub dataloader: DataLoaderConfig,
}

/// Regularizer weight per epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LambdaSchedule {
    Fixed(f64),
    Annealed { target: f64, rate: f64 },
}

impl LambdaSchedule {
    /// Weight used for the training pass of `epoch`.
    pub fn at(&self, epoch: usize) -> f64 {
        match *self {
            LambdaSchedule::Fixed(lambda) => lambda,
            LambdaSchedule::Annealed { target, rate } => {
                law_of_cooling(target, rate, epoch)
            }
        }
    }

    /// Weight used for the validation diagnostics. Annealed runs validate with the
    /// target weight, not the current one.
    pub fn target(&self) -> f64 {
        match *self {
            LambdaSchedule::Fixed(lambda) => lambda,
            LambdaSchedule::Annealed { target, .. } => target,
        }
    }
}

/// `target + (ε - target) * exp(-rate * epoch)`.
pub fn law_of_cooling(target: f64, rate: f64, epoch: usize) -> f64 {
    target + (ANNEALING_EPSILON - target) * (-rate * epoch as f64).exp()
}

/// Mode-independent settings of one training call.
#[derive(Debug, Clone)]
pub(crate) struct RunSettings {
    pub num_atoms: usize,
    pub training_batch_size: usize,
    pub learning_rate: f64,
    pub schedule: LambdaSchedule,
    pub validation_fraction: f64,
    pub stop_after_epochs: usize,
    pub max_num_epochs: usize,
    /// Halt on convergence (`train`) or only track the best log-prob (`anneal`).
    pub early_stopping: bool,
    pub clip_max_norm: Option<f32>,
    pub exclude_invalid_x: bool,
    pub resume_training: bool,
    pub discard_prior_samples: bool,
    pub retrain_from_scratch: bool,
    pub show_train_summary: bool,
    pub dataloader: DataLoaderConfig,
}

impl RunSettings {
    fn validate(self) -> error::Result<Self> {
        crate::loss::check_lagrange_multiplier(self.schedule.target())?;
        if let LambdaSchedule::Annealed { rate, .. } = self.schedule {
            if !(rate > 0.0) {
                return Err(SnreError::invalid(
                    "annealing_rate",
                    format!("must be positive, got {rate}"),
                ));
            }
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(SnreError::invalid(
                "validation_fraction",
                format!("must lie in (0, 1), got {}", self.validation_fraction),
            ));
        }
        if self.training_batch_size == 0 {
            return Err(SnreError::invalid("training_batch_size", "must be positive"));
        }
        if self.stop_after_epochs == 0 {
            return Err(SnreError::invalid("stop_after_epochs", "must be positive"));
        }
        if !(self.learning_rate > 0.0) {
            return Err(SnreError::invalid("learning_rate", "must be positive"));
        }
        Ok(self)
    }
}

impl TryFrom<&TrainConfig> for RunSettings {
    type Error = SnreError;

    fn try_from(config: &TrainConfig) -> error::Result<Self> {
        RunSettings {
            num_atoms: config.num_atoms,
            training_batch_size: config.training_batch_size,
            learning_rate: config.learning_rate,
            schedule: LambdaSchedule::Fixed(config.lagrange_multiplier),
            validation_fraction: config.validation_fraction,
            stop_after_epochs: config.stop_after_epochs,
            max_num_epochs: config.max_num_epochs.unwrap_or(usize::MAX),
            early_stopping: true,
            clip_max_norm: config.clip_max_norm,
            exclude_invalid_x: config.exclude_invalid_x,
            resume_training: config.resume_training,
            discard_prior_samples: config.discard_prior_samples,
            retrain_from_scratch: config.retrain_from_scratch,
            show_train_summary: config.show_train_summary,
            dataloader: config.dataloader.clone(),
        }
        .validate()
    }
}

impl TryFrom<&AnnealConfig> for RunSettings {
    type Error = SnreError;

    fn try_from(config: &AnnealConfig) -> error::Result<Self> {
        RunSettings {
            num_atoms: config.num_atoms,
            training_batch_size: config.training_batch_size,
            learning_rate: config.learning_rate,
            schedule: LambdaSchedule::Annealed {
                target: config.lagrange_multiplier,
                rate: config.annealing_rate,
            },
            validation_fraction: config.validation_fraction,
            stop_after_epochs: config.stop_after_epochs,
            max_num_epochs: config.max_num_epochs,
            early_stopping: false,
            clip_max_norm: config.clip_max_norm,
            exclude_invalid_x: config.exclude_invalid_x,
            resume_training: config.resume_training,
            discard_prior_samples: config.discard_prior_samples,
            retrain_from_scratch: config.retrain_from_scratch,
            show_train_summary: config.show_train_summary,
            dataloader: config.dataloader.clone(),
        }
        .validate()
    }
}

/// Random partition of the rows into training and validation indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSplit {
    pub train: Vec<usize>,
    pub validation: Vec<usize>,
}

impl DataSplit {
    /// The first `floor((1 - validation_fraction) * n)` rows of a random permutation
    /// train, the rest validate. Both parts must be non-empty.
    pub fn new(num_examples: usize, validation_fraction: f64, rng: &mut SmallRng) -> error::Result<Self> {
        let num_train = ((1.0 - validation_fraction) * num_examples as f64) as usize;
        if num_train == 0 || num_train >= num_examples {
            return Err(SnreError::invalid(
                "validation_fraction",
                format!(
                    "{num_examples} simulations cannot be split into non-empty training and validation sets with fraction {validation_fraction}"
                ),
            ));
        }
        let mut permutation: Vec<usize> = (0..num_examples).collect();
        permutation.shuffle(rng);
        let validation = permutation.split_off(num_train);
        Ok(Self {
            train: permutation,
            validation,
        })
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Splits `indices` into minibatches of `batch_size`.
pub fn minibatches(
    indices: &[usize],
    batch_size: usize,
    options: &DataLoaderConfig,
    shuffle: bool,
    rng: &mut SmallRng,
) -> Vec<Vec<usize>> {
    let mut order = indices.to_vec();
    if shuffle && options.shuffle {
        order.shuffle(rng);
    }
    order
        .chunks(batch_size.max(1))
        .filter(|chunk| !options.drop_last || chunk.len() == batch_size)
        .map(<[usize]>::to_vec)
        .collect()
}

/// Clamps `value` into `[min, max]`, warning when it had to be changed.
pub fn clamp_and_warn(name: &str, value: usize, min: usize, max: usize) -> usize {
    let clamped = value.max(min).min(max.max(min));
    if clamped != value {
        tracing::warn!(
            "{name}={value} was clamped to {clamped}; it must be within [{min}, {max}]"
        );
    }
    clamped
}

pub(crate) type AdamOptimizer<B, M> = OptimizerAdaptor<Adam, M, B>;

pub(crate) fn adam<B, M>(clip_max_norm: Option<f32>) -> AdamOptimizer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    AdamConfig::new()
        .with_grad_clipping(clip_max_norm.map(GradientClippingConfig::Norm))
        .init()
}

/// State that survives between training calls when resuming.
pub struct TrainingState<B: AutodiffBackend, M: AutodiffModule<B>> {
    pub epoch: usize,
    pub val_log_prob: f64,
    pub best_val_log_prob: f64,
    pub epochs_since_last_improvement: usize,
    pub best_network: Option<M>,
    pub(crate) optimizer: Option<AdamOptimizer<B, M>>,
    /// Gradient steps taken by the current optimizer.
    pub optimizer_steps: usize,
    pub split: Option<DataSplit>,
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> Default for TrainingState<B, M> {
    fn default() -> Self {
        Self {
            epoch: 0,
            val_log_prob: f64::NEG_INFINITY,
            best_val_log_prob: f64::NEG_INFINITY,
            epochs_since_last_improvement: 0,
            best_network: None,
            optimizer: None,
            optimizer_steps: 0,
            split: None,
        }
    }
}

impl<B: AutodiffBackend, M: AutodiffModule<B>> TrainingState<B, M> {
    /// Fresh optimizer, epoch counter and best log-prob. The split is kept.
    pub(crate) fn restart(&mut self, clip_max_norm: Option<f32>) {
        self.optimizer = Some(adam(clip_max_norm));
        self.optimizer_steps = 0;
        self.epoch = 0;
        self.val_log_prob = f64::NEG_INFINITY;
        self.best_val_log_prob = f64::NEG_INFINITY;
        self.epochs_since_last_improvement = 0;
        self.best_network = None;
    }

    /// Records the latest validation log-prob and snapshots `network` when it
    /// improved. Returns `true` once `stop_after_epochs` epochs passed without
    /// strict improvement.
    pub fn track(&mut self, network: &M, stop_after_epochs: usize) -> bool {
        if self.epoch == 0 || self.val_log_prob > self.best_val_log_prob {
            self.best_val_log_prob = self.val_log_prob;
            self.epochs_since_last_improvement = 0;
            self.best_network = Some(network.clone());
        } else {
            self.epochs_since_last_improvement += 1;
        }
        self.epochs_since_last_improvement >= stop_after_epochs
    }

    /// Like [`TrainingState::track`], and on convergence restores the best snapshot
    /// into `network`.
    pub fn converged(&mut self, network: &mut M, stop_after_epochs: usize) -> bool {
        let converged = self.track(network, stop_after_epochs);
        if converged {
            if let Some(best) = &self.best_network {
                *network = best.clone();
            }
        }
        converged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, ClassifierKind, ClassifierNet, RatioClassifier};
    use approx::assert_abs_diff_eq;
    use burn::backend::{Autodiff, NdArray};
    use rand::SeedableRng;

    type TestBackend = Autodiff<NdArray>;

    #[test]
    fn test_law_of_cooling() {
        assert_abs_diff_eq!(law_of_cooling(0.5, 0.1, 0), ANNEALING_EPSILON, epsilon = 1e-12);
        assert_abs_diff_eq!(law_of_cooling(0.5, 0.1, 10_000), 0.5, epsilon = 1e-12);
        let mid = law_of_cooling(0.5, 0.1, 10);
        assert!(mid > ANNEALING_EPSILON && mid < 0.5);
        assert_abs_diff_eq!(mid, 0.5 - 0.49 * (-1.0_f64).exp(), epsilon = 1e-12);

        let schedule = LambdaSchedule::Annealed { target: 0.5, rate: 0.1 };
        assert_eq!(schedule.target(), 0.5);
        assert_eq!(LambdaSchedule::Fixed(0.2).at(7), 0.2);
    }

    #[test]
    fn test_split_sizes_and_disjointness() {
        let mut rng = SmallRng::seed_from_u64(0);
        let split = DataSplit::new(100, 0.1, &mut rng).unwrap();
        assert_eq!(split.train.len(), 90);
        assert_eq!(split.validation.len(), 10);
        let mut all: Vec<usize> = split.train.iter().chain(&split.validation).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());

        assert!(DataSplit::new(1, 0.1, &mut rng).is_err());
    }

    #[test]
    fn test_minibatches_drop_last() {
        let mut rng = SmallRng::seed_from_u64(0);
        let indices: Vec<usize> = (0..10).collect();
        let keep = DataLoaderConfig::new().with_drop_last(false).with_shuffle(false);
        let batches = minibatches(&indices, 4, &keep, true, &mut rng);
        assert_eq!(batches, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);

        let drop = DataLoaderConfig::new();
        let batches = minibatches(&indices, 4, &drop, true, &mut rng);
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.len() == 4));
    }

    #[test]
    fn test_clamp_and_warn() {
        assert_eq!(clamp_and_warn("num_atoms", 10, 2, 5), 5);
        assert_eq!(clamp_and_warn("num_atoms", 1, 2, 5), 2);
        assert_eq!(clamp_and_warn("num_atoms", 3, 2, 5), 3);
    }

    #[test]
    fn test_invalid_settings_are_rejected() {
        let bad_lambda = TrainConfig::new().with_lagrange_multiplier(1.5);
        assert!(RunSettings::try_from(&bad_lambda).is_err());
        let bad_rate = AnnealConfig::new().with_annealing_rate(0.0);
        assert!(RunSettings::try_from(&bad_rate).is_err());
        let ok = RunSettings::try_from(&TrainConfig::new()).unwrap();
        assert_eq!(ok.max_num_epochs, usize::MAX);
        assert!(ok.early_stopping);
    }

    #[test]
    fn test_convergence_restores_best_network() {
        let device = Default::default();
        let config = ClassifierConfig::new().with_kind(ClassifierKind::Linear);
        let first: ClassifierNet<TestBackend> = config.init(1, 1, &device);
        let mut current: ClassifierNet<TestBackend> = config.init(1, 1, &device);
        let mut state = TrainingState::<TestBackend, ClassifierNet<TestBackend>>::default();

        // epoch 0 always snapshots
        assert!(!state.converged(&mut first.clone(), 2));
        state.epoch = 1;
        state.val_log_prob = -1.0;
        assert!(!state.converged(&mut first.clone(), 2));
        assert_eq!(state.best_val_log_prob, -1.0);

        // two epochs without strict improvement
        state.epoch = 2;
        state.val_log_prob = -1.0;
        assert!(!state.converged(&mut current, 2));
        state.epoch = 3;
        state.val_log_prob = -3.0;
        assert!(state.converged(&mut current, 2));

        let logits = |net: &ClassifierNet<TestBackend>| -> Vec<f32> {
            let theta = Tensor::<TestBackend, 2>::from_floats([[0.3], [-1.2]], &device);
            let x = Tensor::<TestBackend, 2>::from_floats([[1.0], [0.5]], &device);
            net.forward(theta, x).into_data().to_vec().unwrap()
        };
        assert_eq!(logits(&current), logits(&first));
    }
}
