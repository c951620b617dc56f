//! Sequential neural ratio estimation.
//!
//! [`Snre`] owns the simulation store, the classifier and the training state across
//! rounds. A typical round is
//!
//! 1. [`Snre::append_simulations`] with `(θ, x)` pairs tagged by round,
//! 2. [`Snre::train`] (early stopping) or [`Snre::anneal`] (fixed epochs, annealed
//!    regularizer weight),
//! 3. [`Snre::build_posterior`] to sample `θ` given an observation.

use std::time::Instant;

use burn::module::AutodiffModule;
use burn::optim::{GradientsParams, Optimizer};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, Axis};
use rand::rngs::SmallRng;
use rand::{thread_rng, Rng, SeedableRng};

use crate::atoms::AtomicSampler;
use crate::classifier::{ClassifierBuilder, ClassifierConfig, ClassifierNet, RatioClassifier};
use crate::distributions::Prior;
use crate::error::{self, SnreError};
use crate::loss::RatioVariant;
use crate::posterior::{
    host_to_tensor, McmcParameters, PosteriorMethod, RatioPosterior, RejectionParameters,
};
use crate::store::{SimulationStore, Simulations};
use crate::summary::{describe_round, NoopSink, Summary, SummarySink};
use crate::training::{
    adam, clamp_and_warn, minibatches, AdamOptimizer, AnnealConfig, DataLoaderConfig, DataSplit,
    RunSettings, TrainConfig, TrainingState,
};

/// Options fixed for the lifetime of an [`Snre`] object.
#[derive(Config, Debug)]
pub struct SnreConfig {
    /// Loss family.
    #[config(default = "RatioVariant::A")]
    pub variant: RatioVariant,
    /// Seeds the atom sampler, the train/validation split and minibatch shuffling.
    pub seed: Option<u64>,
    #[config(default = true)]
    pub show_progress_bars: bool,
    /// Names of options that were passed but have no effect; logged once.
    #[config(default = "Vec::new()")]
    pub unused_args: Vec<String>,
}

/// Validation metrics of one epoch. All values are `-mean(loss)`.
#[derive(Debug, Clone, Copy)]
struct ValidationStats {
    objective: f64,
    regularizer: f64,
    mixed: f64,
    ratio_avg: f64,
}

/// Sequential neural ratio estimator.
///
/// - `B`: autodiff backend used for training.
/// - `P`: prior over `θ`.
/// - `M`: classifier, [`ClassifierNet`] unless a custom builder is given.
pub struct Snre<B, P, M = ClassifierNet<B>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    config: SnreConfig,
    builder: ClassifierBuilder<B, M>,
    prior: Option<P>,
    store: SimulationStore,
    network: Option<M>,
    state: TrainingState<B, M>,
    sampler: AtomicSampler,
    rng: SmallRng,
    summary: Summary,
    sink: Box<dyn SummarySink>,
    posteriors: Vec<RatioPosterior<B, P, M>>,
    round: usize,
    device: B::Device,
}

impl<B, P> Snre<B, P, ClassifierNet<B>>
where
    B: AutodiffBackend,
    P: Prior + 'static,
{
    /// Uses [`ClassifierNet`] built from `classifier`.
    pub fn with_default_classifier(
        prior: Option<P>,
        classifier: ClassifierConfig,
        config: SnreConfig,
        device: &B::Device,
    ) -> Self {
        Self::new(prior, classifier.builder(), config, device)
    }
}

impl<B, P, M> Snre<B, P, M>
where
    B: AutodiffBackend,
    P: Prior + 'static,
    M: RatioClassifier<B> + AutodiffModule<B>,
    M::InnerModule: RatioClassifier<B::InnerBackend>,
{
    pub fn new(
        prior: Option<P>,
        builder: ClassifierBuilder<B, M>,
        config: SnreConfig,
        device: &B::Device,
    ) -> Self {
        if !config.unused_args.is_empty() {
            tracing::warn!(
                unused = ?config.unused_args,
                "arguments were passed that have no effect on ratio estimation"
            );
        }
        let seed = config.seed.unwrap_or_else(|| thread_rng().gen());
        Self {
            builder,
            prior,
            store: SimulationStore::new(),
            network: None,
            state: TrainingState::default(),
            sampler: AtomicSampler::new().set_seed(seed),
            rng: SmallRng::seed_from_u64(seed.wrapping_add(1)),
            summary: Summary::default(),
            sink: Box::new(NoopSink),
            posteriors: Vec::new(),
            round: 0,
            device: device.clone(),
            config,
        }
    }

    /// Forwards per-round scalars to `sink`.
    pub fn with_sink(mut self, sink: Box<dyn SummarySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Reseeds every random draw made during training.
    pub fn set_seed(&mut self, seed: u64) -> &mut Self {
        self.config.seed = Some(seed);
        self.sampler = self.sampler.clone().set_seed(seed);
        self.rng = SmallRng::seed_from_u64(seed.wrapping_add(1));
        self
    }

    pub fn config(&self) -> &SnreConfig {
        &self.config
    }

    /// Stores simulations generated in round `from_round` (0 for prior draws).
    pub fn append_simulations(
        &mut self,
        theta: Array2<f32>,
        x: Array2<f32>,
        from_round: usize,
    ) -> error::Result<&mut Self> {
        self.store.append(theta, x, from_round)?;
        self.round = self.store.max_round().unwrap_or(0);
        Ok(self)
    }

    /// Trains until the validation log-prob stops improving for `stop_after_epochs`
    /// epochs, then restores the best network. Returns a copy of the trained network.
    pub fn train(&mut self, config: &TrainConfig) -> error::Result<M> {
        let settings = RunSettings::try_from(config)?;
        self.run(settings)
    }

    /// Trains for exactly `max_num_epochs` epochs while the regularizer weight cools
    /// from 0.01 towards its target. Returns a copy of the final network.
    pub fn anneal(&mut self, config: &AnnealConfig) -> error::Result<M> {
        let settings = RunSettings::try_from(config)?;
        self.run(settings)
    }

    /// The current network, if any round was trained.
    pub fn network(&self) -> Option<&M> {
        self.network.as_ref()
    }

    /// Epochs trained so far in the current (possibly resumed) run.
    pub fn epoch(&self) -> usize {
        self.state.epoch
    }

    /// Gradient steps taken by the optimizer since it was last created. Resuming keeps
    /// counting.
    pub fn optimizer_steps(&self) -> usize {
        self.state.optimizer_steps
    }

    /// Latest round seen in the store.
    pub fn round(&self) -> usize {
        self.round
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn store(&self) -> &SimulationStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SimulationStore {
        &mut self.store
    }

    pub fn prior(&self) -> Option<&P> {
        self.prior.as_ref()
    }

    /// Every posterior built so far, oldest first.
    pub fn posteriors(&self) -> &[RatioPosterior<B, P, M>] {
        &self.posteriors
    }

    /// Wraps a classifier into a posterior and records it in the history.
    ///
    /// `density_estimator` defaults to the trained network and `prior` to the one given
    /// at construction. Options are validated before anything is recorded.
    pub fn build_posterior(
        &mut self,
        density_estimator: Option<M>,
        prior: Option<P>,
        sample_with: &str,
        mcmc_method: &str,
        mcmc_parameters: McmcParameters,
        rejection_parameters: RejectionParameters,
    ) -> error::Result<RatioPosterior<B, P, M>> {
        let method = PosteriorMethod::from_options(
            sample_with,
            mcmc_method,
            mcmc_parameters,
            rejection_parameters,
        )?;
        let net = match density_estimator {
            Some(net) => net,
            None => self.network.clone().ok_or(SnreError::NotTrained)?,
        };
        let prior = match prior {
            Some(prior) => prior,
            None => self.prior.clone().ok_or(SnreError::MissingPrior)?,
        };
        let x_dim = self.store.dims().map(|(_, x_dim)| x_dim);
        let posterior = RatioPosterior::new(net, prior, method, x_dim, &self.device)
            .with_progress_bars(self.config.show_progress_bars);
        self.posteriors.push(posterior.clone());
        Ok(posterior)
    }

    fn run(&mut self, settings: RunSettings) -> error::Result<M> {
        let round = self.store.max_round().ok_or(SnreError::NoSimulations)?;
        self.round = round;
        let start_round = usize::from(settings.discard_prior_samples && round > 0);
        let data = self
            .store
            .simulations(start_round, settings.exclude_invalid_x)?;
        let num_examples = data.len();

        let reusable = self
            .state
            .split
            .as_ref()
            .filter(|split| settings.resume_training && split.len() == num_examples);
        let split = match reusable {
            Some(split) => split.clone(),
            None => {
                if settings.resume_training && self.state.split.is_some() {
                    tracing::warn!(
                        num_examples,
                        "number of simulations changed since the last run; drawing a new split"
                    );
                }
                DataSplit::new(num_examples, settings.validation_fraction, &mut self.rng)?
            }
        };

        let train_batch_size = settings.training_batch_size.min(split.train.len());
        let val_batch_size = settings.training_batch_size.min(split.validation.len());
        let smallest_batch = train_batch_size.min(val_batch_size);
        // Every row needs at least two other rows to contrast against.
        if smallest_batch < 3 {
            return Err(SnreError::invalid(
                "training_batch_size",
                format!(
                    "batches of {smallest_batch} rows (train {train_batch_size}, validation \
                     {val_batch_size}) are too small, at least 3 are needed"
                ),
            ));
        }
        let num_atoms = match self.config.variant.fixed_num_atoms() {
            Some(fixed) => {
                if settings.num_atoms != fixed {
                    tracing::debug!(
                        requested = settings.num_atoms,
                        fixed,
                        "num_atoms is fixed by the loss variant"
                    );
                }
                fixed
            }
            None => clamp_and_warn("num_atoms", settings.num_atoms, 2, smallest_batch - 1),
        };
        self.state.split = Some(split.clone());

        let rebuild = self.network.is_none() || settings.retrain_from_scratch;
        if rebuild {
            let theta = data.theta.select(Axis(0), &split.train);
            let x = data.x.select(Axis(0), &split.train);
            self.network = Some((self.builder)(&theta, &x, &self.device));
        }
        if rebuild || !settings.resume_training || self.state.optimizer.is_none() {
            self.state.restart(settings.clip_max_norm);
        }

        let net = self.network.take().ok_or(SnreError::NotTrained)?;
        let optimizer = self
            .state
            .optimizer
            .take()
            .unwrap_or_else(|| adam(settings.clip_max_norm));
        let run = EpochRun {
            data: &data,
            split: &split,
            train_batch_size,
            val_batch_size,
            num_atoms,
        };
        let (net, optimizer, outcome) = self.fit(net, optimizer, &run, &settings);
        self.network = Some(net.clone());
        self.state.optimizer = Some(optimizer);
        let converged = outcome?;

        if settings.early_stopping {
            if converged {
                tracing::info!(
                    epochs = self.state.epoch,
                    best_val_log_prob = self.state.best_val_log_prob,
                    "neural network successfully converged"
                );
            } else {
                tracing::warn!(
                    epochs = self.state.epoch,
                    "maximum number of epochs reached, but the network has not converged yet"
                );
            }
        } else {
            tracing::info!(
                epochs = self.state.epoch,
                best_val_log_prob = self.state.best_val_log_prob,
                "annealing finished"
            );
        }

        self.summary.epochs.push(self.state.epoch);
        self.summary
            .best_validation_log_probs
            .push(self.state.best_val_log_prob);
        self.summary.num_simulations.push(num_examples);
        self.summary.write_round(self.sink.as_mut(), round);
        if settings.show_train_summary {
            println!("{}", describe_round(round, &self.summary));
        }

        Ok(net)
    }

    /// Runs epochs until convergence or `max_num_epochs`. The network and optimizer are
    /// always handed back, also when an epoch fails.
    fn fit(
        &mut self,
        mut net: M,
        mut optimizer: AdamOptimizer<B, M>,
        run: &EpochRun<'_>,
        settings: &RunSettings,
    ) -> (M, AdamOptimizer<B, M>, error::Result<bool>) {
        let pb = self.progress_bar(settings.max_num_epochs);
        let mut converged = false;

        loop {
            if self.state.epoch >= settings.max_num_epochs {
                break;
            }
            if settings.early_stopping {
                if self.state.converged(&mut net, settings.stop_after_epochs) {
                    converged = true;
                    break;
                }
            } else {
                self.state.track(&net, settings.stop_after_epochs);
            }

            let started = Instant::now();
            let lambda = settings.schedule.at(self.state.epoch);
            let (next, train_log_prob) =
                self.train_epoch(net, &mut optimizer, run, lambda, settings);
            net = next;
            let train_log_prob = match train_log_prob {
                Ok(value) => value,
                Err(e) => return (net, optimizer, Err(e)),
            };
            self.state.epoch += 1;

            let stats = match self.validate(&net, run, settings.schedule.target(), &settings.dataloader) {
                Ok(stats) => stats,
                Err(e) => return (net, optimizer, Err(e)),
            };
            if !stats.objective.is_finite() {
                tracing::warn!(
                    epoch = self.state.epoch,
                    val_log_prob = stats.objective,
                    "non-finite validation log-prob"
                );
            }
            self.state.val_log_prob = stats.objective;

            let elapsed = started.elapsed().as_secs_f64();
            self.summary.train_log_probs.push(train_log_prob);
            self.summary.validation_log_probs.push(stats.objective);
            self.summary
                .validation_objective_log_probs
                .push(stats.objective);
            self.summary
                .validation_regularizer_log_probs
                .push(stats.regularizer);
            self.summary.validation_mixed_log_probs.push(stats.mixed);
            self.summary.validation_ratio_avg.push(stats.ratio_avg);
            self.summary.epoch_durations_sec.push(elapsed);

            tracing::debug!(
                epoch = self.state.epoch,
                lambda,
                train_log_prob,
                val_log_prob = stats.objective,
                "epoch finished"
            );
            pb.inc(1);
            pb.set_message(format!(
                "epoch {} | val {:.4}",
                self.state.epoch, stats.objective
            ));
        }

        pb.finish_and_clear();
        (net, optimizer, Ok(converged))
    }

    /// One pass over the training rows. Returns `-mean(mixed loss)`.
    fn train_epoch(
        &mut self,
        mut net: M,
        optimizer: &mut AdamOptimizer<B, M>,
        run: &EpochRun<'_>,
        lambda: f64,
        settings: &RunSettings,
    ) -> (M, error::Result<f64>) {
        let batches = minibatches(
            &run.split.train,
            run.train_batch_size,
            &settings.dataloader,
            true,
            &mut self.rng,
        );
        let mut loss_sum = 0.0;
        let mut count = 0usize;

        for batch in batches {
            if batch.len() < run.train_batch_size && batch.len() <= run.num_atoms {
                tracing::debug!(rows = batch.len(), "skipping undersized trailing batch");
                continue;
            }
            let (theta, x) = batch_tensors::<B>(run.data, &batch, &self.device);
            let terms = match self.config.variant.loss_terms(
                &net,
                &mut self.sampler,
                theta,
                x,
                run.num_atoms,
            ) {
                Ok(terms) => terms,
                Err(e) => return (net, Err(e)),
            };
            let mixed = terms.mixed(lambda);
            let entries = mixed.dims()[0];
            let loss = mixed.mean();
            let value: f64 = loss.clone().into_scalar().elem();
            if !value.is_finite() {
                tracing::warn!(epoch = self.state.epoch, loss = value, "non-finite training loss");
            }

            let grads = GradientsParams::from_grads(loss.backward(), &net);
            net = optimizer.step(settings.learning_rate, net, grads);
            self.state.optimizer_steps += 1;
            loss_sum += value * entries as f64;
            count += entries;
        }

        if count == 0 {
            return (
                net,
                Err(SnreError::invalid(
                    "training_batch_size",
                    "no training batch large enough for the requested atoms",
                )),
            );
        }
        (net, Ok(-loss_sum / count as f64))
    }

    /// Evaluates the validation rows in a fixed order without gradients.
    fn validate(
        &mut self,
        net: &M,
        run: &EpochRun<'_>,
        lambda: f64,
        dataloader: &DataLoaderConfig,
    ) -> error::Result<ValidationStats> {
        let net = net.valid();
        let batches = minibatches(
            &run.split.validation,
            run.val_batch_size,
            &dataloader.clone().with_shuffle(false),
            false,
            &mut self.rng,
        );
        let (mut objective, mut regularizer, mut mixed) = (0.0, 0.0, 0.0);
        let (mut ratio_sum, mut pairs) = (0.0, 0usize);
        let mut count = 0usize;

        for batch in batches {
            if batch.len() < run.val_batch_size && batch.len() <= run.num_atoms {
                continue;
            }
            let (theta, x) = batch_tensors::<B::InnerBackend>(run.data, &batch, &self.device);
            ratio_sum += net
                .forward(theta.clone(), x.clone())
                .sum()
                .into_scalar()
                .elem::<f64>();
            pairs += batch.len();

            let terms = self.config.variant.loss_terms(
                &net,
                &mut self.sampler,
                theta,
                x,
                run.num_atoms,
            )?;
            let entries = terms.entropy_yw.dims()[0];
            objective += terms.objective().sum().into_scalar().elem::<f64>();
            regularizer += terms.regularizer().sum().into_scalar().elem::<f64>();
            mixed += terms.mixed(lambda).sum().into_scalar().elem::<f64>();
            count += entries;
        }

        if count == 0 {
            return Err(SnreError::invalid(
                "validation_fraction",
                "validation set yields no batch",
            ));
        }
        let n = count as f64;
        Ok(ValidationStats {
            objective: -objective / n,
            regularizer: -regularizer / n,
            mixed: -mixed / n,
            ratio_avg: ratio_sum / pairs as f64,
        })
    }

    fn progress_bar(&self, max_num_epochs: usize) -> ProgressBar {
        if !self.config.show_progress_bars {
            return ProgressBar::hidden();
        }
        let pb = if max_num_epochs == usize::MAX {
            ProgressBar::new_spinner()
        } else {
            ProgressBar::new(max_num_epochs.saturating_sub(self.state.epoch) as u64)
        };
        if let Ok(style) =
            ProgressStyle::default_bar().template("{prefix:8} {bar:40.white} ETA {eta:3} | {msg}")
        {
            pb.set_style(style);
        }
        pb.set_prefix(format!("Round {}", self.round + 1));
        pb
    }
}

/// Data and sizes shared by every epoch of one training call.
struct EpochRun<'a> {
    data: &'a Simulations,
    split: &'a DataSplit,
    train_batch_size: usize,
    val_batch_size: usize,
    num_atoms: usize,
}

fn batch_tensors<B: Backend>(
    data: &Simulations,
    rows: &[usize],
    device: &B::Device,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let theta = data.theta.select(Axis(0), rows);
    let x = data.x.select(Axis(0), rows);
    (
        host_to_tensor::<B>(&theta, device),
        host_to_tensor::<B>(&x, device),
    )
}
