//! Error type shared by every fallible operation in the crate.

use thiserror::Error;

/// Errors raised by the simulation store, the training loop and the posterior builder.
///
/// Precondition violations abort the current call; nothing is truncated or padded
/// to make a bad input fit.
#[derive(Debug, Error)]
pub enum SnreError {
    /// `theta` and `x` disagree on the number of rows.
    #[error("batch sizes for theta and x must match: theta has {theta} rows, x has {x}")]
    BatchMismatch { theta: usize, x: usize },

    /// Not enough distinct rows to draw the requested contrastive atoms without replacement.
    #[error("cannot draw {requested} distinct contrastive rows from {available} candidates; reduce `num_atoms` or increase the batch size")]
    InsufficientAtoms { requested: usize, available: usize },

    /// An argument is outside of its admissible range.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    /// Training was requested before any simulations were appended.
    #[error("no simulations available; call `append_simulations` first")]
    NoSimulations,

    /// A posterior was requested before any classifier was trained.
    #[error("no trained classifier available; call `train` or `anneal` first")]
    NotTrained,

    /// Neither the inference object nor the call site supplied a prior.
    #[error("no prior given; pass one to `Snre::new` or to `build_posterior`")]
    MissingPrior,

    /// No observation to condition the posterior on.
    #[error("no observation given; pass `x` or call `set_default_x` first")]
    MissingObservation,

    /// The requested sampling mode or kernel is not available.
    #[error("`{0}` is not implemented")]
    NotImplemented(String),

    /// Host-side array shape errors.
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),

    /// Tensor data could not be read back from the device.
    #[error("failed to read tensor data: {0}")]
    TensorData(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SnreError>;

impl SnreError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        SnreError::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}
