//! Ratio classifiers.
//!
//! The training loop only relies on [`RatioClassifier`]: a differentiable map from a
//! batch of `(θ, x)` rows to one logit per row. For a well-trained classifier the
//! logit approximates `log p(θ, x) / p(θ)p(x)`.
//!
//! A small default family is provided through [`ClassifierConfig`]:
//!
//! ```text
//! [θ | x] → z-score → Linear(d→h) → ReLU → {Linear(h→h) → ReLU (+ skip)}* → Linear(h→1)
//! ```
//!
//! `Linear` has no hidden layers, `Mlp` stacks hidden layers, `Resnet` adds a skip
//! connection around every hidden block.

use burn::module::Param;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::TensorData;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

/// A trainable classifier scoring `(θ, x)` pairs.
pub trait RatioClassifier<B: Backend>: Module<B> {
    /// Returns one logit per row of `theta`/`x`.
    ///
    /// * `theta`: `[n, dim_theta]`
    /// * `x`: `[n, dim_x]`
    fn forward(&self, theta: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 1>;
}

/// Function building a classifier from the first round of training data.
///
/// It receives the training `theta` and `x` so the network can infer input shapes and
/// standardization statistics.
pub type ClassifierBuilder<B, M> =
    Box<dyn Fn(&Array2<f32>, &Array2<f32>, &<B as Backend>::Device) -> M + Send>;

/// Architecture of the default classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClassifierKind {
    Linear,
    Mlp,
    Resnet,
}

impl std::str::FromStr for ClassifierKind {
    type Err = crate::error::SnreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linear" => Ok(ClassifierKind::Linear),
            "mlp" => Ok(ClassifierKind::Mlp),
            "resnet" => Ok(ClassifierKind::Resnet),
            other => Err(crate::error::SnreError::invalid(
                "classifier",
                format!("unknown classifier `{other}`, expected one of linear, mlp, resnet"),
            )),
        }
    }
}

/// Configuration of the default classifier.
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// Network family.
    #[config(default = "ClassifierKind::Resnet")]
    pub kind: ClassifierKind,
    /// Width of the hidden layers.
    #[config(default = 50)]
    pub hidden_features: usize,
    /// Number of hidden `h → h` blocks after the input layer.
    #[config(default = 2)]
    pub num_blocks: usize,
    /// Whether to standardize inputs with statistics of the first training batch.
    #[config(default = true)]
    pub z_score: bool,
}

/// Default classifier network.
#[derive(Module, Debug)]
pub struct ClassifierNet<B: Backend> {
    /// Per-feature input shift, frozen.
    shift: Param<Tensor<B, 1>>,
    /// Per-feature input scale, frozen.
    scale: Param<Tensor<B, 1>>,
    /// Input layer followed by hidden blocks. Empty for the linear classifier.
    layers: Vec<Linear<B>>,
    /// Final projection to a single logit.
    output: Linear<B>,
    /// Add skip connections around hidden blocks.
    residual: bool,
}

impl ClassifierConfig {
    /// Initializes a classifier without standardization.
    pub fn init<B: Backend>(
        &self,
        theta_dim: usize,
        x_dim: usize,
        device: &B::Device,
    ) -> ClassifierNet<B> {
        let d = theta_dim + x_dim;
        self.init_with_stats(vec![0.0; d], vec![1.0; d], device)
    }

    /// Initializes a classifier whose input statistics come from `theta` and `x`.
    ///
    /// Rows are assumed paired; only the column dimensions and (when `z_score` is set)
    /// the per-column mean and standard deviation are used.
    pub fn init_with_data<B: Backend>(
        &self,
        theta: &Array2<f32>,
        x: &Array2<f32>,
        device: &B::Device,
    ) -> ClassifierNet<B> {
        let d = theta.ncols() + x.ncols();
        if !self.z_score || theta.nrows() < 2 {
            return self.init_with_stats(vec![0.0; d], vec![1.0; d], device);
        }
        let mut shift = Vec::with_capacity(d);
        let mut scale = Vec::with_capacity(d);
        for block in [theta, x] {
            let mean = block
                .mean_axis(Axis(0))
                .unwrap_or_else(|| ndarray::Array1::zeros(block.ncols()));
            let std = block.std_axis(Axis(0), 1.0);
            shift.extend(mean.iter().copied());
            scale.extend(std.iter().map(|&s| if s.is_finite() { s.max(1e-6) } else { 1.0 }));
        }
        self.init_with_stats(shift, scale, device)
    }

    fn init_with_stats<B: Backend>(
        &self,
        shift: Vec<f32>,
        scale: Vec<f32>,
        device: &B::Device,
    ) -> ClassifierNet<B> {
        let d = shift.len();
        let h = self.hidden_features;
        let layers = match self.kind {
            ClassifierKind::Linear => Vec::new(),
            ClassifierKind::Mlp | ClassifierKind::Resnet => {
                let mut layers = vec![LinearConfig::new(d, h).init(device)];
                layers.extend((0..self.num_blocks).map(|_| LinearConfig::new(h, h).init(device)));
                layers
            }
        };
        let out_in = if layers.is_empty() { d } else { h };

        ClassifierNet {
            shift: frozen(shift, device),
            scale: frozen(scale, device),
            layers,
            output: LinearConfig::new(out_in, 1).init(device),
            residual: self.kind == ClassifierKind::Resnet,
        }
    }

    /// Returns a builder closure suitable for [`crate::snre::Snre::new`].
    pub fn builder<B: Backend>(self) -> ClassifierBuilder<B, ClassifierNet<B>> {
        Box::new(move |theta, x, device| self.init_with_data(theta, x, device))
    }
}

fn frozen<B: Backend>(values: Vec<f32>, device: &B::Device) -> Param<Tensor<B, 1>> {
    let n = values.len();
    Param::from_tensor(Tensor::from_data(TensorData::new(values, [n]), device))
        .set_require_grad(false)
}

impl<B: Backend> RatioClassifier<B> for ClassifierNet<B> {
    fn forward(&self, theta: Tensor<B, 2>, x: Tensor<B, 2>) -> Tensor<B, 1> {
        let inputs = Tensor::cat(vec![theta, x], 1);
        let n = inputs.dims()[0];
        let shift = self.shift.val().unsqueeze_dim::<2>(0);
        let scale = self.scale.val().unsqueeze_dim::<2>(0);
        let mut h = (inputs - shift) / scale;

        for (i, layer) in self.layers.iter().enumerate() {
            let out = relu(layer.forward(h.clone()));
            h = if self.residual && i > 0 { h + out } else { out };
        }

        self.output.forward(h).reshape([n])
    }
}
