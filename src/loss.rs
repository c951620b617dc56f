//! Atomic contrastive losses for ratio estimation.
//!
//! Every variant produces three per-sample terms:
//!
//! - `entropy_yw`: supervised cross-entropy between the classifier logits on the
//!   primary atomic batch and the "true pairing" labels;
//! - `entropy_zw`: cross-entropy between the logits and their own predicted
//!   probabilities (the classifier's self-entropy);
//! - `exp_neg_entropy_zw`: leave-one-out estimate of `log E[exp(-entropy_zw)]` over
//!   pairings with every other observation of the batch.
//!
//! The training objective is the convex mixture
//! `(1 - λ) * entropy_yw - λ * (entropy_zw + exp_neg_entropy_zw)`.

use burn::prelude::*;
use burn::tensor::activation::{log_softmax, relu, sigmoid};
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};

use crate::atoms::{gather, AtomicSampler};
use crate::classifier::RatioClassifier;
use crate::error::{Result, SnreError};

/// The two published ratio-estimation losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RatioVariant {
    /// Binary classification of joint against marginal pairs (AALR). Uses exactly two
    /// atoms; the logits of a single-round estimator are normalized log-ratios.
    #[default]
    A,
    /// `K`-way classification of the true parameter among `K` atoms (SRE). The logits
    /// are log-ratios only up to an additive constant.
    B,
}

/// Per-sample loss terms of one batch.
#[derive(Debug, Clone)]
pub struct LossTriple<B: Backend> {
    pub entropy_yw: Tensor<B, 1>,
    pub entropy_zw: Tensor<B, 1>,
    pub exp_neg_entropy_zw: Tensor<B, 1>,
}

impl<B: Backend> LossTriple<B> {
    /// The supervised classification term.
    pub fn objective(&self) -> Tensor<B, 1> {
        self.entropy_yw.clone()
    }

    /// Self-entropy plus its leave-one-out correction.
    pub fn regularizer(&self) -> Tensor<B, 1> {
        self.entropy_zw.clone() + self.exp_neg_entropy_zw.clone()
    }

    /// The Lagrange-weighted training loss.
    pub fn mixed(&self, lagrange_multiplier: f64) -> Tensor<B, 1> {
        convex_combine(
            self.entropy_yw.clone(),
            self.entropy_zw.clone(),
            self.exp_neg_entropy_zw.clone(),
            lagrange_multiplier,
        )
    }

    /// Returns `(objective, regularizer, mixed)`.
    pub fn split(&self, lagrange_multiplier: f64) -> (Tensor<B, 1>, Tensor<B, 1>, Tensor<B, 1>) {
        (
            self.objective(),
            self.regularizer(),
            self.mixed(lagrange_multiplier),
        )
    }
}

/// `(1 - λ) * entropy_yw - λ * (entropy_zw + exp_neg_entropy_zw)`.
pub fn convex_combine<B: Backend>(
    entropy_yw: Tensor<B, 1>,
    entropy_zw: Tensor<B, 1>,
    exp_neg_entropy_zw: Tensor<B, 1>,
    lagrange_multiplier: f64,
) -> Tensor<B, 1> {
    entropy_yw.mul_scalar(1.0 - lagrange_multiplier)
        - (entropy_zw + exp_neg_entropy_zw).mul_scalar(lagrange_multiplier)
}

/// Elementwise binary cross-entropy between `logits` and probability `targets`.
///
/// Uses `max(l, 0) - l * t + log(1 + exp(-|l|))`, which stays finite for large `|l|`.
pub fn binary_cross_entropy_with_logits<B: Backend, const D: usize>(
    logits: Tensor<B, D>,
    targets: Tensor<B, D>,
) -> Tensor<B, D> {
    let softplus = relu(logits.clone()) + logits.clone().abs().neg().exp().log1p();
    softplus - logits * targets
}

/// `log(mean(exp(values)))` along dimension 1, computed with max subtraction.
pub fn log_mean_exp<B: Backend>(values: Tensor<B, 2>) -> Tensor<B, 1> {
    let [rows, cols] = values.dims();
    let max = values.clone().max_dim(1).detach();
    let lse = (values - max.clone()).exp().sum_dim(1).log() + max;
    lse.reshape([rows]).sub_scalar((cols as f64).ln())
}

/// Labels of the primary batch: 1 for the true pairing at atom position 0, 0 otherwise.
///
/// With two atoms this is the alternating pattern `1, 0, 1, 0, ...`.
pub fn atom_labels<B: Backend>(num_anchors: usize, num_atoms: usize, device: &B::Device) -> Tensor<B, 1> {
    let labels: Vec<f32> = (0..num_anchors * num_atoms)
        .map(|r| if r % num_atoms == 0 { 1.0 } else { 0.0 })
        .collect();
    Tensor::from_data(TensorData::new(labels, [num_anchors * num_atoms]), device)
}

impl RatioVariant {
    /// Atom count imposed by the variant, if any.
    pub fn fixed_num_atoms(&self) -> Option<usize> {
        match self {
            RatioVariant::A => Some(2),
            RatioVariant::B => None,
        }
    }

    /// Reduces the correction logits, laid out as `[N, N - 1, K]`, to the per-sample
    /// `log E_j[exp(-entropy)]` term.
    pub fn correction<B: Backend>(&self, logits: Tensor<B, 3>) -> Tensor<B, 1> {
        let [n, m, k] = logits.dims();
        match self {
            RatioVariant::A => {
                // Rows are (anchor, atom); columns run over the leave-one-out observations.
                let logits = logits.swap_dims(1, 2).reshape([n * k, m]);
                let neg_h = binary_cross_entropy_with_logits(logits.clone(), sigmoid(logits)).neg();
                log_mean_exp(neg_h)
            }
            RatioVariant::B => {
                let log_p = log_softmax(logits, 2);
                let h = (log_p.clone().exp() * log_p).sum_dim(2).neg().reshape([n, m]);
                log_mean_exp(h.neg())
            }
        }
    }

    /// Computes the three loss terms for one `(theta, x)` batch.
    ///
    /// Variant `A` yields `N * K` entries per term; variant `B` yields `N`.
    pub fn loss_terms<B, M>(
        &self,
        net: &M,
        sampler: &mut AtomicSampler,
        theta: Tensor<B, 2>,
        x: Tensor<B, 2>,
        num_atoms: usize,
    ) -> Result<LossTriple<B>>
    where
        B: Backend,
        M: RatioClassifier<B>,
    {
        let (n, n_x) = (theta.dims()[0], x.dims()[0]);
        if n != n_x {
            return Err(SnreError::BatchMismatch { theta: n, x: n_x });
        }
        let device = theta.device();

        let primary = sampler.primary(n, num_atoms)?;
        let (theta_atoms, x_atoms) = gather(&theta, &x, &primary)?;
        let logits = net.forward(theta_atoms, x_atoms);

        let correction = sampler.correction(n, num_atoms)?;
        let (theta_corr, x_corr) = gather(&theta, &x, &correction)?;
        let corr_logits = net
            .forward(theta_corr, x_corr)
            .reshape([n, n - 1, num_atoms]);
        let exp_neg_entropy_zw = self.correction(corr_logits);

        let (entropy_yw, entropy_zw) = match self {
            RatioVariant::A => {
                let labels = atom_labels::<B>(n, num_atoms, &device);
                let entropy_yw = binary_cross_entropy_with_logits(logits.clone(), labels);
                let entropy_zw = binary_cross_entropy_with_logits(logits.clone(), sigmoid(logits));
                (entropy_yw, entropy_zw)
            }
            RatioVariant::B => {
                let log_p = log_softmax(logits.reshape([n, num_atoms]), 1);
                let entropy_yw = log_p.clone().slice([0..n, 0..1]).reshape([n]).neg();
                let entropy_zw = (log_p.clone().exp() * log_p).sum_dim(1).reshape([n]).neg();
                (entropy_yw, entropy_zw)
            }
        };

        Ok(LossTriple {
            entropy_yw,
            entropy_zw,
            exp_neg_entropy_zw,
        })
    }

    /// Loss terms together with `(objective, regularizer, mixed)`.
    pub fn loss<B, M>(
        &self,
        net: &M,
        sampler: &mut AtomicSampler,
        theta: Tensor<B, 2>,
        x: Tensor<B, 2>,
        num_atoms: usize,
        lagrange_multiplier: f64,
    ) -> Result<(Tensor<B, 1>, Tensor<B, 1>, Tensor<B, 1>)>
    where
        B: Backend,
        M: RatioClassifier<B>,
    {
        check_lagrange_multiplier(lagrange_multiplier)?;
        let terms = self.loss_terms(net, sampler, theta, x, num_atoms)?;
        Ok(terms.split(lagrange_multiplier))
    }
}

pub(crate) fn check_lagrange_multiplier(lagrange_multiplier: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&lagrange_multiplier) {
        return Err(SnreError::invalid(
            "lagrange_multiplier",
            format!("must lie in [0, 1], got {lagrange_multiplier}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{ClassifierConfig, ClassifierKind};
    use approx::assert_abs_diff_eq;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::optim::GradientsParams;
    use burn::tensor::Distribution;

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<NdArray<f32>>;

    fn to_vec<const D: usize>(t: Tensor<TestBackend, D>) -> Vec<f32> {
        t.into_data().to_vec().unwrap()
    }

    fn naive_bce(l: f64, t: f64) -> f64 {
        let p = 1.0 / (1.0 + (-l).exp());
        -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
    }

    #[test]
    fn test_bce_matches_naive_formula() {
        let device = Default::default();
        let logits = [-3.0_f32, -0.5, 0.0, 0.7, 2.5];
        let targets = [0.0_f32, 1.0, 0.3, 0.0, 1.0];
        let out = binary_cross_entropy_with_logits(
            Tensor::<TestBackend, 1>::from_floats(logits, &device),
            Tensor::<TestBackend, 1>::from_floats(targets, &device),
        );
        for ((v, l), t) in to_vec(out).iter().zip(logits).zip(targets) {
            assert_abs_diff_eq!(*v as f64, naive_bce(l as f64, t as f64), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_bce_is_finite_for_extreme_logits() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::from_floats([-500.0_f32, 500.0], &device);
        let targets = Tensor::<TestBackend, 1>::from_floats([1.0_f32, 0.0], &device);
        let out = to_vec(binary_cross_entropy_with_logits(logits, targets));
        assert!(out.iter().all(|v| v.is_finite()));
        assert_abs_diff_eq!(out[0], 500.0, epsilon = 1e-3);
        assert_abs_diff_eq!(out[1], 500.0, epsilon = 1e-3);
    }

    #[test]
    fn test_self_entropy_is_nonnegative_and_matches_definition() {
        let device = Default::default();
        let logits = Tensor::<TestBackend, 1>::random([64], Distribution::Normal(0.0, 4.0), &device);
        let values = to_vec(logits.clone());
        let zw = to_vec(binary_cross_entropy_with_logits(
            logits.clone(),
            sigmoid(logits),
        ));
        for (h, l) in zw.iter().zip(values) {
            let p = 1.0 / (1.0 + (-(l as f64)).exp());
            assert!(*h >= -1e-6, "self-entropy must be non-negative, got {h}");
            assert_abs_diff_eq!(*h as f64, naive_bce(l as f64, p), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_log_mean_exp_matches_naive() {
        let device = Default::default();
        let data = [[0.1_f32, -0.4, 0.9], [-1.2, 0.3, 0.0]];
        let out = to_vec(log_mean_exp(Tensor::<TestBackend, 2>::from_floats(data, &device)));
        for (row, v) in data.iter().zip(out) {
            let naive = (row.iter().map(|&a| (a as f64).exp()).sum::<f64>() / 3.0).ln();
            assert_abs_diff_eq!(v as f64, naive, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_log_mean_exp_survives_large_values() {
        let device = Default::default();
        let out = to_vec(log_mean_exp(Tensor::<TestBackend, 2>::from_floats(
            [[1000.0_f32, 1000.0]],
            &device,
        )));
        assert_abs_diff_eq!(out[0], 1000.0, epsilon = 1e-3);
    }

    #[test]
    fn test_correction_a_matches_naive_log_mean_exp() {
        let device = Default::default();
        let (n, k) = (4, 2);
        let logits = Tensor::<TestBackend, 3>::random([n, n - 1, k], Distribution::Normal(0.0, 2.0), &device);
        let raw = to_vec(logits.clone());
        let out = to_vec(RatioVariant::A.correction(logits));
        assert_eq!(out.len(), n * k);

        for i in 0..n {
            for a in 0..k {
                let mean = (0..n - 1)
                    .map(|j| {
                        let l = raw[(i * (n - 1) + j) * k + a] as f64;
                        let p = 1.0 / (1.0 + (-l).exp());
                        (-naive_bce(l, p)).exp()
                    })
                    .sum::<f64>()
                    / (n - 1) as f64;
                assert_abs_diff_eq!(out[i * k + a] as f64, mean.ln(), epsilon = 1e-4);
            }
        }
    }

    #[test]
    fn test_correction_b_matches_naive_log_mean_exp() {
        let device = Default::default();
        let (n, k) = (3, 3);
        let logits = Tensor::<TestBackend, 3>::random([n, n - 1, k], Distribution::Normal(0.0, 1.0), &device);
        let raw = to_vec(logits.clone());
        let out = to_vec(RatioVariant::B.correction(logits));
        assert_eq!(out.len(), n);

        for i in 0..n {
            let mean = (0..n - 1)
                .map(|j| {
                    let row: Vec<f64> = (0..k)
                        .map(|a| raw[(i * (n - 1) + j) * k + a] as f64)
                        .collect();
                    let z: f64 = row.iter().map(|l| l.exp()).sum();
                    let h: f64 = row.iter().map(|l| -(l.exp() / z) * (l - z.ln())).sum();
                    (-h).exp()
                })
                .sum::<f64>()
                / (n - 1) as f64;
            assert_abs_diff_eq!(out[i] as f64, mean.ln(), epsilon = 1e-4);
        }
    }

    #[test]
    fn test_convex_combine_endpoints() {
        let device = Default::default();
        let yw = Tensor::<TestBackend, 1>::from_floats([1.0_f32, 2.0], &device);
        let zw = Tensor::<TestBackend, 1>::from_floats([0.5_f32, 0.25], &device);
        let corr = Tensor::<TestBackend, 1>::from_floats([-0.1_f32, -0.2], &device);

        let at_zero = to_vec(convex_combine(yw.clone(), zw.clone(), corr.clone(), 0.0));
        assert_eq!(at_zero, vec![1.0, 2.0]);
        let at_one = to_vec(convex_combine(yw.clone(), zw.clone(), corr.clone(), 1.0));
        assert_abs_diff_eq!(at_one[0], -0.4, epsilon = 1e-6);
        assert_abs_diff_eq!(at_one[1], -0.05, epsilon = 1e-6);
        let half = to_vec(convex_combine(yw, zw, corr, 0.5));
        assert_abs_diff_eq!(half[0], 0.5 - 0.2, epsilon = 1e-6);
    }

    #[test]
    fn test_loss_term_shapes_per_variant() {
        let device = Default::default();
        let net = ClassifierConfig::new()
            .with_kind(ClassifierKind::Mlp)
            .with_hidden_features(8)
            .init::<TestBackend>(1, 2, &device);
        let theta = Tensor::<TestBackend, 2>::random([6, 1], Distribution::Default, &device);
        let x = Tensor::<TestBackend, 2>::random([6, 2], Distribution::Default, &device);
        let mut sampler = AtomicSampler::new().set_seed(1);

        let a = RatioVariant::A
            .loss_terms(&net, &mut sampler, theta.clone(), x.clone(), 2)
            .unwrap();
        assert_eq!(a.entropy_yw.dims(), [12]);
        assert_eq!(a.entropy_zw.dims(), [12]);
        assert_eq!(a.exp_neg_entropy_zw.dims(), [12]);

        let b = RatioVariant::B
            .loss_terms(&net, &mut sampler, theta, x, 4)
            .unwrap();
        assert_eq!(b.entropy_yw.dims(), [6]);
        assert_eq!(b.entropy_zw.dims(), [6]);
        assert_eq!(b.exp_neg_entropy_zw.dims(), [6]);
        let yw = to_vec(b.entropy_yw);
        assert!(yw.iter().all(|v| *v >= 0.0));
    }

    #[test]
    fn test_mismatched_batches_are_rejected() {
        let device = Default::default();
        let net = ClassifierConfig::new().init::<TestBackend>(1, 1, &device);
        let theta = Tensor::<TestBackend, 2>::zeros([5, 1], &device);
        let x = Tensor::<TestBackend, 2>::zeros([4, 1], &device);
        let mut sampler = AtomicSampler::new().set_seed(1);
        let err = RatioVariant::A
            .loss_terms(&net, &mut sampler, theta, x, 2)
            .unwrap_err();
        assert!(matches!(err, SnreError::BatchMismatch { theta: 5, x: 4 }));
    }

    #[test]
    fn test_lagrange_multiplier_out_of_range() {
        let device = Default::default();
        let net = ClassifierConfig::new().init::<TestBackend>(1, 1, &device);
        let theta = Tensor::<TestBackend, 2>::zeros([4, 1], &device);
        let x = Tensor::<TestBackend, 2>::zeros([4, 1], &device);
        let mut sampler = AtomicSampler::new().set_seed(1);
        let err = RatioVariant::A
            .loss(&net, &mut sampler, theta, x, 2, 1.5)
            .unwrap_err();
        assert!(matches!(err, SnreError::InvalidArgument { name: "lagrange_multiplier", .. }));
    }

    #[test]
    fn test_mixed_loss_backpropagates() {
        let device = Default::default();
        let net = ClassifierConfig::new()
            .with_hidden_features(8)
            .init::<TestAutodiffBackend>(1, 1, &device);
        let theta = Tensor::<TestAutodiffBackend, 2>::random([5, 1], Distribution::Default, &device);
        let x = Tensor::<TestAutodiffBackend, 2>::random([5, 1], Distribution::Default, &device);
        let mut sampler = AtomicSampler::new().set_seed(9);

        let (_, _, mixed) = RatioVariant::A
            .loss(&net, &mut sampler, theta, x, 2, 0.3)
            .unwrap();
        let loss = mixed.mean();
        let value: f32 = loss.clone().into_scalar().elem();
        assert!(value.is_finite());

        let grads = GradientsParams::from_grads(loss.backward(), &net);
        assert!(!grads.is_empty());
    }
}
