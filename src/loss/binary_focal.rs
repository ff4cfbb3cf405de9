use candle_core::Tensor;
use candle_nn::ops::sigmoid;

use super::Loss;
use super::base::binary_cross_entropy_with_logits;
use crate::config::{Alpha, FocalLossConfig, Reduction, validate_weight_tensor};
use crate::error::Result;

/// Binary focal loss on logits (Lin et al., "Focal Loss for Dense Object Detection")
///
/// Also works unchanged for multi-label classification, since every element
/// is treated as an independent binary problem.
///
/// `alpha` differs from the paper: it weights the positive term only and the
/// negative term keeps a weight of 1, so it is unbounded. The paper's
/// `alpha*` in `[0, 1]` converts as `alpha = alpha* / (1 - alpha*)`.
#[derive(Debug, Clone)]
pub struct BinaryFocalLoss {
    gamma: f64,
    alpha: Option<Tensor>,
    weight: Option<Tensor>,
    reduction: Reduction,
}

/// Builder for [`BinaryFocalLoss`]
#[derive(Debug, Clone, Default)]
pub struct BinaryFocalLossBuilder {
    config: FocalLossConfig,
    alpha: Option<Alpha>,
    weight: Option<Tensor>,
    pos_weight: Option<Tensor>,
}

impl BinaryFocalLossBuilder {
    /// Replace gamma and reduction at once
    pub fn config(mut self, config: FocalLossConfig) -> Self {
        self.config = config;
        self
    }

    /// Focusing strength, `0` gives plain binary cross entropy
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.config.gamma = gamma;
        self
    }

    /// Aggregation of the elementwise loss
    pub fn reduction(mut self, reduction: Reduction) -> Self {
        self.config.reduction = reduction;
        self
    }

    /// Positive class weight, a scalar or a tensor broadcast against the inputs
    pub fn alpha(mut self, alpha: impl Into<Alpha>) -> Self {
        self.alpha = Some(alpha.into());
        self
    }

    /// Per-element rescaling weight, broadcast against the inputs
    pub fn weight(mut self, weight: Tensor) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Alternative name for `alpha`; ignored when `alpha` is set
    pub fn pos_weight(mut self, pos_weight: Tensor) -> Self {
        self.pos_weight = Some(pos_weight);
        self
    }

    /// Validate the options and resolve `alpha` against `pos_weight`
    pub fn build(self) -> Result<BinaryFocalLoss> {
        self.config.validate()?;

        let alpha = match (self.alpha, self.pos_weight) {
            (Some(alpha), pos_weight) => {
                if pos_weight.is_some() {
                    tracing::warn!("pos_weight ignored because alpha is set");
                }
                Some(alpha.into_tensor()?)
            }
            (None, Some(pos_weight)) => Some(validate_weight_tensor("pos_weight", pos_weight)?),
            (None, None) => None,
        };
        let weight = self
            .weight
            .map(|weight| validate_weight_tensor("weight", weight))
            .transpose()?;

        tracing::debug!(
            gamma = self.config.gamma,
            reduction = %self.config.reduction,
            alpha = alpha.is_some(),
            weight = weight.is_some(),
            "built binary focal loss"
        );

        Ok(BinaryFocalLoss {
            gamma: self.config.gamma,
            alpha,
            weight,
            reduction: self.config.reduction,
        })
    }
}

impl BinaryFocalLoss {
    /// Create a loss with no balancing or rescaling weights
    pub fn new(config: FocalLossConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Start from the default options
    pub fn builder() -> BinaryFocalLossBuilder {
        BinaryFocalLossBuilder::default()
    }

    /// Focusing strength
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Resolved positive class weight (a scalar alpha is a one-element vector)
    pub fn alpha(&self) -> Option<&Tensor> {
        self.alpha.as_ref()
    }

    /// Per-element rescaling weight
    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    /// Aggregation applied by `forward`
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Elementwise focusing term `|target - sigmoid(inputs)|^gamma`
    ///
    /// All ones when gamma is zero.
    pub fn focusing_weights(&self, inputs: &Tensor, target: &Tensor) -> Result<Tensor> {
        let target = target.to_dtype(inputs.dtype())?;
        match self.focus(inputs, &target)? {
            Some(focus) => Ok(focus),
            None => Ok(inputs.ones_like()?),
        }
    }

    // None stands for a focus of one, so gamma == 0 skips the power entirely
    fn focus(&self, inputs: &Tensor, target: &Tensor) -> Result<Option<Tensor>> {
        if self.gamma == 0.0 {
            return Ok(None);
        }
        let probabilities = sigmoid(inputs)?;
        let focus = target.sub(&probabilities)?.abs()?.powf(self.gamma)?;
        Ok(Some(focus))
    }
}

impl Loss for BinaryFocalLoss {
    /// `inputs` are logits of any shape, `target` has the same shape with values in `[0, 1]`
    fn forward(&self, inputs: &Tensor, target: &Tensor) -> Result<Tensor> {
        tracing::trace!(shape = ?inputs.dims(), "binary focal loss forward");

        let target = target.to_dtype(inputs.dtype())?;
        let bce = binary_cross_entropy_with_logits(
            inputs,
            &target,
            self.weight.as_ref(),
            self.alpha.as_ref(),
        )?;

        let loss = match self.focus(inputs, &target)? {
            Some(focus) => focus.broadcast_mul(&bce)?,
            None => bce,
        };
        self.reduction.reduce(loss)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FocalLossError;
    use candle_core::{DType, Device, Var};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const LN_2: f64 = std::f64::consts::LN_2;

    fn random_batch(rng: &mut StdRng, n: usize) -> Result<(Tensor, Tensor)> {
        let logits: Vec<f64> = (0..n).map(|_| rng.random_range(-6.0..6.0)).collect();
        let labels: Vec<f64> = (0..n)
            .map(|_| if rng.random_bool(0.3) { 1.0 } else { 0.0 })
            .collect();
        let inputs = Tensor::from_vec(logits, (n / 4, 4), &Device::Cpu)?;
        let target = Tensor::from_vec(labels, (n / 4, 4), &Device::Cpu)?;
        Ok((inputs, target))
    }

    fn scalar(tensor: &Tensor) -> Result<f64> {
        Ok(tensor.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }

    #[test]
    fn test_binary_focal_loss_single_logit() -> Result<()> {
        let inputs = Tensor::new(&[0.0f64], &Device::Cpu)?;
        let target = Tensor::new(&[1.0f64], &Device::Cpu)?;

        let loss = BinaryFocalLoss::builder().gamma(2.0).build()?;
        let value = scalar(&loss.forward(&inputs, &target)?)?;

        // bce = ln 2, p = 0.5, focus = 0.25
        assert!((value - 0.25 * LN_2).abs() < 1e-12);
        assert!((value - 0.1733).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_gamma_zero_equals_base_loss() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(7);
        let (inputs, target) = random_batch(&mut rng, 32)?;
        let alpha = Tensor::new(&[0.5f64, 1.0, 2.0, 4.0], &Device::Cpu)?;
        let weight = Tensor::new(&[1.0f64, 0.0, 3.0, 0.5], &Device::Cpu)?;

        let base = binary_cross_entropy_with_logits(&inputs, &target, Some(&weight), Some(&alpha))?;
        for reduction in [Reduction::None, Reduction::Sum, Reduction::Mean] {
            let loss = BinaryFocalLoss::builder()
                .gamma(0.0)
                .alpha(&alpha)
                .weight(weight.clone())
                .reduction(reduction)
                .build()?;
            let focal = loss.forward(&inputs, &target)?;
            let expected = reduction.reduce(base.clone())?;

            let focal = focal.flatten_all()?.to_vec1::<f64>()?;
            let expected = expected.flatten_all()?.to_vec1::<f64>()?;
            assert_eq!(focal, expected, "reduction {reduction}");
        }
        Ok(())
    }

    #[test]
    fn test_focus_is_a_fraction() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(11);
        for gamma in [0.5, 1.0, 2.0, 5.0] {
            let (inputs, target) = random_batch(&mut rng, 64)?;
            let loss = BinaryFocalLoss::builder().gamma(gamma).build()?;
            let focus = loss.focusing_weights(&inputs, &target)?;
            for value in focus.flatten_all()?.to_vec1::<f64>()? {
                assert!((0.0..=1.0).contains(&value), "gamma {gamma}: focus {value}");
            }
        }

        let (inputs, target) = random_batch(&mut rng, 8)?;
        let loss = BinaryFocalLoss::builder().gamma(0.0).build()?;
        let focus = loss.focusing_weights(&inputs, &target)?;
        assert!(focus.flatten_all()?.to_vec1::<f64>()?.iter().all(|&f| f == 1.0));
        Ok(())
    }

    #[test]
    fn test_reductions_are_consistent() -> Result<()> {
        let mut rng = StdRng::seed_from_u64(3);
        let (inputs, target) = random_batch(&mut rng, 40)?;
        let build = |reduction| BinaryFocalLoss::builder().gamma(1.5).reduction(reduction).build();

        let none = build(Reduction::None)?.forward(&inputs, &target)?;
        let sum = scalar(&build(Reduction::Sum)?.forward(&inputs, &target)?)?;
        let mean = scalar(&build(Reduction::Mean)?.forward(&inputs, &target)?)?;

        assert_eq!(none.dims(), inputs.dims());
        let total: f64 = none.flatten_all()?.to_vec1::<f64>()?.iter().sum();
        assert!((sum - total).abs() < 1e-9);
        assert!((mean - sum / 40.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_scalar_alpha_matches_pos_weight() -> Result<()> {
        let inputs = Tensor::new(&[-1.0f64, 0.5, 2.0], &Device::Cpu)?;
        let target = Tensor::new(&[1.0f64, 0.0, 1.0], &Device::Cpu)?;

        let from_scalar = BinaryFocalLoss::builder()
            .alpha(2.0)
            .reduction(Reduction::None)
            .build()?;
        let from_tensor = BinaryFocalLoss::builder()
            .pos_weight(Tensor::new(&[2.0f64], &Device::Cpu)?)
            .reduction(Reduction::None)
            .build()?;

        assert_eq!(from_scalar.alpha().unwrap().to_vec1::<f64>()?, vec![2.0]);
        assert_eq!(
            from_scalar.forward(&inputs, &target)?.to_vec1::<f64>()?,
            from_tensor.forward(&inputs, &target)?.to_vec1::<f64>()?
        );
        Ok(())
    }

    #[test]
    fn test_alpha_wins_over_pos_weight() -> Result<()> {
        let loss = BinaryFocalLoss::builder()
            .pos_weight(Tensor::new(&[5.0f64], &Device::Cpu)?)
            .alpha(0.5)
            .build()?;
        assert_eq!(loss.alpha().unwrap().to_vec1::<f64>()?, vec![0.5]);
        Ok(())
    }

    #[test]
    fn test_alpha_scales_positive_examples_only() -> Result<()> {
        let inputs = Tensor::new(&[0.3f64, 0.3], &Device::Cpu)?;
        let target = Tensor::new(&[1.0f64, 0.0], &Device::Cpu)?;
        let plain = BinaryFocalLoss::builder().reduction(Reduction::None).build()?;
        let balanced = BinaryFocalLoss::builder()
            .alpha(3.0)
            .reduction(Reduction::None)
            .build()?;

        let plain = plain.forward(&inputs, &target)?.to_vec1::<f64>()?;
        let balanced = balanced.forward(&inputs, &target)?.to_vec1::<f64>()?;
        assert!((balanced[0] - 3.0 * plain[0]).abs() < 1e-12);
        assert_eq!(balanced[1], plain[1]);
        Ok(())
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(matches!(
            FocalLossConfig::new(2.0, "invalid").and_then(BinaryFocalLoss::new),
            Err(FocalLossError::InvalidReduction(_))
        ));
        assert!(matches!(
            BinaryFocalLoss::builder().gamma(-0.5).build(),
            Err(FocalLossError::InvalidGamma(_))
        ));
        assert!(matches!(
            BinaryFocalLoss::builder().alpha(f64::NAN).build(),
            Err(FocalLossError::InvalidWeight(_))
        ));

        let int_weight = Tensor::new(&[1i64, 2], &Device::Cpu).unwrap();
        assert!(matches!(
            BinaryFocalLoss::builder().pos_weight(int_weight.clone()).build(),
            Err(FocalLossError::InvalidWeight(_))
        ));
        assert!(matches!(
            BinaryFocalLoss::builder().weight(int_weight).build(),
            Err(FocalLossError::InvalidWeight(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_surfaces_engine_error() -> Result<()> {
        let inputs = Tensor::new(&[0.0f32, 1.0, 2.0], &Device::Cpu)?;
        let target = Tensor::new(&[1.0f32, 0.0], &Device::Cpu)?;
        let loss = BinaryFocalLoss::new(FocalLossConfig::default())?;

        assert!(matches!(
            loss.forward(&inputs, &target),
            Err(FocalLossError::Tensor(_))
        ));
        Ok(())
    }

    #[test]
    fn test_gradients_match_finite_differences() -> Result<()> {
        let logits = [-1.5f64, -0.2, 0.3, 2.0];
        let target = Tensor::new(&[0.0f64, 1.0, 0.8, 0.0], &Device::Cpu)?;
        let loss = BinaryFocalLoss::builder()
            .alpha(2.0)
            .reduction(Reduction::Sum)
            .build()?;

        let inputs = Var::new(&logits, &Device::Cpu)?;
        let grads = loss.forward(inputs.as_tensor(), &target)?.backward()?;
        let grad = grads
            .get(inputs.as_tensor())
            .expect("no gradient for the logits")
            .to_vec1::<f64>()?;

        let eps = 1e-6;
        for i in 0..logits.len() {
            let mut plus = logits;
            let mut minus = logits;
            plus[i] += eps;
            minus[i] -= eps;
            let plus = scalar(&loss.forward(&Tensor::new(&plus, &Device::Cpu)?, &target)?)?;
            let minus = scalar(&loss.forward(&Tensor::new(&minus, &Device::Cpu)?, &target)?)?;
            let numeric = (plus - minus) / (2.0 * eps);
            assert!((grad[i] - numeric).abs() < 1e-6, "{i}: {} vs {numeric}", grad[i]);
        }
        Ok(())
    }

    #[test]
    fn test_f32_inputs_with_f64_alpha() -> Result<()> {
        let inputs = Tensor::new(&[0.0f32], &Device::Cpu)?;
        let target = Tensor::new(&[1.0f32], &Device::Cpu)?;
        let loss = BinaryFocalLoss::builder().alpha(2.0).build()?;

        let value = loss.forward(&inputs, &target)?;
        assert_eq!(value.dtype(), DType::F32);
        assert!((value.to_scalar::<f32>()? - (0.5 * LN_2) as f32).abs() < 1e-6);
        Ok(())
    }
}
