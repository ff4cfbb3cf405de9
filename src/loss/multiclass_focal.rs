use candle_core::Tensor;
use candle_nn::ops::softmax;

use super::Loss;
use super::base::{ClassTargets, cross_entropy, cross_entropy_mean};
use crate::config::{Alpha, FocalLossConfig, Reduction, validate_weight_tensor};
use crate::error::{FocalLossError, Result};

/// Default target value excluded from the loss
pub const DEFAULT_IGNORE_INDEX: i64 = -100;

/// Multi-class focal loss on softmax logits
///
/// Extends the binary focal loss of Lin et al. to more than two classes:
/// the softmax cross entropy of every row is scaled by `(1 - p)^gamma`, where
/// `p` is the predicted probability of the true class. `alpha` holds one
/// weight per class and acts exactly like class weights of cross entropy.
#[derive(Debug, Clone)]
pub struct MultiClassFocalLoss {
    gamma: f64,
    alpha: Option<Tensor>,
    reduction: Reduction,
    ignore_index: i64,
    label_smoothing: f64,
}

/// Builder for [`MultiClassFocalLoss`]
#[derive(Debug, Clone)]
pub struct MultiClassFocalLossBuilder {
    config: FocalLossConfig,
    alpha: Option<Alpha>,
    weight: Option<Tensor>,
    ignore_index: i64,
    label_smoothing: f64,
}

impl Default for MultiClassFocalLossBuilder {
    fn default() -> Self {
        Self {
            config: FocalLossConfig::default(),
            alpha: None,
            weight: None,
            ignore_index: DEFAULT_IGNORE_INDEX,
            label_smoothing: 0.0,
        }
    }
}

impl MultiClassFocalLossBuilder {
    /// Replace gamma and reduction at once
    pub fn config(mut self, config: FocalLossConfig) -> Self {
        self.config = config;
        self
    }

    /// Focusing strength, `0` gives plain cross entropy
    pub fn gamma(mut self, gamma: f64) -> Self {
        self.config.gamma = gamma;
        self
    }

    /// Aggregation of the elementwise loss
    pub fn reduction(mut self, reduction: Reduction) -> Self {
        self.config.reduction = reduction;
        self
    }

    /// Per-class balancing weights of shape `[num_classes]`
    pub fn alpha(mut self, alpha: impl Into<Alpha>) -> Self {
        self.alpha = Some(alpha.into());
        self
    }

    /// Alternative name for `alpha`; ignored when `alpha` is set
    pub fn weight(mut self, weight: Tensor) -> Self {
        self.weight = Some(weight);
        self
    }

    /// Target value that contributes neither to the loss nor to the mean
    pub fn ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    /// Amount of smoothing towards the uniform distribution, in `[0, 1]`
    pub fn label_smoothing(mut self, label_smoothing: f64) -> Self {
        self.label_smoothing = label_smoothing;
        self
    }

    /// Validate the options and resolve `alpha` against its alias
    pub fn build(self) -> Result<MultiClassFocalLoss> {
        self.config.validate()?;
        if !(0.0..=1.0).contains(&self.label_smoothing) {
            return Err(FocalLossError::InvalidLabelSmoothing(self.label_smoothing));
        }

        let alpha = match (self.alpha, self.weight) {
            (Some(alpha), weight) => {
                if weight.is_some() {
                    tracing::warn!("weight ignored because alpha is set");
                }
                if alpha.is_scalar() {
                    return Err(FocalLossError::InvalidWeight(
                        "alpha must hold one weight per class, got a scalar".to_string(),
                    ));
                }
                Some(class_weights("alpha", alpha.into_tensor()?)?)
            }
            (None, Some(weight)) => Some(class_weights(
                "weight",
                validate_weight_tensor("weight", weight)?,
            )?),
            (None, None) => None,
        };

        tracing::debug!(
            gamma = self.config.gamma,
            reduction = %self.config.reduction,
            alpha = alpha.is_some(),
            ignore_index = self.ignore_index,
            label_smoothing = self.label_smoothing,
            "built multi-class focal loss"
        );

        Ok(MultiClassFocalLoss {
            gamma: self.config.gamma,
            alpha,
            reduction: self.config.reduction,
            ignore_index: self.ignore_index,
            label_smoothing: self.label_smoothing,
        })
    }
}

fn class_weights(name: &str, weights: Tensor) -> Result<Tensor> {
    if weights.rank() != 1 {
        return Err(FocalLossError::InvalidWeight(format!(
            "{name} must be a vector of per-class weights, got shape {:?}",
            weights.dims()
        )));
    }
    Ok(weights)
}

impl MultiClassFocalLoss {
    /// Create a loss without class weights, ignoring the default index
    pub fn new(config: FocalLossConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Start from the default options
    pub fn builder() -> MultiClassFocalLossBuilder {
        MultiClassFocalLossBuilder::default()
    }

    /// Focusing strength
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Resolved per-class weights
    pub fn alpha(&self) -> Option<&Tensor> {
        self.alpha.as_ref()
    }

    /// Aggregation applied by `forward`
    pub fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Target value excluded from the loss
    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    /// Smoothing passed to the base cross entropy
    pub fn label_smoothing(&self) -> f64 {
        self.label_smoothing
    }

    /// Per-row focusing term `(1 - p_true)^gamma`, all ones when gamma is zero
    ///
    /// Ignored rows are looked up at class 0; their value is meaningless.
    pub fn focusing_weights(&self, inputs: &Tensor, target: &Tensor) -> Result<Tensor> {
        let targets = ClassTargets::new(target, self.ignore_index, inputs.dtype())?;
        match self.focus(inputs, &targets)? {
            Some(focus) => Ok(focus),
            None => Ok(targets.keep().ones_like()?),
        }
    }

    fn focus(&self, inputs: &Tensor, targets: &ClassTargets) -> Result<Option<Tensor>> {
        if self.gamma == 0.0 {
            return Ok(None);
        }
        let probabilities = softmax(inputs, 1)?
            .gather(&targets.indices().unsqueeze(1)?, 1)?
            .squeeze(1)?;
        let focus = probabilities.affine(-1.0, 1.0)?.powf(self.gamma)?;
        Ok(Some(focus))
    }
}

impl Loss for MultiClassFocalLoss {
    /// `inputs` are logits `[batch, num_classes]`, `target` class indices `[batch]`
    fn forward(&self, inputs: &Tensor, target: &Tensor) -> Result<Tensor> {
        tracing::trace!(shape = ?inputs.dims(), "multi-class focal loss forward");

        let targets = ClassTargets::new(target, self.ignore_index, inputs.dtype())?;
        let ce = cross_entropy(inputs, &targets, self.alpha.as_ref(), self.label_smoothing)?;

        // Ignored rows have ce == 0, so whatever their focus is they stay 0
        let loss = match self.focus(inputs, &targets)? {
            Some(focus) => focus.mul(&ce)?,
            None => ce,
        };

        match self.reduction {
            Reduction::Mean => cross_entropy_mean(&loss, &targets, self.alpha.as_ref()),
            reduction => reduction.reduce(loss),
        }
    }
}
