//! Construction-time configuration shared by the focal losses
//!
//! Everything in here is resolved once when a loss is built and never changes
//! afterwards.

use std::fmt;
use std::str::FromStr;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{FocalLossError, Result};

/// How the elementwise loss is aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Return the elementwise loss unchanged
    None,
    /// Sum over all elements
    Sum,
    /// Average over all elements (or over the effective sample count for
    /// multi-class focal loss)
    #[default]
    Mean,
}

impl Reduction {
    /// Apply `none`/`sum`/plain elementwise `mean` to a loss tensor
    pub(crate) fn reduce(self, loss: Tensor) -> Result<Tensor> {
        let reduced = match self {
            Reduction::None => loss,
            Reduction::Sum => loss.sum_all()?,
            Reduction::Mean => loss.mean_all()?,
        };
        Ok(reduced)
    }
}

impl FromStr for Reduction {
    type Err = FocalLossError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Reduction::None),
            "sum" => Ok(Reduction::Sum),
            "mean" => Ok(Reduction::Mean),
            other => Err(FocalLossError::InvalidReduction(other.to_string())),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reduction::None => "none",
            Reduction::Sum => "sum",
            Reduction::Mean => "mean",
        };
        f.write_str(name)
    }
}

/// Hyperparameters common to both focal losses
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocalLossConfig {
    /// Focusing strength; `0` turns the focal loss into its base loss
    pub gamma: f64,
    /// Aggregation of the elementwise loss
    pub reduction: Reduction,
}

impl Default for FocalLossConfig {
    fn default() -> Self {
        Self {
            gamma: 2.0,
            reduction: Reduction::Mean,
        }
    }
}

impl FocalLossConfig {
    /// Create a validated config from a gamma and a reduction name
    pub fn new(gamma: f64, reduction: &str) -> Result<Self> {
        let config = Self {
            gamma,
            reduction: reduction.parse()?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check that gamma is a finite, non-negative number
    pub fn validate(&self) -> Result<()> {
        if !self.gamma.is_finite() || self.gamma < 0.0 {
            return Err(FocalLossError::InvalidGamma(self.gamma));
        }
        Ok(())
    }
}

/// Class balancing factor(s) as accepted by the builders
///
/// Whatever the variant, it is resolved into a rank-1 float tensor when the
/// loss is built. A scalar becomes a one-element vector.
#[derive(Debug, Clone)]
pub enum Alpha {
    /// Single weight (binary only)
    Scalar(f64),
    Vector(Vec<f64>),
    Tensor(Tensor),
}

impl Alpha {
    pub(crate) fn is_scalar(&self) -> bool {
        matches!(self, Alpha::Scalar(_))
    }

    /// Resolve into the canonical tensor representation
    pub(crate) fn into_tensor(self) -> Result<Tensor> {
        match self {
            Alpha::Scalar(value) => {
                check_finite(&[value])?;
                Ok(Tensor::new(&[value], &Device::Cpu)?)
            }
            Alpha::Vector(values) => {
                if values.is_empty() {
                    return Err(FocalLossError::InvalidWeight(
                        "alpha must hold at least one value".to_string(),
                    ));
                }
                check_finite(&values)?;
                Ok(Tensor::new(values.as_slice(), &Device::Cpu)?)
            }
            Alpha::Tensor(tensor) => validate_weight_tensor("alpha", tensor),
        }
    }
}

impl From<f64> for Alpha {
    fn from(value: f64) -> Self {
        Alpha::Scalar(value)
    }
}

impl From<f32> for Alpha {
    fn from(value: f32) -> Self {
        Alpha::Scalar(value as f64)
    }
}

impl From<Vec<f64>> for Alpha {
    fn from(values: Vec<f64>) -> Self {
        Alpha::Vector(values)
    }
}

impl From<&[f64]> for Alpha {
    fn from(values: &[f64]) -> Self {
        Alpha::Vector(values.to_vec())
    }
}

impl From<Tensor> for Alpha {
    fn from(tensor: Tensor) -> Self {
        Alpha::Tensor(tensor)
    }
}

impl From<&Tensor> for Alpha {
    fn from(tensor: &Tensor) -> Self {
        Alpha::Tensor(tensor.clone())
    }
}

fn check_finite(values: &[f64]) -> Result<()> {
    match values.iter().find(|v| !v.is_finite()) {
        Some(bad) => Err(FocalLossError::InvalidWeight(format!(
            "alpha values must be finite, got {bad}"
        ))),
        None => Ok(()),
    }
}

/// Weight-like tensors (alpha and its aliases) must be non-empty floats
pub(crate) fn validate_weight_tensor(name: &str, tensor: Tensor) -> Result<Tensor> {
    if !tensor.dtype().is_float() {
        return Err(FocalLossError::InvalidWeight(format!(
            "{name} must hold floating point values, got {:?}",
            tensor.dtype()
        )));
    }
    if tensor.elem_count() == 0 {
        return Err(FocalLossError::InvalidWeight(format!(
            "{name} must hold at least one value"
        )));
    }
    Ok(tensor)
}

/// Cast a stored weight tensor onto the dtype and device of the inputs
pub(crate) fn align_with(weight: &Tensor, inputs: &Tensor) -> Result<Tensor> {
    Ok(weight.to_dtype(inputs.dtype())?.to_device(inputs.device())?)
}
