//! Focal loss functions and the cross-entropy losses they wrap

pub mod base;
mod binary_focal;
mod multiclass_focal;

pub use binary_focal::{BinaryFocalLoss, BinaryFocalLossBuilder};
pub use multiclass_focal::{DEFAULT_IGNORE_INDEX, MultiClassFocalLoss, MultiClassFocalLossBuilder};

use candle_core::Tensor;

use crate::error::Result;

/// Common trait for loss functions
///
/// There is no separate backward pass: the returned tensor stays in the
/// autograd graph of `inputs`, so calling `backward()` on it yields the
/// gradients.
pub trait Loss {
    /// Calculate the loss between logits and targets
    fn forward(&self, inputs: &Tensor, target: &Tensor) -> Result<Tensor>;
}
