//! # Focal Loss
//!
//! Binary and multi-class focal loss for [candle](https://github.com/huggingface/candle) tensors.
//!
//! Focal loss (Lin et al., "Focal Loss for Dense Object Detection") scales a
//! cross-entropy loss by a focusing term that shrinks the contribution of
//! well-classified examples, so training concentrates on the hard ones.
//! With `gamma = 0` both losses are exactly their base cross entropy.
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use focal_loss::{BinaryFocalLoss, Loss};
//!
//! # fn main() -> focal_loss::Result<()> {
//! let loss = BinaryFocalLoss::builder().gamma(2.0).alpha(0.5).build()?;
//! let logits = Tensor::new(&[0.0f32, 2.5, -1.0], &Device::Cpu)?;
//! let target = Tensor::new(&[1.0f32, 1.0, 0.0], &Device::Cpu)?;
//! let value = loss.forward(&logits, &target)?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
pub mod loss;

// Re-export main types
pub use config::{Alpha, FocalLossConfig, Reduction};
pub use error::{FocalLossError, Result};
pub use loss::{
    BinaryFocalLoss, BinaryFocalLossBuilder, DEFAULT_IGNORE_INDEX, Loss, MultiClassFocalLoss,
    MultiClassFocalLossBuilder,
};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
