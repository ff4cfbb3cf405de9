//! Error types for focal loss construction and evaluation

use thiserror::Error;

/// Errors raised while building or evaluating a focal loss
#[derive(Error, Debug)]
pub enum FocalLossError {
    /// Reduction mode outside of `none`, `sum` and `mean`
    #[error("Valid reduction modes are 'none', 'sum', and 'mean', got '{0}'")]
    InvalidReduction(String),

    /// Focusing parameter that is negative or not finite
    #[error("Gamma must be a finite non-negative number, got {0}")]
    InvalidGamma(f64),

    /// Malformed alpha, alias or weight argument
    #[error("Invalid weight: {0}")]
    InvalidWeight(String),

    /// Label smoothing outside of `[0, 1]`
    #[error("Label smoothing must be in [0, 1], got {0}")]
    InvalidLabelSmoothing(f64),

    /// Error raised by the tensor engine during evaluation
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
}

/// Result type used throughout the crate
pub type Result<T> = std::result::Result<T, FocalLossError>;
