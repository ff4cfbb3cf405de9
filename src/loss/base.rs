//! Base cross-entropy losses the focal losses are built on
//!
//! Both functions return the elementwise loss (no reduction). They are
//! composed from differentiable candle ops so gradients flow back to the
//! logits.

use candle_core::{DType, Tensor};
use candle_nn::ops::log_softmax;

use crate::config::align_with;
use crate::error::Result;

/// Binary cross entropy on logits, elementwise
///
/// `pos_weight` scales the positive term only, `weight` rescales every
/// element. Both broadcast against `inputs`.
pub fn binary_cross_entropy_with_logits(
    inputs: &Tensor,
    target: &Tensor,
    weight: Option<&Tensor>,
    pos_weight: Option<&Tensor>,
) -> Result<Tensor> {
    let target = target.to_dtype(inputs.dtype())?;

    // softplus(-x) = max(-x, 0) + ln(1 + e^(-|x|))
    let softplus = inputs
        .neg()?
        .relu()?
        .add(&inputs.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?)?;

    let negative = target.affine(-1.0, 1.0)?.mul(inputs)?;
    let positive = match pos_weight {
        Some(pos_weight) => {
            // 1 + (pos_weight - 1) * t
            let pos_weight = align_with(pos_weight, inputs)?.affine(1.0, -1.0)?;
            let log_weight = target.broadcast_mul(&pos_weight)?.affine(1.0, 1.0)?;
            log_weight.mul(&softplus)?
        }
        None => softplus,
    };

    let loss = negative.add(&positive)?;
    match weight {
        Some(weight) => Ok(loss.broadcast_mul(&align_with(weight, inputs)?)?),
        None => Ok(loss),
    }
}

/// Target class indices with ignored rows masked out
///
/// Ignored rows get index 0 so that gathers never see the sentinel, and a
/// zero in `keep` so that their contribution vanishes.
#[derive(Debug, Clone)]
pub struct ClassTargets {
    indices: Tensor,
    keep: Tensor,
}

impl ClassTargets {
    /// Mask `target` against `ignore_index`; `dtype` is the dtype of the keep mask
    pub fn new(target: &Tensor, ignore_index: i64, dtype: DType) -> Result<Self> {
        let target = target.to_dtype(DType::I64)?;
        let keep = target.ne(ignore_index)?;
        let indices = keep.where_cond(&target, &target.zeros_like()?)?;
        let keep = keep.to_dtype(dtype)?;
        Ok(Self { indices, keep })
    }

    /// Class index per row, `0` for ignored rows
    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    /// `1` for rows that count, `0` for ignored rows
    pub fn keep(&self) -> &Tensor {
        &self.keep
    }
}

/// Softmax cross entropy on `[batch, classes]` logits, elementwise
///
/// With label smoothing `ε` over `C` classes and class weights `w`:
/// `(1 - ε) * w[y] * -log p[y] + ε / C * Σ_c w[c] * -log p[c]`.
/// Ignored rows are exactly zero.
pub fn cross_entropy(
    inputs: &Tensor,
    targets: &ClassTargets,
    weight: Option<&Tensor>,
    label_smoothing: f64,
) -> Result<Tensor> {
    let (_, num_classes) = inputs.dims2()?;
    let log_probs = log_softmax(inputs, 1)?;
    let picked = log_probs
        .gather(&targets.indices.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;

    let weight = weight.map(|w| align_with(w, inputs)).transpose()?;
    if let Some(weight) = &weight {
        let weight_classes = weight.dims1()?;
        if weight_classes != num_classes {
            return Err(candle_core::Error::Msg(format!(
                "class weights hold {weight_classes} entries but the logits have {num_classes} classes"
            ))
            .into());
        }
    }
    let nll = match &weight {
        Some(weight) => picked.mul(&weight.index_select(&targets.indices, 0)?)?,
        None => picked,
    };
    let nll = nll.mul(&targets.keep)?;
    if label_smoothing == 0.0 {
        return Ok(nll);
    }

    let smooth = match &weight {
        Some(weight) => log_probs.broadcast_mul(&weight.unsqueeze(0)?)?.sum(1)?,
        None => log_probs.sum(1)?,
    };
    let smooth = smooth.neg()?.mul(&targets.keep)?;

    Ok(nll
        .affine(1.0 - label_smoothing, 0.0)?
        .add(&smooth.affine(label_smoothing / num_classes as f64, 0.0)?)?)
}

/// Mean of an elementwise cross-entropy-shaped loss over the effective sample count
///
/// The count is `Σ weight[y]` over kept rows, or the number of kept rows when
/// there are no class weights. All rows ignored gives NaN.
pub fn cross_entropy_mean(
    loss: &Tensor,
    targets: &ClassTargets,
    weight: Option<&Tensor>,
) -> Result<Tensor> {
    let counted = match weight {
        Some(weight) => align_with(weight, &targets.keep)?
            .index_select(&targets.indices, 0)?
            .mul(&targets.keep)?,
        None => targets.keep.clone(),
    };
    let denominator = counted.to_dtype(DType::F64)?.sum_all()?.to_scalar::<f64>()?;
    Ok(loss.sum_all()?.affine(1.0 / denominator, 0.0)?)
}
