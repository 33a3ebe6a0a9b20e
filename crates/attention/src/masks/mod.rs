//! Mask utilities shared by attention implementations.
//!
//! Masks are keep-masks: non-zero entries mark `(query, key)` pairs that may
//! attend, zeros mark blocked pairs. Builders here produce [`MASK_DTYPE`]
//! tensors, but the kernels accept any dtype and any shape broadcastable to
//! `[batch, heads, q_len, k_len]`. Blocked scores are replaced by
//! [`MASK_FILL`] before the softmax.

pub mod causal;
pub mod padding;

use candle_core::{DType, Tensor};

use crate::core::AttentionError;

/// Dtype produced by the mask builders.
pub const MASK_DTYPE: DType = DType::U8;

/// Score assigned to blocked positions.
///
/// The lowest finite `f32`, so a blocked score never exceeds a kept one however
/// negative the kept scores are, while a row with no kept key still softmaxes
/// to a finite uniform distribution instead of NaN.
pub const MASK_FILL: f32 = f32::MIN;

pub use causal::causal_mask;
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};

/// Logical AND of two keep-masks, broadcasting as needed.
pub fn combine_masks(left: &Tensor, right: &Tensor) -> candle_core::Result<Tensor> {
    let left = left.ne(&left.zeros_like()?)?;
    let right = right.ne(&right.zeros_like()?)?;
    left.broadcast_mul(&right)
}

/// Validates `mask` against the score shape and broadcasts it to that shape.
///
/// Returns a `u8` tensor holding `1` for kept pairs. Masks of rank below four
/// are left-padded with unit axes, so `[q_len, k_len]` and
/// `[batch, q_len, k_len]`-style masks work as long as every axis is either
/// `1` or equal to the corresponding score axis.
pub fn expand_mask(
    mask: &Tensor,
    scores: (usize, usize, usize, usize),
) -> Result<Tensor, AttentionError> {
    let (batch, heads, q_len, k_len) = scores;
    let target = [batch, heads, q_len, k_len];
    let dims = mask.dims();
    if dims.is_empty() || dims.len() > target.len() {
        return Err(AttentionError::shape(format!(
            "mask must have rank 1 to 4, got {:?}",
            dims
        )));
    }

    let mut padded = vec![1usize; target.len() - dims.len()];
    padded.extend_from_slice(dims);
    let broadcastable = padded
        .iter()
        .zip(target.iter())
        .all(|(&actual, &wanted)| actual == 1 || actual == wanted);
    if !broadcastable {
        return Err(AttentionError::shape(format!(
            "mask shape {:?} is not broadcastable to scores {:?}",
            dims, target
        )));
    }

    let keep = mask.ne(&mask.zeros_like()?)?;
    Ok(keep.reshape(padded)?.broadcast_as(target.to_vec())?)
}
