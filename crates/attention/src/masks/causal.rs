//! Builders for causal keep-masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[1, 1, q_len, k_len]`, broadcasting over batch and heads. Entries are `1`
//! where attention is permitted and `0` otherwise.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask for the supplied sequence lengths.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn causal_mask(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let offset = k_len.saturating_sub(q_len);
    let data: Vec<u8> = (0..q_len)
        .flat_map(|q| (0..k_len).map(move |k| u8::from(k <= q + offset)))
        .collect();
    Tensor::from_vec(data, (1, 1, q_len, k_len), device)
}
