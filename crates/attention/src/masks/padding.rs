//! Builders for padding keep-masks used to drop padded keys.
//!
//! Padding masks are shaped `[batch, 1, 1, k_len]` so they broadcast over heads
//! and query positions.

use candle_core::{Device, Error, Result, Tensor};

/// Construct padding masks from per-batch valid key lengths.
///
/// Lengths larger than `k_len` are clamped.
pub fn padding_mask_from_lengths(
    device: &Device,
    key_lengths: &[usize],
    k_len: usize,
) -> Result<Tensor> {
    let data: Vec<u8> = key_lengths
        .iter()
        .flat_map(|&valid| {
            let valid = valid.min(k_len);
            (0..k_len).map(move |k| u8::from(k < valid))
        })
        .collect();
    Tensor::from_vec(data, (key_lengths.len(), 1, 1, k_len), device)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map_or(0, Vec::len);
    if let Some(row) = padding.iter().find(|row| row.len() != k_len) {
        return Err(Error::Msg(format!(
            "all boolean padding masks must share k_len {k_len}, got {}",
            row.len()
        )));
    }
    let data: Vec<u8> = padding
        .iter()
        .flat_map(|row| row.iter().map(|&padded| u8::from(!padded)))
        .collect();
    Tensor::from_vec(data, (padding.len(), 1, 1, k_len), device)
}
