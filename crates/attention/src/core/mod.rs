//! Core traits and types shared across attention implementations.
//!
//! Kernels operate on tensors with layout `[batch, heads, seq_len, head_dim]`
//! (or `[batch, seq_len, head_dim]` for a single head). Scores are reduced in
//! `f32` regardless of the incoming dtype (`bf16`, `f16`, or `f32`).

pub mod config;
pub mod errors;

use candle_core::Tensor;
use layers::Dropout;

pub use config::{Config, MaskedRowPolicy, MultiHeadConfig};
pub use errors::AttentionError;

/// Result of an attention call.
#[derive(Debug, Clone)]
pub struct AttentionOutput {
    /// Weighted aggregate of the values; same leading shape as the query.
    pub context: Tensor,
    /// Normalised attention probabilities `[batch, heads, q_len, k_len]` (or
    /// `[batch, q_len, k_len]` for rank-3 inputs), taken before dropout.
    pub weights: Tensor,
}

/// Unified interface for attention kernels.
///
/// * `q`, `k`, and `v` share rank, batch and head dimensions; `k` and `v`
///   share the key length and `q`/`k` share the last dimension.
/// * Masks are keep-masks: non-zero entries may attend, zeros are blocked.
///   Any shape broadcastable to the score tensor is accepted.
/// * Dropout is applied to the weights only when `train` is set.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout: Option<&Dropout>,
        train: bool,
    ) -> Result<AttentionOutput, AttentionError>;
}
