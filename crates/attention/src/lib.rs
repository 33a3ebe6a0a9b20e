//! Scaled dot-product and multi-head attention on Candle tensors.
//!
//! [`ScaledDotProductAttention`] computes `softmax(q kᵀ / sqrt(d_k)) v` over
//! tensors laid out `[batch, heads, seq_len, head_dim]` (or
//! `[batch, seq_len, dim]` for a single head) and reports the attention
//! weights alongside the aggregate. [`MultiHeadAttention`] wraps it with four
//! learned `model_dim -> model_dim` projections, splitting the model dimension
//! into heads and merging them back in head order.
//!
//! Inputs may be `f32`, `f16` or `bf16`; scores are normalised in `f32`.
//!
//! Dropout on the attention weights is a train-only concern: callers pass
//! `train = true` explicitly. With `train = false` the forward pass is
//! deterministic.
//!
//! Masks are keep-masks (non-zero = may attend) broadcastable to the score
//! shape; builders for causal and padding masks live in [`masks`]. Rows whose
//! keys are all masked never produce NaN; see [`MaskedRowPolicy`].

pub mod core;
pub mod masks;
pub mod multi_head;
pub mod parameters;
pub mod reference;

pub use core::{
    Attention, AttentionError, AttentionOutput, Config, MaskedRowPolicy, MultiHeadConfig,
};
pub use multi_head::{merge_heads, split_heads, MultiHeadAttention};
pub use parameters::AttentionParameters;
pub use reference::ScaledDotProductAttention;
