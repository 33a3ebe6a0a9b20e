//! Reference attention kernels.
//!
//! The kernels here prioritise numerical fidelity over speed and define the
//! semantics of the [`Attention`](crate::core::Attention) trait.

pub mod scaled_dot_product;

pub use scaled_dot_product::ScaledDotProductAttention;
