//! Building blocks for the attention crate.
//!
//! Hosts the affine projections, dropout, precision policy and validation
//! helpers that multi-head attention is assembled from. Everything here
//! operates on Candle tensors and reports failures as
//! `candle_core::Result`.

pub mod checks;
pub mod dropout;
pub mod dtypes;
pub mod linear;

pub use dropout::Dropout;
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit, LinearLayer};
