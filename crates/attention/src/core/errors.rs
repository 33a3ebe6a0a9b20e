//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// Construction-time configuration is unusable (e.g. heads do not divide the model dimension).
    #[error("invalid attention configuration: {message}")]
    InvalidConfig { message: String },
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl AttentionError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        Self::Backend {
            message: err.to_string(),
        }
    }
}
