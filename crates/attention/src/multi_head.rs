//! Multi-head attention with learned projections.
//!
//! Inputs are `(batch, seq, model_dim)`. Query, key and value are projected
//! independently, split into `heads` subspaces of `model_dim / heads`
//! features, attended with [`ScaledDotProductAttention`] in one batched call,
//! concatenated back in head order and passed through the output projection.
//!
//! Query length may differ from key/value length (cross-attention); the
//! output always has the query's shape.

use std::fmt;
use std::sync::OnceLock;

use candle_core::{bail, DType, Device, Result as CandleResult, Tensor};
use layers::dtypes::FLOAT_DTYPES;
use layers::{Dropout, LinearInit, LinearLayer, PrecisionPolicy};

use crate::core::{Attention, AttentionError, AttentionOutput, MultiHeadConfig};
use crate::parameters::AttentionParameters;
use crate::reference::ScaledDotProductAttention;

/// Reinterprets `(batch, seq, heads * head_dim)` as `(batch, heads, seq, head_dim)`.
///
/// Head `h` owns features `h * head_dim .. (h + 1) * head_dim`. The result is
/// a strided view; no data is copied.
pub fn split_heads(tensor: &Tensor, heads: usize) -> CandleResult<Tensor> {
    let (batch, seq, features) = match tensor.dims() {
        [b, s, f] => (*b, *s, *f),
        dims => bail!("split_heads expected [batch, seq, features] got {:?}", dims),
    };
    if heads == 0 || features % heads != 0 {
        bail!("split_heads cannot divide {features} features into {heads} heads");
    }
    tensor
        .reshape((batch, seq, heads, features / heads))?
        .transpose(1, 2)
}

/// Inverse of [`split_heads`]: concatenates heads along the feature axis.
pub fn merge_heads(tensor: &Tensor) -> CandleResult<Tensor> {
    let (batch, heads, seq, head_dim) = match tensor.dims() {
        [b, h, s, d] => (*b, *h, *s, *d),
        dims => bail!(
            "merge_heads expected [batch, heads, seq, head_dim] got {:?}",
            dims
        ),
    };
    tensor
        .transpose(1, 2)?
        .reshape((batch, seq, heads * head_dim))
}

/// Multi-head attention module owning its four projections.
pub struct MultiHeadAttention {
    config: MultiHeadConfig,
    params: AttentionParameters,
    attention: ScaledDotProductAttention,
    dropout: Dropout,
    policy: PrecisionPolicy,
    first_call: OnceLock<()>,
}

impl fmt::Debug for MultiHeadAttention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiHeadAttention")
            .field("heads", &self.config.heads)
            .field("model_dim", &self.config.model_dim)
            .field("dropout_p", &self.config.dropout_p)
            .field("masked_rows", &self.config.masked_rows)
            .field("dtype", &self.params.dtype())
            .finish()
    }
}

impl MultiHeadAttention {
    /// Builds a module with freshly initialised projections.
    ///
    /// Fails with [`AttentionError::InvalidConfig`] when `model_dim` is not
    /// divisible by `heads` or the dropout probability is out of range.
    pub fn new(
        config: MultiHeadConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let params = AttentionParameters::new(&config, LinearInit::default(), device, dtype)?;
        Self::from_parameters(config, params)
    }

    /// Builds a module around externally supplied projections.
    pub fn from_parameters(
        config: MultiHeadConfig,
        params: AttentionParameters,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        params.validate(&config)?;
        let dropout = match config.dropout_seed {
            Some(seed) => Dropout::seeded(config.dropout_p, seed)?,
            None => Dropout::new(config.dropout_p)?,
        };
        Ok(Self {
            attention: ScaledDotProductAttention::with_config(config.kernel_config()),
            policy: PrecisionPolicy::from_parameter_dtype(params.dtype()),
            config,
            params,
            dropout,
            first_call: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &MultiHeadConfig {
        &self.config
    }

    /// The projection parameters, e.g. for an optimizer or checkpoint writer.
    pub fn parameters(&self) -> &AttentionParameters {
        &self.params
    }

    pub fn heads(&self) -> usize {
        self.config.heads
    }

    pub fn head_dim(&self) -> usize {
        self.config.head_dim()
    }

    fn validate_inputs(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<(), AttentionError> {
        let inputs = [("query", query), ("key", key), ("value", value)];

        let dtype = query.dtype();
        if key.dtype() != dtype || value.dtype() != dtype {
            return Err(AttentionError::shape(format!(
                "query, key and value must share a dtype, got {:?}, {:?}, {:?}",
                dtype,
                key.dtype(),
                value.dtype()
            )));
        }
        if !FLOAT_DTYPES.contains(&dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let device = self.params.query.weight().device();
        for (name, tensor) in inputs {
            if !tensor.device().same_device(device) {
                return Err(AttentionError::shape(format!(
                    "{name} must reside on the same device as the projections"
                )));
            }
        }

        let model_dim = self.config.model_dim;
        let mut dims = [(0usize, 0usize); 3];
        for (slot, (name, tensor)) in dims.iter_mut().zip(inputs) {
            match tensor.dims() {
                [batch, seq, features] if *features == model_dim => *slot = (*batch, *seq),
                other => {
                    return Err(AttentionError::shape(format!(
                        "{name} must be [batch, seq, {model_dim}], got {other:?}"
                    )))
                }
            }
        }
        let [(q_batch, _), (k_batch, k_len), (v_batch, v_len)] = dims;
        if k_batch != q_batch || v_batch != q_batch {
            return Err(AttentionError::shape(format!(
                "batch sizes differ: query {q_batch}, key {k_batch}, value {v_batch}"
            )));
        }
        if k_len != v_len {
            return Err(AttentionError::shape(format!(
                "key length {k_len} does not match value length {v_len}"
            )));
        }
        Ok(())
    }

    /// Runs attention over `(batch, seq, model_dim)` inputs.
    ///
    /// `mask` is a keep-mask broadcastable to `(batch, heads, q_len, k_len)`.
    /// Dropout on the attention weights is applied only when `train` is set.
    /// Returns the projected output, shaped like `query`, and the pre-dropout
    /// attention weights `(batch, heads, q_len, k_len)`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<AttentionOutput, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::multi_head init heads={} model_dim={} head_dim={} dropout_p={} masked_rows={:?} bias={} dtype={:?}",
                self.config.heads,
                self.config.model_dim,
                self.head_dim(),
                self.config.dropout_p,
                self.config.masked_rows,
                self.config.bias,
                self.params.dtype()
            );
        }
        self.validate_inputs(query, key, value)?;
        log::debug!(
            "multi_head forward query={:?} key={:?} value={:?} masked={} train={}",
            query.dims(),
            key.dims(),
            value.dims(),
            mask.is_some(),
            train
        );

        let heads = self.config.heads;
        let q = split_heads(&self.params.query.forward(query, &self.policy)?, heads)?;
        let k = split_heads(&self.params.key.forward(key, &self.policy)?, heads)?;
        let v = split_heads(&self.params.value.forward(value, &self.policy)?, heads)?;

        let attended = self
            .attention
            .attend(&q, &k, &v, mask, Some(&self.dropout), train)?;

        let merged = merge_heads(&attended.context)?;
        let output = self.params.output.forward(&merged, &self.policy)?;

        Ok(AttentionOutput {
            context: output,
            weights: attended.weights,
        })
    }
}
