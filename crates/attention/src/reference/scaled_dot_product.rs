//! Scaled dot-product attention.
//!
//! Computes `softmax(q kᵀ / sqrt(d_k)) v` for every `(batch, head)` slice in
//! one batched matmul. Scores, masking and the softmax run in `f32`; the
//! context is cast back to the input dtype while the weights stay `f32`.
//! Every step is built from differentiable Candle ops, so gradients flow back
//! to the projections that produced `q`, `k` and `v`.

use std::sync::OnceLock;

use candle_core::{DType, Result as CandleResult, Tensor, D};
use candle_nn::ops::softmax;
use layers::{Dropout, PrecisionPolicy};

use crate::core::{Attention, AttentionError, AttentionOutput, Config, MaskedRowPolicy};
use crate::masks::{expand_mask, MASK_FILL};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ScaledDotProductAttention {
    config: Config,
    first_call: OnceLock<()>,
}

impl Clone for ScaledDotProductAttention {
    fn clone(&self) -> Self {
        Self::with_config(self.config)
    }
}

impl ScaledDotProductAttention {
    /// Kernel with the default masked-row policy.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            first_call: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn attend_heads(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout: Option<&Dropout>,
        train: bool,
    ) -> Result<AttentionOutput, AttentionError> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (kb, kh, k_len, kd) = k.dims4()?;
        let (vb, vh, vk, v_dim) = v.dims4()?;

        if kb != batch || kh != heads || kd != head_dim {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
            )));
        }
        if vb != batch || vh != heads || vk != k_len {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected [{batch}, {heads}, {k_len}, ?] got [{vb}, {vh}, {vk}, {v_dim}]"
            )));
        }
        if head_dim == 0 {
            return Err(AttentionError::shape("head dimension must be non-zero"));
        }

        let policy = PrecisionPolicy::from_parameter_dtype(q.dtype());
        let merged = batch * heads;
        let q_view = policy.cast_for_reduction(q)?.reshape((merged, q_len, head_dim))?;
        let k_view = policy.cast_for_reduction(k)?.reshape((merged, k_len, head_dim))?;
        let v_view = policy.cast_for_reduction(v)?.reshape((merged, k_len, v_dim))?;

        let scale = 1.0 / (head_dim as f32).sqrt();
        let scores = q_view
            .matmul(&k_view.transpose(1, 2)?)?
            .mul_scalar(scale)?
            .reshape((batch, heads, q_len, k_len))?;

        let keep = mask
            .map(|mask| {
                if !q.device().same_device(mask.device()) {
                    return Err(AttentionError::shape(
                        "mask must reside on the same device as q",
                    ));
                }
                expand_mask(mask, (batch, heads, q_len, k_len))
            })
            .transpose()?;

        let scores = match &keep {
            Some(keep) => {
                let fill = Tensor::full(MASK_FILL, (batch, heads, q_len, k_len), q.device())?;
                keep.where_cond(&scores, &fill)?
            }
            None => scores,
        };

        // Max-subtracted softmax over the key axis.
        let mut weights = softmax(&scores, D::Minus1)?;

        // A fully masked row softmaxes to uniform since every score equals MASK_FILL.
        if let (Some(keep), MaskedRowPolicy::Zero) = (&keep, self.config.masked_rows) {
            let row_has_key = keep.max_keepdim(D::Minus1)?.to_dtype(policy.reduction())?;
            weights = weights.broadcast_mul(&row_has_key)?;
        }

        let dropped = match dropout {
            Some(dropout) => dropout.forward(&weights, train)?,
            None => weights.clone(),
        };

        let context = dropped
            .reshape((merged, q_len, k_len))?
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, v_dim))?;

        Ok(AttentionOutput {
            context: policy.cast_to_storage(&context)?,
            weights,
        })
    }
}

impl Attention for ScaledDotProductAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        dropout: Option<&Dropout>,
        train: bool,
    ) -> Result<AttentionOutput, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init masked_rows={:?} dropout_p={}",
                self.config.masked_rows,
                dropout.map_or(0.0, Dropout::probability)
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        match (q.rank(), k.rank(), v.rank()) {
            (4, 4, 4) => self.attend_heads(q, k, v, mask, dropout, train),
            (3, 3, 3) => {
                // A rank-3 mask carries a batch axis, which must skip the head axis.
                let mask = match mask {
                    Some(mask) if mask.rank() == 3 => Some(mask.unsqueeze(1)?),
                    Some(mask) => Some(mask.clone()),
                    None => None,
                };
                let output = self.attend_heads(
                    &q.unsqueeze(1)?,
                    &k.unsqueeze(1)?,
                    &v.unsqueeze(1)?,
                    mask.as_ref(),
                    dropout,
                    train,
                )?;
                Ok(AttentionOutput {
                    context: output.context.squeeze(1)?,
                    weights: output.weights.squeeze(1)?,
                })
            }
            ranks => Err(AttentionError::shape(format!(
                "q, k, v must all be rank 3 [batch, seq, dim] or rank 4 [batch, heads, seq, dim], got {ranks:?}"
            ))),
        }
    }
}

trait MulScalarExt {
    fn mul_scalar(&self, value: f32) -> CandleResult<Tensor>;
}

impl MulScalarExt for Tensor {
    fn mul_scalar(&self, value: f32) -> CandleResult<Tensor> {
        let scalar = Tensor::new(value, self.device())?.to_dtype(self.dtype())?;
        self.broadcast_mul(&scalar)
    }
}
