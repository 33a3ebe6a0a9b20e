//! Precision policy shared by projections and the attention kernels.
//!
//! Parameters may be stored in `f16`/`bf16`, but projections multiply in the
//! compute dtype and attention scores are normalised in the reduction dtype
//! (always `f32`). [`PrecisionPolicy`] centralises those casts so every layer
//! promotes and demotes tensors the same way.

use candle_core::{DType, Result, Tensor};

/// Dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: [DType; 3] = [DType::F32, DType::F16, DType::BF16];

/// Describes how tensors should be cast during different phases of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the parameter storage dtype.
    ///
    /// Half precision parameters are promoted to `f32` for matmuls; reductions
    /// always run in `f32`.
    pub fn from_parameter_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        Self::new(storage, compute, DType::F32)
    }

    /// Returns the dtype used to store parameters and outputs.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for softmax and other reductions.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn policy_promotes_reduced_precision_parameters() {
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        assert_eq!(policy.storage(), DType::F16);
        assert_eq!(policy.compute(), DType::F32);
        assert_eq!(policy.reduction(), DType::F32);

        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        assert_eq!(policy.compute(), DType::F32);
    }

    #[test]
    fn cast_round_trip_preserves_representable_values() -> Result<()> {
        let device = Device::Cpu;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::BF16);
        let base = Tensor::from_vec(vec![0.125f32, -0.75, 3.5], (3,), &device)?;
        let storage = base.to_dtype(policy.storage())?;

        let compute = policy.cast_for_matmul(&storage)?;
        assert_eq!(compute.dtype(), policy.compute());

        let round_trip = policy.cast_to_storage(&compute)?;
        let original = base.to_vec1::<f32>()?;
        let restored = round_trip.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        // All three values are exactly representable in bf16.
        assert_eq!(original, restored);
        Ok(())
    }
}
