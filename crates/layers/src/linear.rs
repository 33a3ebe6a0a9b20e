//! Linear and affine projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` or `(rows, in_dim)`
//! and return the same leading dimensions with `out_dim` features. Weights are
//! stored PyTorch style as `(out_dim, in_dim)` and applied as `x Wᵀ + b`.
//! Weights and activations are cast to [`PrecisionPolicy::compute`] for the
//! matmul and back to [`PrecisionPolicy::storage`] for the result.
//!
//! Parameters live in [`Var`]s so gradients can be taken through the forward
//! graph, and an optimizer or checkpoint loader can overwrite them in place.

use candle_core::{DType, Device, Error, Result, Tensor, Var};

use crate::{
    checks,
    dtypes::{PrecisionPolicy, FLOAT_DTYPES},
};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    /// Incoming feature dimension.
    pub input_dim: usize,
    /// Output feature dimension.
    pub output_dim: usize,
    /// Whether a learnable bias vector should be applied.
    pub bias: bool,
}

impl LinearConfig {
    /// Creates a configuration for a projection layer with bias.
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
            bias: true,
        }
    }
}

/// Shared interface for affine projections.
pub trait LinearLayer: Send + Sync {
    /// Returns the static configuration used to validate inputs.
    fn config(&self) -> &LinearConfig;

    /// Applies the linear projection, promoting to the compute dtype when needed.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Weight initialisation policies for projections.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum LinearInit {
    /// `U(-1/sqrt(fan_in), 1/sqrt(fan_in))` for both weight and bias.
    #[default]
    FanInUniform,
    /// Xavier/Glorot uniform weights with a zero bias.
    XavierUniform,
}

impl LinearInit {
    fn sample_weight(&self, config: &LinearConfig, device: &Device) -> Result<Tensor> {
        let shape = (config.output_dim, config.input_dim);
        let (fan_in, fan_out) = (config.input_dim as f64, config.output_dim as f64);
        let bound = match self {
            LinearInit::FanInUniform => 1.0 / fan_in.sqrt(),
            LinearInit::XavierUniform => (6.0 / (fan_in + fan_out)).sqrt(),
        };
        Tensor::rand(-bound as f32, bound as f32, shape, device)
    }

    fn sample_bias(&self, config: &LinearConfig, device: &Device) -> Result<Tensor> {
        match self {
            LinearInit::FanInUniform => {
                let bound = 1.0 / (config.input_dim as f64).sqrt();
                Tensor::rand(-bound as f32, bound as f32, config.output_dim, device)
            }
            LinearInit::XavierUniform => Tensor::zeros(config.output_dim, DType::F32, device),
        }
    }
}

/// Dense affine projection with optional bias and mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
    bias: Option<Var>,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Self::validate_bias(&config, bias.as_ref())?;
        if let Some(bias) = &bias {
            checks::expect_same_dtype("linear.bias", bias, "linear.weight", &weight)?;
        }
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
            bias: bias.as_ref().map(Var::from_tensor).transpose()?,
        })
    }

    /// Builds a linear layer with randomly initialised parameters following `init`.
    pub fn with_init(
        config: LinearConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        checks::ensure_cast_supported("linear.init", DType::F32, dtype)?;
        let weight = init.sample_weight(&config, device)?.to_dtype(dtype)?;
        let bias = if config.bias {
            Some(init.sample_bias(&config, device)?.to_dtype(dtype)?)
        } else {
            None
        };
        Self::new(config, weight, bias)
    }

    /// Returns the weight tensor, shaped `(output_dim, input_dim)`.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Returns the bias tensor if present.
    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref().map(Var::as_tensor)
    }

    /// Trainable variables, weight first.
    pub fn vars(&self) -> Vec<Var> {
        let mut vars = vec![self.weight.clone()];
        vars.extend(self.bias.iter().cloned());
        vars
    }

    /// Overwrites the weight in place, casting to the stored dtype.
    pub fn copy_weight_from(&self, value: &Tensor) -> Result<()> {
        Self::validate_weight(&self.config, value)?;
        checks::ensure_cast_supported("linear.weight", value.dtype(), self.weight.dtype())?;
        self.weight.set(&value.to_dtype(self.weight.dtype())?)
    }

    /// Overwrites the bias in place, casting to the stored dtype.
    pub fn copy_bias_from(&self, value: &Tensor) -> Result<()> {
        match &self.bias {
            Some(bias) => {
                Self::validate_bias(&self.config, Some(value))?;
                checks::ensure_cast_supported("linear.bias", value.dtype(), bias.dtype())?;
                bias.set(&value.to_dtype(bias.dtype())?)
            }
            None => Err(Error::Msg("layer has no bias to copy into".into())),
        }
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, &FLOAT_DTYPES)?;
        checks::expect_contiguous("linear.weight", weight)
    }

    fn validate_bias(config: &LinearConfig, bias: Option<&Tensor>) -> Result<()> {
        match (config.bias, bias) {
            (true, Some(tensor)) => {
                checks::expect_rank("linear.bias", tensor, 1)?;
                checks::expect_shape("linear.bias", tensor, &[config.output_dim])?;
                checks::expect_dtype_in("linear.bias", tensor, &FLOAT_DTYPES)?;
                checks::expect_contiguous("linear.bias", tensor)
            }
            (false, Some(_)) => Err(Error::Msg("bias provided but config disables bias".into())),
            (true, None) => Err(Error::Msg("config expects bias but none supplied".into())),
            (false, None) => Ok(()),
        }
    }

    fn validate_input(&self, hidden: &Tensor) -> Result<()> {
        match hidden.dims() {
            [_, _, _] => checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim),
            [_, hidden_dim] if *hidden_dim == self.config.input_dim => Ok(()),
            [_, hidden_dim] => Err(Error::Msg(format!(
                "linear.input: expected last dim {} but received {}",
                self.config.input_dim, hidden_dim
            ))),
            dims => Err(Error::Msg(format!(
                "linear expects input shaped [B, T, H_in] or [T, H_in], got {:?}",
                dims
            ))),
        }
    }
}

impl LinearLayer for Linear {
    fn config(&self) -> &LinearConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.validate_input(hidden)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(self.weight.as_tensor())?.t()?;

        let mut output = match input.dims() {
            [batch, seq, _] => {
                let (batch, seq) = (*batch, *seq);
                let flat = input.reshape((batch * seq, self.config.input_dim))?;
                flat.matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            _ => input.matmul(&weight_t)?,
        };

        if let Some(bias) = &self.bias {
            let bias = policy.cast_for_matmul(bias.as_tensor())?;
            output = output.broadcast_add(&bias)?;
        }

        policy.cast_to_storage(&output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn reference_linear(input: &Tensor, weight: &Tensor, bias: Option<&Tensor>) -> Result<Tensor> {
        let (batch, seq, hidden) = input.dims3()?;
        let out_dim = weight.dims()[0];
        let x = input.flatten_all()?.to_vec1::<f32>()?;
        let w = weight.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let b = match bias {
            Some(bias) => bias.to_dtype(DType::F32)?.to_vec1::<f32>()?,
            None => vec![0.0; out_dim],
        };
        let mut out = vec![0f32; batch * seq * out_dim];
        for row in 0..batch * seq {
            for o in 0..out_dim {
                let mut acc = b[o];
                for i in 0..hidden {
                    acc += x[row * hidden + i] * w[o * hidden + i];
                }
                out[row * out_dim + o] = acc;
            }
        }
        Tensor::from_vec(out, (batch, seq, out_dim), input.device())
    }

    fn tensor_stats(tensor: &Tensor) -> Result<(f64, f64)> {
        let values = tensor
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let mean = values.iter().copied().map(f64::from).sum::<f64>() / values.len() as f64;
        let var = values
            .iter()
            .map(|&v| (f64::from(v) - mean).powi(2))
            .sum::<f64>()
            / values.len() as f64;
        Ok((mean, var.sqrt()))
    }

    #[test]
    fn forward_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(8, 12);
        let weight = Tensor::randn(0f32, 0.05, (12, 8), &device)?;
        let bias = Tensor::randn(0f32, 0.02, 12, &device)?;
        let input = Tensor::randn(0f32, 1.0, (2, 5, 8), &device)?;
        let reference = reference_linear(&input, &weight, Some(&bias))?;

        for &dtype in &FLOAT_DTYPES {
            let linear = Linear::new(
                config.clone(),
                weight.to_dtype(dtype)?,
                Some(bias.to_dtype(dtype)?),
            )?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = linear.forward(&input.to_dtype(dtype)?, &policy)?;

            assert_eq!(output.dims(), &[2, 5, 12]);
            assert_eq!(output.dtype(), dtype);

            let max = output
                .to_dtype(DType::F32)?
                .sub(&reference)?
                .abs()?
                .max_all()?
                .to_vec0::<f32>()?;
            let tol = match dtype {
                DType::F16 => 1e-2,
                DType::BF16 => 3e-2,
                _ => 1e-5,
            };
            assert!(max <= tol, "max diff {} for {:?}", max, dtype);
        }
        Ok(())
    }

    #[test]
    fn accepts_two_dimensional_inputs() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(4, 3),
            LinearInit::default(),
            &device,
            DType::F32,
        )?;
        let input = Tensor::randn(0f32, 1.0, (6, 4), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let flat = linear.forward(&input, &policy)?;
        let batched = linear.forward(&input.reshape((2, 3, 4))?, &policy)?;
        assert_eq!(flat.dims(), &[6, 3]);
        let diff = flat
            .reshape((2, 3, 3))?
            .sub(&batched)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn rejects_wrong_feature_dimension() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(4, 4),
            LinearInit::default(),
            &device,
            DType::F32,
        )?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let input = Tensor::zeros((1, 2, 5), DType::F32, &device)?;
        assert!(linear.forward(&input, &policy).is_err());
        let input = Tensor::zeros(4, DType::F32, &device)?;
        assert!(linear.forward(&input, &policy).is_err());
        Ok(())
    }

    #[test]
    fn xavier_uniform_stats_are_reasonable() -> Result<()> {
        let device = Device::Cpu;
        let linear = Linear::with_init(
            LinearConfig::new(128, 64),
            LinearInit::XavierUniform,
            &device,
            DType::F32,
        )?;
        let (mean, std) = tensor_stats(linear.weight())?;
        // Uniform(-a, a) has std a / sqrt(3).
        let expected = (6.0f64 / 192.0).sqrt() / 3f64.sqrt();
        assert!(mean.abs() < 5e-3);
        assert!((std - expected).abs() < expected * 0.25);
        let bias = linear.bias().expect("bias enabled");
        assert_eq!(bias.abs()?.sum_all()?.to_vec0::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn parameter_updates_are_visible_to_forward() -> Result<()> {
        let device = Device::Cpu;
        let config = LinearConfig::new(4, 2);
        let linear = Linear::with_init(config, LinearInit::default(), &device, DType::F32)?;
        linear.copy_weight_from(&Tensor::full(0.25f32, (2, 4), &device)?)?;
        linear.copy_bias_from(&Tensor::new(&[1f32, -1.0], &device)?)?;

        let input = Tensor::ones((1, 1, 4), DType::F32, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let out = linear.forward(&input, &policy)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(out, vec![2.0, 0.0]);

        assert!(linear
            .copy_weight_from(&Tensor::zeros((4, 2), DType::F32, &device)?)
            .is_err());
        assert_eq!(linear.vars().len(), 2);
        Ok(())
    }

    #[test]
    fn bias_configuration_must_match_parameters() -> Result<()> {
        let device = Device::Cpu;
        let mut config = LinearConfig::new(2, 2);
        config.bias = false;
        let weight = Tensor::zeros((2, 2), DType::F32, &device)?;
        let bias = Tensor::zeros(2, DType::F32, &device)?;
        assert!(Linear::new(config.clone(), weight.clone(), Some(bias)).is_err());
        let linear = Linear::new(config, weight, None)?;
        assert!(linear.bias().is_none());
        assert!(linear
            .copy_bias_from(&Tensor::zeros(2, DType::F32, &device)?)
            .is_err());
        Ok(())
    }
}
