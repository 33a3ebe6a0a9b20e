//! Learnable parameters of a multi-head attention module.
//!
//! The four `model_dim -> model_dim` projections are held in an explicit
//! record rather than discovered through registration. Iteration order is
//! fixed (`query`, `key`, `value`, `output`, weight before bias) so optimizer
//! state can be matched to parameters positionally.

use candle_core::{DType, Device, Var};
use layers::{Linear, LinearConfig, LinearInit, LinearLayer};

use crate::core::{AttentionError, MultiHeadConfig};

/// Names of the projections in iteration order.
pub const PROJECTION_NAMES: [&str; 4] = ["query", "key", "value", "output"];

#[derive(Debug, Clone)]
pub struct AttentionParameters {
    pub query: Linear,
    pub key: Linear,
    pub value: Linear,
    pub output: Linear,
}

impl AttentionParameters {
    /// Randomly initialised projections sized for `config`.
    pub fn new(
        config: &MultiHeadConfig,
        init: LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let linear_config = Self::linear_config(config);
        let build = || Linear::with_init(linear_config.clone(), init, device, dtype);
        Ok(Self {
            query: build()?,
            key: build()?,
            value: build()?,
            output: build()?,
        })
    }

    /// Projection layout every parameter must have for `config`.
    pub fn linear_config(config: &MultiHeadConfig) -> LinearConfig {
        LinearConfig {
            input_dim: config.model_dim,
            output_dim: config.model_dim,
            bias: config.bias,
        }
    }

    /// The projections paired with their names, in iteration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Linear)> {
        PROJECTION_NAMES
            .into_iter()
            .zip([&self.query, &self.key, &self.value, &self.output])
    }

    /// Trainable variables named `<projection>.weight` / `<projection>.bias`.
    pub fn named_vars(&self) -> Vec<(String, Var)> {
        self.iter()
            .flat_map(|(name, linear)| {
                let suffixes = ["weight", "bias"];
                linear
                    .vars()
                    .into_iter()
                    .zip(suffixes)
                    .map(move |(var, suffix)| (format!("{name}.{suffix}"), var))
            })
            .collect()
    }

    /// Trainable variables in iteration order.
    pub fn vars(&self) -> Vec<Var> {
        self.named_vars().into_iter().map(|(_, var)| var).collect()
    }

    /// Storage dtype shared by all projections.
    pub fn dtype(&self) -> DType {
        self.query.weight().dtype()
    }

    /// Checks that every projection fits `config` and that all share a dtype
    /// and device.
    pub fn validate(&self, config: &MultiHeadConfig) -> Result<(), AttentionError> {
        let expected = Self::linear_config(config);
        let dtype = self.dtype();
        let device = self.query.weight().device();
        for (name, linear) in self.iter() {
            if linear.config() != &expected {
                return Err(AttentionError::config(format!(
                    "{name} projection is {:?}, expected {:?}",
                    linear.config(),
                    expected
                )));
            }
            if linear.weight().dtype() != dtype {
                return Err(AttentionError::config(format!(
                    "{name} projection has dtype {:?}, expected {:?}",
                    linear.weight().dtype(),
                    dtype
                )));
            }
            if !linear.weight().device().same_device(device) {
                return Err(AttentionError::config(format!(
                    "{name} projection lives on a different device"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_vars_have_stable_order() -> Result<(), AttentionError> {
        let config = MultiHeadConfig::new(2, 8, 0.0);
        let params =
            AttentionParameters::new(&config, LinearInit::default(), &Device::Cpu, DType::F32)?;
        let names: Vec<String> = params.named_vars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            [
                "query.weight",
                "query.bias",
                "key.weight",
                "key.bias",
                "value.weight",
                "value.bias",
                "output.weight",
                "output.bias",
            ]
        );
        assert_eq!(params.vars()[6].dims(), &[8, 8]);
        assert_eq!(params.vars()[7].dims(), &[8]);
        Ok(())
    }

    #[test]
    fn bias_free_projections_expose_weights_only() -> Result<(), AttentionError> {
        let mut config = MultiHeadConfig::new(2, 8, 0.0);
        config.bias = false;
        let params =
            AttentionParameters::new(&config, LinearInit::XavierUniform, &Device::Cpu, DType::F32)?;
        let names: Vec<String> = params.named_vars().into_iter().map(|(n, _)| n).collect();
        assert_eq!(
            names,
            ["query.weight", "key.weight", "value.weight", "output.weight"]
        );
        Ok(())
    }

    #[test]
    fn projections_are_independent() -> Result<(), AttentionError> {
        let config = MultiHeadConfig::new(2, 8, 0.0);
        let params =
            AttentionParameters::new(&config, LinearInit::default(), &Device::Cpu, DType::F32)?;
        let diff = params
            .query
            .weight()
            .sub(params.key.weight())?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }

    #[test]
    fn validate_rejects_mismatched_projection() -> Result<(), AttentionError> {
        let config = MultiHeadConfig::new(2, 8, 0.0);
        let mut params =
            AttentionParameters::new(&config, LinearInit::default(), &Device::Cpu, DType::F32)?;
        params.validate(&config)?;
        params.value = Linear::with_init(
            LinearConfig::new(8, 4),
            LinearInit::default(),
            &Device::Cpu,
            DType::F32,
        )?;
        let err = params.validate(&config).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
        Ok(())
    }
}
