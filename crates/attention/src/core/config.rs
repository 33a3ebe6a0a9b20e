//! Configuration for the attention kernel and the multi-head module.
//!
//! [`Config`] carries per-kernel knobs. [`MultiHeadConfig`] describes a
//! multi-head attention instance and can be deserialised from TOML, then
//! adjusted through environment variables without a rebuild.

use std::env;

use serde::Deserialize;

use super::AttentionError;

/// Environment variable overriding [`MultiHeadConfig::dropout_p`].
pub const ENV_DROPOUT_P: &str = "ATTENTION_DROPOUT_P";
/// Environment variable overriding [`MultiHeadConfig::masked_rows`] (`uniform` or `zero`).
pub const ENV_MASKED_ROWS: &str = "ATTENTION_MASKED_ROWS";

/// Fallback for query rows whose keys are all masked out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskedRowPolicy {
    /// Spread the weight uniformly over every key position.
    #[default]
    Uniform,
    /// Zero the weights so the row contributes nothing.
    Zero,
}

impl MaskedRowPolicy {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "uniform" => Some(Self::Uniform),
            "zero" => Some(Self::Zero),
            _ => None,
        }
    }
}

/// Configuration driving the scaled dot-product kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Config {
    /// Behaviour for fully masked query rows.
    pub masked_rows: MaskedRowPolicy,
}

fn default_dropout_p() -> f32 {
    0.1
}

fn default_bias() -> bool {
    true
}

/// Construction parameters for [`MultiHeadAttention`](crate::multi_head::MultiHeadAttention).
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MultiHeadConfig {
    /// Number of attention heads.
    pub heads: usize,
    /// Model (feature) dimension; must be divisible by `heads`.
    pub model_dim: usize,
    /// Dropout probability applied to attention weights in training mode.
    #[serde(default = "default_dropout_p")]
    pub dropout_p: f32,
    /// Whether the four projections carry a bias.
    #[serde(default = "default_bias")]
    pub bias: bool,
    /// Seed for reproducible dropout masks; `None` uses the device RNG.
    #[serde(default)]
    pub dropout_seed: Option<u64>,
    #[serde(default)]
    pub masked_rows: MaskedRowPolicy,
}

impl MultiHeadConfig {
    /// Configuration with biased projections and the default masked-row policy.
    pub fn new(heads: usize, model_dim: usize, dropout_p: f32) -> Self {
        Self {
            heads,
            model_dim,
            dropout_p,
            bias: true,
            dropout_seed: None,
            masked_rows: MaskedRowPolicy::default(),
        }
    }

    /// Parses and validates a TOML table such as `heads = 8\nmodel_dim = 512`.
    pub fn from_toml_str(contents: &str) -> Result<Self, AttentionError> {
        let config: Self = toml::from_str(contents)
            .map_err(|err| AttentionError::config(format!("failed to parse config: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Per-head feature dimension.
    pub fn head_dim(&self) -> usize {
        self.model_dim / self.heads.max(1)
    }

    /// Kernel configuration derived from this module configuration.
    pub fn kernel_config(&self) -> Config {
        Config {
            masked_rows: self.masked_rows,
        }
    }

    /// Applies [`ENV_DROPOUT_P`] and [`ENV_MASKED_ROWS`] when set.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(ENV_DROPOUT_P) {
            match raw.trim().parse::<f32>() {
                Ok(p) => self.dropout_p = p,
                Err(_) => log::warn!("ignoring {ENV_DROPOUT_P}={raw:?}: not a number"),
            }
        }
        if let Ok(raw) = env::var(ENV_MASKED_ROWS) {
            match MaskedRowPolicy::parse(&raw) {
                Some(policy) => self.masked_rows = policy,
                None => log::warn!("ignoring {ENV_MASKED_ROWS}={raw:?}: expected uniform or zero"),
            }
        }
    }

    /// Checks the structural invariants required before parameters are built.
    pub fn validate(&self) -> Result<(), AttentionError> {
        if self.heads == 0 {
            return Err(AttentionError::config("heads must be greater than zero"));
        }
        if self.model_dim == 0 {
            return Err(AttentionError::config("model_dim must be greater than zero"));
        }
        if self.model_dim % self.heads != 0 {
            return Err(AttentionError::config(format!(
                "model_dim ({}) must be divisible by heads ({})",
                self.model_dim, self.heads
            )));
        }
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(AttentionError::config(format!(
                "dropout_p must be in [0, 1), got {}",
                self.dropout_p
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn divisibility_is_enforced() {
        assert!(MultiHeadConfig::new(8, 512, 0.1).validate().is_ok());
        let err = MultiHeadConfig::new(7, 512, 0.1).validate().unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
        assert!(MultiHeadConfig::new(0, 512, 0.1).validate().is_err());
        assert!(MultiHeadConfig::new(4, 0, 0.1).validate().is_err());
    }

    #[test]
    fn dropout_range_is_enforced() {
        assert!(MultiHeadConfig::new(2, 8, 0.0).validate().is_ok());
        assert!(MultiHeadConfig::new(2, 8, 1.0).validate().is_err());
        assert!(MultiHeadConfig::new(2, 8, -0.5).validate().is_err());
    }

    #[test]
    fn toml_defaults_fill_optional_fields() {
        let config = MultiHeadConfig::from_toml_str("heads = 4\nmodel_dim = 64\n").unwrap();
        assert_eq!(config, MultiHeadConfig::new(4, 64, 0.1));
        assert_eq!(config.head_dim(), 16);

        let config = MultiHeadConfig::from_toml_str(
            "heads = 2\nmodel_dim = 8\ndropout_p = 0.0\nbias = false\ndropout_seed = 9\nmasked_rows = \"zero\"\n",
        )
        .unwrap();
        assert!(!config.bias);
        assert_eq!(config.dropout_seed, Some(9));
        assert_eq!(config.kernel_config().masked_rows, MaskedRowPolicy::Zero);
    }

    #[test]
    fn toml_errors_are_configuration_errors() {
        let err = MultiHeadConfig::from_toml_str("heads = 3\nmodel_dim = 64\n").unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
        let err = MultiHeadConfig::from_toml_str("heads = \"many\"").unwrap_err();
        assert!(matches!(err, AttentionError::InvalidConfig { .. }));
    }

    #[test]
    fn masked_row_policy_parsing() {
        assert_eq!(MaskedRowPolicy::parse(" Zero "), Some(MaskedRowPolicy::Zero));
        assert_eq!(MaskedRowPolicy::parse("uniform"), Some(MaskedRowPolicy::Uniform));
        assert_eq!(MaskedRowPolicy::parse("nan"), None);
    }

    #[test]
    fn environment_overrides_replace_parsed_values() {
        let mut config = MultiHeadConfig::new(2, 8, 0.1);
        env::set_var(ENV_DROPOUT_P, "0.3");
        env::set_var(ENV_MASKED_ROWS, "zero");
        config.apply_env_overrides();
        assert_eq!(config.dropout_p, 0.3);
        assert_eq!(config.masked_rows, MaskedRowPolicy::Zero);

        env::set_var(ENV_DROPOUT_P, "lots");
        env::set_var(ENV_MASKED_ROWS, "sometimes");
        config.apply_env_overrides();
        assert_eq!(config.dropout_p, 0.3);
        assert_eq!(config.masked_rows, MaskedRowPolicy::Zero);

        env::remove_var(ENV_DROPOUT_P);
        env::remove_var(ENV_MASKED_ROWS);
    }
}
