// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference model configuration, parsed from `config.json`.

use serde_json::Value;

use crate::error::{Result, SteerError};

/// Dimensions of a [`ReferenceModel`](super::ReferenceModel).
///
/// [`Default`] gives the small configuration used by synthetic models:
/// a 512-token byte vocabulary, 32-wide hidden state, 4 blocks.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Vocabulary size (logits width).
    pub vocab_size: usize,
    /// Hidden (residual stream) width.
    pub hidden_size: usize,
    /// MLP inner width.
    pub intermediate_size: usize,
    /// Number of mixer blocks.
    pub num_layers: usize,
    /// RMS norm epsilon.
    pub norm_eps: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 512,
            hidden_size: 32,
            intermediate_size: 64,
            num_layers: 4,
            norm_eps: 1e-5,
        }
    }
}

impl ModelConfig {
    /// Parse a `config.json` value.
    ///
    /// `vocab_size` and `hidden_size` are required. The block count is read
    /// from `num_layers` or `num_hidden_layers`. `intermediate_size`
    /// defaults to `2 * hidden_size` and `norm_eps` (or `rms_norm_eps`) to
    /// `1e-5`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if a required field is missing or a
    /// dimension is zero.
    pub fn from_json(config: &Value) -> Result<Self> {
        let hidden_size = get_usize(config, "hidden_size")?;
        let num_layers = match get_optional_usize(config, "num_layers") {
            Some(n) => n,
            None => get_usize(config, "num_hidden_layers")?,
        };
        let parsed = Self {
            vocab_size: get_usize(config, "vocab_size")?,
            hidden_size,
            intermediate_size: get_optional_usize(config, "intermediate_size")
                .unwrap_or(2 * hidden_size),
            num_layers,
            norm_eps: config
                .get("norm_eps")
                .or_else(|| config.get("rms_norm_eps"))
                .and_then(Value::as_f64)
                .unwrap_or(1e-5),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    /// Check that every dimension is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] naming the first zero dimension.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_layers", self.num_layers),
        ] {
            if value == 0 {
                return Err(SteerError::Config(format!("'{name}' must be positive")));
            }
        }
        Ok(())
    }
}

/// Extract a required `usize` field.
fn get_usize(config: &Value, key: &str) -> Result<usize> {
    let val = config
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| SteerError::Config(format!("missing or invalid field '{key}'")))?;
    usize::try_from(val)
        .map_err(|_| SteerError::Config(format!("field '{key}' value {val} overflows usize")))
}

/// Extract an optional `usize` field, returning `None` if absent.
fn get_optional_usize(config: &Value, key: &str) -> Option<usize> {
    config
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|v| usize::try_from(v).ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg = ModelConfig::from_json(&json!({
            "vocab_size": 512,
            "hidden_size": 16,
            "intermediate_size": 40,
            "num_layers": 2,
            "norm_eps": 1e-6,
        }))
        .unwrap();
        assert_eq!(cfg.hidden_size, 16);
        assert_eq!(cfg.intermediate_size, 40);
        assert_eq!(cfg.num_layers, 2);
        assert!((cfg.norm_eps - 1e-6).abs() < 1e-12);
    }

    #[test]
    fn fills_defaults_and_aliases() {
        let cfg = ModelConfig::from_json(&json!({
            "vocab_size": 256,
            "hidden_size": 8,
            "num_hidden_layers": 3,
        }))
        .unwrap();
        assert_eq!(cfg.intermediate_size, 16);
        assert_eq!(cfg.num_layers, 3);
        assert!((cfg.norm_eps - 1e-5).abs() < 1e-12);
    }

    #[test]
    fn missing_or_zero_fields_are_config_errors() {
        let missing = ModelConfig::from_json(&json!({ "hidden_size": 8, "num_layers": 1 }));
        assert!(matches!(missing, Err(SteerError::Config(m)) if m.contains("vocab_size")));

        let zero = ModelConfig::from_json(&json!({
            "vocab_size": 256, "hidden_size": 8, "num_layers": 0,
        }));
        assert!(matches!(zero, Err(SteerError::Config(_))));
    }
}
