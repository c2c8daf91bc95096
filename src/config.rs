// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run configuration: output selection, embedding layers, steering scales.
//!
//! Everything here is validated before the first forward pass, so an
//! invalid option combination fails with [`SteerError::Config`] without
//! touching the model.
//!
//! # Usage
//!
//! ```
//! use evo_steer::config::{OutputType, parse_layer_names, parse_scales};
//!
//! let output: OutputType = "logits_and_embedding".parse().unwrap();
//! assert!(output.needs_embeddings());
//!
//! let layers = parse_layer_names(&["blocks.1.mlp,blocks.2", "final_norm"]);
//! assert_eq!(layers, ["blocks.1.mlp", "blocks.2", "final_norm"]);
//!
//! assert_eq!(parse_scales(Some("1.0,n0.5,2")).unwrap(), [1.0, -0.5, 2.0]);
//! ```

use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SteerError};
use crate::steering::SteeringVector;

// ---------------------------------------------------------------------------
// OutputType
// ---------------------------------------------------------------------------

/// Which per-position tensors are computed and persisted.
///
/// The per-sequence summary is always computed and written, whatever the
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputType {
    /// Logits only.
    Logits,
    /// Logits and embeddings.
    LogitsAndEmbeddings,
    /// Embeddings only.
    Embeddings,
    /// Summary table only.
    SummaryOnly,
}

impl OutputType {
    /// Whether logits artifacts are written.
    #[must_use]
    pub const fn needs_logits(self) -> bool {
        matches!(self, Self::Logits | Self::LogitsAndEmbeddings)
    }

    /// Whether embeddings are requested from the forward pass and written.
    #[must_use]
    pub const fn needs_embeddings(self) -> bool {
        matches!(self, Self::LogitsAndEmbeddings | Self::Embeddings)
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Logits => write!(f, "logits"),
            Self::LogitsAndEmbeddings => write!(f, "logits_and_embedding"),
            Self::Embeddings => write!(f, "embedding"),
            Self::SummaryOnly => write!(f, "summary_only"),
        }
    }
}

/// Parse an output-type token.
///
/// Case-insensitive; `-` and `+` are read as `_`, and plural spellings
/// are accepted.
impl FromStr for OutputType {
    type Err = SteerError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', '+'], "_");
        match normalized.as_str() {
            "logits" | "logits_only" => Ok(Self::Logits),
            "logits_and_embedding" | "logits_and_embeddings" | "logits_embedding"
            | "logits_embeddings" => Ok(Self::LogitsAndEmbeddings),
            "embedding" | "embeddings" | "embedding_only" | "embeddings_only" => {
                Ok(Self::Embeddings)
            }
            "summary" | "summary_only" => Ok(Self::SummaryOnly),
            _ => Err(SteerError::Config(format!(
                "unknown output type `{s}` (expected logits, logits_and_embedding, \
                 embedding or summary_only)"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Token-level parsers
// ---------------------------------------------------------------------------

/// Normalize a mixed comma/space separated list of layer names.
///
/// Every token is split further on commas and whitespace; empty pieces are
/// dropped. Order and duplicates are preserved.
#[must_use]
pub fn parse_layer_names<S: AsRef<str>>(tokens: &[S]) -> Vec<String> {
    tokens
        .iter()
        .flat_map(|token| {
            token
                .as_ref()
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|piece| !piece.is_empty())
                .map(str::to_owned)
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Parse a comma-separated steering-scale string.
///
/// Each token is a float, optionally prefixed with `n`/`N` to negate it
/// (so negative scales survive shells and job templates that mangle a
/// leading `-`). An absent or blank string yields `[1.0]`.
///
/// # Errors
///
/// Returns [`SteerError::Config`] if a token is a bare prefix, is not a
/// number, or is not finite.
pub fn parse_scales(raw: Option<&str>) -> Result<Vec<f64>> {
    let mut scales = Vec::new();
    for token in raw.unwrap_or_default().split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        scales.push(parse_scale_token(token)?);
    }
    if scales.is_empty() {
        scales.push(1.0);
    }
    Ok(scales)
}

/// Parse a single scale token (see [`parse_scales`]).
fn parse_scale_token(token: &str) -> Result<f64> {
    let (negate, literal) = match token.strip_prefix(['n', 'N']) {
        Some(rest) => (true, rest.trim()),
        None => (false, token),
    };
    if literal.is_empty() {
        return Err(SteerError::Config(format!(
            "steering scale `{token}` has a negation prefix but no number"
        )));
    }
    let value: f64 = literal.parse().map_err(|_| {
        SteerError::Config(format!("steering scale `{token}` is not a number"))
    })?;
    if !value.is_finite() {
        return Err(SteerError::Config(format!(
            "steering scale `{token}` is not finite"
        )));
    }
    Ok(if negate { -value } else { value })
}

// ---------------------------------------------------------------------------
// SteeringConfig
// ---------------------------------------------------------------------------

/// Where and how strongly to steer.
///
/// Either both `layer_name` and `vector` are present (steering enabled) or
/// neither is. `scales` is never empty.
#[derive(Debug, Clone)]
pub struct SteeringConfig {
    /// Layer whose output receives the perturbation.
    layer_name: Option<String>,
    /// Base steering vector.
    vector: Option<SteeringVector>,
    /// Multipliers applied to `vector`, in sweep order.
    scales: Vec<f64>,
}

impl SteeringConfig {
    /// No steering: a single unsteered pass.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            layer_name: None,
            vector: None,
            scales: vec![1.0],
        }
    }

    /// Build a validated steering configuration.
    ///
    /// `raw_scales` is parsed with [`parse_scales`]. Scales supplied without
    /// a steering layer are ignored (with a warning).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if only one of `layer_name` and
    /// `vector` is given, or if the scale string is malformed.
    pub fn new(
        layer_name: Option<String>,
        vector: Option<SteeringVector>,
        raw_scales: Option<&str>,
    ) -> Result<Self> {
        let scales = parse_scales(raw_scales)?;
        let layer_name = layer_name.filter(|name| !name.trim().is_empty());
        match (&layer_name, &vector) {
            (Some(_), Some(_)) => {}
            (Some(layer), None) => {
                return Err(SteerError::Config(format!(
                    "steering layer `{layer}` given without a steering vector"
                )));
            }
            (None, Some(_)) => {
                return Err(SteerError::Config(
                    "steering vector given without a steering layer".into(),
                ));
            }
            (None, None) => {
                if raw_scales.is_some_and(|s| !s.trim().is_empty()) {
                    tracing::warn!("steering scales ignored: no steering layer configured");
                }
                return Ok(Self::disabled());
            }
        }
        Ok(Self {
            layer_name,
            vector,
            scales,
        })
    }

    /// Whether a perturbation is applied for non-zero scales.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.layer_name.is_some()
    }

    /// Target layer, if steering is enabled.
    #[must_use]
    pub fn layer_name(&self) -> Option<&str> {
        self.layer_name.as_deref()
    }

    /// Base vector, if steering is enabled.
    #[must_use]
    pub const fn vector(&self) -> Option<&SteeringVector> {
        self.vector.as_ref()
    }

    /// Configured scales in parse order (never empty).
    #[must_use]
    pub fn scales(&self) -> &[f64] {
        &self.scales
    }
}

// ---------------------------------------------------------------------------
// SweepConfig
// ---------------------------------------------------------------------------

/// Validated configuration for one sweep.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// Which tensors to persist.
    pub output_type: OutputType,
    /// Layers to capture when embeddings are selected.
    pub embedding_layers: Vec<String>,
    /// Steering layer, vector and scales.
    pub steering: SteeringConfig,
    /// Treat a failed perturbation install as fatal instead of skipping
    /// the scale.
    pub strict_steering: bool,
}

impl SweepConfig {
    /// Combine parsed options into a validated configuration.
    ///
    /// Layer names are normalized with [`parse_layer_names`] and
    /// deduplicated, keeping first occurrences. Layers given for an output
    /// type without embeddings are dropped (with a warning).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if the output type requires embeddings
    /// and no layer names remain after normalization.
    pub fn new<S: AsRef<str>>(
        output_type: OutputType,
        embedding_layer_tokens: &[S],
        steering: SteeringConfig,
    ) -> Result<Self> {
        let mut embedding_layers = parse_layer_names(embedding_layer_tokens);
        let requested = embedding_layers.len();
        let mut seen = std::collections::HashSet::new();
        embedding_layers.retain(|layer| seen.insert(layer.clone()));
        if embedding_layers.len() < requested {
            tracing::warn!("duplicate embedding layers ignored");
        }
        if output_type.needs_embeddings() && embedding_layers.is_empty() {
            return Err(SteerError::Config(format!(
                "output type `{output_type}` requires at least one embedding layer"
            )));
        }
        if !output_type.needs_embeddings() && !embedding_layers.is_empty() {
            tracing::warn!(
                "embedding layers ignored: output type `{output_type}` writes no embeddings"
            );
            embedding_layers.clear();
        }
        Ok(Self {
            output_type,
            embedding_layers,
            steering,
            strict_steering: false,
        })
    }

    /// Make perturbation-installation failures fatal.
    #[must_use]
    pub const fn with_strict_steering(mut self, strict: bool) -> Self {
        self.strict_steering = strict;
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn vector() -> SteeringVector {
        SteeringVector::new(vec![1.0, 2.0]).unwrap()
    }

    #[test]
    fn output_type_aliases() {
        let cases = [
            ("logits", OutputType::Logits),
            ("LOGITS", OutputType::Logits),
            ("logits+embeddings", OutputType::LogitsAndEmbeddings),
            ("logits_and_embedding", OutputType::LogitsAndEmbeddings),
            ("embeddings-only", OutputType::Embeddings),
            ("embedding", OutputType::Embeddings),
            ("summary_only", OutputType::SummaryOnly),
        ];
        for (token, expected) in cases {
            assert_eq!(token.parse::<OutputType>().unwrap(), expected, "{token}");
        }
        assert!("probabilities".parse::<OutputType>().is_err());
    }

    #[test]
    fn output_type_display_parses_back() {
        for ty in [
            OutputType::Logits,
            OutputType::LogitsAndEmbeddings,
            OutputType::Embeddings,
            OutputType::SummaryOnly,
        ] {
            assert_eq!(ty.to_string().parse::<OutputType>().unwrap(), ty);
        }
    }

    #[test]
    fn output_type_selection() {
        assert!(OutputType::Logits.needs_logits());
        assert!(!OutputType::Logits.needs_embeddings());
        assert!(!OutputType::Embeddings.needs_logits());
        assert!(!OutputType::SummaryOnly.needs_logits());
        assert!(!OutputType::SummaryOnly.needs_embeddings());
    }

    #[test]
    fn layer_names_split_on_commas_and_spaces() {
        let layers = parse_layer_names(&["a,b", ",c,", "d e", ""]);
        assert_eq!(layers, ["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn scales_with_negation_prefix() {
        assert_eq!(parse_scales(Some("1.0,n0.5,2")).unwrap(), [1.0, -0.5, 2.0]);
        assert_eq!(parse_scales(Some(" N3 , -1.5 ,")).unwrap(), [-3.0, -1.5]);
    }

    #[test]
    fn scales_default_to_one() {
        assert_eq!(parse_scales(None).unwrap(), [1.0]);
        assert_eq!(parse_scales(Some("")).unwrap(), [1.0]);
        assert_eq!(parse_scales(Some("  , ")).unwrap(), [1.0]);
    }

    #[test]
    fn malformed_scales_are_config_errors() {
        for raw in ["n", "1.0,N", "abc", "n1x", "inf", "nNaN"] {
            let err = parse_scales(Some(raw)).unwrap_err();
            assert!(matches!(err, SteerError::Config(_)), "{raw}: {err}");
        }
    }

    #[test]
    fn steering_requires_layer_and_vector_together() {
        assert!(SteeringConfig::new(Some("blocks.1".into()), None, None).is_err());
        assert!(SteeringConfig::new(None, Some(vector()), None).is_err());
        let on =
            SteeringConfig::new(Some("blocks.1".into()), Some(vector()), Some("2,n1")).unwrap();
        assert!(on.is_enabled());
        assert_eq!(on.scales(), [2.0, -1.0]);
        assert_eq!(on.layer_name(), Some("blocks.1"));
    }

    #[test]
    fn scales_without_layer_are_ignored() {
        let off = SteeringConfig::new(None, None, Some("3,4")).unwrap();
        assert!(!off.is_enabled());
        assert_eq!(off.scales(), [1.0]);
    }

    #[test]
    fn embeddings_require_layers() {
        let err = SweepConfig::new::<&str>(
            OutputType::LogitsAndEmbeddings,
            &[],
            SteeringConfig::disabled(),
        )
        .unwrap_err();
        assert!(matches!(err, SteerError::Config(_)));

        let err = SweepConfig::new(OutputType::Embeddings, &[" , "], SteeringConfig::disabled())
            .unwrap_err();
        assert!(matches!(err, SteerError::Config(_)));

        let ok = SweepConfig::new(OutputType::Embeddings, &["x,y"], SteeringConfig::disabled())
            .unwrap();
        assert_eq!(ok.embedding_layers, ["x", "y"]);

        let deduped =
            SweepConfig::new(OutputType::Embeddings, &["y,x", "y"], SteeringConfig::disabled())
                .unwrap();
        assert_eq!(deduped.embedding_layers, ["y", "x"]);
    }

    #[test]
    fn layers_dropped_when_not_needed() {
        let cfg = SweepConfig::new(OutputType::SummaryOnly, &["x"], SteeringConfig::disabled())
            .unwrap()
            .with_strict_steering(true);
        assert!(cfg.embedding_layers.is_empty());
        assert!(cfg.strict_steering);
    }
}
