// SPDX-License-Identifier: MIT OR Apache-2.0

//! One mixer block of the reference model.
//!
//! `x -> rms_norm -> mix(t) = h(t) + gate * h(t-1) -> proj(gelu(fc(mix)))`,
//! with the block output added back onto the residual stream by the caller.

use candle_core::{Module, Tensor};
use candle_nn::{Linear, RmsNorm, VarBuilder};

use super::config::ModelConfig;
use crate::error::{Result, SteerError};

// ---------------------------------------------------------------------------
// MixerBlock
// ---------------------------------------------------------------------------

/// Causal token-shift mixer followed by a GELU MLP.
pub(super) struct MixerBlock {
    /// Pre-mix RMS norm.
    norm: RmsNorm,
    /// Per-channel weight on the previous position: `[hidden_size]`.
    shift_gate: Tensor,
    /// MLP up projection: `[hidden_size] -> [intermediate_size]`.
    fc: Linear,
    /// MLP down projection: `[intermediate_size] -> [hidden_size]`.
    proj: Linear,
}

impl MixerBlock {
    /// Load block weights (`norm.weight`, `shift_gate`, `mlp.fc.*`,
    /// `mlp.proj.*`) relative to `vb`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] if a weight is missing or misshapen.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub(super) fn load(config: &ModelConfig, vb: VarBuilder<'_>) -> Result<Self> {
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        Ok(Self {
            norm: candle_nn::rms_norm(hidden, config.norm_eps, vb.pp("norm"))?,
            shift_gate: vb.get(hidden, "shift_gate")?,
            fc: candle_nn::linear(hidden, inter, vb.pp("mlp.fc"))?,
            proj: candle_nn::linear(inter, hidden, vb.pp("mlp.proj"))?,
        })
    }

    /// Block contribution to the residual stream (the `mlp` hook point).
    ///
    /// # Shapes
    /// - `residual`: `[1, seq, hidden_size]`
    /// - returns: `[1, seq, hidden_size]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`] on tensor operation failures.
    pub(super) fn forward(&self, residual: &Tensor) -> Result<Tensor> {
        let normed = self.norm.forward(residual)?;
        let previous = shift_right(&normed)?;
        let mixed = (&normed + previous.broadcast_mul(&self.shift_gate)?)?;
        let inner = self.fc.forward(&mixed)?.gelu()?;
        Ok(self.proj.forward(&inner)?)
    }
}

/// Shift along the sequence axis by one position, zero-filling `t = 0`.
///
/// # Shapes
/// - `xs`: `[batch, seq, hidden]`, `seq >= 1`
/// - returns: `[batch, seq, hidden]`
fn shift_right(xs: &Tensor) -> Result<Tensor> {
    let (batch, seq_len, hidden) = xs.dims3()?;
    if seq_len == 0 {
        return Err(SteerError::Shape("cannot shift an empty sequence".into()));
    }
    let pad = Tensor::zeros((batch, 1, hidden), xs.dtype(), xs.device())?;
    if seq_len == 1 {
        return Ok(pad);
    }
    let head = xs.narrow(1, 0, seq_len - 1)?;
    Ok(Tensor::cat(&[&pad, &head], 1)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    #[test]
    fn shift_right_delays_by_one() {
        let xs = Tensor::new(&[[[1.0_f32], [2.0], [3.0]]], &Device::Cpu).unwrap();
        let shifted: Vec<Vec<f32>> =
            shift_right(&xs).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(shifted, vec![vec![0.0], vec![1.0], vec![2.0]]);
    }

    #[test]
    fn shift_right_single_position_is_zero() {
        let xs = Tensor::new(&[[[5.0_f32, 6.0]]], &Device::Cpu).unwrap();
        let shifted: Vec<Vec<f32>> =
            shift_right(&xs).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(shifted, vec![vec![0.0, 0.0]]);
    }
}
