// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-sequence summary statistic: total next-token log-likelihood.

use candle_core::{D, DType, Tensor};

use crate::error::{Result, SteerError};

/// Total log-likelihood of `tokens` under next-token `logits`.
///
/// `logits[t]` is the predictive distribution for `tokens[t + 1]`, so the
/// last logits row and the first token are dropped before a log-softmax
/// over the vocabulary; the log-probabilities of the true next tokens are
/// then gathered and summed. Fewer than two tokens sum over zero terms and
/// yield `0.0`.
///
/// # Shapes
/// - `logits`: `[1, seq, vocab]` or `[seq, vocab]`
/// - `tokens`: `[seq]`
///
/// # Errors
///
/// Returns [`SteerError::Shape`] if the logits rank or length does not
/// match `tokens`, and [`SteerError::Model`] on tensor failures (including
/// a token id outside the vocabulary).
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use evo_steer::summary::log_likelihood;
///
/// // Uniform over 4 tokens: each of the 2 predictions scores ln(1/4).
/// let logits = Tensor::zeros((1, 3, 4), candle_core::DType::F32, &Device::Cpu).unwrap();
/// let ll = log_likelihood(&logits, &[0, 1, 2]).unwrap();
/// assert!((ll - 2.0 * 0.25_f64.ln()).abs() < 1e-5);
/// ```
pub fn log_likelihood(logits: &Tensor, tokens: &[u32]) -> Result<f64> {
    let logits = match logits.rank() {
        3 => logits.squeeze(0)?,
        2 => logits.clone(),
        r => {
            return Err(SteerError::Shape(format!(
                "logits must be [1, seq, vocab] or [seq, vocab], got rank {r}"
            )));
        }
    };
    let seq_len = logits.dim(0)?;
    if seq_len != tokens.len() {
        return Err(SteerError::Shape(format!(
            "logits cover {seq_len} positions but sequence has {} tokens",
            tokens.len()
        )));
    }
    let Some(targets) = tokens.get(1..).filter(|t| !t.is_empty()) else {
        return Ok(0.0);
    };

    // PROMOTE: log-softmax in f32 regardless of model dtype
    let predictive = logits.narrow(0, 0, seq_len - 1)?.to_dtype(DType::F32)?;
    let log_probs = candle_nn::ops::log_softmax(&predictive, D::Minus1)?;
    let targets = Tensor::new(targets, log_probs.device())?.unsqueeze(1)?;
    let gathered = log_probs.gather(&targets, 1)?;
    // f64 accumulation keeps 6 decimals for long sequences
    let total: f64 = gathered.to_dtype(DType::F64)?.sum_all()?.to_scalar()?;
    Ok(total)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::Device;

    use super::*;

    /// `[1, rows, vocab]` logits with `value` at `(row, hot[row])`, 0 elsewhere.
    fn one_hot_logits(hot: &[usize], vocab: usize, value: f32) -> Tensor {
        let mut data = vec![0.0_f32; hot.len() * vocab];
        for (row, &col) in hot.iter().enumerate() {
            if let Some(cell) = data.get_mut(row * vocab + col) {
                *cell = value;
            }
        }
        Tensor::from_vec(data, (1, hot.len(), vocab), &Device::Cpu).unwrap()
    }

    #[test]
    fn certain_prediction_scores_zero() {
        // Row 0 predicts token 1 with probability ~1; row 1 is ignored.
        let logits = one_hot_logits(&[1, 0], 4, 200.0);
        let ll = log_likelihood(&logits, &[3, 1]).unwrap();
        assert!(ll.abs() < 1e-6, "got {ll}");
    }

    #[test]
    fn impossible_prediction_is_very_negative() {
        let logits = one_hot_logits(&[1, 0], 4, 200.0);
        let ll = log_likelihood(&logits, &[3, 2]).unwrap();
        assert!(ll < -150.0, "got {ll}");
    }

    #[test]
    fn short_sequences_score_zero() {
        let one = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(log_likelihood(&one, &[2]).unwrap(), 0.0);
        let none = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(log_likelihood(&none, &[]).unwrap(), 0.0);
    }

    #[test]
    fn rank2_matches_rank3() {
        let logits = one_hot_logits(&[2, 3, 1], 5, 1.5);
        let tokens = [0, 2, 3];
        let a = log_likelihood(&logits, &tokens).unwrap();
        let b = log_likelihood(&logits.squeeze(0).unwrap(), &tokens).unwrap();
        assert!((a - b).abs() < 1e-9);
        // ln(e^1.5 / (e^1.5 + 4)) twice.
        let expected = 2.0 * (1.5_f64.exp() / (1.5_f64.exp() + 4.0)).ln();
        assert!((a - expected).abs() < 1e-4, "{a} vs {expected}");
    }

    #[test]
    fn long_sequence_total_keeps_precision() {
        let rows = 200_000;
        let logits = Tensor::zeros((rows, 4), DType::F32, &Device::Cpu).unwrap();
        let first_row = logits.narrow(0, 0, 1).unwrap();
        let per_token: f32 = candle_nn::ops::log_softmax(&first_row, D::Minus1)
            .unwrap()
            .flatten_all()
            .unwrap()
            .get(0)
            .unwrap()
            .to_scalar()
            .unwrap();
        let tokens = vec![0_u32; rows];
        let ll = log_likelihood(&logits, &tokens).unwrap();
        let expected = f64::from(per_token) * 199_999.0;
        assert!((ll - expected).abs() < 1e-6, "{ll} vs {expected}");
    }

    #[test]
    fn length_mismatch_is_shape_error() {
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            log_likelihood(&logits, &[0, 1]),
            Err(SteerError::Shape(_))
        ));
    }
}
