// SPDX-License-Identifier: MIT OR Apache-2.0

//! Restricting per-position tensors to a query range.

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, SteerError};
use crate::sequences::QueryRange;

/// Keep positions `start..=end` (1-based) along the sequence axis.
///
/// A leading batch axis of size 1 is dropped first, so `[1, seq, d]` and
/// `[seq, d]` give the same `[end - start + 1, d]` result. Other axes are
/// untouched.
///
/// # Errors
///
/// Returns [`SteerError::Shape`] for a tensor that is not `[1, seq, d]` or
/// `[seq, d]`, and [`SteerError::Range`] if the range does not fit the
/// sequence axis.
///
/// # Example
///
/// ```
/// use candle_core::{DType, Device, Tensor};
/// use evo_steer::{QueryRange, range::restrict};
///
/// let logits = Tensor::zeros((1, 8, 512), DType::F32, &Device::Cpu).unwrap();
/// let kept = restrict(&logits, QueryRange::new(3, 5), "s1").unwrap();
/// assert_eq!(kept.dims(), &[3, 512]);
/// ```
pub fn restrict(tensor: &Tensor, range: QueryRange, seq_id: &str) -> Result<Tensor> {
    let unbatched = match tensor.dims() {
        [1, _, _] => tensor.squeeze(0)?,
        [_, _] => tensor.clone(),
        dims => {
            return Err(SteerError::Shape(format!(
                "expected [1, seq, d] or [seq, d] for `{seq_id}`, got {dims:?}"
            )));
        }
    };
    let len = unbatched.dim(0)?;
    range.validate(seq_id, len)?;
    Ok(unbatched.narrow(0, range.start - 1, range.len())?)
}

/// Copy a tensor to host memory as `f32`, ready for serialization.
///
/// # Errors
///
/// Returns [`SteerError::Model`] if the transfer or cast fails.
pub fn to_host(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?)
}
