// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steering vectors: loading and broadcasting to activation shape.
//!
//! A steering vector is read from a TSV file whose first column holds one
//! value per line. Before injection it is scaled and reshaped so that it
//! broadcasts over every leading (batch, sequence) axis of the target
//! layer's output.

use std::io::BufRead;
use std::path::Path;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, SteerError};

/// An ordered, non-empty sequence of `f32` components.
///
/// # Example
///
/// ```
/// use evo_steer::SteeringVector;
///
/// let v = SteeringVector::from_reader("0.5\tgeneA\n-1.25\n\n2\n".as_bytes()).unwrap();
/// assert_eq!(v.values(), &[0.5, -1.25, 2.0]);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SteeringVector {
    /// Vector components in file order.
    values: Vec<f32>,
}

impl SteeringVector {
    /// Wrap already-parsed values.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Format`] if `values` is empty.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(SteerError::Format("steering vector has no values".into()));
        }
        Ok(Self { values })
    }

    /// Load a steering vector from a TSV file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] if the file cannot be read, and
    /// [`SteerError::FormatAt`] / [`SteerError::Format`] as for
    /// [`from_reader`](Self::from_reader).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let vector = Self::from_reader(std::io::BufReader::new(file))?;
        tracing::info!(
            "loaded steering vector of length {} from {}",
            vector.len(),
            path.as_ref().display()
        );
        Ok(vector)
    }

    /// Parse the first tab-delimited column of every non-blank line.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::FormatAt`] on a non-numeric or non-finite
    /// entry and
    /// [`SteerError::Format`] if no values were read.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut values = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let field = line.split('\t').next().unwrap_or_default().trim();
            let value: f32 = field.parse().map_err(|_| SteerError::FormatAt {
                line: idx + 1,
                message: format!("steering vector entry `{field}` is not a number"),
            })?;
            if !value.is_finite() {
                return Err(SteerError::FormatAt {
                    line: idx + 1,
                    message: format!("steering vector entry `{field}` is not finite"),
                });
            }
            values.push(value);
        }
        Self::new(values)
    }

    /// Vector components in file order.
    #[must_use]
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Number of components.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always `false`: construction rejects empty vectors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Build the additive perturbation for one scale.
    ///
    /// The vector is multiplied by `scale` and singleton axes are prepended
    /// until the tensor has `rank` dimensions, so it broadcasts over the
    /// batch and sequence axes of the layer output.
    ///
    /// # Shapes
    /// - returns: `[1, ..., 1, len]` with `rank` dimensions
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Shape`] if `rank` is zero and
    /// [`SteerError::Model`] on tensor failures.
    pub fn to_addend(&self, scale: f64, rank: usize, device: &Device) -> Result<Tensor> {
        let base = Tensor::from_slice(&self.values, self.values.len(), device)?;
        let scaled = base.to_dtype(DType::F32)?.affine(scale, 0.0)?;
        broadcast_to_rank(&scaled, rank)
    }
}

/// Prepend singleton dimensions until `tensor` has `rank` dimensions.
///
/// # Errors
///
/// Returns [`SteerError::Shape`] if the tensor already has more than
/// `rank` dimensions or `rank` is zero.
pub fn broadcast_to_rank(tensor: &Tensor, rank: usize) -> Result<Tensor> {
    let current = tensor.rank();
    if rank == 0 || current > rank {
        return Err(SteerError::Shape(format!(
            "cannot broadcast a rank-{current} tensor to rank {rank}"
        )));
    }
    let mut dims = vec![1_usize; rank - current];
    dims.extend_from_slice(tensor.dims());
    Ok(tensor.reshape(dims)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn reads_first_column_and_skips_blank_lines() {
        let src = "1.5\tfoo\tbar\n\n  \n-2\n3e-1\n";
        let v = SteeringVector::from_reader(src.as_bytes()).unwrap();
        assert_eq!(v.len(), 3);
        assert!((v.values()[2] - 0.3).abs() < 1e-6);
    }

    #[test]
    fn non_numeric_entry_reports_line() {
        let src = "1.0\n\nabc\t2\n";
        let err = SteeringVector::from_reader(src.as_bytes()).unwrap_err();
        match err {
            SteerError::FormatAt { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn non_finite_entry_reports_line() {
        for bad in ["nan", "inf", "-infinity", "NaN"] {
            let src = format!("0.5\n{bad}\n1.0\n");
            match SteeringVector::from_reader(src.as_bytes()) {
                Err(SteerError::FormatAt { line, message }) => {
                    assert_eq!(line, 2);
                    assert!(message.contains("not finite"), "{message}");
                }
                other => panic!("`{bad}` gave {other:?}"),
            }
        }
    }

    #[test]
    fn empty_source_is_a_format_error() {
        let err = SteeringVector::from_reader("\n\n".as_bytes()).unwrap_err();
        assert!(matches!(err, SteerError::Format(_)));
    }

    #[test]
    fn addend_is_scaled_and_broadcast() {
        let v = SteeringVector::new(vec![1.0, -2.0, 4.0]).unwrap();
        let addend = v.to_addend(-0.5, 3, &Device::Cpu).unwrap();
        assert_eq!(addend.dims(), &[1, 1, 3]);
        let flat: Vec<f32> = addend.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![-0.5, 1.0, -2.0]);
    }

    #[test]
    fn broadcast_rejects_shrinking() {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(broadcast_to_rank(&t, 1).is_err());
        assert_eq!(broadcast_to_rank(&t, 4).unwrap().dims(), &[1, 1, 2, 3]);
    }
}
