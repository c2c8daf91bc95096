// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hook plumbing shared by oracles: layer captures and additive
//! perturbations.
//!
//! - [`CaptureSpec`]: which named layer outputs a forward pass returns.
//! - [`ForwardOutput`]: logits plus the captured layer outputs.
//! - [`PerturbationRegistry`]: installed steering addends, keyed by
//!   [`PerturbationHandle`], applied to a layer's output as it is produced.
//!
//! Layer names are opaque strings owned by the oracle (e.g.
//! `blocks.3.mlp` or `final_norm`).

use std::collections::{HashMap, HashSet};

use candle_core::Tensor;

use crate::error::{Result, SteerError};

// ---------------------------------------------------------------------------
// CaptureSpec
// ---------------------------------------------------------------------------

/// Declares which layer outputs to return from a forward pass.
///
/// When empty, the oracle returns logits only and clones nothing.
///
/// # Example
///
/// ```
/// use evo_steer::CaptureSpec;
///
/// let mut spec = CaptureSpec::new();
/// spec.capture("blocks.1.mlp").capture("final_norm");
/// assert!(spec.wants_embeddings());
/// assert!(spec.is_captured("final_norm"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CaptureSpec {
    /// Requested layer names.
    layers: HashSet<String>,
}

impl CaptureSpec {
    /// An empty spec (logits only).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture every layer in `names`.
    #[must_use]
    pub fn layers<S: AsRef<str>>(names: &[S]) -> Self {
        let mut spec = Self::new();
        for name in names {
            spec.capture(name.as_ref());
        }
        spec
    }

    /// Request capture of one layer output.
    pub fn capture(&mut self, layer: &str) -> &mut Self {
        self.layers.insert(layer.to_owned());
        self
    }

    /// Whether `layer` should be captured.
    #[must_use]
    pub fn is_captured(&self, layer: &str) -> bool {
        self.layers.contains(layer)
    }

    /// Whether any embeddings were requested.
    #[must_use]
    pub fn wants_embeddings(&self) -> bool {
        !self.layers.is_empty()
    }

    /// Number of requested layers.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.layers.len()
    }
}

// ---------------------------------------------------------------------------
// ForwardOutput
// ---------------------------------------------------------------------------

/// Logits plus captured layer outputs from one forward pass.
///
/// # Example
///
/// ```
/// use evo_steer::ForwardOutput;
/// use candle_core::{DType, Device, Tensor};
///
/// let logits = Tensor::zeros((1, 4, 16), DType::F32, &Device::Cpu).unwrap();
/// let mut out = ForwardOutput::new(logits);
/// out.store("final_norm", Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu).unwrap());
/// assert_eq!(out.require("final_norm").unwrap().dims(), &[1, 4, 8]);
/// assert!(out.require("blocks.0").is_err());
/// ```
#[derive(Debug)]
pub struct ForwardOutput {
    /// Logits, `[1, seq, vocab]`.
    logits: Tensor,
    /// Captured layer outputs keyed by layer name, each `[1, seq, hidden]`.
    embeddings: HashMap<String, Tensor>,
}

impl ForwardOutput {
    /// Create an output with no captures.
    #[must_use]
    pub fn new(logits: Tensor) -> Self {
        Self {
            logits,
            embeddings: HashMap::new(),
        }
    }

    /// The logits tensor.
    #[must_use]
    pub const fn logits(&self) -> &Tensor {
        &self.logits
    }

    /// Captured output of `layer`, if any.
    #[must_use]
    pub fn get(&self, layer: &str) -> Option<&Tensor> {
        self.embeddings.get(layer)
    }

    /// Captured output of `layer`, or an error if it was not captured.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if `layer` was not captured.
    pub fn require(&self, layer: &str) -> Result<&Tensor> {
        self.embeddings
            .get(layer)
            .ok_or_else(|| SteerError::Hook(format!("layer `{layer}` was not captured")))
    }

    /// Store a captured layer output. Called by oracle implementations.
    pub fn store(&mut self, layer: &str, tensor: Tensor) {
        self.embeddings.insert(layer.to_owned(), tensor);
    }

    /// Replace the logits (for oracles that compute them last).
    pub fn set_logits(&mut self, logits: Tensor) {
        self.logits = logits;
    }

    /// Number of captured layers.
    #[must_use]
    pub fn num_captures(&self) -> usize {
        self.embeddings.len()
    }
}

// ---------------------------------------------------------------------------
// Perturbations
// ---------------------------------------------------------------------------

/// Token identifying one installed perturbation.
///
/// Deliberately not `Clone`: a handle is consumed by removal, so the same
/// perturbation cannot be removed twice.
#[derive(Debug, PartialEq, Eq)]
pub struct PerturbationHandle {
    /// Registry-unique id.
    id: u64,
    /// Layer the perturbation is attached to.
    layer: String,
}

impl PerturbationHandle {
    /// Create a handle. Oracles that keep their own bookkeeping use this;
    /// [`PerturbationRegistry`] hands them out itself.
    #[must_use]
    pub fn new(id: u64, layer: &str) -> Self {
        Self {
            id,
            layer: layer.to_owned(),
        }
    }

    /// Registry-unique id.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Layer the perturbation is attached to.
    #[must_use]
    pub fn layer(&self) -> &str {
        &self.layer
    }
}

/// An installed additive perturbation.
#[derive(Debug)]
struct Installed {
    /// Handle id.
    id: u64,
    /// Target layer.
    layer: String,
    /// Tensor added (with broadcasting) to the layer output.
    addend: Tensor,
}

/// Installed perturbations for one oracle.
///
/// Installation is checked against the set of layer names the oracle
/// exposes, so an unknown layer fails at install time rather than being
/// silently ignored during the forward pass.
#[derive(Debug)]
pub struct PerturbationRegistry {
    /// Layer names that accept perturbations.
    known_layers: HashSet<String>,
    /// Active perturbations in install order.
    installed: Vec<Installed>,
    /// Next handle id.
    next_id: u64,
}

impl PerturbationRegistry {
    /// Create an empty registry for the given layer names.
    #[must_use]
    pub fn new<I, S>(layers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known_layers: layers.into_iter().map(Into::into).collect(),
            installed: Vec::new(),
            next_id: 0,
        }
    }

    /// Whether `layer` accepts perturbations.
    #[must_use]
    pub fn has_layer(&self, layer: &str) -> bool {
        self.known_layers.contains(layer)
    }

    /// Install `addend` at `layer`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if `layer` is unknown.
    pub fn install(&mut self, layer: &str, addend: Tensor) -> Result<PerturbationHandle> {
        if !self.has_layer(layer) {
            return Err(SteerError::Hook(format!(
                "cannot install perturbation: unknown layer `{layer}`"
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        self.installed.push(Installed {
            id,
            layer: layer.to_owned(),
            addend,
        });
        Ok(PerturbationHandle::new(id, layer))
    }

    /// Remove the perturbation identified by `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if the handle does not belong to this
    /// registry.
    pub fn remove(&mut self, handle: PerturbationHandle) -> Result<()> {
        let pos = self
            .installed
            .iter()
            .position(|p| p.id == handle.id && p.layer == handle.layer)
            .ok_or_else(|| {
                SteerError::Hook(format!(
                    "no perturbation {} installed at `{}`",
                    handle.id, handle.layer
                ))
            })?;
        self.installed.remove(pos);
        Ok(())
    }

    /// Add every perturbation installed at `layer` to `output`.
    ///
    /// Addends are cast to the output dtype and broadcast over its leading
    /// axes. Returns `output` unchanged (no copy) when nothing is installed
    /// at `layer`.
    ///
    /// # Shapes
    /// - `output`: `[batch, seq, hidden]`
    /// - returns: same shape as `output`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`] if an addend does not broadcast to the
    /// output shape.
    pub fn apply(&self, layer: &str, output: Tensor) -> Result<Tensor> {
        let mut hidden = output;
        for p in self.installed.iter().filter(|p| p.layer == layer) {
            let addend = p.addend.to_dtype(hidden.dtype())?;
            hidden = hidden.broadcast_add(&addend).map_err(|e| {
                SteerError::Hook(format!(
                    "perturbation at `{layer}` with shape {:?} does not fit output {:?}: {e}",
                    p.addend.dims(),
                    hidden.dims()
                ))
            })?;
        }
        Ok(hidden)
    }

    /// Number of active perturbations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.installed.len()
    }

    /// Whether no perturbation is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.installed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device};

    use super::*;

    fn registry() -> PerturbationRegistry {
        PerturbationRegistry::new(["blocks.0", "final_norm"])
    }

    #[test]
    fn capture_spec_queries() {
        let spec = CaptureSpec::layers(&["a", "b", "a"]);
        assert_eq!(spec.num_captures(), 2);
        assert!(spec.is_captured("b"));
        assert!(!spec.is_captured("c"));
        assert!(!CaptureSpec::new().wants_embeddings());
    }

    #[test]
    fn install_unknown_layer_fails() {
        let mut reg = registry();
        let addend = Tensor::ones((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let err = reg.install("blocks.9", addend).unwrap_err();
        assert!(err.is_recoverable());
        assert!(reg.is_empty());
    }

    #[test]
    fn apply_adds_then_remove_restores() {
        let mut reg = registry();
        let output = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let addend = Tensor::new(&[[[1.0_f32, 2.0, 3.0, 4.0]]], &Device::Cpu).unwrap();

        let handle = reg.install("blocks.0", addend).unwrap();
        assert_eq!(handle.layer(), "blocks.0");
        let steered = reg.apply("blocks.0", output.clone()).unwrap();
        let rows: Vec<Vec<f32>> = steered.squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r == &[1.0, 2.0, 3.0, 4.0]));

        let other = reg.apply("final_norm", output.clone()).unwrap();
        assert_eq!(other.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);

        reg.remove(handle).unwrap();
        assert!(reg.is_empty());
        let plain = reg.apply("blocks.0", output).unwrap();
        assert_eq!(plain.sum_all().unwrap().to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn remove_foreign_handle_fails() {
        let mut reg = registry();
        let err = reg.remove(PerturbationHandle::new(42, "blocks.0")).unwrap_err();
        assert!(matches!(err, SteerError::Hook(_)));
    }

    #[test]
    fn mismatched_addend_is_hook_error() {
        let mut reg = registry();
        let addend = Tensor::ones((1, 1, 5), DType::F32, &Device::Cpu).unwrap();
        reg.install("final_norm", addend).unwrap();
        let output = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            reg.apply("final_norm", output),
            Err(SteerError::Hook(_))
        ));
    }
}
