// SPDX-License-Identifier: MIT OR Apache-2.0

//! The inference oracle contract and scoped steering.
//!
//! [`InferenceOracle`] is the only view the sweep has of a sequence model:
//! tokenize, run a forward pass, and add/remove a perturbation at a named
//! layer. [`SteeringGuard`] ties a perturbation's lifetime to a lexical
//! scope so it is removed even when a forward pass fails mid-scale.

use std::ops::Deref;

use candle_core::{Device, Tensor};

use crate::error::Result;
use crate::hooks::{CaptureSpec, ForwardOutput, PerturbationHandle};

// ---------------------------------------------------------------------------
// InferenceOracle
// ---------------------------------------------------------------------------

/// A black-box sequence model with a per-layer perturbation capability.
///
/// The device returned by [`device`](Self::device) is the single shared
/// accelerator context of the run; the sweep never issues more than one
/// forward call at a time.
pub trait InferenceOracle {
    /// Device the model lives on.
    fn device(&self) -> &Device;

    /// Rank of layer outputs (`3` for `[batch, seq, hidden]`). Steering
    /// addends are reshaped to this rank before installation.
    fn activation_rank(&self) -> usize {
        3
    }

    /// Whether `layer` names a layer that can be captured or perturbed.
    fn has_layer(&self, layer: &str) -> bool;

    /// Convert residues into token ids.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`](crate::SteerError::Tokenizer) if
    /// the residues cannot be encoded.
    fn tokenize(&self, residues: &str) -> Result<Vec<u32>>;

    /// Run a forward pass over one sequence.
    ///
    /// Embeddings are captured only for layers in `capture`; an empty spec
    /// returns logits only.
    ///
    /// # Shapes
    /// - `token_ids`: `[seq]`
    /// - returns: logits `[1, seq, vocab]`, captures `[1, seq, hidden]`
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Model`](crate::SteerError::Model) on tensor
    /// failures.
    fn forward(&self, token_ids: &[u32], capture: &CaptureSpec) -> Result<ForwardOutput>;

    /// Add `addend` to the output of `layer` on every forward pass until
    /// the returned handle is removed.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`](crate::SteerError::Hook) if the layer
    /// is unknown or the addend does not fit its output.
    fn install_perturbation(&mut self, layer: &str, addend: Tensor)
    -> Result<PerturbationHandle>;

    /// Remove a perturbation installed by this oracle.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Hook`](crate::SteerError::Hook) if the handle
    /// is not active.
    fn remove_perturbation(&mut self, handle: PerturbationHandle) -> Result<()>;
}

// ---------------------------------------------------------------------------
// SteeringGuard
// ---------------------------------------------------------------------------

/// Exclusive access to an oracle for the duration of one scale, with at
/// most one perturbation installed.
///
/// The perturbation is removed by [`release`](Self::release) or, if the
/// guard is dropped early (for example by `?` on a failed forward pass),
/// by `Drop`. Forward passes go through the guard via `Deref`.
pub struct SteeringGuard<'a, O: InferenceOracle + ?Sized> {
    /// Borrowed oracle.
    oracle: &'a mut O,
    /// Active perturbation, if one was installed.
    handle: Option<PerturbationHandle>,
}

impl<'a, O: InferenceOracle + ?Sized> SteeringGuard<'a, O> {
    /// A guard with nothing installed (the unsteered pass).
    pub fn unsteered(oracle: &'a mut O) -> Self {
        Self {
            oracle,
            handle: None,
        }
    }

    /// Install `addend` at `layer` and guard its removal.
    ///
    /// # Errors
    ///
    /// Propagates the oracle's installation error; nothing is installed in
    /// that case.
    pub fn install(oracle: &'a mut O, layer: &str, addend: Tensor) -> Result<Self> {
        let handle = oracle.install_perturbation(layer, addend)?;
        tracing::debug!(layer, id = handle.id(), "perturbation installed");
        Ok(Self {
            oracle,
            handle: Some(handle),
        })
    }

    /// Whether a perturbation is active.
    #[must_use]
    pub const fn is_steered(&self) -> bool {
        self.handle.is_some()
    }

    /// Remove the perturbation, reporting failure. A no-op for unsteered
    /// guards.
    ///
    /// # Errors
    ///
    /// Propagates the oracle's removal error.
    pub fn release(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => {
                let id = handle.id();
                self.oracle.remove_perturbation(handle)?;
                tracing::debug!(id, "perturbation removed");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl<O: InferenceOracle + ?Sized> Deref for SteeringGuard<'_, O> {
    type Target = O;

    fn deref(&self) -> &O {
        &*self.oracle
    }
}

impl<O: InferenceOracle + ?Sized> Drop for SteeringGuard<'_, O> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let id = handle.id();
            if let Err(e) = self.oracle.remove_perturbation(handle) {
                tracing::error!(id, "failed to remove perturbation during unwind: {e}");
            } else {
                tracing::debug!(id, "perturbation removed during unwind");
            }
        }
    }
}
