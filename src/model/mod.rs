// SPDX-License-Identifier: MIT OR Apache-2.0

//! A small candle-native nucleotide language model that implements
//! [`InferenceOracle`].
//!
//! Architecture: byte embedding, `num_layers` [`MixerBlock`]s on a residual
//! stream, final RMS norm, untied unembedding. Named layers, in forward
//! order:
//!
//! | Layer | Output |
//! |---|---|
//! | `embed` | token embeddings |
//! | `blocks.{i}.mlp` | block `i` contribution before the residual add |
//! | `blocks.{i}` | residual stream after block `i` |
//! | `final_norm` | normalized stream fed to the unembedding |
//!
//! Every named layer can be captured and perturbed; a perturbation is
//! applied before the capture at the same layer.

pub mod config;
mod block;

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Embedding, Linear, RmsNorm, VarBuilder};

use self::block::MixerBlock;
pub use self::config::ModelConfig;
use crate::error::{Result, SteerError};
use crate::hooks::{CaptureSpec, ForwardOutput, PerturbationHandle, PerturbationRegistry};
use crate::oracle::InferenceOracle;
use crate::tokenizer::SeqTokenizer;

/// Name of the embedding hook point.
pub const EMBED_LAYER: &str = "embed";
/// Name of the final-norm hook point.
pub const FINAL_NORM_LAYER: &str = "final_norm";

// ---------------------------------------------------------------------------
// ReferenceModel
// ---------------------------------------------------------------------------

/// Byte-level residual mixer model with per-layer capture and steering.
pub struct ReferenceModel {
    /// Token embedding: `[vocab_size, hidden_size]`.
    embed: Embedding,
    /// Mixer blocks.
    blocks: Vec<MixerBlock>,
    /// Final RMS norm.
    final_norm: RmsNorm,
    /// Unembedding: `[hidden_size] -> [vocab_size]`.
    unembed: Linear,
    /// Residue tokenizer.
    tokenizer: SeqTokenizer,
    /// Installed steering perturbations.
    perturbations: PerturbationRegistry,
    /// Model dimensions.
    config: ModelConfig,
    /// Device the weights live on.
    device: Device,
}

impl ReferenceModel {
    /// Build a model from a [`VarBuilder`] with a byte-level tokenizer.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] for invalid dimensions and
    /// [`SteerError::Model`] if a weight is missing or misshapen.
    #[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
    pub fn from_var_builder(config: ModelConfig, vb: VarBuilder<'_>) -> Result<Self> {
        config.validate()?;
        let embed = candle_nn::embedding(config.vocab_size, config.hidden_size, vb.pp("embed"))?;

        let mut blocks = Vec::with_capacity(config.num_layers);
        for i in 0..config.num_layers {
            blocks.push(MixerBlock::load(&config, vb.pp(format!("blocks.{i}")))?);
        }

        let final_norm =
            candle_nn::rms_norm(config.hidden_size, config.norm_eps, vb.pp("final_norm"))?;
        let unembed =
            candle_nn::linear_no_bias(config.hidden_size, config.vocab_size, vb.pp("unembed"))?;

        let perturbations = PerturbationRegistry::new(layer_names(config.num_layers));
        Ok(Self {
            embed,
            blocks,
            final_norm,
            unembed,
            tokenizer: SeqTokenizer::bytes(config.vocab_size),
            perturbations,
            device: vb.device().clone(),
            config,
        })
    }

    /// Load a model directory: `config.json`, `model.safetensors`, and an
    /// optional `tokenizer.json` (byte-level tokenization otherwise).
    ///
    /// Weights are loaded as `F32` on CPU and `BF16` on CUDA.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] if `config.json` or the weights file
    /// is missing or invalid, [`SteerError::Tokenizer`] for a bad
    /// `tokenizer.json`, and [`SteerError::Model`] if weight loading fails.
    pub fn load(dir: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let dir = dir.as_ref();
        let config_path = dir.join("config.json");
        let config_str = std::fs::read_to_string(&config_path).map_err(|e| {
            SteerError::Config(format!("read {}: {e}", config_path.display()))
        })?;
        let json: serde_json::Value = serde_json::from_str(&config_str)
            .map_err(|e| SteerError::Config(format!("parse config.json: {e}")))?;
        let config = ModelConfig::from_json(&json)?;

        let weights_path = dir.join("model.safetensors");
        if !weights_path.is_file() {
            return Err(SteerError::Config(format!(
                "model.safetensors not found in {}",
                dir.display()
            )));
        }

        let dtype = if device.is_cuda() {
            DType::BF16
        } else {
            DType::F32
        };
        let vb = create_var_builder(&weights_path, dtype, device)?;
        let mut model = Self::from_var_builder(config, vb)?;

        let tokenizer_path = dir.join("tokenizer.json");
        if tokenizer_path.is_file() {
            model = model.with_tokenizer(SeqTokenizer::from_hf_path(&tokenizer_path)?);
        }

        tracing::info!(
            dir = %dir.display(),
            layers = model.config.num_layers,
            hidden = model.config.hidden_size,
            vocab = model.config.vocab_size,
            "loaded reference model"
        );
        Ok(model)
    }

    /// Build a model with deterministic pseudo-random weights.
    ///
    /// Every weight is a scaled sine pattern over its flat index, so two
    /// calls with the same config produce identical models. Useful for
    /// exercising the pipeline without a checkpoint.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] for invalid dimensions and
    /// [`SteerError::Model`] on tensor failures.
    pub fn synthetic(config: ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let tensors = synthetic_weights(&config, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let model = Self::from_var_builder(config, vb)?;
        tracing::info!(
            layers = model.config.num_layers,
            hidden = model.config.hidden_size,
            "built synthetic reference model"
        );
        Ok(model)
    }

    /// Replace the tokenizer.
    #[must_use]
    pub fn with_tokenizer(mut self, tokenizer: SeqTokenizer) -> Self {
        if tokenizer.vocab_size() > self.config.vocab_size {
            tracing::warn!(
                tokenizer_vocab = tokenizer.vocab_size(),
                model_vocab = self.config.vocab_size,
                "tokenizer vocabulary is larger than the model's; out-of-range ids will fail"
            );
        }
        self.tokenizer = tokenizer;
        self
    }

    /// Model dimensions.
    #[must_use]
    pub const fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// All hook point names in forward order.
    #[must_use]
    pub fn layer_names(&self) -> Vec<String> {
        layer_names(self.config.num_layers)
    }

    /// Number of perturbations currently installed.
    #[must_use]
    pub fn num_perturbations(&self) -> usize {
        self.perturbations.len()
    }

    /// Apply perturbations at `layer`, then capture if requested.
    fn hook(
        &self,
        layer: &str,
        hidden: Tensor,
        capture: &CaptureSpec,
        out: &mut ForwardOutput,
    ) -> Result<Tensor> {
        let hidden = self.perturbations.apply(layer, hidden)?;
        if capture.is_captured(layer) {
            out.store(layer, hidden.clone());
        }
        Ok(hidden)
    }
}

impl InferenceOracle for ReferenceModel {
    fn device(&self) -> &Device {
        &self.device
    }

    fn has_layer(&self, layer: &str) -> bool {
        self.perturbations.has_layer(layer)
    }

    fn tokenize(&self, residues: &str) -> Result<Vec<u32>> {
        self.tokenizer.encode(residues)
    }

    fn forward(&self, token_ids: &[u32], capture: &CaptureSpec) -> Result<ForwardOutput> {
        if token_ids.is_empty() {
            return Err(SteerError::Shape("cannot run forward on zero tokens".into()));
        }
        if let Some(bad) = token_ids
            .iter()
            .find(|&&id| usize::try_from(id).map_or(true, |id| id >= self.config.vocab_size))
        {
            return Err(SteerError::Tokenizer(format!(
                "token id {bad} is outside vocabulary of size {}",
                self.config.vocab_size
            )));
        }

        let input_ids = Tensor::new(token_ids, &self.device)?.unsqueeze(0)?;

        // Capture cache: logits are set at the end.
        let mut out = ForwardOutput::new(Tensor::zeros(1, DType::F32, &self.device)?);

        // --- Embedding ---
        let mut hidden = self.embed.forward(&input_ids)?;
        hidden = self.hook(EMBED_LAYER, hidden, capture, &mut out)?;

        // --- Blocks ---
        for (i, block) in self.blocks.iter().enumerate() {
            let contribution = block.forward(&hidden)?;
            let mlp_layer = format!("blocks.{i}.mlp");
            let contribution = self.hook(&mlp_layer, contribution, capture, &mut out)?;
            hidden = (hidden + contribution)?;
            hidden = self.hook(&format!("blocks.{i}"), hidden, capture, &mut out)?;
        }

        // --- Final norm ---
        hidden = self.final_norm.forward(&hidden)?;
        hidden = self.hook(FINAL_NORM_LAYER, hidden, capture, &mut out)?;

        // --- Unembedding ---
        out.set_logits(self.unembed.forward(&hidden)?);
        Ok(out)
    }

    fn install_perturbation(
        &mut self,
        layer: &str,
        addend: Tensor,
    ) -> Result<PerturbationHandle> {
        let hidden = self.config.hidden_size;
        let fits = addend.rank() <= 3 && addend.dims().last() == Some(&hidden);
        if !fits {
            return Err(SteerError::Hook(format!(
                "addend of shape {:?} does not fit `{layer}` output [1, seq, {hidden}]",
                addend.dims()
            )));
        }
        let addend = addend.to_device(&self.device)?;
        self.perturbations.install(layer, addend)
    }

    fn remove_perturbation(&mut self, handle: PerturbationHandle) -> Result<()> {
        self.perturbations.remove(handle)
    }
}

impl std::fmt::Debug for ReferenceModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceModel")
            .field("config", &self.config)
            .field("tokenizer", &self.tokenizer)
            .field("perturbations", &self.perturbations.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Select CUDA device 0 when available (and not `force_cpu`), else CPU.
///
/// # Errors
///
/// Returns [`SteerError::Model`] on device detection failure.
pub fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu {
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    tracing::debug!(cuda = device.is_cuda(), "selected device");
    Ok(device)
}

/// Hook point names for a model with `num_layers` blocks.
fn layer_names(num_layers: usize) -> Vec<String> {
    let mut names = Vec::with_capacity(2 * num_layers + 2);
    names.push(EMBED_LAYER.to_owned());
    for i in 0..num_layers {
        names.push(format!("blocks.{i}.mlp"));
        names.push(format!("blocks.{i}"));
    }
    names.push(FINAL_NORM_LAYER.to_owned());
    names
}

/// Create a `VarBuilder` for a single safetensors file.
///
/// Uses buffered (safe) loading by default; with the `mmap` feature the
/// file is memory-mapped instead.
fn create_var_builder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    #[cfg(feature = "mmap")]
    {
        mmap_var_builder(&[path.to_path_buf()], dtype, device)
    }
    #[cfg(not(feature = "mmap"))]
    {
        buffered_var_builder(path, dtype, device)
    }
}

/// Load weights by reading the whole file into memory.
#[cfg(not(feature = "mmap"))]
fn buffered_var_builder(
    path: &Path,
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    let data = std::fs::read(path).map_err(|e| {
        SteerError::Model(candle_core::Error::Msg(format!(
            "read {}: {e}",
            path.display()
        )))
    })?;
    Ok(VarBuilder::from_buffered_safetensors(data, dtype, device)?)
}

/// Load weights via a memory-mapped file.
///
/// # Safety
///
/// The safetensors file must not be modified while the model is loaded.
#[cfg(feature = "mmap")]
#[allow(unsafe_code)]
fn mmap_var_builder(
    paths: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: safetensors files must not be modified while loaded.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(paths, dtype, device)? };
    Ok(vb)
}

/// Deterministic weights for [`ReferenceModel::synthetic`].
fn synthetic_weights(config: &ModelConfig, device: &Device) -> Result<HashMap<String, Tensor>> {
    let hidden = config.hidden_size;
    let inter = config.intermediate_size;
    let vocab = config.vocab_size;
    let in_scale = 1.0 / f64::from(u32::try_from(hidden).unwrap_or(u32::MAX)).sqrt();
    let mid_scale = 1.0 / f64::from(u32::try_from(inter).unwrap_or(u32::MAX)).sqrt();

    let mut weights = HashMap::new();
    let mut seed = 0.0_f64;
    let mut next = |shape: &[usize], scale: f64| -> Result<Tensor> {
        seed += 1.0;
        sine_pattern(shape, seed, scale, device)
    };

    weights.insert("embed.weight".to_owned(), next(&[vocab, hidden], 1.0)?);
    for i in 0..config.num_layers {
        let p = format!("blocks.{i}");
        weights.insert(
            format!("{p}.norm.weight"),
            Tensor::ones(hidden, DType::F32, device)?,
        );
        weights.insert(format!("{p}.shift_gate"), next(&[hidden], 0.5)?);
        weights.insert(format!("{p}.mlp.fc.weight"), next(&[inter, hidden], in_scale)?);
        weights.insert(format!("{p}.mlp.fc.bias"), next(&[inter], 0.1)?);
        weights.insert(format!("{p}.mlp.proj.weight"), next(&[hidden, inter], mid_scale)?);
        weights.insert(
            format!("{p}.mlp.proj.bias"),
            Tensor::zeros(hidden, DType::F32, device)?,
        );
    }
    weights.insert(
        "final_norm.weight".to_owned(),
        Tensor::ones(hidden, DType::F32, device)?,
    );
    weights.insert("unembed.weight".to_owned(), next(&[vocab, hidden], in_scale)?);
    Ok(weights)
}

/// `scale * sin(0.618 * seed * k + seed)` over flat index `k`, reshaped.
fn sine_pattern(shape: &[usize], seed: f64, scale: f64, device: &Device) -> Result<Tensor> {
    let numel: usize = shape.iter().product();
    let numel = u32::try_from(numel)
        .map_err(|_| SteerError::Config(format!("synthetic tensor {shape:?} is too large")))?;
    let index = Tensor::arange(0_u32, numel, device)?.to_dtype(DType::F32)?;
    let values = index
        .affine(0.618_033_988_75 * seed, seed)?
        .sin()?
        .affine(scale, 0.0)?;
    Ok(values.reshape(shape.to_vec())?)
}
