// SPDX-License-Identifier: MIT OR Apache-2.0

//! # evo-steer
//!
//! Multi-scale activation steering sweeps over genomic sequence models,
//! built on [candle](https://github.com/huggingface/candle).
//!
//! For every requested steering scale (plus an implicit unsteered pass),
//! evo-steer adds a scaled vector to one internal layer's output, runs the
//! model over every sequence, and records the total next-token
//! log-likelihood together with range-restricted logits and embeddings.
//!
//! ## Pieces
//!
//! - [`InferenceOracle`]: the model contract (tokenize, forward with
//!   captures, install/remove a perturbation).
//! - [`ReferenceModel`]: a small byte-level model implementing it, loaded
//!   from a local directory or built synthetically.
//! - [`SweepEngine`]: the scale sweep, with perturbation lifetime scoped by
//!   [`SteeringGuard`].
//! - [`ResultWriter`]: per-scale artifacts, committed atomically.
//!
//! ## Example
//!
//! ```
//! use candle_core::Device;
//! use evo_steer::{
//!     ModelConfig, OutputType, ReferenceModel, SequenceStore, SteeringConfig, SweepConfig,
//!     SweepEngine,
//! };
//!
//! # fn main() -> evo_steer::Result<()> {
//! let mut model = ReferenceModel::synthetic(ModelConfig::default(), &Device::Cpu)?;
//! let store = SequenceStore::from_reader(">s1\nACGTACGT\n".as_bytes())?;
//! let no_layers: &[&str] = &[];
//! let config = SweepConfig::new(OutputType::SummaryOnly, no_layers, SteeringConfig::disabled())?;
//!
//! let report = SweepEngine::new(&mut model, &config).run(&store, None, |_| Ok(()))?;
//! assert_eq!(report.results.len(), 1);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod hooks;
pub mod model;
pub mod oracle;
pub mod output;
pub mod pipeline;
pub mod range;
pub mod sequences;
pub mod steering;
pub mod summary;
pub mod sweep;
pub mod tokenizer;

pub use config::{OutputType, SteeringConfig, SweepConfig, parse_layer_names, parse_scales};
pub use error::{Result, SteerError};
pub use hooks::{CaptureSpec, ForwardOutput, PerturbationHandle, PerturbationRegistry};
pub use model::{ModelConfig, ReferenceModel, select_device};
pub use oracle::{InferenceOracle, SteeringGuard};
pub use output::ResultWriter;
pub use pipeline::{RunInputs, run_sweep};
pub use sequences::{QueryRange, QueryTable, Sequence, SequenceStore};
pub use steering::SteeringVector;
pub use sweep::{
    ScalePass, ScaleResult, SequenceOutput, SequenceSummary, SkippedScale, SweepEngine,
    SweepPlan, SweepReport,
};
pub use tokenizer::SeqTokenizer;
