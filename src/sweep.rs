// SPDX-License-Identifier: MIT OR Apache-2.0

//! The scale sweep: one inference pass over every sequence per steering
//! scale, with the perturbation installed for exactly the duration of its
//! pass.
//!
//! Passes run in [`SweepPlan`] order (the unsteered pass first, then the
//! configured scales as parsed); sequences run in load order within each
//! pass. Each finished pass is handed to a callback before the next one
//! starts, so a consumer can persist it immediately.

use candle_core::Tensor;

use crate::config::{SteeringConfig, SweepConfig};
use crate::error::{Result, SteerError};
use crate::hooks::CaptureSpec;
use crate::oracle::{InferenceOracle, SteeringGuard};
use crate::range::{restrict, to_host};
use crate::sequences::{QueryRange, QueryTable, Sequence, SequenceStore};
use crate::summary::log_likelihood;

/// Label of the implicit pass without perturbation.
pub const UNSTEERED_LABEL: &str = "unsteered";

// ---------------------------------------------------------------------------
// SweepPlan
// ---------------------------------------------------------------------------

/// One scheduled pass of the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalePass {
    /// Multiplier applied to the steering vector (`0.0` when unsteered).
    pub scale: f64,
    /// `unsteered` or `scale_<value>`.
    pub label: String,
    /// Whether a perturbation is installed for this pass.
    pub steered: bool,
}

impl ScalePass {
    /// The implicit pass with no perturbation.
    #[must_use]
    pub fn unsteered() -> Self {
        Self {
            scale: 0.0,
            label: UNSTEERED_LABEL.to_owned(),
            steered: false,
        }
    }

    /// A configured scale. A scale of exactly `0.0` installs nothing.
    #[must_use]
    pub fn scaled(scale: f64) -> Self {
        Self {
            scale,
            label: scale_label(scale),
            steered: scale != 0.0,
        }
    }
}

/// `scale_<value>`, with at least one decimal digit (`scale_1.0`,
/// `scale_-0.5`).
#[must_use]
pub fn scale_label(scale: f64) -> String {
    let mut value = scale.to_string();
    if !value.contains('.') {
        value.push_str(".0");
    }
    format!("scale_{value}")
}

/// Ordered list of passes for a sweep.
///
/// # Example
///
/// ```
/// use evo_steer::{SteeringConfig, SteeringVector, SweepPlan};
///
/// # fn main() -> evo_steer::Result<()> {
/// let vector = SteeringVector::new(vec![0.1, 0.2])?;
/// let steering = SteeringConfig::new(Some("blocks.1".into()), Some(vector), Some("1,n1"))?;
/// let plan = SweepPlan::new(&steering);
/// let labels: Vec<&str> = plan.passes().iter().map(|p| p.label.as_str()).collect();
/// assert_eq!(labels, ["unsteered", "scale_1.0", "scale_-1.0"]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SweepPlan {
    /// Passes in execution order.
    passes: Vec<ScalePass>,
}

impl SweepPlan {
    /// Plan the passes for `steering`: the unsteered pass, followed by one
    /// pass per configured scale when steering is enabled.
    #[must_use]
    pub fn new(steering: &SteeringConfig) -> Self {
        let mut passes = vec![ScalePass::unsteered()];
        if steering.is_enabled() {
            passes.extend(steering.scales().iter().map(|&s| ScalePass::scaled(s)));
        }
        Self { passes }
    }

    /// Passes in execution order.
    #[must_use]
    pub fn passes(&self) -> &[ScalePass] {
        &self.passes
    }

    /// Whether artifacts need a per-pass label to stay distinct.
    #[must_use]
    pub fn is_labeled(&self) -> bool {
        self.passes.len() > 1
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Summary row for one sequence in one pass.
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceSummary {
    /// Sequence id.
    pub seq_id: String,
    /// Query start (1-based, inclusive).
    pub start: usize,
    /// Query end (1-based, inclusive).
    pub end: usize,
    /// Total next-token log-likelihood over the full sequence.
    pub log_likelihood: f64,
}

/// Everything produced for one sequence in one pass.
///
/// Tensors are already restricted to the query range and live in host
/// memory as `f32`.
#[derive(Debug)]
pub struct SequenceOutput {
    /// Summary row.
    pub summary: SequenceSummary,
    /// Logits `[end - start + 1, vocab]`, if the output type keeps them.
    pub logits: Option<Tensor>,
    /// `(layer, [end - start + 1, hidden])` in configured layer order.
    pub embeddings: Vec<(String, Tensor)>,
}

/// Results of one completed pass.
#[derive(Debug)]
pub struct ScaleResult {
    /// The pass these results belong to.
    pub pass: ScalePass,
    /// One entry per sequence, in load order.
    pub sequences: Vec<SequenceOutput>,
}

impl ScaleResult {
    /// Scale label (`unsteered` or `scale_<value>`).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.pass.label
    }

    /// Steering multiplier.
    #[must_use]
    pub const fn scale(&self) -> f64 {
        self.pass.scale
    }

    /// Summary rows in load order.
    pub fn summaries(&self) -> impl Iterator<Item = &SequenceSummary> {
        self.sequences.iter().map(|s| &s.summary)
    }
}

/// A pass dropped because its perturbation could not be installed.
#[derive(Debug, Clone)]
pub struct SkippedScale {
    /// The skipped pass.
    pub pass: ScalePass,
    /// Installation error message.
    pub reason: String,
}

/// Outcome of a whole sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Completed passes, in execution order.
    pub results: Vec<ScaleResult>,
    /// Passes skipped after a recoverable installation failure.
    pub skipped: Vec<SkippedScale>,
}

// ---------------------------------------------------------------------------
// SweepEngine
// ---------------------------------------------------------------------------

/// Drives an [`InferenceOracle`] through a [`SweepPlan`].
pub struct SweepEngine<'a, O: InferenceOracle + ?Sized> {
    /// Exclusive access to the oracle for the whole sweep.
    oracle: &'a mut O,
    /// Validated sweep options.
    config: &'a SweepConfig,
    /// Pass schedule derived from `config.steering`.
    plan: SweepPlan,
}

impl<'a, O: InferenceOracle + ?Sized> SweepEngine<'a, O> {
    /// Create an engine for `config`.
    pub fn new(oracle: &'a mut O, config: &'a SweepConfig) -> Self {
        let plan = SweepPlan::new(&config.steering);
        Self {
            oracle,
            config,
            plan,
        }
    }

    /// The pass schedule.
    #[must_use]
    pub const fn plan(&self) -> &SweepPlan {
        &self.plan
    }

    /// Run every pass over every sequence in `store`.
    ///
    /// `on_scale` is called with each completed pass, after its
    /// perturbation has been removed and before the next pass begins.
    ///
    /// # Errors
    ///
    /// - [`SteerError::Config`] if an embedding layer is unknown to the
    ///   oracle (checked before any inference).
    /// - [`SteerError::Range`] if a query range does not fit its sequence.
    /// - Installation errors that are not recoverable, or any installation
    ///   error when `strict_steering` is set.
    /// - Any tokenizer, forward, or `on_scale` error.
    ///
    /// The perturbation of the failing pass is removed on every error path.
    pub fn run<F>(
        &mut self,
        store: &SequenceStore,
        queries: Option<&QueryTable>,
        mut on_scale: F,
    ) -> Result<SweepReport>
    where
        F: FnMut(&ScaleResult) -> Result<()>,
    {
        self.validate()?;
        let capture = CaptureSpec::layers(&self.config.embedding_layers);
        let mut report = SweepReport::default();

        for pass in &self.plan.passes {
            let guard = match install(&mut *self.oracle, &self.config.steering, pass) {
                Ok(guard) => guard,
                Err(e) if e.is_recoverable() && !self.config.strict_steering => {
                    tracing::warn!(label = %pass.label, "skipping scale: {e}");
                    report.skipped.push(SkippedScale {
                        pass: pass.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
                Err(e) => return Err(e),
            };

            tracing::info!(
                label = %pass.label,
                scale = pass.scale,
                steered = guard.is_steered(),
                sequences = store.len(),
                "running scale"
            );
            let sequences = run_pass(&*guard, store, queries, self.config, &capture)?;
            guard.release()?;

            let result = ScaleResult {
                pass: pass.clone(),
                sequences,
            };
            on_scale(&result)?;
            report.results.push(result);
        }

        tracing::info!(
            completed = report.results.len(),
            skipped = report.skipped.len(),
            "sweep finished"
        );
        Ok(report)
    }

    /// Check the configuration against the oracle without running
    /// inference: every embedding layer must exist.
    ///
    /// [`run`](Self::run) calls this itself; callers may call it earlier to
    /// fail before creating any output.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Config`] naming every unknown layer.
    pub fn validate(&self) -> Result<()> {
        let unknown: Vec<&str> = self
            .config
            .embedding_layers
            .iter()
            .map(String::as_str)
            .filter(|layer| !self.oracle.has_layer(layer))
            .collect();
        if unknown.is_empty() {
            return Ok(());
        }
        Err(SteerError::Config(format!(
            "unknown embedding layer(s): {}",
            unknown.join(", ")
        )))
    }
}

/// Set up the perturbation for `pass`, if it has one.
fn install<'o, O: InferenceOracle + ?Sized>(
    oracle: &'o mut O,
    steering: &SteeringConfig,
    pass: &ScalePass,
) -> Result<SteeringGuard<'o, O>> {
    let (true, Some(layer), Some(vector)) = (pass.steered, steering.layer_name(), steering.vector())
    else {
        return Ok(SteeringGuard::unsteered(oracle));
    };
    let addend = vector.to_addend(pass.scale, oracle.activation_rank(), oracle.device())?;
    SteeringGuard::install(oracle, layer, addend)
}

/// Process every sequence once under the current perturbation.
fn run_pass<O: InferenceOracle + ?Sized>(
    oracle: &O,
    store: &SequenceStore,
    queries: Option<&QueryTable>,
    config: &SweepConfig,
    capture: &CaptureSpec,
) -> Result<Vec<SequenceOutput>> {
    store
        .iter()
        .map(|seq| {
            let range = queries.map_or_else(|| QueryRange::full(seq.len()), |q| q.range_for(seq));
            run_sequence(oracle, seq, range, config, capture)
        })
        .collect()
}

/// Inference, summary, and range extraction for one sequence.
fn run_sequence<O: InferenceOracle + ?Sized>(
    oracle: &O,
    seq: &Sequence,
    range: QueryRange,
    config: &SweepConfig,
    capture: &CaptureSpec,
) -> Result<SequenceOutput> {
    range.validate(&seq.id, seq.len())?;

    let tokens = oracle.tokenize(&seq.residues)?;
    let out = oracle.forward(&tokens, capture)?;
    let ll = log_likelihood(out.logits(), &tokens)?;

    let logits = if config.output_type.needs_logits() {
        Some(to_host(&restrict(out.logits(), range, &seq.id)?)?)
    } else {
        None
    };
    let embeddings = config
        .embedding_layers
        .iter()
        .map(|layer| {
            let kept = restrict(out.require(layer)?, range, &seq.id)?;
            Ok((layer.clone(), to_host(&kept)?))
        })
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        seq_id = %seq.id,
        start = range.start,
        end = range.end,
        log_likelihood = ll,
        "sequence done"
    );
    Ok(SequenceOutput {
        summary: SequenceSummary {
            seq_id: seq.id.clone(),
            start: range.start,
            end: range.end,
            log_likelihood: ll,
        },
        logits,
        embeddings,
    })
}
