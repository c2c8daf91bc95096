// SPDX-License-Identifier: MIT OR Apache-2.0

//! Writing sweep results to disk.
//!
//! File names, with `_<label>` appended only when the sweep has more than
//! one pass:
//!
//! | Artifact | Name |
//! |---|---|
//! | processed ids | `<base>_processed_ids.txt` |
//! | summary table | `<base>_summary[_<label>].tsv` |
//! | logits | `<base>_<sid>_logits[_<label>].npy` |
//! | embeddings | `<base>_<sid>_embeddings_<layer>[_<label>].npy` |
//! | run manifest | `<base>_run.json` |
//!
//! `<sid>` and `<layer>` go through [`safe_file_component`]; ids that
//! collide after that get an index suffix ([`sequence_file_components`]). Each pass is
//! written into a hidden staging directory and moved into place with the
//! summary table last, so a summary on disk means every artifact of its
//! pass is complete.

use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::{OutputType, SweepConfig};
use crate::error::{Result, SteerError};
use crate::sweep::{ScaleResult, SweepReport};

/// Header of the per-pass summary table.
pub const SUMMARY_HEADER: &str = "seq_id\tstart\tend\ttotal_log_likelihood";

/// Replace every non-alphanumeric character with `_`. Letters and digits
/// outside ASCII are kept.
///
/// ```
/// assert_eq!(evo_steer::output::safe_file_component("chr1:100-200 (+)"), "chr1_100_200____");
/// ```
#[must_use]
pub fn safe_file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// File components for a run's sequence ids, in the same order.
///
/// Each id goes through [`safe_file_component`]; when the result was
/// already taken by an earlier id, `_<n>` is appended, `n` being the
/// 1-based record index. The mapping depends only on the id order, so
/// every pass of a sweep names a sequence the same way.
///
/// ```
/// use evo_steer::output::sequence_file_components;
/// assert_eq!(sequence_file_components(&["a.b", "a_b", "c"]), ["a_b", "a_b_2", "c"]);
/// ```
#[must_use]
pub fn sequence_file_components(ids: &[&str]) -> Vec<String> {
    let mut used = HashSet::new();
    ids.iter()
        .enumerate()
        .map(|(idx, id)| {
            let base = safe_file_component(id);
            let mut candidate = base.clone();
            while used.contains(&candidate) {
                candidate = format!("{candidate}_{}", idx + 1);
            }
            if candidate != base {
                tracing::warn!(seq_id = %id, file_id = %candidate, "file name collision renamed");
            }
            used.insert(candidate.clone());
            candidate
        })
        .collect()
}

/// Run basename: the sequence file name without its last extension.
#[must_use]
pub fn run_basename(sequence_file: &Path) -> String {
    sequence_file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "run".to_owned())
}

// ---------------------------------------------------------------------------
// ResultWriter
// ---------------------------------------------------------------------------

/// A pass that has been fully written.
#[derive(Debug, Clone, Serialize)]
pub struct CommittedScale {
    /// Scale label.
    pub label: String,
    /// Steering multiplier.
    pub scale: f64,
    /// Number of sequences written.
    pub sequences: usize,
    /// File names (relative to the output directory), summary last.
    pub files: Vec<String>,
}

/// Serializes [`ScaleResult`]s into an output directory.
#[derive(Debug)]
pub struct ResultWriter {
    /// Output directory.
    dir: PathBuf,
    /// Prefix of every file name.
    basename: String,
    /// Which tensors are persisted.
    output_type: OutputType,
    /// Append `_<label>` to per-pass file names.
    labeled: bool,
    /// Passes written so far.
    committed: Vec<CommittedScale>,
}

impl ResultWriter {
    /// Create a writer, creating `dir` if needed.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] if the directory cannot be created.
    pub fn new(
        dir: impl Into<PathBuf>,
        basename: impl Into<String>,
        output_type: OutputType,
        labeled: bool,
    ) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            basename: basename.into(),
            output_type,
            labeled,
            committed: Vec::new(),
        })
    }

    /// Output directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Passes written so far, in commit order.
    #[must_use]
    pub fn committed(&self) -> &[CommittedScale] {
        &self.committed
    }

    /// Write the processed-ids list, one id per line.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] on write failure.
    pub fn write_ids(&self, ids: &[&str]) -> Result<PathBuf> {
        let path = self.dir.join(format!("{}_processed_ids.txt", self.basename));
        let mut body = String::new();
        for id in ids {
            body.push_str(id);
            body.push('\n');
        }
        write_atomic(&path, body.as_bytes())?;
        tracing::debug!(path = %path.display(), count = ids.len(), "wrote processed ids");
        Ok(path)
    }

    /// Write every artifact of one pass.
    ///
    /// Artifacts are written to `.<base>.<label>.partial/` inside the
    /// output directory, then renamed into place; the summary table moves
    /// last and the staging directory is removed. On failure the staging
    /// directory and every artifact already moved out of it are removed,
    /// so a pass is either complete on disk or absent.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] on file system failures,
    /// [`SteerError::Model`] if a tensor cannot be serialized,
    /// [`SteerError::Shape`] if the result lacks a tensor the output type
    /// requires, and [`SteerError::Config`] if two artifacts would share a
    /// file name.
    pub fn commit(&mut self, result: &ScaleResult) -> Result<CommittedScale> {
        let staging = self
            .dir
            .join(format!(".{}.{}.partial", self.basename, result.label()));
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let mut moved = Vec::new();
        let files = match self.stage(&staging, result, &mut moved) {
            Ok(files) => files,
            Err(e) => {
                self.discard(&staging, &moved);
                return Err(e);
            }
        };

        tracing::info!(
            label = result.label(),
            files = files.len(),
            dir = %self.dir.display(),
            "committed scale"
        );
        let committed = CommittedScale {
            label: result.label().to_owned(),
            scale: result.scale(),
            sequences: result.sequences.len(),
            files,
        };
        self.committed.push(committed.clone());
        Ok(committed)
    }

    /// Write one pass into `staging` and move it into the output
    /// directory, recording each moved name in `moved`.
    fn stage(
        &self,
        staging: &Path,
        result: &ScaleResult,
        moved: &mut Vec<String>,
    ) -> Result<Vec<String>> {
        let ids: Vec<&str> = result
            .sequences
            .iter()
            .map(|seq| seq.summary.seq_id.as_str())
            .collect();
        let sids = sequence_file_components(&ids);

        let mut files = Vec::new();
        let mut seen = HashSet::new();
        let mut claim = |name: String| -> Result<String> {
            if !seen.insert(name.clone()) {
                return Err(SteerError::Config(format!(
                    "two artifacts of pass `{}` would both be named `{name}`",
                    result.label()
                )));
            }
            files.push(name.clone());
            Ok(name)
        };
        for (seq, sid) in result.sequences.iter().zip(&sids) {
            if self.output_type.needs_logits() {
                let logits = seq.logits.as_ref().ok_or_else(|| {
                    SteerError::Shape(format!("no logits kept for `{}`", seq.summary.seq_id))
                })?;
                let stem = format!("{sid}_logits");
                let name = claim(self.file_name(&stem, result.label(), "npy"))?;
                logits.write_npy(staging.join(name))?;
            }
            if self.output_type.needs_embeddings() {
                for (layer, embedding) in &seq.embeddings {
                    let stem = format!("{sid}_embeddings_{}", safe_file_component(layer));
                    let name = claim(self.file_name(&stem, result.label(), "npy"))?;
                    embedding.write_npy(staging.join(name))?;
                }
            }
        }

        let summary_name = claim(self.file_name("summary", result.label(), "tsv"))?;
        write_summary(&staging.join(summary_name), result)?;

        // Summary is last in `files`, so it lands last.
        for name in &files {
            fs::rename(staging.join(name), self.dir.join(name))?;
            moved.push(name.clone());
        }
        fs::remove_dir(staging)?;
        Ok(files)
    }

    /// Best-effort removal of a failed pass.
    fn discard(&self, staging: &Path, moved: &[String]) {
        for name in moved {
            if let Err(e) = fs::remove_file(self.dir.join(name)) {
                tracing::warn!(file = %name, error = %e, "could not remove partial artifact");
            }
        }
        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(staging) {
                tracing::warn!(
                    dir = %staging.display(),
                    error = %e,
                    "could not remove staging dir"
                );
            }
        }
    }

    /// Write `<base>_run.json` describing the whole sweep.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] on write failure or
    /// [`SteerError::Format`] if serialization fails.
    pub fn write_manifest(&self, config: &SweepConfig, report: &SweepReport) -> Result<PathBuf> {
        let manifest = RunManifest {
            output_type: config.output_type.to_string(),
            embedding_layers: &config.embedding_layers,
            steering_layer: config.steering.layer_name(),
            strict_steering: config.strict_steering,
            scales: &self.committed,
            skipped: report
                .skipped
                .iter()
                .map(|s| SkippedEntry {
                    label: &s.pass.label,
                    scale: s.pass.scale,
                    reason: &s.reason,
                })
                .collect(),
        };
        let json = serde_json::to_string_pretty(&manifest)
            .map_err(|e| SteerError::Format(format!("serialize run manifest: {e}")))?;
        let path = self.dir.join(format!("{}_run.json", self.basename));
        write_atomic(&path, json.as_bytes())?;
        tracing::debug!(path = %path.display(), "wrote run manifest");
        Ok(path)
    }

    /// `<base>_<stem>[_<label>].<ext>`
    fn file_name(&self, stem: &str, label: &str, ext: &str) -> String {
        if self.labeled {
            format!("{}_{stem}_{label}.{ext}", self.basename)
        } else {
            format!("{}_{stem}.{ext}", self.basename)
        }
    }
}

/// Contents of `<base>_run.json`.
#[derive(Serialize)]
struct RunManifest<'a> {
    /// Output type token.
    output_type: String,
    /// Captured layers.
    embedding_layers: &'a [String],
    /// Steering layer, if any.
    steering_layer: Option<&'a str>,
    /// Whether install failures were fatal.
    strict_steering: bool,
    /// Committed passes.
    scales: &'a [CommittedScale],
    /// Skipped passes.
    skipped: Vec<SkippedEntry<'a>>,
}

/// Manifest entry for a skipped pass.
#[derive(Serialize)]
struct SkippedEntry<'a> {
    /// Scale label.
    label: &'a str,
    /// Steering multiplier.
    scale: f64,
    /// Why it was skipped.
    reason: &'a str,
}

/// Write the summary table for one pass.
fn write_summary(path: &Path, result: &ScaleResult) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    writeln!(out, "{SUMMARY_HEADER}")?;
    for row in result.summaries() {
        writeln!(
            out,
            "{}\t{}\t{}\t{:.6}",
            row.seq_id, row.start, row.end, row.log_likelihood
        )?;
    }
    out.flush()?;
    Ok(())
}

/// Write through a sibling temp file and rename over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use candle_core::{DType, Device, Tensor};

    use super::*;
    use crate::sweep::{ScalePass, SequenceOutput, SequenceSummary};

    fn sequence(seq_id: &str, with_tensors: bool, fill: f64) -> SequenceOutput {
        let tensor = |d: usize| {
            Tensor::zeros((3, d), DType::F32, &Device::Cpu)
                .unwrap()
                .affine(1.0, fill)
                .unwrap()
        };
        SequenceOutput {
            summary: SequenceSummary {
                seq_id: seq_id.into(),
                start: 2,
                end: 4,
                log_likelihood: -1.234_567_89,
            },
            logits: with_tensors.then(|| tensor(16)),
            embeddings: if with_tensors {
                vec![("blocks.1".into(), tensor(8))]
            } else {
                Vec::new()
            },
        }
    }

    fn result(pass: ScalePass, with_tensors: bool) -> ScaleResult {
        ScaleResult {
            pass,
            sequences: vec![sequence("chr1:5-7", with_tensors, 0.0)],
        }
    }

    fn listing(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn safe_components_and_basename() {
        assert_eq!(safe_file_component("blocks.28.mlp.l3"), "blocks_28_mlp_l3");
        assert_eq!(safe_file_component("ok123"), "ok123");
        assert_eq!(run_basename(Path::new("/data/genes.fasta")), "genes");
        assert_eq!(run_basename(Path::new("a.b.fa")), "a.b");
        assert_eq!(safe_file_component("größe-1"), "größe_1");
    }

    #[test]
    fn colliding_ids_get_index_suffix() {
        assert_eq!(sequence_file_components(&["x", "y"]), ["x", "y"]);
        assert_eq!(
            sequence_file_components(&["a.b", "a_b", "a b", "a_b_2"]),
            ["a_b", "a_b_2", "a_b_3", "a_b_2_4"]
        );
    }

    #[test]
    fn ids_that_sanitize_alike_both_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(dir.path(), "in", OutputType::Logits, false).unwrap();
        let pass = ScaleResult {
            pass: ScalePass::unsteered(),
            sequences: vec![sequence("a.b", true, 1.0), sequence("a_b", true, 2.0)],
        };
        let committed = writer.commit(&pass).unwrap();
        assert_eq!(
            committed.files,
            vec!["in_a_b_logits.npy", "in_a_b_2_logits.npy", "in_summary.tsv"]
        );
        assert_eq!(
            listing(dir.path()),
            ["in_a_b_2_logits.npy", "in_a_b_logits.npy", "in_summary.tsv"]
        );

        let first: Vec<f32> = Tensor::read_npy(dir.path().join("in_a_b_logits.npy"))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let second: Vec<f32> = Tensor::read_npy(dir.path().join("in_a_b_2_logits.npy"))
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(first.iter().all(|&v| v == 1.0));
        assert!(second.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn unlabeled_summary_only_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ResultWriter::new(dir.path(), "run", OutputType::SummaryOnly, false).unwrap();
        let committed = writer.commit(&result(ScalePass::unsteered(), false)).unwrap();
        assert_eq!(committed.files, vec!["run_summary.tsv"]);

        let text = fs::read_to_string(dir.path().join("run_summary.tsv")).unwrap();
        assert_eq!(text, format!("{SUMMARY_HEADER}\nchr1:5-7\t2\t4\t-1.234568\n"));
        assert!(!dir.path().join(".run.unsteered.partial").exists());
    }

    #[test]
    fn labeled_commit_writes_tensors_then_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ResultWriter::new(dir.path(), "run", OutputType::LogitsAndEmbeddings, true).unwrap();
        let committed = writer.commit(&result(ScalePass::scaled(-1.0), true)).unwrap();
        assert_eq!(
            committed.files,
            vec![
                "run_chr1_5_7_logits_scale_-1.0.npy",
                "run_chr1_5_7_embeddings_blocks_1_scale_-1.0.npy",
                "run_summary_scale_-1.0.tsv",
            ]
        );
        let logits =
            Tensor::read_npy(dir.path().join("run_chr1_5_7_logits_scale_-1.0.npy")).unwrap();
        assert_eq!(logits.dims(), &[3, 16]);
    }

    #[test]
    fn missing_tensor_is_shape_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(dir.path(), "run", OutputType::Logits, false).unwrap();
        let err = writer.commit(&result(ScalePass::unsteered(), false)).unwrap_err();
        assert!(matches!(err, SteerError::Shape(_)));
        assert!(listing(dir.path()).is_empty());
        assert!(writer.committed().is_empty());
    }

    #[test]
    fn failed_commit_leaves_nothing_of_the_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ResultWriter::new(dir.path(), "run", OutputType::Logits, true).unwrap();
        let pass = ScaleResult {
            pass: ScalePass::scaled(2.0),
            sequences: vec![sequence("s1", true, 0.0), sequence("s2", false, 0.0)],
        };
        assert!(writer.commit(&pass).is_err());
        assert!(listing(dir.path()).is_empty());
    }

    #[test]
    fn ids_and_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            ResultWriter::new(dir.path(), "run", OutputType::SummaryOnly, false).unwrap();
        let ids = writer.write_ids(&["s1", "s2"]).unwrap();
        assert_eq!(fs::read_to_string(ids).unwrap(), "s1\ns2\n");

        writer.commit(&result(ScalePass::unsteered(), false)).unwrap();
        let config = SweepConfig::new(
            OutputType::SummaryOnly,
            &[] as &[&str],
            crate::config::SteeringConfig::disabled(),
        )
        .unwrap();
        let path = writer.write_manifest(&config, &SweepReport::default()).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json["output_type"], "summary_only");
        assert_eq!(json["scales"][0]["label"], "unsteered");
        assert_eq!(json["scales"][0]["files"][0], "run_summary.tsv");
    }
}
