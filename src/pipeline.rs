// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end run: load inputs, validate them eagerly, sweep, write.

use std::path::Path;

use crate::config::SweepConfig;
use crate::error::Result;
use crate::oracle::InferenceOracle;
use crate::output::ResultWriter;
use crate::sequences::{QueryTable, SequenceStore};
use crate::sweep::{SweepEngine, SweepReport};

/// Sequences and optional query ranges for one run, already
/// cross-validated.
#[derive(Debug)]
pub struct RunInputs {
    /// Sequences in load order.
    pub store: SequenceStore,
    /// Per-sequence query ranges; `None` means full length everywhere.
    pub queries: Option<QueryTable>,
}

impl RunInputs {
    /// Load the sequence file and optional query table, and check that
    /// every query row names a loaded sequence.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Format`](crate::SteerError::Format) or
    /// [`SteerError::FormatAt`](crate::SteerError::FormatAt) for malformed
    /// files, [`SteerError::Reference`](crate::SteerError::Reference) for
    /// unknown ids, and [`SteerError::Io`](crate::SteerError::Io) if a file
    /// cannot be read.
    pub fn load(sequence_file: &Path, query_table: Option<&Path>) -> Result<Self> {
        let store = SequenceStore::load(sequence_file)?;
        let queries = query_table.map(QueryTable::load).transpose()?;
        Self::new(store, queries)
    }

    /// Combine already-loaded inputs, validating query references.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Reference`](crate::SteerError::Reference) if
    /// the table names a sequence not in `store`.
    pub fn new(store: SequenceStore, queries: Option<QueryTable>) -> Result<Self> {
        if let Some(table) = &queries {
            table.validate_references(&store)?;
        }
        Ok(Self { store, queries })
    }
}

/// Run the full sweep and write its artifacts under `output_dir`.
///
/// An empty sequence set is a successful no-op: nothing is written and an
/// empty report is returned. Otherwise the processed-ids list is written
/// first, each pass is committed as soon as it completes, and the run
/// manifest is written last.
///
/// # Errors
///
/// Propagates every fatal error of [`SweepEngine::run`] and of the
/// [`ResultWriter`]. Passes committed before the error stay on disk.
pub fn run_sweep<O: InferenceOracle + ?Sized>(
    oracle: &mut O,
    inputs: &RunInputs,
    config: &SweepConfig,
    output_dir: &Path,
    basename: &str,
) -> Result<SweepReport> {
    if inputs.store.is_empty() {
        tracing::info!("no sequences found");
        return Ok(SweepReport::default());
    }

    let mut engine = SweepEngine::new(oracle, config);
    engine.validate()?;
    let mut writer = ResultWriter::new(
        output_dir,
        basename,
        config.output_type,
        engine.plan().is_labeled(),
    )?;
    writer.write_ids(&inputs.store.ids())?;

    let report = engine.run(&inputs.store, inputs.queries.as_ref(), |result| {
        writer.commit(result).map(|_| ())
    })?;

    let manifest = writer.write_manifest(config, &report)?;
    tracing::info!(
        scales = report.results.len(),
        skipped = report.skipped.len(),
        manifest = %manifest.display(),
        "run complete"
    );
    Ok(report)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::SteerError;

    #[test]
    fn unknown_query_id_fails_before_inference() {
        let store = SequenceStore::from_reader(">s1\nACGT\n".as_bytes()).unwrap();
        let table = QueryTable::from_reader("seq_id\tstart\tend\ns2\t1\t2\n".as_bytes()).unwrap();
        let err = RunInputs::new(store, Some(table)).unwrap_err();
        assert!(matches!(err, SteerError::Reference(m) if m.contains("s2")));
    }

    #[test]
    fn load_reads_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let fasta = dir.path().join("in.fa");
        let table = dir.path().join("q.tsv");
        std::fs::write(&fasta, ">a\nAC\nGT\n>b\nTT\n").unwrap();
        std::fs::write(&table, "seq_id\tstart\tend\na\t2\t3\n").unwrap();
        let inputs = RunInputs::load(&fasta, Some(&table)).unwrap();
        assert_eq!(inputs.store.ids(), vec!["a", "b"]);
        assert_eq!(inputs.queries.map(|q| q.len()), Some(1));
    }
}
