// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequence records and query ranges.
//!
//! [`SequenceStore`] holds the named sequences of one run in load order.
//! [`QueryTable`] restricts which positions of each sequence are persisted.
//! Both are loaded eagerly and cross-checked with
//! [`QueryTable::validate_references`] before any inference starts.
//!
//! FASTA is read line by line rather than through `bio::io::fasta`, which
//! splits the header into id and description and rejects content before
//! the first header; here the whole header is the id and leading content
//! is skipped.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use crate::error::{Result, SteerError};

/// Exact header line required at the top of a query table.
pub const QUERY_TABLE_HEADER: &str = "seq_id\tstart\tend";

// ---------------------------------------------------------------------------
// Sequence / SequenceStore
// ---------------------------------------------------------------------------

/// A named sequence of residues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence {
    /// Identifier: the full header text after `>`.
    pub id: String,
    /// Residues with case preserved.
    pub residues: String,
}

impl Sequence {
    /// Number of residues.
    #[must_use]
    pub fn len(&self) -> usize {
        self.residues.len()
    }

    /// Whether the sequence has no residues.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.residues.is_empty()
    }
}

/// Ordered mapping from sequence id to residues.
///
/// Iteration follows the order in which ids first appeared in the source.
///
/// # Example
///
/// ```
/// use evo_steer::SequenceStore;
///
/// let store = SequenceStore::from_reader(">s1\nACGT\nacgt\n>s2\nTT\n".as_bytes()).unwrap();
/// assert_eq!(store.len(), 2);
/// assert_eq!(store.get("s1").unwrap().residues, "ACGTacgt");
/// ```
#[derive(Debug, Clone, Default)]
pub struct SequenceStore {
    /// Records in first-appearance order.
    records: Vec<Sequence>,
    /// Position of each id in `records`.
    index: HashMap<String, usize>,
}

impl SequenceStore {
    /// Load sequences from a FASTA file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] if the file cannot be read and
    /// [`SteerError::FormatAt`] as for [`from_reader`](Self::from_reader).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let store = Self::from_reader(std::io::BufReader::new(file))?;
        tracing::info!(
            "read {} sequences from {}",
            store.len(),
            path.as_ref().display()
        );
        Ok(store)
    }

    /// Parse `>`-delimited records.
    ///
    /// Lines are trimmed; content lines are concatenated verbatim. Content
    /// before the first header is ignored. A repeated id keeps its first
    /// position but takes the residues of the last record (last write wins).
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::FormatAt`] for a header with an empty id.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut store = Self::default();
        let mut current: Option<usize> = None;
        let mut orphan_lines = 0_usize;

        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if let Some(header) = line.strip_prefix('>') {
                let id = header.trim();
                if id.is_empty() {
                    return Err(SteerError::FormatAt {
                        line: idx + 1,
                        message: "sequence header has an empty id".into(),
                    });
                }
                current = Some(store.start_record(id));
            } else if let Some(pos) = current {
                if let Some(record) = store.records.get_mut(pos) {
                    record.residues.push_str(line);
                }
            } else if !line.is_empty() {
                orphan_lines += 1;
            }
        }

        if orphan_lines > 0 {
            tracing::warn!("ignored {orphan_lines} content lines before the first header");
        }
        Ok(store)
    }

    /// Begin (or restart) the record for `id`, returning its position.
    fn start_record(&mut self, id: &str) -> usize {
        if let Some(&pos) = self.index.get(id) {
            tracing::warn!("duplicate sequence id `{id}`: later record replaces earlier one");
            if let Some(record) = self.records.get_mut(pos) {
                record.residues.clear();
            }
            return pos;
        }
        let pos = self.records.len();
        self.records.push(Sequence {
            id: id.to_owned(),
            residues: String::new(),
        });
        self.index.insert(id.to_owned(), pos);
        pos
    }

    /// Look up a sequence by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Sequence> {
        self.index.get(id).and_then(|&pos| self.records.get(pos))
    }

    /// Whether `id` was loaded.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Iterate over sequences in load order.
    pub fn iter(&self) -> impl Iterator<Item = &Sequence> {
        self.records.iter()
    }

    /// Sequence ids in load order.
    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.id.as_str()).collect()
    }

    /// Number of sequences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no sequences were loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

// ---------------------------------------------------------------------------
// QueryRange
// ---------------------------------------------------------------------------

/// 1-indexed inclusive sub-interval of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryRange {
    /// First position (1-based, inclusive).
    pub start: usize,
    /// Last position (1-based, inclusive).
    pub end: usize,
}

impl QueryRange {
    /// Create a range without checking it.
    #[must_use]
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// The whole of a sequence of length `len`.
    #[must_use]
    pub const fn full(len: usize) -> Self {
        Self { start: 1, end: len }
    }

    /// Number of positions covered.
    #[must_use]
    pub const fn len(&self) -> usize {
        (self.end + 1).saturating_sub(self.start)
    }

    /// Whether the range covers no positions.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check `1 <= start <= end <= len`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Range`] if the range does not fit.
    pub fn validate(&self, seq_id: &str, len: usize) -> Result<()> {
        if self.start < 1 || self.start > self.end || self.end > len {
            return Err(SteerError::Range {
                seq_id: seq_id.to_owned(),
                start: self.start,
                end: self.end,
                len,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// QueryTable
// ---------------------------------------------------------------------------

/// Per-sequence query ranges loaded from a TSV table.
///
/// # Example
///
/// ```
/// use evo_steer::{QueryRange, QueryTable};
///
/// let table = QueryTable::from_reader("seq_id\tstart\tend\ns1\t2\t5\n".as_bytes()).unwrap();
/// assert_eq!(table.get("s1"), Some(QueryRange::new(2, 5)));
/// ```
#[derive(Debug, Clone, Default)]
pub struct QueryTable {
    /// Entries in table order.
    entries: Vec<(String, QueryRange)>,
    /// Position of each id in `entries`.
    index: HashMap<String, usize>,
}

impl QueryTable {
    /// Load a query table from a TSV file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Io`] if the file cannot be read and
    /// [`SteerError::FormatAt`] as for [`from_reader`](Self::from_reader).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let table = Self::from_reader(std::io::BufReader::new(file))?;
        tracing::info!(
            "read {} query ranges from {}",
            table.len(),
            path.as_ref().display()
        );
        Ok(table)
    }

    /// Parse a table with header [`QUERY_TABLE_HEADER`] and one
    /// `seq_id<TAB>start<TAB>end` row per non-blank line.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::FormatAt`] for a missing or wrong header, a row
    /// without exactly three fields, non-integer coordinates, coordinates
    /// violating `1 <= start <= end`, or a repeated id.
    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut lines = reader.lines();
        let header = lines.next().transpose()?.unwrap_or_default();
        if header.trim_end_matches(['\r', '\n']) != QUERY_TABLE_HEADER {
            return Err(SteerError::FormatAt {
                line: 1,
                message: format!(
                    "query table header must be `{}`, found `{}`",
                    QUERY_TABLE_HEADER.escape_default(),
                    header.escape_default()
                ),
            });
        }

        let mut table = Self::default();
        for (idx, line) in lines.enumerate() {
            let line = line?;
            let line_no = idx + 2;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.trim().is_empty() {
                continue;
            }
            let (id, range) = parse_query_row(line, line_no)?;
            if table.index.contains_key(&id) {
                return Err(SteerError::FormatAt {
                    line: line_no,
                    message: format!("duplicate query range for `{id}`"),
                });
            }
            table.index.insert(id.clone(), table.entries.len());
            table.entries.push((id, range));
        }
        Ok(table)
    }

    /// Range for `seq_id`, if the table has one.
    #[must_use]
    pub fn get(&self, seq_id: &str) -> Option<QueryRange> {
        self.index
            .get(seq_id)
            .and_then(|&pos| self.entries.get(pos))
            .map(|(_, range)| *range)
    }

    /// Range for `seq`, defaulting to the whole sequence.
    #[must_use]
    pub fn range_for(&self, seq: &Sequence) -> QueryRange {
        self.get(&seq.id).unwrap_or_else(|| QueryRange::full(seq.len()))
    }

    /// Check that every id in the table names a loaded sequence.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Reference`] listing every unknown id.
    pub fn validate_references(&self, store: &SequenceStore) -> Result<()> {
        let missing: Vec<&str> = self
            .entries
            .iter()
            .map(|(id, _)| id.as_str())
            .filter(|id| !store.contains(id))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(SteerError::Reference(format!(
            "query table names {} unknown sequence(s): {}",
            missing.len(),
            missing.join(", ")
        )))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Parse one `seq_id<TAB>start<TAB>end` row.
fn parse_query_row(line: &str, line_no: usize) -> Result<(String, QueryRange)> {
    let fields: Vec<&str> = line.split('\t').collect();
    let [id, start, end] = fields.as_slice() else {
        return Err(SteerError::FormatAt {
            line: line_no,
            message: format!("expected 3 tab-separated fields, found {}", fields.len()),
        });
    };
    let parse_coord = |name: &str, raw: &str| -> Result<usize> {
        raw.trim().parse::<usize>().map_err(|_| SteerError::FormatAt {
            line: line_no,
            message: format!("{name} `{raw}` is not a positive integer"),
        })
    };
    let start = parse_coord("start", *start)?;
    let end = parse_coord("end", *end)?;
    if start < 1 || start > end {
        return Err(SteerError::FormatAt {
            line: line_no,
            message: format!("coordinates must satisfy 1 <= start <= end, got {start}..{end}"),
        });
    }
    Ok(((*id).to_owned(), QueryRange::new(start, end)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    fn line_of(err: &SteerError) -> usize {
        match err {
            SteerError::FormatAt { line, .. } => *line,
            other => panic!("expected FormatAt, got {other}"),
        }
    }

    #[test]
    fn fasta_multiline_records_in_order() {
        let src = "\
>seq B
ACGT
  tgca

>seq A
NNNN
";
        let store = SequenceStore::from_reader(src.as_bytes()).unwrap();
        assert_eq!(store.ids(), ["seq B", "seq A"]);
        assert_eq!(store.get("seq B").unwrap().residues, "ACGTtgca");
        assert_eq!(store.get("seq A").unwrap().len(), 4);
    }

    #[test]
    fn fasta_empty_source() {
        let store = SequenceStore::from_reader("".as_bytes()).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn fasta_duplicate_id_last_write_wins_first_position() {
        let src = ">a\nAAAA\n>b\nCC\n>a\nGG\n";
        let store = SequenceStore::from_reader(src.as_bytes()).unwrap();
        assert_eq!(store.ids(), ["a", "b"]);
        assert_eq!(store.get("a").unwrap().residues, "GG");
    }

    #[test]
    fn fasta_orphan_lines_ignored() {
        let store = SequenceStore::from_reader("ACGT\n>x\nT\n".as_bytes()).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("x").unwrap().residues, "T");
    }

    #[test]
    fn fasta_empty_header_is_rejected() {
        let err = SequenceStore::from_reader(">a\nA\n>  \nC\n".as_bytes()).unwrap_err();
        assert_eq!(line_of(&err), 3);
    }

    #[test]
    fn query_table_parses_rows() {
        let src = "seq_id\tstart\tend\ns1\t1\t4\n\ns2\t3\t3\n";
        let table = QueryTable::from_reader(src.as_bytes()).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get("s2"), Some(QueryRange::new(3, 3)));
        assert_eq!(table.get("s3"), None);
    }

    #[test]
    fn query_table_header_must_match_exactly() {
        for src in [
            "",
            "seq_id start end\ns1\t1\t2\n",
            "id\tstart\tend\n",
            "seq_id\tstart\tend\tx\n",
        ] {
            let err = QueryTable::from_reader(src.as_bytes()).unwrap_err();
            assert_eq!(line_of(&err), 1, "{src:?}");
        }
        assert!(QueryTable::from_reader("seq_id\tstart\tend\r\n".as_bytes()).is_ok());
    }

    #[test]
    fn query_table_row_errors_carry_line_numbers() {
        let cases = [
            ("seq_id\tstart\tend\ns1\t5\t3\n", 2),
            ("seq_id\tstart\tend\ns1\t1\t3\ns2\t0\t3\n", 3),
            ("seq_id\tstart\tend\ns1\t1\n", 2),
            ("seq_id\tstart\tend\n\ns1\t1\t2\t9\n", 3),
            ("seq_id\tstart\tend\ns1\tone\t2\n", 2),
            ("seq_id\tstart\tend\ns1\t-1\t2\n", 2),
            ("seq_id\tstart\tend\ns1\t1\t2\ns1\t1\t3\n", 3),
        ];
        for (src, expected) in cases {
            let err = QueryTable::from_reader(src.as_bytes()).unwrap_err();
            assert_eq!(line_of(&err), expected, "{src:?}");
        }
    }

    #[test]
    fn unknown_ids_are_reference_errors() {
        let store = SequenceStore::from_reader(">s1\nACGT\n".as_bytes()).unwrap();
        let table =
            QueryTable::from_reader("seq_id\tstart\tend\ns1\t1\t2\nghost\t1\t1\n".as_bytes())
                .unwrap();
        let err = table.validate_references(&store).unwrap_err();
        assert!(matches!(err, SteerError::Reference(ref msg) if msg.contains("ghost")));
    }

    #[test]
    fn range_defaults_and_validation() {
        let seq = Sequence {
            id: "s".into(),
            residues: "ACGTACGT".into(),
        };
        let table = QueryTable::default();
        let range = table.range_for(&seq);
        assert_eq!(range, QueryRange::new(1, 8));
        assert_eq!(range.len(), 8);
        assert!(range.validate("s", 8).is_ok());
        assert!(QueryRange::new(2, 9).validate("s", 8).is_err());
        assert!(QueryRange::new(0, 2).validate("s", 8).is_err());
        assert!(QueryRange::new(3, 2).validate("s", 8).is_err());
        assert!(QueryRange::full(0).validate("s", 0).is_err());
    }
}
