// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sequence tokenizers: byte-level by default, or a `HuggingFace` JSON
//! tokenizer.
//!
//! Nucleotide models in this family tokenize one character per token, with
//! the token id equal to the ASCII byte. [`SeqTokenizer::Bytes`] does
//! exactly that; [`SeqTokenizer::HuggingFace`] covers models that ship a
//! `tokenizer.json`.

use std::path::Path;

use crate::error::{Result, SteerError};

/// Tokenizer for residue strings.
///
/// # Example
///
/// ```
/// use evo_steer::SeqTokenizer;
///
/// # fn main() -> evo_steer::Result<()> {
/// let tok = SeqTokenizer::bytes(512);
/// assert_eq!(tok.encode("ACGT")?, vec![65, 67, 71, 84]);
/// # Ok(())
/// # }
/// ```
#[non_exhaustive]
pub enum SeqTokenizer {
    /// One token per byte; ids must stay below `vocab_size`.
    Bytes {
        /// Model vocabulary size.
        vocab_size: usize,
    },
    /// `HuggingFace` `tokenizers` backend.
    HuggingFace(Box<tokenizers::Tokenizer>),
}

impl SeqTokenizer {
    /// Byte-level tokenizer for a model with `vocab_size` tokens.
    #[must_use]
    pub const fn bytes(vocab_size: usize) -> Self {
        Self::Bytes { vocab_size }
    }

    /// Load a `HuggingFace` tokenizer from a `tokenizer.json` file.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if the file cannot be loaded or parsed.
    pub fn from_hf_path(path: impl AsRef<Path>) -> Result<Self> {
        let tok = tokenizers::Tokenizer::from_file(path.as_ref()).map_err(|e| {
            SteerError::Tokenizer(format!(
                "failed to load HF tokenizer from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Ok(Self::HuggingFace(Box::new(tok)))
    }

    /// Encode residues into token ids. No special tokens are added, so
    /// position `t` of the output corresponds to residue `t + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`SteerError::Tokenizer`] if a byte falls outside the
    /// vocabulary or the `HuggingFace` encoder fails.
    pub fn encode(&self, residues: &str) -> Result<Vec<u32>> {
        match self {
            Self::Bytes { vocab_size } => residues
                .bytes()
                .enumerate()
                .map(|(pos, b)| {
                    if usize::from(b) < *vocab_size {
                        Ok(u32::from(b))
                    } else {
                        Err(SteerError::Tokenizer(format!(
                            "byte {b:#04x} at position {} is outside vocabulary of size {vocab_size}",
                            pos + 1
                        )))
                    }
                })
                .collect(),
            Self::HuggingFace(tok) => {
                let encoding = tok
                    .encode(residues, false)
                    .map_err(|e| SteerError::Tokenizer(format!("HF encode failed: {e}")))?;
                Ok(encoding.get_ids().to_vec())
            }
        }
    }

    /// Vocabulary size.
    #[must_use]
    pub fn vocab_size(&self) -> usize {
        match self {
            Self::Bytes { vocab_size } => *vocab_size,
            Self::HuggingFace(tok) => tok.get_vocab_size(true),
        }
    }
}

impl std::fmt::Debug for SeqTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes { vocab_size } => f
                .debug_struct("Bytes")
                .field("vocab_size", vocab_size)
                .finish(),
            Self::HuggingFace(_) => f.debug_tuple("HuggingFace").field(&"...").finish(),
        }
    }
}
