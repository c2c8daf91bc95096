// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types for evo-steer.
//!
//! Every failure in the sweep is a deterministic function of its inputs, so
//! nothing here is retried. [`SteerError::is_recoverable`] marks the one
//! condition the sweep survives: a perturbation that could not be installed.

/// Errors that can occur while preparing or running a steering sweep.
#[derive(Debug, thiserror::Error)]
pub enum SteerError {
    /// Invalid combination of command-line options.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed input file, no line information.
    #[error("format error: {0}")]
    Format(String),

    /// Malformed input file at a 1-based line number.
    #[error("format error at line {line}: {message}")]
    FormatAt {
        /// 1-based line number of the offending line.
        line: usize,
        /// What was wrong with it.
        message: String,
    },

    /// The query table names sequences missing from the sequence set.
    #[error("reference error: {0}")]
    Reference(String),

    /// A query range does not fit the sequence it applies to.
    #[error("range error: [{start}, {end}] is out of bounds for `{seq_id}` (length {len})")]
    Range {
        /// Sequence the range was applied to.
        seq_id: String,
        /// 1-based inclusive start.
        start: usize,
        /// 1-based inclusive end.
        end: usize,
        /// Actual length the range was checked against.
        len: usize,
    },

    /// A tensor had an unexpected rank or dimension.
    #[error("shape error: {0}")]
    Shape(String),

    /// Perturbation install/remove or capture lookup failure.
    #[error("hook error: {0}")]
    Hook(String),

    /// Tokenizer error.
    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    /// Model loading or forward pass error (wraps candle).
    #[error("model error: {0}")]
    Model(#[from] candle_core::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SteerError {
    /// Whether the sweep may continue past this error by skipping a scale.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Hook(_))
    }
}

/// Result type alias for evo-steer operations.
pub type Result<T> = std::result::Result<T, SteerError>;
