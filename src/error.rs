//! Error types for the chiptrack pipeline, per spec.md §7.
//!
//! Four kinds of failure are distinguished: input-parse errors, configuration
//! errors, and consistency violations in the blob<->barcode<->trajectory
//! back-reference graph all halt processing. Ambiguity warnings never become
//! errors; they are collected and reported by the caller (see
//! `pipeline::Warning`).

use thiserror::Error;

/// Errors that can halt the pipeline.
#[derive(Debug, Error)]
pub enum TrajognizeError {
    #[error("parse error in {file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(
        "consistency violation at frame {frame}: {side} side of back-reference mismatch for {what}"
    )]
    Consistency {
        frame: u64,
        what: String,
        side: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TrajognizeError>;
