//! Error taxonomy for qgate core.

use std::path::PathBuf;

/// Errors produced while building check definitions and file sets.
#[derive(Debug, thiserror::Error)]
pub enum QgateError {
    #[error("invalid check definition: {0}")]
    InvalidCheck(String),

    #[error("invalid output pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("workspace root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("file walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for qgate core operations.
pub type Result<T> = std::result::Result<T, QgateError>;
