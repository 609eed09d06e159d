//! Pipeline error types.

use thiserror::Error;

/// Workflow definitions that cannot be run.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("workflow has no stages")]
    NoStages,

    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    #[error("duplicate check name: {0}")]
    DuplicateCheck(String),

    #[error("invalid check {check}: {reason}")]
    InvalidCheck { check: String, reason: String },

    #[error("unknown stage: {0}")]
    UnknownStage(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
