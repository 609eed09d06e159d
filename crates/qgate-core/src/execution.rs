//! Check execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Outcome classification of one check execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Passed,
    Failed,
    /// The tool could not be launched or judged.
    Error,
    TimedOut,
    CacheHit,
    /// Cut short or never started because the workflow was cancelled.
    Aborted,
}

impl Classification {
    /// Only deterministic outcomes may be cached.
    pub fn is_deterministic(&self) -> bool {
        matches!(self, Classification::Passed | Classification::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Passed => "passed",
            Classification::Failed => "failed",
            Classification::Error => "error",
            Classification::TimedOut => "timed_out",
            Classification::CacheHit => "cache_hit",
            Classification::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a process was force-terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    HardTimeout,
    Stalled,
    Cancelled,
}

/// One concrete run of a check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckExecution {
    pub check_name: String,
    pub stage: String,
    pub files: Vec<PathBuf>,

    /// Rendered command line.
    pub command: Vec<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// Exit code, absent when the process never exited on its own.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,

    pub classification: Classification,

    /// Set when the process was killed.
    pub termination: Option<TerminationCause>,

    /// For cache hits, the outcome that was cached.
    pub cached_outcome: Option<Classification>,

    /// Number of process launches (0 for cache hits and aborted dispatches).
    pub attempts: u32,

    /// Error context for `error` outcomes.
    pub error: Option<String>,
}

impl CheckExecution {
    /// The effective outcome, looking through cache hits.
    pub fn outcome(&self) -> Classification {
        match (self.classification, self.cached_outcome) {
            (Classification::CacheHit, Some(outcome)) => outcome,
            (c, _) => c,
        }
    }

    /// Whether this execution counts as a pass for gating.
    pub fn passed(&self) -> bool {
        self.outcome() == Classification::Passed
    }

    /// Whether the result may be stored in the cache.
    pub fn is_deterministic(&self) -> bool {
        self.classification.is_deterministic()
    }

    pub fn is_cache_hit(&self) -> bool {
        self.classification == Classification::CacheHit
    }

    pub fn stalled(&self) -> bool {
        self.termination == Some(TerminationCause::Stalled)
    }

    /// Execution record for a check that was never launched.
    pub fn not_started(
        check_name: &str,
        stage: &str,
        files: Vec<PathBuf>,
        command: Vec<String>,
        classification: Classification,
        error: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            check_name: check_name.to_string(),
            stage: stage.to_string(),
            files,
            command,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            classification,
            termination: if classification == Classification::Aborted {
                Some(TerminationCause::Cancelled)
            } else {
                None
            },
            cached_outcome: None,
            attempts: 0,
            error,
        }
    }

    /// One-line summary for logs and console output.
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} {} ({}ms",
            self.check_name, self.classification, self.duration_ms
        );
        if let Some(code) = self.exit_code {
            line.push_str(&format!(", exit code {code}"));
        }
        if let Some(cause) = self.termination {
            line.push_str(&format!(", {cause:?}"));
        }
        if let Some(outcome) = self.cached_outcome {
            line.push_str(&format!(", cached {outcome}"));
        }
        line.push(')');
        line
    }
}
