//! qgate core library
//!
//! Domain types and shared infrastructure for the quality-gate engine:
//! - check definitions and execution records
//! - file sets and fingerprints
//! - the content-addressed result cache (in memory and on disk)
//! - retry policy, cancellation, tracing setup

pub mod cache;
pub mod cancel;
pub mod check;
pub mod error;
pub mod execution;
pub mod fileset;
pub mod obs;
pub mod output;
pub mod retry;
pub mod telemetry;

pub use cache::{CacheConfig, CacheEntry, CacheError, CacheKey, CacheStats, LoadReport, ResultCache};
pub use cancel::{CancelSource, CancelToken};
pub use check::{BuiltinCheck, CheckDefinition, CheckKind, Classifier};
pub use error::{QgateError, Result};
pub use execution::{CheckExecution, Classification, TerminationCause};
pub use fileset::{FileFingerprint, FileSet, FingerprintMode};
pub use obs::WorkflowSpan;
pub use output::TailBuffer;
pub use retry::{retry_async, RetryPolicy};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

/// qgate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
