//! qgate CI - staged quality gates
//!
//! Runs static-analysis checks and tests against a source tree:
//! - launches each check as a process with timeout and stall detection
//! - dispatches a stage's checks concurrently, reusing cached results
//! - gates stages in order and loops failed fail-fast stages through autofix
//! - streams progress as [`PipelineEvent`]s

pub mod autofix;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod monitor;
pub mod pipeline;
pub mod runner;
pub mod stage;

// Re-export key types
pub use autofix::{AutofixCoordinator, AutofixError, CommandAutofix, FixOutcome, NoopAutofix};
pub use config::OrchestratorConfig;
pub use error::PipelineError;
pub use events::{EventBus, PipelineEvent};
pub use executor::ConcurrentExecutor;
pub use monitor::{
    HealthSample, MonitorConfig, MonitorHandle, MonitorState, ProcSampler, ProcessMonitor,
    ProcessSampler, RawSample, SampleError,
};
pub use pipeline::{
    AutofixRecord, PipelineConfig, StagePipeline, StageResult, WorkflowRun, WorkflowStatus,
};
pub use runner::{CheckRunner, RunnerConfig};
pub use stage::{default_workflow, select_stages, validate_workflow, GatingPolicy, StageDefinition};
