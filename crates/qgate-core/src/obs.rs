//! Structured observability hooks for workflow lifecycle events.
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`); the CLI's
//! `--json` flag switches the subscriber to JSON lines.

use tracing::info;

use crate::execution::CheckExecution;

/// Span tagged with the run id. Attach to async work with
/// `tracing::Instrument::instrument`.
pub fn workflow_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("qgate.workflow", run_id = %run_id)
}

/// Span for one stage run, nested under the workflow span.
pub fn stage_span(stage: &str, iteration: u32) -> tracing::Span {
    tracing::info_span!("qgate.stage", stage = %stage, iteration = iteration)
}

/// RAII guard that enters a workflow-scoped tracing span on the current
/// thread. Not for use across `.await` points.
///
/// ```ignore
/// let _span = WorkflowSpan::enter("5f0c…");
/// // every log line below carries run_id = "5f0c…"
/// ```
pub struct WorkflowSpan {
    _span: tracing::span::EnteredSpan,
}

impl WorkflowSpan {
    /// Create and enter a span tagged with the run id.
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: workflow_span(run_id).entered(),
        }
    }
}

/// Emit event: workflow started.
pub fn emit_workflow_started(run_id: &str, stages: usize, max_iterations: u32) {
    info!(
        event = "workflow.started",
        run_id = %run_id,
        stages = stages,
        max_iterations = max_iterations,
    );
}

/// Emit event: stage dispatched.
pub fn emit_stage_started(stage: &str, iteration: u32, checks: usize) {
    info!(event = "stage.started", stage = %stage, iteration = iteration, checks = checks);
}

/// Emit event: one check finished.
pub fn emit_check_completed(exec: &CheckExecution) {
    info!(
        event = "check.completed",
        stage = %exec.stage,
        check = %exec.check_name,
        classification = %exec.classification,
        exit_code = ?exec.exit_code,
        termination = ?exec.termination,
        duration_ms = exec.duration_ms,
    );
}

/// Emit event: stage gating decision.
pub fn emit_stage_finished(stage: &str, passed: bool, failing: &[String], duration_ms: u64) {
    info!(
        event = "stage.finished",
        stage = %stage,
        passed = passed,
        failing = ?failing,
        duration_ms = duration_ms,
    );
}

/// Emit event: autofix coordinator returned.
pub fn emit_autofix_attempted(stage: &str, iteration: u32, applied: bool, files_changed: usize) {
    info!(
        event = "autofix.attempted",
        stage = %stage,
        iteration = iteration,
        applied = applied,
        files_changed = files_changed,
    );
}

/// Emit event: workflow reached a terminal status.
pub fn emit_workflow_finished(run_id: &str, status: &str, iterations: u32, duration_ms: u64) {
    info!(
        event = "workflow.finished",
        run_id = %run_id,
        status = %status,
        iterations = iterations,
        duration_ms = duration_ms,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workflow_span_create() {
        let _span = WorkflowSpan::enter("test-run-id");
    }
}
