//! Staged workflow driver with gating and the autofix loop.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use qgate_core::obs;
use qgate_core::{
    retry_async, CancelToken, CheckExecution, Classification, FileSet, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::autofix::{AutofixCoordinator, AutofixError, FixOutcome};
use crate::events::{EventBus, PipelineEvent};
use crate::executor::ConcurrentExecutor;
use crate::stage::{validate_workflow, GatingPolicy, StageDefinition};

/// Available CPU parallelism, at least 1.
pub fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pipeline tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub max_parallel: usize,
    /// Maximum autofix-triggered stage re-executions per workflow.
    pub max_iterations: u32,
    /// Applied to autofix calls that return an error.
    pub autofix_retry: RetryPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_parallelism(),
            max_iterations: 3,
            autofix_retry: RetryPolicy::none(),
        }
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
    MaxIterationsExceeded,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Pending | WorkflowStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Success => "success",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Aborted => "aborted",
            WorkflowStatus::MaxIterationsExceeded => "max_iterations_exceeded",
        }
    }

    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkflowStatus::Success => 0,
            WorkflowStatus::Failed => 1,
            WorkflowStatus::MaxIterationsExceeded => 2,
            WorkflowStatus::Aborted => 3,
            WorkflowStatus::Pending | WorkflowStatus::Running => 4,
        }
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one execution of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub policy: GatingPolicy,
    /// Workflow iteration counter when the stage ran.
    pub iteration: u32,
    pub executions: Vec<CheckExecution>,
    pub passed: bool,
    pub failing_checks: Vec<String>,
    /// The stage was cut short by cancellation.
    pub aborted: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl StageResult {
    /// Gate a stage on its executions. The stage counts as aborted only
    /// when some execution was, so a cancel that lands after every check
    /// finished leaves the result intact.
    pub fn from_executions(
        stage: &StageDefinition,
        iteration: u32,
        executions: Vec<CheckExecution>,
        started_at: DateTime<Utc>,
        duration_ms: u64,
    ) -> Self {
        let failing_checks: Vec<String> = executions
            .iter()
            .filter(|e| !e.passed())
            .map(|e| e.check_name.clone())
            .collect();
        let aborted = executions
            .iter()
            .any(|e| e.classification == Classification::Aborted);
        Self {
            stage: stage.name.clone(),
            policy: stage.policy,
            iteration,
            passed: !aborted && failing_checks.is_empty(),
            executions,
            failing_checks,
            aborted,
            started_at,
            finished_at: Utc::now(),
            duration_ms,
        }
    }

    /// Number of executions that passed.
    pub fn passed_count(&self) -> usize {
        self.executions.iter().filter(|e| e.passed()).count()
    }

    /// Number of executions that did not pass.
    pub fn failed_count(&self) -> usize {
        self.executions.len() - self.passed_count()
    }

    pub fn execution(&self, check: &str) -> Option<&CheckExecution> {
        self.executions.iter().find(|e| e.check_name == check)
    }
}

/// One call to the autofix coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutofixRecord {
    pub stage: String,
    pub iteration: u32,
    pub applied: bool,
    pub files_changed: Vec<PathBuf>,
    pub error: Option<String>,
    /// Cache entries dropped because of this fix.
    pub invalidated: usize,
    pub at: DateTime<Utc>,
}

/// State of one workflow invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub current_stage: Option<String>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub stage_results: Vec<StageResult>,
    pub autofix_log: Vec<AutofixRecord>,
    pub status: WorkflowStatus,
    pub abort_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            current_stage: None,
            iteration: 0,
            max_iterations,
            stage_results: Vec::new(),
            autofix_log: Vec::new(),
            status: WorkflowStatus::Pending,
            abort_reason: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as u64
    }

    /// The most recent result of each stage, in execution order.
    pub fn latest_results(&self) -> Vec<&StageResult> {
        let mut latest: Vec<&StageResult> = Vec::new();
        for result in &self.stage_results {
            match latest.iter_mut().find(|r| r.stage == result.stage) {
                Some(slot) => *slot = result,
                None => latest.push(result),
            }
        }
        latest
    }

    /// Checks failing in the latest result of any stage.
    pub fn failing_checks(&self) -> Vec<String> {
        self.latest_results()
            .into_iter()
            .flat_map(|r| r.failing_checks.iter().cloned())
            .collect()
    }

    /// How many times `stage` ran.
    pub fn executions_of(&self, stage: &str) -> usize {
        self.stage_results.iter().filter(|r| r.stage == stage).count()
    }
}

/// Drives stages in order, gating on each and looping through autofix.
pub struct StagePipeline {
    executor: ConcurrentExecutor,
    autofix: Arc<dyn AutofixCoordinator>,
    config: PipelineConfig,
    events: EventBus,
}

impl StagePipeline {
    pub fn new(
        executor: ConcurrentExecutor,
        autofix: Arc<dyn AutofixCoordinator>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            executor,
            autofix,
            config,
            events: EventBus::default(),
        }
    }

    /// Publish events on an existing bus.
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run `stages` against `files` to a terminal status.
    pub async fn run(
        &self,
        stages: &[StageDefinition],
        files: &FileSet,
        cancel: &CancelToken,
    ) -> WorkflowRun {
        let run = WorkflowRun::new(self.config.max_iterations);
        let span = obs::workflow_span(&run.run_id);
        self.drive(run, stages, files, cancel).instrument(span).await
    }

    async fn drive(
        &self,
        mut run: WorkflowRun,
        stages: &[StageDefinition],
        files: &FileSet,
        cancel: &CancelToken,
    ) -> WorkflowRun {
        let start = Instant::now();

        if let Err(e) = validate_workflow(stages) {
            warn!(error = %e, "invalid workflow");
            run.abort_reason = Some(e.to_string());
            return self.finish(run, WorkflowStatus::Aborted, start);
        }

        run.status = WorkflowStatus::Running;
        obs::emit_workflow_started(&run.run_id, stages.len(), run.max_iterations);

        let mut idx = 0;
        while idx < stages.len() {
            let stage = &stages[idx];
            if cancel.is_cancelled() {
                run.abort_reason = Some("cancelled".to_string());
                return self.finish(run, WorkflowStatus::Aborted, start);
            }

            run.current_stage = Some(stage.name.clone());
            let result = self
                .run_stage(&run.run_id, stage, run.iteration, files, cancel)
                .instrument(obs::stage_span(&stage.name, run.iteration))
                .await;
            run.stage_results.push(result.clone());

            if result.aborted {
                self.publish_stage_failed(&run.run_id, &result);
                run.abort_reason = Some("cancelled".to_string());
                return self.finish(run, WorkflowStatus::Aborted, start);
            }

            if result.passed {
                self.events.publish(PipelineEvent::StagePassed {
                    run_id: run.run_id.clone(),
                    stage: result.stage.clone(),
                    iteration: result.iteration,
                    duration_ms: result.duration_ms,
                });
                idx += 1;
                continue;
            }

            self.publish_stage_failed(&run.run_id, &result);

            match stage.policy {
                GatingPolicy::FailOpen => {
                    info!(stage = %stage.name, failing = ?result.failing_checks, "fail-open stage failed; continuing");
                    idx += 1;
                }
                GatingPolicy::FailFast => {
                    if run.iteration >= run.max_iterations {
                        warn!(
                            stage = %stage.name,
                            iterations = run.iteration,
                            "iteration limit reached"
                        );
                        return self.finish(run, WorkflowStatus::MaxIterationsExceeded, start);
                    }

                    let (outcome, error) = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            run.abort_reason = Some("cancelled".to_string());
                            return self.finish(run, WorkflowStatus::Aborted, start);
                        }
                        attempt = self.attempt_autofix(&result) => attempt,
                    };

                    let invalidated = if outcome.applied {
                        self.invalidate(stage, &result, files, &outcome.files_changed)
                    } else {
                        0
                    };
                    obs::emit_autofix_attempted(
                        &stage.name,
                        run.iteration,
                        outcome.applied,
                        outcome.files_changed.len(),
                    );
                    self.events.publish(PipelineEvent::AutofixAttempted {
                        run_id: run.run_id.clone(),
                        stage: stage.name.clone(),
                        iteration: run.iteration,
                        applied: outcome.applied,
                        files_changed: outcome.files_changed.clone(),
                        error: error.clone(),
                    });
                    run.autofix_log.push(AutofixRecord {
                        stage: stage.name.clone(),
                        iteration: run.iteration,
                        applied: outcome.applied,
                        files_changed: outcome.files_changed,
                        error,
                        invalidated,
                        at: Utc::now(),
                    });

                    if !outcome.applied {
                        return self.finish(run, WorkflowStatus::Failed, start);
                    }
                    run.iteration += 1;
                    // Same index: the stage runs again.
                }
            }
        }

        self.finish(run, WorkflowStatus::Success, start)
    }

    async fn run_stage(
        &self,
        run_id: &str,
        stage: &StageDefinition,
        iteration: u32,
        files: &FileSet,
        cancel: &CancelToken,
    ) -> StageResult {
        let started_at = Utc::now();
        let start = Instant::now();
        let enabled: Vec<String> = stage.enabled_checks().map(|c| c.name.clone()).collect();

        obs::emit_stage_started(&stage.name, iteration, enabled.len());
        self.events.publish(PipelineEvent::StageStarted {
            run_id: run_id.to_string(),
            stage: stage.name.clone(),
            iteration,
            checks: enabled,
        });

        let executions = self
            .executor
            .execute(
                &stage.checks,
                files,
                self.config.max_parallel,
                cancel,
                |exec| {
                    obs::emit_check_completed(exec);
                    self.events.publish(PipelineEvent::CheckCompleted {
                        run_id: run_id.to_string(),
                        stage: stage.name.clone(),
                        execution: Box::new(exec.clone()),
                    });
                },
            )
            .await;

        let result = StageResult::from_executions(
            stage,
            iteration,
            executions,
            started_at,
            start.elapsed().as_millis() as u64,
        );
        obs::emit_stage_finished(
            &stage.name,
            result.passed,
            &result.failing_checks,
            result.duration_ms,
        );
        result
    }

    /// Call the coordinator, retrying errors per policy. A final error
    /// counts as not applied.
    async fn attempt_autofix(&self, result: &StageResult) -> (FixOutcome, Option<String>) {
        let autofix = self.autofix.as_ref();
        let (outcome, attempts) = retry_async(
            &self.config.autofix_retry,
            |r: &Result<FixOutcome, AutofixError>| r.is_err(),
            move |_| autofix.attempt_fix(result),
        )
        .await;
        match outcome {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                warn!(stage = %result.stage, attempts, error = %e, "autofix failed");
                (FixOutcome::not_applied(), Some(e.to_string()))
            }
        }
    }

    /// Drop cache entries touched by a fix. Without a file list every
    /// entry of the stage's checks goes. Entries of the failing checks
    /// always go, since their keys may not cover the files the fix edited.
    fn invalidate(
        &self,
        stage: &StageDefinition,
        result: &StageResult,
        files: &FileSet,
        changed: &[PathBuf],
    ) -> usize {
        let Some(cache) = self.executor.cache() else {
            return 0;
        };
        let removed = if changed.is_empty() {
            cache.invalidate_checks(&stage.check_names())
        } else {
            let relative: Vec<PathBuf> = changed.iter().map(|p| files.relativize(p)).collect();
            cache.invalidate_paths(&relative) + cache.invalidate_checks(&result.failing_checks)
        };
        info!(stage = %stage.name, removed, "invalidated cache after autofix");
        removed
    }

    fn publish_stage_failed(&self, run_id: &str, result: &StageResult) {
        self.events.publish(PipelineEvent::StageFailed {
            run_id: run_id.to_string(),
            stage: result.stage.clone(),
            iteration: result.iteration,
            policy: result.policy,
            failing_checks: result.failing_checks.clone(),
            aborted: result.aborted,
        });
    }

    fn finish(&self, mut run: WorkflowRun, status: WorkflowStatus, start: Instant) -> WorkflowRun {
        run.status = status;
        run.finished_at = Some(Utc::now());
        let duration_ms = start.elapsed().as_millis() as u64;
        obs::emit_workflow_finished(&run.run_id, status.as_str(), run.iteration, duration_ms);
        self.events.publish(PipelineEvent::WorkflowTerminal {
            run_id: run.run_id.clone(),
            status,
            iterations: run.iteration,
            duration_ms,
            abort_reason: run.abort_reason.clone(),
        });
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autofix::NoopAutofix;
    use crate::runner::{CheckRunner, RunnerConfig};
    use qgate_core::CheckDefinition;

    fn pipeline() -> StagePipeline {
        let executor =
            ConcurrentExecutor::new(Arc::new(CheckRunner::new(RunnerConfig::default())), None);
        StagePipeline::new(executor, Arc::new(NoopAutofix), PipelineConfig::default())
    }

    fn check(name: &str, program: &str) -> CheckDefinition {
        CheckDefinition::custom(name, "", vec![program.into()], 30)
    }

    #[test]
    fn test_status_exit_codes_are_distinct() {
        assert_eq!(WorkflowStatus::Success.exit_code(), 0);
        assert_eq!(WorkflowStatus::Failed.exit_code(), 1);
        assert_eq!(WorkflowStatus::MaxIterationsExceeded.exit_code(), 2);
        assert_eq!(WorkflowStatus::Aborted.exit_code(), 3);
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::Aborted.is_terminal());
    }

    fn finished(name: &str, classification: Classification) -> CheckExecution {
        let mut exec =
            CheckExecution::not_started(name, "fast", vec![], vec![name.into()], classification, None);
        exec.exit_code = match classification {
            Classification::Passed => Some(0),
            Classification::Failed => Some(1),
            _ => None,
        };
        exec
    }

    #[test]
    fn test_completed_stage_is_not_aborted() {
        let stage = StageDefinition::fail_fast("fast");
        let executions = vec![
            finished("a", Classification::Passed),
            finished("b", Classification::Passed),
        ];
        let result = StageResult::from_executions(&stage, 0, executions, Utc::now(), 5);
        assert!(result.passed);
        assert!(!result.aborted);
        assert!(result.failing_checks.is_empty());
    }

    #[test]
    fn test_any_aborted_execution_aborts_the_stage() {
        let stage = StageDefinition::fail_fast("fast");
        let executions = vec![
            finished("a", Classification::Passed),
            finished("b", Classification::Aborted),
            finished("c", Classification::Failed),
        ];
        let result = StageResult::from_executions(&stage, 2, executions, Utc::now(), 5);
        assert!(result.aborted);
        assert!(!result.passed);
        assert_eq!(result.failing_checks, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(result.iteration, 2);
    }

    #[test]
    fn test_status_serde_name() {
        let json = serde_json::to_string(&WorkflowStatus::MaxIterationsExceeded).unwrap();
        assert_eq!(json, "\"max_iterations_exceeded\"");
    }

    #[tokio::test]
    async fn test_all_stages_pass() {
        let dir = tempfile::tempdir().unwrap();
        let stages = vec![
            StageDefinition::fail_fast("one").with_check(check("a", "true")),
            StageDefinition::fail_fast("two").with_check(check("b", "true")),
        ];
        let run = pipeline()
            .run(&stages, &FileSet::empty(dir.path()), &CancelToken::never())
            .await;
        assert_eq!(run.status, WorkflowStatus::Success);
        assert_eq!(run.stage_results.len(), 2);
        assert_eq!(run.iteration, 0);
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_noop_autofix_fails_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let stages = vec![StageDefinition::fail_fast("one").with_check(check("a", "false"))];
        let run = pipeline()
            .run(&stages, &FileSet::empty(dir.path()), &CancelToken::never())
            .await;
        assert_eq!(run.status, WorkflowStatus::Failed);
        assert_eq!(run.autofix_log.len(), 1);
        assert!(!run.autofix_log[0].applied);
        assert_eq!(run.failing_checks(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_invalid_workflow_is_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let run = pipeline()
            .run(&[], &FileSet::empty(dir.path()), &CancelToken::never())
            .await;
        assert_eq!(run.status, WorkflowStatus::Aborted);
        assert!(run.abort_reason.unwrap().contains("no stages"));
        assert!(run.stage_results.is_empty());
    }

    #[test]
    fn test_latest_results_replace_earlier_runs() {
        let mut run = WorkflowRun::new(3);
        let now = Utc::now();
        let result = |iteration: u32, passed: bool| StageResult {
            stage: "fast".into(),
            policy: GatingPolicy::FailFast,
            iteration,
            executions: Vec::new(),
            passed,
            failing_checks: if passed { vec![] } else { vec!["fmt".into()] },
            aborted: false,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        };
        run.stage_results.push(result(0, false));
        run.stage_results.push(result(1, true));

        let latest = run.latest_results();
        assert_eq!(latest.len(), 1);
        assert!(latest[0].passed);
        assert!(run.failing_checks().is_empty());
        assert_eq!(run.executions_of("fast"), 2);
    }
}
