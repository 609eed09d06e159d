//! Autofix coordination after a fail-fast stage failure.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use qgate_core::{FileSet, FingerprintMode, QgateError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::pipeline::StageResult;
use crate::stage::StageDefinition;

/// Result of one autofix attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixOutcome {
    /// Whether anything was changed that warrants re-running the stage.
    pub applied: bool,
    /// Files the fix touched, relative to the workspace root. Empty with
    /// `applied` means the coordinator could not say which.
    pub files_changed: Vec<PathBuf>,
}

impl FixOutcome {
    pub fn not_applied() -> Self {
        Self::default()
    }

    pub fn applied(files_changed: Vec<PathBuf>) -> Self {
        Self {
            applied: true,
            files_changed,
        }
    }
}

#[derive(Debug, Error)]
pub enum AutofixError {
    #[error("fix command for {check} failed: {reason}")]
    CommandFailed { check: String, reason: String },

    #[error("cannot snapshot workspace: {0}")]
    Snapshot(#[from] QgateError),
}

/// Repairs the causes of a failed stage.
#[async_trait]
pub trait AutofixCoordinator: Send + Sync {
    async fn attempt_fix(&self, stage: &StageResult) -> Result<FixOutcome, AutofixError>;
}

/// Never changes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAutofix;

#[async_trait]
impl AutofixCoordinator for NoopAutofix {
    async fn attempt_fix(&self, _stage: &StageResult) -> Result<FixOutcome, AutofixError> {
        Ok(FixOutcome::not_applied())
    }
}

/// Runs the fix command of each failing check and reports the files whose
/// contents changed.
#[derive(Debug, Clone)]
pub struct CommandAutofix {
    files: FileSet,
    commands: HashMap<String, Vec<String>>,
    timeout: Duration,
}

impl CommandAutofix {
    pub fn new(files: FileSet) -> Self {
        Self {
            files,
            commands: HashMap::new(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Register every check that declares a fix command.
    pub fn from_stages(files: FileSet, stages: &[StageDefinition]) -> Self {
        let mut autofix = Self::new(files);
        for check in stages.iter().flat_map(|s| s.checks.iter()) {
            if let Some(cmd) = &check.fix_command {
                autofix.commands.insert(check.name.clone(), cmd.clone());
            }
        }
        autofix
    }

    pub fn with_command(mut self, check: impl Into<String>, command: Vec<String>) -> Self {
        self.commands.insert(check.into(), command);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_fix(&self, check: &str) -> bool {
        self.commands.contains_key(check)
    }

    /// Content digests of the watched files. An empty file set watches
    /// the whole tree.
    fn snapshot(&self) -> Result<BTreeMap<PathBuf, String>, AutofixError> {
        let set = if self.files.is_empty() {
            FileSet::discover(self.files.root(), &[])?
        } else {
            self.files.clone()
        };
        Ok(set
            .fingerprints(FingerprintMode::Content)?
            .into_iter()
            .map(|fp| (fp.path, fp.digest))
            .collect())
    }

    async fn run_fix(&self, check: &str, command: &[String]) -> Result<(), AutofixError> {
        let Some((program, args)) = command.split_first() else {
            return Err(AutofixError::CommandFailed {
                check: check.to_string(),
                reason: "empty fix command".to_string(),
            });
        };
        let child = Command::new(program)
            .args(args)
            .current_dir(self.files.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AutofixError::CommandFailed {
                check: check.to_string(),
                reason: e.to_string(),
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AutofixError::CommandFailed {
                check: check.to_string(),
                reason: format!("timed out after {}s", self.timeout.as_secs()),
            })?
            .map_err(|e| AutofixError::CommandFailed {
                check: check.to_string(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            // Partial fixes still count; the re-run decides.
            warn!(
                check,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr),
                "fix command exited unsuccessfully"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl AutofixCoordinator for CommandAutofix {
    async fn attempt_fix(&self, stage: &StageResult) -> Result<FixOutcome, AutofixError> {
        let targets: Vec<(&String, &Vec<String>)> = stage
            .failing_checks
            .iter()
            .filter_map(|name| self.commands.get(name).map(|cmd| (name, cmd)))
            .collect();
        if targets.is_empty() {
            debug!(stage = %stage.stage, "no fix commands for failing checks");
            return Ok(FixOutcome::not_applied());
        }

        let before = self.snapshot()?;
        let mut last_error = None;
        let mut ran = 0usize;
        for (check, command) in &targets {
            info!(stage = %stage.stage, check = %check, command = ?command, "running fix command");
            match self.run_fix(check, command).await {
                Ok(()) => ran += 1,
                Err(e) => {
                    warn!(check = %check, error = %e, "fix command failed");
                    last_error = Some(e);
                }
            }
        }
        if ran == 0 {
            if let Some(e) = last_error {
                return Err(e);
            }
        }

        let after = self.snapshot()?;
        let changed = diff_snapshots(&before, &after);
        debug!(stage = %stage.stage, changed = changed.len(), "fix commands finished");
        if changed.is_empty() {
            Ok(FixOutcome::not_applied())
        } else {
            Ok(FixOutcome::applied(changed))
        }
    }
}

/// Paths added, removed, or modified between two snapshots.
fn diff_snapshots(
    before: &BTreeMap<PathBuf, String>,
    after: &BTreeMap<PathBuf, String>,
) -> Vec<PathBuf> {
    let mut changed: Vec<PathBuf> = after
        .iter()
        .filter(|(path, digest)| before.get(*path) != Some(*digest))
        .map(|(path, _)| path.clone())
        .collect();
    changed.extend(
        before
            .keys()
            .filter(|path| !after.contains_key(*path))
            .cloned(),
    );
    changed.sort();
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::GatingPolicy;
    use chrono::Utc;
    use std::fs;

    fn failed_stage(failing: &[&str]) -> StageResult {
        let now = Utc::now();
        StageResult {
            stage: "fast".to_string(),
            policy: GatingPolicy::FailFast,
            iteration: 0,
            executions: Vec::new(),
            passed: false,
            failing_checks: failing.iter().map(|s| s.to_string()).collect(),
            aborted: false,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_noop_never_applies() {
        let outcome = NoopAutofix.attempt_fix(&failed_stage(&["fmt"])).await.unwrap();
        assert!(!outcome.applied);
        assert!(outcome.files_changed.is_empty());
    }

    #[tokio::test]
    async fn test_command_autofix_reports_changed_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn a(){}").unwrap();
        fs::write(dir.path().join("b.rs"), "fn b() {}").unwrap();
        let files = FileSet::new(dir.path(), vec!["a.rs".into(), "b.rs".into()]);

        let autofix = CommandAutofix::new(files).with_command(
            "fmt",
            vec!["sh".into(), "-c".into(), "printf 'fn a() {}' > a.rs".into()],
        );
        let outcome = autofix.attempt_fix(&failed_stage(&["fmt"])).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.files_changed, vec![PathBuf::from("a.rs")]);
    }

    #[tokio::test]
    async fn test_command_autofix_without_changes_is_not_applied() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.rs"), "fn a() {}").unwrap();
        let files = FileSet::new(dir.path(), vec!["a.rs".into()]);

        let autofix = CommandAutofix::new(files).with_command("fmt", vec!["true".into()]);
        let outcome = autofix.attempt_fix(&failed_stage(&["fmt"])).await.unwrap();
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn test_command_autofix_skips_checks_without_fix() {
        let dir = tempfile::tempdir().unwrap();
        let autofix = CommandAutofix::new(FileSet::empty(dir.path()));
        let outcome = autofix.attempt_fix(&failed_stage(&["test"])).await.unwrap();
        assert!(!outcome.applied);
    }

    #[tokio::test]
    async fn test_command_autofix_launch_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let autofix = CommandAutofix::new(FileSet::empty(dir.path()))
            .with_command("fmt", vec!["qgate-no-such-fixer".into()]);
        let err = autofix
            .attempt_fix(&failed_stage(&["fmt"]))
            .await
            .unwrap_err();
        assert!(matches!(err, AutofixError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_empty_file_set_watches_whole_tree() {
        let dir = tempfile::tempdir().unwrap();
        let autofix = CommandAutofix::new(FileSet::empty(dir.path())).with_command(
            "gen",
            vec!["sh".into(), "-c".into(), "echo x > new.rs".into()],
        );
        let outcome = autofix.attempt_fix(&failed_stage(&["gen"])).await.unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.files_changed, vec![PathBuf::from("new.rs")]);
    }

    #[test]
    fn test_from_stages_collects_fix_commands() {
        let dir = tempfile::tempdir().unwrap();
        let autofix = CommandAutofix::from_stages(
            FileSet::empty(dir.path()),
            &crate::stage::default_workflow(),
        );
        assert!(autofix.has_fix("cargo_fmt"));
        assert!(autofix.has_fix("cargo_clippy"));
        assert!(!autofix.has_fix("cargo_test"));
    }

    #[test]
    fn test_diff_snapshots() {
        let before: BTreeMap<PathBuf, String> = [
            (PathBuf::from("a"), "1".to_string()),
            (PathBuf::from("b"), "2".to_string()),
        ]
        .into_iter()
        .collect();
        let after: BTreeMap<PathBuf, String> = [
            (PathBuf::from("a"), "1".to_string()),
            (PathBuf::from("c"), "3".to_string()),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            diff_snapshots(&before, &after),
            vec![PathBuf::from("b"), PathBuf::from("c")]
        );
    }
}
