//! Check execution: spawn, watch, kill, classify.

use std::future::pending;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use qgate_core::{
    retry_async, CancelToken, CheckDefinition, CheckExecution, Classification, FileSet,
    RetryPolicy, TailBuffer, TerminationCause,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::monitor::{HealthSample, MonitorConfig, MonitorHandle, ProcSampler, ProcessMonitor, ProcessSampler};

const READ_CHUNK: usize = 8 * 1024;

/// Runner tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Per-stream output cap; older bytes are dropped first.
    pub max_output_bytes: usize,
    /// How long to wait for a killed process and its output pipes.
    pub kill_grace_ms: u64,
    /// Applied to `timed_out` executions only.
    pub retry: RetryPolicy,
    pub monitor: MonitorConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 1024 * 1024,
            kill_grace_ms: 2_000,
            retry: RetryPolicy::none(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl RunnerConfig {
    fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

/// What ended the wait on a child process.
enum Trigger {
    Exited(std::io::Result<ExitStatus>),
    Stalled(HealthSample),
    HardTimeout,
    Cancelled,
}

/// Runs one check as an external process.
pub struct CheckRunner {
    config: RunnerConfig,
    sampler: Arc<dyn ProcessSampler>,
}

impl CheckRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self::with_sampler(config, Arc::new(ProcSampler::new()))
    }

    /// Use a custom process sampler for stall detection.
    pub fn with_sampler(config: RunnerConfig, sampler: Arc<dyn ProcessSampler>) -> Self {
        Self { config, sampler }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run `check` against `files`.
    ///
    /// A zero `timeout` disables the hard timeout. Executions that time out
    /// are retried per the configured [`RetryPolicy`]; launch errors never are.
    pub async fn run(
        &self,
        check: &CheckDefinition,
        files: &FileSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> CheckExecution {
        let (mut exec, attempts) = retry_async(
            &self.config.retry,
            |exec: &CheckExecution| {
                exec.classification == Classification::TimedOut && !cancel.is_cancelled()
            },
            move |attempt| {
                if attempt > 1 {
                    info!(check = %check.name, attempt, "retrying timed out check");
                }
                self.run_once(check, files, timeout, cancel)
            },
        )
        .await;
        if exec.attempts > 0 {
            exec.attempts = attempts;
        }
        exec
    }

    async fn run_once(
        &self,
        check: &CheckDefinition,
        files: &FileSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> CheckExecution {
        let command = check.render_command(files.root(), files.files());
        let file_list = files.files().to_vec();

        if command.is_empty() || command[0].trim().is_empty() {
            return CheckExecution::not_started(
                &check.name,
                &check.stage,
                file_list,
                command,
                Classification::Error,
                Some(format!("check {} has empty command", check.name)),
            );
        }
        if cancel.is_cancelled() {
            return CheckExecution::not_started(
                &check.name,
                &check.stage,
                file_list,
                command,
                Classification::Aborted,
                None,
            );
        }

        let started_at = Utc::now();
        let start = Instant::now();

        let mut child = match Command::new(&command[0])
            .args(&command[1..])
            .current_dir(files.root())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(check = %check.name, program = %command[0], error = %e, "failed to launch check");
                let mut exec = CheckExecution::not_started(
                    &check.name,
                    &check.stage,
                    file_list,
                    command.clone(),
                    Classification::Error,
                    Some(format!("failed to launch {}: {}", command[0], e)),
                );
                exec.attempts = 1;
                return exec;
            }
        };

        let stdout_buf = Arc::new(Mutex::new(TailBuffer::new(self.config.max_output_bytes)));
        let stderr_buf = Arc::new(Mutex::new(TailBuffer::new(self.config.max_output_bytes)));
        let pumps = vec![
            tokio::spawn(pump(child.stdout.take(), Arc::clone(&stdout_buf))),
            tokio::spawn(pump(child.stderr.take(), Arc::clone(&stderr_buf))),
        ];

        let pid = child.id();
        let mut monitor = match pid {
            Some(pid) => ProcessMonitor::spawn(
                pid,
                self.config.monitor.clone(),
                Arc::clone(&self.sampler),
            ),
            None => MonitorHandle::disabled(),
        };
        debug!(check = %check.name, pid = ?pid, command = ?command, "check process started");

        let hard_deadline = async {
            if timeout.is_zero() {
                pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        // Exit wins when it is ready together with a trigger.
        let trigger = tokio::select! {
            biased;
            status = child.wait() => Trigger::Exited(status),
            sample = monitor.stalled() => Trigger::Stalled(sample),
            _ = hard_deadline => Trigger::HardTimeout,
            _ = cancel.cancelled() => Trigger::Cancelled,
        };
        let health = monitor.shutdown().await;
        debug!(
            check = %check.name,
            state = ?health.state,
            samples = health.samples_taken,
            "process monitor stopped"
        );

        let mut exec = CheckExecution {
            check_name: check.name.clone(),
            stage: check.stage.clone(),
            files: file_list,
            command,
            started_at,
            finished_at: started_at,
            duration_ms: 0,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            classification: Classification::Error,
            termination: None,
            cached_outcome: None,
            attempts: 1,
            error: None,
        };

        let status = match trigger {
            Trigger::Exited(status) => Some(status),
            Trigger::Stalled(sample) => {
                warn!(
                    check = %check.name,
                    cpu_percent = sample.cpu_percent,
                    streak = sample.low_activity_streak,
                    "killing stalled check"
                );
                exec.termination = Some(TerminationCause::Stalled);
                exec.error = Some(format!(
                    "stalled: {:.1}% cpu over {} consecutive samples",
                    sample.cpu_percent, sample.low_activity_streak
                ));
                None
            }
            Trigger::HardTimeout => {
                warn!(check = %check.name, timeout_ms = timeout.as_millis() as u64, "check timed out");
                exec.termination = Some(TerminationCause::HardTimeout);
                exec.error = Some(format!("timed out after {}ms", timeout.as_millis()));
                None
            }
            Trigger::Cancelled => {
                debug!(check = %check.name, "check cancelled");
                exec.termination = Some(TerminationCause::Cancelled);
                None
            }
        };

        if status.is_none() {
            self.terminate(&mut child, pid).await;
        }
        self.drain(pumps).await;

        exec.stdout = render(&stdout_buf);
        exec.stderr = render(&stderr_buf);
        exec.finished_at = Utc::now();
        exec.duration_ms = start.elapsed().as_millis() as u64;

        exec.classification = match (status, exec.termination) {
            (Some(Ok(status)), _) => match status.code() {
                Some(code) => {
                    exec.exit_code = Some(code);
                    match check.classifier.passes(code, &exec.stdout, &exec.stderr) {
                        Ok(true) => Classification::Passed,
                        Ok(false) => Classification::Failed,
                        Err(e) => {
                            exec.error = Some(e.to_string());
                            Classification::Error
                        }
                    }
                }
                None => {
                    exec.error = Some(format!("terminated by signal ({status})"));
                    Classification::Error
                }
            },
            (Some(Err(e)), _) => {
                exec.error = Some(format!("failed to wait for process: {e}"));
                Classification::Error
            }
            (None, Some(TerminationCause::Cancelled)) => Classification::Aborted,
            (None, _) => Classification::TimedOut,
        };

        debug!(
            check = %check.name,
            classification = %exec.classification,
            exit_code = ?exec.exit_code,
            duration_ms = exec.duration_ms,
            "check process finished"
        );
        exec
    }

    /// Kill the child and every descendant it spawned.
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        let descendants = pid
            .map(|pid| self.sampler.descendants(pid))
            .unwrap_or_default();
        if let Err(e) = child.start_kill() {
            debug!(pid = ?pid, error = %e, "kill failed");
        }
        signal_pids("KILL", &descendants).await;

        if tokio::time::timeout(self.config.kill_grace(), child.wait())
            .await
            .is_err()
        {
            warn!(pid = ?pid, "process did not exit after kill");
        }
    }

    /// Wait for the output readers; give up once the kill grace runs out.
    async fn drain(&self, pumps: Vec<JoinHandle<()>>) {
        let aborts: Vec<_> = pumps.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(
            self.config.kill_grace(),
            futures::future::join_all(pumps),
        )
        .await;
        if joined.is_err() {
            debug!("output pipes still open after grace; keeping partial output");
            for handle in aborts {
                handle.abort();
            }
        }
    }
}

async fn pump<R>(reader: Option<R>, buffer: Arc<Mutex<TailBuffer>>)
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return;
    };
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let mut guard = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                guard.push(&chunk[..n]);
            }
            Err(e) => {
                debug!(error = %e, "output read failed");
                break;
            }
        }
    }
}

fn render(buffer: &Mutex<TailBuffer>) -> String {
    buffer.lock().unwrap_or_else(PoisonError::into_inner).render()
}

async fn signal_pids(signal: &str, pids: &[u32]) {
    if pids.is_empty() {
        return;
    }
    let mut cmd = Command::new("kill");
    cmd.arg(format!("-{signal}"))
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for pid in pids {
        cmd.arg(pid.to_string());
    }
    if let Err(e) = cmd.status().await {
        debug!(signal, error = %e, "failed to invoke kill");
    }
}
