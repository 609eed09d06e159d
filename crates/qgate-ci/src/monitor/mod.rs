//! Stall detection for running check processes.
//!
//! A monitor samples the CPU usage of a process tree on a fixed interval.
//! A long enough run of low-activity samples marks the process stalled
//! and fires a one-shot callback so the runner can kill it well before
//! the hard timeout.

pub mod sampler;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

pub use sampler::{ProcSampler, ProcessSampler, RawSample, SampleError};

/// Stall detection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub enabled: bool,
    /// No samples are judged before this has elapsed (milliseconds).
    pub grace_period_ms: u64,
    pub sample_interval_ms: u64,
    /// Samples below this CPU percentage count as low activity.
    pub cpu_threshold_percent: f64,
    /// Consecutive low-activity samples required for a stall.
    pub stall_samples: u32,
    /// Minimum cumulative duration of the low-activity streak (milliseconds).
    pub stall_timeout_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            grace_period_ms: 10_000,
            sample_interval_ms: 1_000,
            cpu_threshold_percent: 1.0,
            stall_samples: 30,
            stall_timeout_ms: 60_000,
        }
    }
}

impl MonitorConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_millis(self.stall_timeout_ms)
    }
}

/// Health of a monitored process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Starting,
    Healthy,
    Suspect,
    Stalled,
    Completed,
}

impl MonitorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MonitorState::Stalled | MonitorState::Completed)
    }
}

/// One judged sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub pid: u32,
    pub cpu_percent: f64,
    pub memory_kib: Option<u64>,
    /// Time since the monitor started.
    pub elapsed_ms: u64,
    pub low_activity_streak: u32,
}

/// Latest published state of a monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorStatus {
    pub state: MonitorState,
    pub last_sample: Option<HealthSample>,
    pub samples_taken: u32,
}

impl Default for MonitorStatus {
    fn default() -> Self {
        Self {
            state: MonitorState::Starting,
            last_sample: None,
            samples_taken: 0,
        }
    }
}

/// The low-activity state machine, independent of any clock or process.
#[derive(Debug, Clone)]
pub struct StallTracker {
    threshold: f64,
    stall_samples: u32,
    stall_timeout: Duration,
    streak: u32,
    streak_duration: Duration,
    state: MonitorState,
}

impl StallTracker {
    pub fn new(config: &MonitorConfig) -> Self {
        Self {
            threshold: config.cpu_threshold_percent,
            stall_samples: config.stall_samples.max(1),
            stall_timeout: config.stall_timeout(),
            streak: 0,
            streak_duration: Duration::ZERO,
            state: MonitorState::Starting,
        }
    }

    /// Feed one CPU measurement covering `interval`; returns the new state.
    pub fn observe(&mut self, cpu_percent: f64, interval: Duration) -> MonitorState {
        if self.state.is_terminal() {
            return self.state;
        }
        if cpu_percent >= self.threshold {
            self.streak = 0;
            self.streak_duration = Duration::ZERO;
            self.state = MonitorState::Healthy;
        } else {
            self.streak += 1;
            self.streak_duration += interval;
            self.state = if self.streak >= self.stall_samples
                && self.streak_duration >= self.stall_timeout
            {
                MonitorState::Stalled
            } else {
                MonitorState::Suspect
            };
        }
        self.state
    }

    /// The process exited; a stall verdict is kept.
    pub fn complete(&mut self) {
        if !self.state.is_terminal() {
            self.state = MonitorState::Completed;
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

/// Spawns monitor tasks.
pub struct ProcessMonitor;

impl ProcessMonitor {
    /// Start watching `pid`. The task ends on stall, on
    /// [`MonitorHandle::shutdown`], or when the handle is dropped.
    pub fn spawn(
        pid: u32,
        config: MonitorConfig,
        sampler: Arc<dyn ProcessSampler>,
    ) -> MonitorHandle {
        if !config.enabled {
            return MonitorHandle::disabled();
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(MonitorStatus::default());
        let (stall_tx, stall_rx) = oneshot::channel();

        let task = tokio::spawn(monitor_loop(
            pid, config, sampler, stop_rx, status_tx, stall_tx,
        ));

        MonitorHandle {
            stop_tx: Some(stop_tx),
            status_rx,
            stall_rx: Some(stall_rx),
            task: Some(task),
        }
    }
}

/// Owner side of a running monitor.
pub struct MonitorHandle {
    stop_tx: Option<watch::Sender<bool>>,
    status_rx: watch::Receiver<MonitorStatus>,
    stall_rx: Option<oneshot::Receiver<HealthSample>>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// A handle that never reports a stall.
    pub fn disabled() -> Self {
        let (_status_tx, status_rx) = watch::channel(MonitorStatus::default());
        Self {
            stop_tx: None,
            status_rx,
            stall_rx: None,
            task: None,
        }
    }

    /// Resolves with the last sample when the process is declared stalled.
    /// Pends forever if the monitor ends any other way.
    pub async fn stalled(&mut self) -> HealthSample {
        if let Some(rx) = self.stall_rx.as_mut() {
            let result = rx.await;
            self.stall_rx = None;
            if let Ok(sample) = result {
                return sample;
            }
        }
        std::future::pending().await
    }

    /// Current state and last sample.
    pub fn status(&self) -> MonitorStatus {
        self.status_rx.borrow().clone()
    }

    /// Watch channel of status updates.
    pub fn subscribe(&self) -> watch::Receiver<MonitorStatus> {
        self.status_rx.clone()
    }

    /// Signal the task to stop, wait for it to publish its final state,
    /// and return that status.
    pub async fn shutdown(mut self) -> MonitorStatus {
        if let Some(tx) = self.stop_tx.take() {
            tx.send_replace(true);
        }
        match self.task.take() {
            Some(task) => {
                if let Err(e) = task.await {
                    debug!(error = %e, "monitor task ended abnormally");
                }
                self.status()
            }
            // Nothing was ever watched.
            None => MonitorStatus {
                state: MonitorState::Completed,
                ..self.status()
            },
        }
    }

    fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            tx.send_replace(true);
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn monitor_loop(
    pid: u32,
    config: MonitorConfig,
    sampler: Arc<dyn ProcessSampler>,
    mut stop_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<MonitorStatus>,
    stall_tx: oneshot::Sender<HealthSample>,
) {
    let started = Instant::now();
    let mut tracker = StallTracker::new(&config);
    let mut samples_taken = 0u32;

    tokio::select! {
        biased;
        _ = stop_requested(&mut stop_rx) => {
            publish_completed(&mut tracker, &status_tx);
            return;
        }
        _ = tokio::time::sleep(config.grace_period()) => {}
    }

    let mut ticker = tokio::time::interval(config.sample_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut previous: Option<(Instant, RawSample)> = sample_or_log(sampler.as_ref(), pid)
        .map(|raw| (Instant::now(), raw));

    loop {
        tokio::select! {
            biased;
            _ = stop_requested(&mut stop_rx) => break,
            _ = ticker.tick() => {}
        }

        let now = Instant::now();
        let Some(raw) = sample_or_log(sampler.as_ref(), pid) else {
            continue;
        };
        let Some((prev_at, prev_raw)) = previous.replace((now, raw)) else {
            continue;
        };

        let wall = now.duration_since(prev_at);
        let cpu = raw.cpu_time.saturating_sub(prev_raw.cpu_time);
        let cpu_percent = if wall.is_zero() {
            0.0
        } else {
            cpu.as_secs_f64() / wall.as_secs_f64() * 100.0
        };

        let state = tracker.observe(cpu_percent, wall);
        samples_taken += 1;
        let sample = HealthSample {
            pid,
            cpu_percent,
            memory_kib: raw.rss_kib,
            elapsed_ms: started.elapsed().as_millis() as u64,
            low_activity_streak: tracker.streak(),
        };
        debug!(
            pid,
            cpu_percent,
            streak = tracker.streak(),
            state = ?state,
            "process health sample"
        );
        status_tx.send_replace(MonitorStatus {
            state,
            last_sample: Some(sample.clone()),
            samples_taken,
        });

        if state == MonitorState::Stalled {
            warn!(
                pid,
                streak = sample.low_activity_streak,
                elapsed_ms = sample.elapsed_ms,
                "process stalled"
            );
            let _ = stall_tx.send(sample);
            return;
        }
    }

    publish_completed(&mut tracker, &status_tx);
}

fn publish_completed(tracker: &mut StallTracker, status_tx: &watch::Sender<MonitorStatus>) {
    tracker.complete();
    let state = tracker.state();
    status_tx.send_modify(|s| s.state = state);
}

fn sample_or_log(sampler: &dyn ProcessSampler, pid: u32) -> Option<RawSample> {
    match sampler.sample(pid) {
        Ok(raw) => Some(raw),
        Err(e) => {
            debug!(pid, error = %e, "process sample unavailable");
            None
        }
    }
}
