//! Live workflow event stream.
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Publishing never
//! blocks: without subscribers events are dropped, and a subscriber that
//! falls behind loses the oldest events (it sees `RecvError::Lagged`).

use std::path::PathBuf;

use qgate_core::CheckExecution;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::pipeline::WorkflowStatus;
use crate::stage::GatingPolicy;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StageStarted {
        run_id: String,
        stage: String,
        iteration: u32,
        checks: Vec<String>,
    },
    CheckCompleted {
        run_id: String,
        stage: String,
        execution: Box<CheckExecution>,
    },
    StagePassed {
        run_id: String,
        stage: String,
        iteration: u32,
        duration_ms: u64,
    },
    StageFailed {
        run_id: String,
        stage: String,
        iteration: u32,
        policy: GatingPolicy,
        failing_checks: Vec<String>,
        aborted: bool,
    },
    AutofixAttempted {
        run_id: String,
        stage: String,
        iteration: u32,
        applied: bool,
        files_changed: Vec<PathBuf>,
        error: Option<String>,
    },
    WorkflowTerminal {
        run_id: String,
        status: WorkflowStatus,
        iterations: u32,
        duration_ms: u64,
        abort_reason: Option<String>,
    },
}

impl PipelineEvent {
    /// The wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::StageStarted { .. } => "stage_started",
            PipelineEvent::CheckCompleted { .. } => "check_completed",
            PipelineEvent::StagePassed { .. } => "stage_passed",
            PipelineEvent::StageFailed { .. } => "stage_failed",
            PipelineEvent::AutofixAttempted { .. } => "autofix_attempted",
            PipelineEvent::WorkflowTerminal { .. } => "workflow_terminal",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            PipelineEvent::StageStarted { run_id, .. }
            | PipelineEvent::CheckCompleted { run_id, .. }
            | PipelineEvent::StagePassed { run_id, .. }
            | PipelineEvent::StageFailed { run_id, .. }
            | PipelineEvent::AutofixAttempted { run_id, .. }
            | PipelineEvent::WorkflowTerminal { run_id, .. } => run_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineEvent::WorkflowTerminal { .. })
    }
}

/// Broadcast hub for [`PipelineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Send to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
