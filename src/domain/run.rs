//! Run results and run reconstruction from events.
//!
//! A [`RunResult`] is the outcome of one pipeline execution. Stage and step
//! results are appended in execution order and never rewritten.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::artifact::PublishOutcome;
use super::events::{Event, EventType};

/// Outcome of a complete pipeline execution
///
/// Only the engine mutates a run; callers read it through accessors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique identifier for this run
    pub(crate) id: Uuid,

    /// Name of the pipeline that was executed
    pub(crate) pipeline_name: String,

    /// Lifecycle state; terminal once the engine returns
    pub(crate) status: RunStatus,

    /// One entry per declared stage, in declaration order
    pub(crate) stages: Vec<StageResult>,

    /// Published artifacts and publish warnings
    pub(crate) artifacts: Vec<PublishOutcome>,

    /// When the run started
    pub(crate) started_at: DateTime<Utc>,

    /// When the run finished
    pub(crate) finished_at: Option<DateTime<Utc>>,

    /// Wall time in milliseconds
    pub(crate) duration_ms: u64,
}

impl RunResult {
    /// Create a pending run
    pub(crate) fn new(id: Uuid, pipeline_name: String) -> Self {
        Self {
            id,
            pipeline_name,
            status: RunStatus::Pending,
            stages: Vec::new(),
            artifacts: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: 0,
        }
    }

    /// Move to `next` if the state machine allows it
    pub(crate) fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.allows(&next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Stamp completion time
    pub(crate) fn finish(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.finished_at = Some(now);
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Lifecycle state; terminal once the engine returns
    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Stage results in declaration order
    pub fn stages(&self) -> &[StageResult] {
        &self.stages
    }

    /// Published artifacts and publish warnings
    pub fn artifacts(&self) -> &[PublishOutcome] {
        &self.artifacts
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    /// Whether the run ended in `Succeeded`
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded)
    }

    /// Whether the run reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Get a stage result by name
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Step results across all stages, in execution order
    pub fn steps(&self) -> impl Iterator<Item = &StepResult> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }

    /// Number of steps that actually ran
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    /// Process exit code for this run
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }
}

/// State of a pipeline run
///
/// `Pending -> Running -> {Succeeded, Failed, Aborted}`; a run that fails
/// validation goes straight from `Pending` to `Aborted`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunStatus {
    /// Not started yet
    Pending,

    /// Currently executing stages
    Running,

    /// Every stage succeeded or had its failure suppressed
    Succeeded,

    /// A stage without best-effort failed
    Failed { stage: String },

    /// Stopped before or during execution
    Aborted { cause: AbortCause },
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed { .. } | Self::Aborted { .. }
        )
    }

    fn allows(&self, next: &RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Aborted { .. })
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed { .. })
                | (Self::Running, Self::Aborted { .. })
        )
    }

    /// 0 on success, 1 on failure, 2 on abort
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Succeeded => 0,
            Self::Failed { .. } => 1,
            Self::Aborted { .. } | Self::Pending | Self::Running => 2,
        }
    }

    /// Short lowercase label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// Why a run was aborted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum AbortCause {
    #[error("{location}: undefined variable '{name}'")]
    UndefinedVariable { name: String, location: String },

    #[error("invalid pipeline definition: {reason}")]
    InvalidDefinition { reason: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("run exceeded {limit_seconds}s")]
    RunTimeout { limit_seconds: u64 },
}

impl AbortCause {
    /// Configuration errors are detected before anything runs
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::UndefinedVariable { .. } | Self::InvalidDefinition { .. }
        )
    }
}

/// Outcome of one stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name
    pub name: String,

    /// Whether the stage was declared best-effort
    pub best_effort: bool,

    /// Aggregate status
    pub status: StageStatus,

    /// Steps that ran, in order
    pub steps: Vec<StepResult>,

    /// Wall time in milliseconds
    pub duration_ms: u64,
}

impl StageResult {
    /// A stage that never ran
    pub fn skipped(name: String, best_effort: bool) -> Self {
        Self {
            name,
            best_effort,
            status: StageStatus::Skipped,
            steps: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Success as reported to the engine (suppressed failures count as success)
    pub fn success(&self) -> bool {
        matches!(
            self.status,
            StageStatus::Succeeded | StageStatus::FailureSuppressed
        )
    }

    /// Whether any step failed, even if the stage failure was suppressed
    pub fn has_step_failures(&self) -> bool {
        self.steps.iter().any(|s| s.failed)
    }

    /// The step that stopped the stage
    pub fn failed_step(&self) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.failed)
    }

    /// Get a step result by name
    pub fn step(&self, name: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.name == name)
    }
}

/// Status of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// All steps succeeded
    Succeeded,

    /// A step failed
    Failed,

    /// A step failed but the stage is best-effort
    FailureSuppressed,

    /// The in-flight step was cancelled
    Cancelled,

    /// Not executed
    Skipped,
}

/// Outcome of one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step name
    pub name: String,

    /// Command template as declared (never the resolved command)
    pub command: String,

    /// Process exit code, if the process exited normally
    pub exit_code: Option<i32>,

    /// Combined stdout/stderr, redacted
    pub output: String,

    /// Whether older output was dropped to respect the output limit
    pub truncated: bool,

    /// Wall time in milliseconds
    pub duration_ms: u64,

    /// Whether the step counts as failed after continue-on-error
    pub failed: bool,

    /// Whether the step was declared continue-on-error
    pub continue_on_error: bool,

    /// Why the step did not exit normally
    pub error: Option<StepError>,
}

impl StepResult {
    /// True when the step did not succeed but continue-on-error hid it
    pub fn suppressed(&self) -> bool {
        !self.failed && (self.error.is_some() || self.exit_code != Some(0))
    }
}

/// Abnormal step terminations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum StepError {
    #[error("timed out after {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("failed to spawn process: {message}")]
    Spawn { message: String },

    #[error("cancelled")]
    Cancelled,
}

/// Run state rebuilt from the event log (for runs without a final result)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: Uuid,
    pub pipeline_name: String,
    pub state: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// stage name -> last known status label, in first-seen order
    pub stages: Vec<(String, String)>,
}

impl RunSnapshot {
    /// Reconstruct a snapshot from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut snapshot = Self {
            id: first_event.run_id,
            pipeline_name: String::new(),
            state: RunStatus::Pending.label().to_string(),
            started_at: first_event.timestamp,
            completed_at: None,
            stages: Vec::new(),
        };

        for event in events {
            snapshot.apply_event(event);
        }

        Some(snapshot)
    }

    /// Apply a single event
    pub fn apply_event(&mut self, event: &Event) {
        if let Some(ref pipeline) = event.pipeline {
            self.pipeline_name = pipeline.clone();
        }

        match event.event_type {
            EventType::RunStarted => {
                self.state = RunStatus::Running.label().to_string();
                self.started_at = event.timestamp;
            }
            EventType::RunSucceeded => self.close("succeeded", event),
            EventType::RunFailed => self.close("failed", event),
            EventType::RunAborted => self.close("aborted", event),
            EventType::StageStarted => self.set_stage(event, "running"),
            EventType::StageSucceeded => self.set_stage(event, "succeeded"),
            EventType::StageFailed => self.set_stage(event, "failed"),
            EventType::StageFailureSuppressed => self.set_stage(event, "failure_suppressed"),
            EventType::StageCancelled => self.set_stage(event, "cancelled"),
            EventType::StageSkipped => self.set_stage(event, "skipped"),
            EventType::StepStarted
            | EventType::StepCompleted
            | EventType::StepFailed
            | EventType::ArtifactPublished
            | EventType::PublishWarning => {}
        }
    }

    fn close(&mut self, state: &str, event: &Event) {
        self.state = state.to_string();
        self.completed_at = Some(event.timestamp);
    }

    fn set_stage(&mut self, event: &Event, status: &str) {
        let Some(ref stage) = event.stage else {
            return;
        };
        match self.stages.iter_mut().find(|(name, _)| name == stage) {
            Some(entry) => entry.1 = status.to_string(),
            None => self.stages.push((stage.clone(), status.to_string())),
        }
    }
}
