//! Event types for the run log.
//!
//! Every state change of a run is recorded as an immutable event in an
//! append-only log. Payloads are built from redacted data only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single event in the append-only event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Pipeline name (run-level events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<String>,

    /// Stage name (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Step name (if applicable)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    /// Type of event
    pub event_type: EventType,

    /// Human-readable summary (NO secrets)
    pub summary: String,

    /// Exit code of a finished step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Time taken in milliseconds (for finished steps and stages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(run_id: Uuid, event_type: EventType, summary: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            pipeline: None,
            stage: None,
            step: None,
            event_type,
            summary,
            exit_code: None,
            duration_ms: None,
            error: None,
        }
    }

    /// A run-level event
    pub fn run(run_id: Uuid, pipeline: &str, event_type: EventType, summary: String) -> Self {
        let mut event = Self::new(run_id, event_type, summary);
        event.pipeline = Some(pipeline.to_string());
        event
    }

    /// A stage-level event
    pub fn stage(run_id: Uuid, stage: &str, event_type: EventType, summary: String) -> Self {
        let mut event = Self::new(run_id, event_type, summary);
        event.stage = Some(stage.to_string());
        event
    }

    /// A step-level event
    pub fn step(
        run_id: Uuid,
        stage: &str,
        step: &str,
        event_type: EventType,
        summary: String,
    ) -> Self {
        let mut event = Self::stage(run_id, stage, event_type, summary);
        event.step = Some(step.to_string());
        event
    }

    /// Attach an exit code
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }
}

/// Types of events that can occur during pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunSucceeded,
    RunFailed,
    RunAborted,

    StageStarted,
    StageSucceeded,
    StageFailed,
    /// A best-effort stage failed and the run continued
    StageFailureSuppressed,
    StageCancelled,
    StageSkipped,

    StepStarted,
    /// A step finished without counting as failed (includes suppressed failures)
    StepCompleted,
    StepFailed,

    ArtifactPublished,
    PublishWarning,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = Event::step(
            Uuid::new_v4(),
            "scan",
            "trivy",
            EventType::StepStarted,
            "Starting trivy".to_string(),
        );

        let json = serde_json::to_string(&event).unwrap();
        let parsed: Event = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, EventType::StepStarted);
        assert_eq!(parsed.stage.as_deref(), Some("scan"));
        assert_eq!(parsed.step.as_deref(), Some("trivy"));
        assert!(!json.contains("exit_code"));
    }

    #[test]
    fn test_event_with_duration_and_exit_code() {
        let event = Event::step(
            Uuid::new_v4(),
            "scan",
            "trivy",
            EventType::StepCompleted,
            "Completed".to_string(),
        )
        .with_exit_code(Some(1))
        .with_duration(1500);

        assert_eq!(event.exit_code, Some(1));
        assert_eq!(event.duration_ms, Some(1500));
    }

    #[test]
    fn test_event_with_error() {
        let event = Event::run(
            Uuid::new_v4(),
            "image",
            EventType::RunAborted,
            "Aborted".to_string(),
        )
        .with_error("run cancelled".to_string());

        assert_eq!(event.error, Some("run cancelled".to_string()));
        assert_eq!(event.pipeline.as_deref(), Some("image"));
    }
}
