//! Event Store Integration Tests
//!
//! Tests for event log format, append operations, replay order and the
//! events an engine run leaves behind.

use gantry::core::{EventStore, PipelineEngine};
use gantry::domain::{Event, EventType, RunSnapshot};
use gantry::{Environment, Pipeline, RunStatus};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test]
async fn test_event_append_format() {
    let run_id = Uuid::new_v4();

    let event = Event::step(
        run_id,
        "scan",
        "trivy",
        EventType::StepCompleted,
        "Step 'trivy' completed".to_string(),
    )
    .with_exit_code(Some(1))
    .with_duration(1500);

    let json = serde_json::to_string(&event).unwrap();
    let parsed: Event = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.run_id, run_id);
    assert_eq!(parsed.stage, Some("scan".to_string()));
    assert_eq!(parsed.step, Some("trivy".to_string()));
    assert_eq!(parsed.event_type, EventType::StepCompleted);
    assert_eq!(parsed.exit_code, Some(1));
    assert_eq!(parsed.duration_ms, Some(1500));
    assert!(json.contains(r#""event_type":"step_completed""#));

    // Verify timestamp is valid ISO 8601
    let timestamp_str = parsed.timestamp.to_rfc3339();
    assert!(timestamp_str.contains('T'));
}

#[tokio::test]
async fn test_event_types_serialization() {
    let event_types = vec![
        EventType::RunStarted,
        EventType::RunSucceeded,
        EventType::RunFailed,
        EventType::RunAborted,
        EventType::StageStarted,
        EventType::StageFailureSuppressed,
        EventType::StageSkipped,
        EventType::StepStarted,
        EventType::StepFailed,
        EventType::ArtifactPublished,
        EventType::PublishWarning,
    ];

    for event_type in event_types {
        let json = serde_json::to_string(&event_type).unwrap();
        let parsed: EventType = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event_type);
    }
}

#[tokio::test]
async fn test_event_replay_order() {
    let temp_dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open(temp_dir.path(), run_id).await.unwrap();

    for i in 0..5 {
        let event = Event::step(
            run_id,
            "build",
            &format!("step{}", i),
            EventType::StepStarted,
            format!("Step {} started", i),
        );
        store.append(&event).await.unwrap();
    }

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 5);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.step, Some(format!("step{}", i)));
    }
    assert!(store.events_path().ends_with("events.jsonl"));
}

#[tokio::test]
async fn test_engine_run_log() {
    let temp = TempDir::new().unwrap();
    let runs_dir = temp.path().join("runs");
    let engine = PipelineEngine::new(temp.path()).with_runs_dir(&runs_dir);
    let pipeline = Pipeline::from_yaml(
        r#"
name: image
stages:
  - name: lint
    best_effort: true
    steps:
      - name: hadolint
        run: exit 1
  - name: build
    steps:
      - name: compile
        run: exit 2
  - name: scan
    steps:
      - name: trivy
        run: "true"
artifacts:
  report: report.html
"#,
    )
    .unwrap();

    let run = engine
        .run(&pipeline, &Environment::default(), CancellationToken::new())
        .await;
    assert_eq!(
        *run.status(),
        RunStatus::Failed {
            stage: "build".to_string()
        }
    );

    let store = EventStore::open(&runs_dir, run.id()).await.unwrap();
    let events = store.replay().await.unwrap();
    let types: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        types,
        vec![
            EventType::RunStarted,
            EventType::StageStarted,
            EventType::StepStarted,
            EventType::StepFailed,
            EventType::StageFailureSuppressed,
            EventType::StageStarted,
            EventType::StepStarted,
            EventType::StepFailed,
            EventType::StageFailed,
            EventType::StageSkipped,
            EventType::PublishWarning,
            EventType::RunFailed,
        ]
    );

    let failed = store
        .last_event_of_type(EventType::StepFailed)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.step.as_deref(), Some("compile"));
    assert_eq!(failed.exit_code, Some(2));

    // Snapshot from events agrees with the stored result
    let snapshot = RunSnapshot::from_events(&events).unwrap();
    assert_eq!(snapshot.state, "failed");
    assert_eq!(snapshot.pipeline_name, "image");
    assert_eq!(
        snapshot.stages,
        vec![
            ("lint".to_string(), "failure_suppressed".to_string()),
            ("build".to_string(), "failed".to_string()),
            ("scan".to_string(), "skipped".to_string()),
        ]
    );

    let saved = store.load_result().await.unwrap().unwrap();
    assert_eq!(saved.id(), run.id());
    assert_eq!(saved.status(), run.status());
    assert_eq!(saved.step_count(), 2);

    assert_eq!(EventStore::list_runs(&runs_dir).await.unwrap(), vec![run.id()]);
}

#[tokio::test]
async fn test_validation_abort_is_logged() {
    let temp = TempDir::new().unwrap();
    let runs_dir = temp.path().join("runs");
    let engine = PipelineEngine::new(temp.path()).with_runs_dir(&runs_dir);
    let pipeline = Pipeline::from_yaml(
        "name: bad\nstages:\n  - name: s\n    steps:\n      - name: a\n        run: echo ${MISSING}\n",
    )
    .unwrap();

    let run = engine
        .run(&pipeline, &Environment::default(), CancellationToken::new())
        .await;

    let store = EventStore::open(&runs_dir, run.id()).await.unwrap();
    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::RunAborted);
    assert!(events[0].error.as_deref().unwrap().contains("MISSING"));
}
