//! Append-only run log with file-based persistence.
//!
//! Each run gets a directory `<runs_dir>/<run_id>/` holding `events.jsonl`
//! (newline-delimited JSON, one event per line) and, once the run is over,
//! `result.json` with the final [`RunResult`].

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Event, EventType, RunResult};

/// File-based event store using JSONL format
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Path to the final result
    result_path: PathBuf,
}

impl EventStore {
    /// Create or open the store for a run under `runs_dir`
    pub async fn open(runs_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = runs_dir.join(run_id.to_string());

        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", run_dir.display()))?;

        Ok(Self {
            events_path: run_dir.join("events.jsonl"),
            result_path: run_dir.join("result.json"),
            run_dir,
        })
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Persist the final run result
    pub async fn write_result(&self, run: &RunResult) -> Result<()> {
        let json = serde_json::to_string_pretty(run).context("Failed to serialize run result")?;
        fs::write(&self.result_path, json)
            .await
            .with_context(|| format!("Failed to write run result: {}", self.result_path.display()))
    }

    /// Load the final run result, if the run finished
    pub async fn load_result(&self) -> Result<Option<RunResult>> {
        if !self.result_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.result_path)
            .await
            .with_context(|| format!("Failed to read run result: {}", self.result_path.display()))?;

        let run = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run result: {}", self.result_path.display()))?;
        Ok(Some(run))
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// List all run IDs in `runs_dir`
    pub async fn list_runs(runs_dir: &Path) -> Result<Vec<Uuid>> {
        if !runs_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(runs_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open(temp.path(), run_id).await.unwrap();

        let event1 = Event::run(
            run_id,
            "image",
            EventType::RunStarted,
            "Run started".to_string(),
        );
        let event2 = Event::step(
            run_id,
            "build",
            "docker-build",
            EventType::StepStarted,
            "Step started".to_string(),
        );

        store.append(&event1).await.unwrap();
        store.append(&event2).await.unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].event_type, EventType::StepStarted);
    }

    #[tokio::test]
    async fn test_replay_empty_store() {
        let temp = TempDir::new().unwrap();
        let store = EventStore::open(temp.path(), Uuid::new_v4()).await.unwrap();

        assert!(store.replay().await.unwrap().is_empty());
        assert!(store.load_result().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_result_round_trip() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open(temp.path(), run_id).await.unwrap();

        let mut run = RunResult::new(run_id, "image".to_string());
        run.transition(RunStatus::Running);
        run.transition(RunStatus::Succeeded);
        store.write_result(&run).await.unwrap();

        let loaded = store.load_result().await.unwrap().unwrap();
        assert_eq!(loaded.id, run_id);
        assert_eq!(loaded.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_list_runs_ignores_other_entries() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        EventStore::open(temp.path(), run_id).await.unwrap();
        std::fs::create_dir_all(temp.path().join("not-a-run")).unwrap();
        std::fs::write(temp.path().join("notes.txt"), "x").unwrap();

        let runs = EventStore::list_runs(temp.path()).await.unwrap();
        assert_eq!(runs, vec![run_id]);
    }

    #[tokio::test]
    async fn test_last_event_of_type() {
        let temp = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open(temp.path(), run_id).await.unwrap();

        for stage in ["build", "scan"] {
            let event = Event::stage(
                run_id,
                stage,
                EventType::StageStarted,
                format!("Stage {} started", stage),
            );
            store.append(&event).await.unwrap();
        }

        let last = store
            .last_event_of_type(EventType::StageStarted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.stage.as_deref(), Some("scan"));
        assert!(store
            .last_event_of_type(EventType::RunFailed)
            .await
            .unwrap()
            .is_none());
    }
}
