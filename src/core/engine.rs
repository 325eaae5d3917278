//! Pipeline engine: drives a run through its state machine.
//!
//! Validates the definition, executes stages in order, applies fail-fast and
//! best-effort rules, publishes artifacts and records every transition in the
//! run event log.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{
    AbortCause, Event, EventType, PublishOutcome, RunResult, RunStatus, StageResult,
    StageStatus, StepResult,
};

use super::environment::{Environment, EnvironmentError, Variable};
use super::event_store::EventStore;
use super::limits::{Limits, RunBudget};
use super::pipeline::{Pipeline, Stage, Step};
use super::publisher::ArtifactPublisher;
use super::runner::{default_shell, StepRunner};
use super::stage::{StageExecutor, StepObserver};

/// Main pipeline engine
///
/// Holds only immutable settings, so one engine can drive several runs at
/// once.
#[derive(Debug, Clone)]
pub struct PipelineEngine {
    /// Defaults under each pipeline's own limits
    limits: Limits,

    /// Default shell invocation
    shell: Vec<String>,

    /// Directory relative working directories are resolved against
    base_dir: PathBuf,

    /// Timeout applied to every step when set
    timeout_override: Option<Duration>,

    /// Where run logs go; no log is written when unset
    runs_dir: Option<PathBuf>,
}

impl PipelineEngine {
    /// Create an engine with default limits rooted at `base_dir`
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            limits: Limits::default(),
            shell: default_shell(),
            base_dir: base_dir.into(),
            timeout_override: None,
            runs_dir: None,
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    /// Apply `timeout` to every step instead of declared timeouts
    pub fn with_timeout_override(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    /// Record event logs and results under `runs_dir`
    pub fn with_runs_dir(mut self, runs_dir: impl Into<PathBuf>) -> Self {
        self.runs_dir = Some(runs_dir.into());
        self
    }

    /// Engine limits with the pipeline's overrides layered on top
    pub fn limits_for(&self, pipeline: &Pipeline) -> Limits {
        self.limits.overlay(&pipeline.limits)
    }

    /// Shell invocation in effect for `pipeline`
    pub fn shell_for(&self, pipeline: &Pipeline) -> Vec<String> {
        pipeline.shell.clone().unwrap_or_else(|| self.shell.clone())
    }

    /// Working directory in effect for `pipeline`
    pub fn working_dir_for(&self, pipeline: &Pipeline) -> PathBuf {
        pipeline.working_dir(&self.base_dir)
    }

    /// Build the run environment from declarations plus `overrides`
    pub fn environment<I>(
        &self,
        pipeline: &Pipeline,
        overrides: I,
    ) -> Result<Environment, EnvironmentError>
    where
        I: IntoIterator<Item = Variable>,
    {
        let limits = self.limits_for(pipeline);
        overrides
            .into_iter()
            .fold(
                Environment::builder()
                    .sensitive_patterns(limits.sensitive_patterns.iter().cloned())
                    .declare_all(&pipeline.variables),
                |builder, var| {
                    if var.secret {
                        builder.secret(var.name, var.value)
                    } else {
                        builder.value(var.name, var.value)
                    }
                },
            )
            .build()
    }

    /// Check structure and every template before anything runs
    pub fn validate(&self, pipeline: &Pipeline, env: &Environment) -> Result<(), AbortCause> {
        pipeline
            .validate()
            .map_err(|e| AbortCause::InvalidDefinition {
                reason: e.to_string(),
            })?;

        pipeline.check_references(env).map_err(|e| match e.source {
            EnvironmentError::UndefinedVariable { name } => AbortCause::UndefinedVariable {
                name,
                location: e.location,
            },
            other => AbortCause::InvalidDefinition {
                reason: format!("{}: {}", e.location, other),
            },
        })
    }

    /// Execute `pipeline` with `env` until it reaches a terminal state
    ///
    /// Always returns a finished [`RunResult`]; failures are reported through
    /// its status rather than as errors.
    #[instrument(skip_all, fields(pipeline = %pipeline.name))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        env: &Environment,
        cancel: CancellationToken,
    ) -> RunResult {
        let mut run = RunResult::new(Uuid::new_v4(), pipeline.name.clone());
        let mut log = RunLog::open(self.runs_dir.as_deref(), run.id).await;
        info!(run_id = %run.id, "Starting pipeline execution");

        if let Err(cause) = self.validate(pipeline, env) {
            error!(run_id = %run.id, %cause, "Pipeline validation failed");
            log.record(
                Event::run(
                    run.id,
                    &pipeline.name,
                    EventType::RunAborted,
                    format!("Pipeline '{}' aborted before start", pipeline.name),
                )
                .with_error(cause.to_string()),
            )
            .await;
            run.transition(RunStatus::Aborted { cause });
            run.finish();
            log.write_result(&run).await;
            return run;
        }

        let limits = self.limits_for(pipeline);
        let working_dir = self.working_dir_for(pipeline);
        let runner = StepRunner::new(&working_dir)
            .with_shell(self.shell_for(pipeline))
            .with_max_output_bytes(limits.max_output_bytes);
        let budget = RunBudget::start(limits.run_timeout());
        let executor = StageExecutor::new(&runner, &limits, &budget)
            .with_timeout_override(self.timeout_override);

        run.transition(RunStatus::Running);
        log.record(Event::run(
            run.id,
            &pipeline.name,
            EventType::RunStarted,
            format!(
                "Pipeline '{}' started ({} stages)",
                pipeline.name,
                pipeline.stages.len()
            ),
        ))
        .await;

        // First terminal status reached; later stages are skipped
        let mut outcome: Option<RunStatus> = None;

        for stage in &pipeline.stages {
            if outcome.is_none() {
                if cancel.is_cancelled() {
                    outcome = Some(cancelled());
                } else if let Err(violation) = budget.check() {
                    warn!(%violation, "Run budget exhausted");
                    outcome = Some(run_timeout(&limits));
                }
            }

            if outcome.is_some() {
                log.record(Event::stage(
                    run.id,
                    &stage.name,
                    EventType::StageSkipped,
                    format!("Stage '{}' skipped", stage.name),
                ))
                .await;
                run.stages
                    .push(StageResult::skipped(stage.name.clone(), stage.best_effort));
                continue;
            }

            log.record(Event::stage(
                run.id,
                &stage.name,
                EventType::StageStarted,
                format!("Stage '{}' started", stage.name),
            ))
            .await;

            let result = executor.run(stage, env, &cancel, &mut log).await;
            log.record(stage_event(run.id, &result)).await;

            match result.status {
                StageStatus::Succeeded | StageStatus::FailureSuppressed | StageStatus::Skipped => {}
                StageStatus::Cancelled => outcome = Some(cancelled()),
                StageStatus::Failed if budget.check().is_err() => {
                    outcome = Some(run_timeout(&limits));
                }
                StageStatus::Failed => {
                    outcome = Some(RunStatus::Failed {
                        stage: stage.name.clone(),
                    });
                }
            }
            run.stages.push(result);
        }

        run.transition(outcome.unwrap_or(RunStatus::Succeeded));

        run.artifacts = ArtifactPublisher::new(&working_dir)
            .publish(pipeline, env, &run)
            .await;
        for artifact in &run.artifacts {
            log.record(publish_event(run.id, artifact)).await;
        }

        run.finish();
        match &run.status {
            RunStatus::Succeeded => info!(run_id = %run.id, "Pipeline succeeded"),
            RunStatus::Failed { stage } => error!(run_id = %run.id, %stage, "Pipeline failed"),
            RunStatus::Aborted { cause } => error!(run_id = %run.id, %cause, "Pipeline aborted"),
            RunStatus::Pending | RunStatus::Running => {}
        }
        log.record(run_event(&run)).await;
        log.write_result(&run).await;

        run
    }
}

fn cancelled() -> RunStatus {
    RunStatus::Aborted {
        cause: AbortCause::Cancelled,
    }
}

fn run_timeout(limits: &Limits) -> RunStatus {
    RunStatus::Aborted {
        cause: AbortCause::RunTimeout {
            limit_seconds: limits.run_timeout_seconds,
        },
    }
}

fn stage_event(run_id: Uuid, result: &StageResult) -> Event {
    let (event_type, verb) = match result.status {
        StageStatus::Succeeded => (EventType::StageSucceeded, "succeeded"),
        StageStatus::Failed => (EventType::StageFailed, "failed"),
        StageStatus::FailureSuppressed => {
            (EventType::StageFailureSuppressed, "failed (best effort)")
        }
        StageStatus::Cancelled => (EventType::StageCancelled, "cancelled"),
        StageStatus::Skipped => (EventType::StageSkipped, "skipped"),
    };

    let event = Event::stage(
        run_id,
        &result.name,
        event_type,
        format!("Stage '{}' {}", result.name, verb),
    )
    .with_duration(result.duration_ms);

    match result.failed_step() {
        Some(step) => event.with_error(format!("step '{}' failed", step.name)),
        None => event,
    }
}

fn publish_event(run_id: Uuid, outcome: &PublishOutcome) -> Event {
    match outcome {
        PublishOutcome::Published(record) => Event::new(
            run_id,
            EventType::ArtifactPublished,
            format!(
                "Artifact '{}' published ({} bytes, sha256 {})",
                record.name, record.size_bytes, record.sha256
            ),
        ),
        PublishOutcome::Warning(warning) => Event::new(
            run_id,
            EventType::PublishWarning,
            format!("Artifact '{}' not published: {}", warning.name, warning.path),
        )
        .with_error(warning.reason.clone()),
    }
}

fn run_event(run: &RunResult) -> Event {
    let (event_type, summary) = match &run.status {
        RunStatus::Failed { stage } => (
            EventType::RunFailed,
            format!("Pipeline '{}' failed at stage '{}'", run.pipeline_name, stage),
        ),
        RunStatus::Aborted { .. } => (
            EventType::RunAborted,
            format!("Pipeline '{}' aborted", run.pipeline_name),
        ),
        _ => (
            EventType::RunSucceeded,
            format!("Pipeline '{}' succeeded", run.pipeline_name),
        ),
    };

    let event = Event::run(run.id, &run.pipeline_name, event_type, summary)
        .with_duration(run.duration_ms);
    match &run.status {
        RunStatus::Aborted { cause } => event.with_error(cause.to_string()),
        _ => event,
    }
}

/// Event log of one run; a no-op without a runs directory
///
/// Write failures are logged and otherwise ignored so that a broken log
/// never changes how a run ends.
struct RunLog {
    run_id: Uuid,
    store: Option<EventStore>,
}

impl RunLog {
    async fn open(runs_dir: Option<&Path>, run_id: Uuid) -> Self {
        let store = match runs_dir {
            Some(dir) => match EventStore::open(dir, run_id).await {
                Ok(store) => Some(store),
                Err(e) => {
                    warn!(error = %format!("{:#}", e), "Run log unavailable");
                    None
                }
            },
            None => None,
        };
        Self { run_id, store }
    }

    async fn record(&self, event: Event) {
        if let Some(store) = &self.store {
            if let Err(e) = store.append(&event).await {
                warn!(error = %format!("{:#}", e), "Failed to append run event");
            }
        }
    }

    async fn write_result(&self, run: &RunResult) {
        if let Some(store) = &self.store {
            if let Err(e) = store.write_result(run).await {
                warn!(error = %format!("{:#}", e), "Failed to write run result");
            }
        }
    }
}

#[async_trait]
impl StepObserver for RunLog {
    async fn step_started(&mut self, stage: &Stage, step: &Step) {
        self.record(Event::step(
            self.run_id,
            &stage.name,
            &step.name,
            EventType::StepStarted,
            format!("Step '{}' started", step.name),
        ))
        .await;
    }

    async fn step_finished(&mut self, stage: &Stage, result: &StepResult) {
        let (event_type, verb) = if result.failed {
            (EventType::StepFailed, "failed")
        } else if result.suppressed() {
            (EventType::StepCompleted, "failed (continue on error)")
        } else {
            (EventType::StepCompleted, "completed")
        };

        let mut event = Event::step(
            self.run_id,
            &stage.name,
            &result.name,
            event_type,
            format!("Step '{}' {}", result.name, verb),
        )
        .with_exit_code(result.exit_code)
        .with_duration(result.duration_ms);
        if let Some(error) = &result.error {
            event = event.with_error(error.to_string());
        }
        self.record(event).await;
    }
}
