//! Stage executor: runs the steps of one stage in order.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::domain::{StageResult, StageStatus, StepError, StepResult};

use super::environment::Environment;
use super::limits::{Limits, RunBudget};
use super::pipeline::{Stage, Step};
use super::runner::StepRunner;

/// Observer notified around each step (used for the run event log)
#[async_trait]
pub trait StepObserver: Send {
    async fn step_started(&mut self, stage: &Stage, step: &Step);
    async fn step_finished(&mut self, stage: &Stage, result: &StepResult);
}

/// Observer that ignores everything
pub struct NoopObserver;

#[async_trait]
impl StepObserver for NoopObserver {
    async fn step_started(&mut self, _stage: &Stage, _step: &Step) {}
    async fn step_finished(&mut self, _stage: &Stage, _result: &StepResult) {}
}

/// Runs stages step by step, stopping at the first failed step
pub struct StageExecutor<'a> {
    runner: &'a StepRunner,
    limits: &'a Limits,
    budget: &'a RunBudget,
    timeout_override: Option<Duration>,
}

impl<'a> StageExecutor<'a> {
    pub fn new(runner: &'a StepRunner, limits: &'a Limits, budget: &'a RunBudget) -> Self {
        Self {
            runner,
            limits,
            budget,
            timeout_override: None,
        }
    }

    /// Use `timeout` for every step instead of its declared timeout
    pub fn with_timeout_override(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_override = timeout;
        self
    }

    /// Effective timeout of a step, capped by what is left of the run
    pub fn step_timeout(&self, step: &Step) -> Duration {
        let timeout = self
            .timeout_override
            .unwrap_or_else(|| step.timeout(self.limits));
        self.budget.cap(timeout)
    }

    /// Execute `stage`
    #[instrument(skip_all, fields(stage = %stage.name))]
    pub async fn run(
        &self,
        stage: &Stage,
        env: &Environment,
        cancel: &CancellationToken,
        observer: &mut dyn StepObserver,
    ) -> StageResult {
        let started = Instant::now();
        let mut steps = Vec::with_capacity(stage.steps.len());

        info!(best_effort = stage.best_effort, steps = stage.steps.len(), "Stage started");

        for step in &stage.steps {
            observer.step_started(stage, step).await;
            let result = self
                .runner
                .run(step, env, self.step_timeout(step), cancel)
                .await;
            observer.step_finished(stage, &result).await;

            let stop = result.failed;
            steps.push(result);
            if stop {
                break;
            }
        }

        let status = aggregate(stage, &steps);
        match status {
            StageStatus::Succeeded => info!("Stage succeeded"),
            StageStatus::FailureSuppressed => {
                warn!("Stage failed, continuing (best_effort)")
            }
            _ => warn!(status = ?status, "Stage did not succeed"),
        }

        StageResult {
            name: stage.name.clone(),
            best_effort: stage.best_effort,
            status,
            steps,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// Fold step outcomes into a stage status
fn aggregate(stage: &Stage, steps: &[StepResult]) -> StageStatus {
    match steps.iter().find(|s| s.failed) {
        None => StageStatus::Succeeded,
        Some(step) if step.error == Some(StepError::Cancelled) => StageStatus::Cancelled,
        Some(_) if stage.best_effort => StageStatus::FailureSuppressed,
        Some(_) => StageStatus::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn step(name: &str, run: &str, continue_on_error: bool) -> Step {
        Step {
            name: name.to_string(),
            run: run.to_string(),
            continue_on_error,
            timeout_seconds: None,
        }
    }

    fn stage(best_effort: bool, steps: Vec<Step>) -> Stage {
        Stage {
            name: "scan".to_string(),
            best_effort,
            steps,
        }
    }

    async fn execute(stage: &Stage) -> StageResult {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());
        let limits = Limits::default();
        let budget = RunBudget::start(limits.run_timeout());
        StageExecutor::new(&runner, &limits, &budget)
            .run(
                stage,
                &Environment::default(),
                &CancellationToken::new(),
                &mut NoopObserver,
            )
            .await
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let result = execute(&stage(
            false,
            vec![step("a", "true", false), step("b", "echo ok", false)],
        ))
        .await;

        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.steps.len(), 2);
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_fail_fast_within_stage() {
        let result = execute(&stage(
            false,
            vec![
                step("a", "exit 2", false),
                step("b", "echo never", false),
            ],
        ))
        .await;

        assert_eq!(result.status, StageStatus::Failed);
        assert_eq!(result.steps.len(), 1);
        assert_eq!(result.steps[0].exit_code, Some(2));
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_continue_on_error_does_not_fail_stage() {
        let result = execute(&stage(
            false,
            vec![
                step("scan", "exit 1", true),
                step("report", "echo report", false),
            ],
        ))
        .await;

        assert_eq!(result.status, StageStatus::Succeeded);
        assert_eq!(result.steps.len(), 2);
        assert_eq!(result.steps[0].exit_code, Some(1));
        assert!(!result.steps[0].failed);
    }

    #[tokio::test]
    async fn test_best_effort_reports_success_but_keeps_failures() {
        let result = execute(&stage(
            true,
            vec![step("scan", "exit 4", false), step("after", "true", false)],
        ))
        .await;

        assert_eq!(result.status, StageStatus::FailureSuppressed);
        assert!(result.success());
        assert!(result.has_step_failures());
        assert_eq!(result.steps.len(), 1);
        assert!(result.steps[0].failed);
    }

    #[test]
    fn test_timeout_override_and_budget_cap() {
        let runner = StepRunner::new(".");
        let limits = Limits::default();
        let budget = RunBudget::start(Duration::from_secs(30));
        let mut slow = step("slow", "true", false);
        slow.timeout_seconds = Some(600);

        let executor = StageExecutor::new(&runner, &limits, &budget);
        assert!(executor.step_timeout(&slow) <= Duration::from_secs(30));

        let executor = executor.with_timeout_override(Some(Duration::from_secs(5)));
        assert_eq!(executor.step_timeout(&slow), Duration::from_secs(5));
    }
}
