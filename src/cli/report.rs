//! Human-readable rendering of plans, runs and configuration.

use crate::config::ResolvedConfig;
use crate::core::{Pipeline, PipelineEngine};
use crate::domain::{
    AbortCause, PublishOutcome, RunResult, RunSnapshot, RunStatus, StageResult, StageStatus,
    StepResult,
};

use super::RunSummary;

/// Print what a run would execute; templates are shown unresolved
pub fn print_plan(engine: &PipelineEngine, pipeline: &Pipeline, validation: &Result<(), AbortCause>) {
    let limits = engine.limits_for(pipeline);

    println!("Pipeline: {}", pipeline.name);
    if !pipeline.description.is_empty() {
        println!("  {}", pipeline.description);
    }
    println!("Working dir: {}", engine.working_dir_for(pipeline).display());
    println!("Shell: {}", engine.shell_for(pipeline).join(" "));
    println!("Run timeout: {}s", limits.run_timeout_seconds);
    println!();

    for (i, stage) in pipeline.stages.iter().enumerate() {
        let flag = if stage.best_effort { " (best effort)" } else { "" };
        println!("{}. {}{}", i + 1, stage.name, flag);
        for step in &stage.steps {
            let mut notes = vec![format!("timeout {}s", step.timeout(&limits).as_secs())];
            if step.continue_on_error {
                notes.push("continue on error".to_string());
            }
            println!("   - {} [{}]", step.name, notes.join(", "));
            println!("     $ {}", step.run);
        }
    }

    if !pipeline.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for (name, path) in &pipeline.artifacts {
            println!("  {}: {}", name, path);
        }
    }

    println!();
    match validation {
        Ok(()) => println!("Plan is valid (dry run, nothing executed)"),
        Err(cause) => println!("Plan is invalid: {}", cause),
    }
}

/// Print a finished run
pub fn print_run(run: &RunResult) {
    println!();
    println!("Run {} ({})", run.id, run.pipeline_name);

    for stage in &run.stages {
        print_stage(stage);
    }

    if !run.artifacts.is_empty() {
        println!();
        println!("Artifacts:");
        for outcome in &run.artifacts {
            match outcome {
                PublishOutcome::Published(record) => println!(
                    "  {:<16} {} ({} bytes, sha256 {})",
                    record.name,
                    record.path.display(),
                    record.size_bytes,
                    &record.sha256[..record.sha256.len().min(12)]
                ),
                PublishOutcome::Warning(warning) => println!(
                    "  {:<16} WARNING {}: {}",
                    warning.name, warning.path, warning.reason
                ),
            }
        }
    }

    println!();
    println!(
        "Status: {} in {}",
        describe_status(&run.status),
        format_ms(run.duration_ms)
    );
}

fn print_stage(stage: &StageResult) {
    let marker = match stage.status {
        StageStatus::Succeeded => "ok",
        StageStatus::Failed => "FAILED",
        StageStatus::FailureSuppressed => "failed (best effort)",
        StageStatus::Cancelled => "cancelled",
        StageStatus::Skipped => "skipped",
    };

    if stage.status == StageStatus::Skipped {
        println!("  [{}] {}", marker, stage.name);
        return;
    }

    println!(
        "  [{}] {} ({})",
        marker,
        stage.name,
        format_ms(stage.duration_ms)
    );
    for step in &stage.steps {
        println!("      {:<24} {}", step.name, describe_step(step));
    }
}

fn describe_step(step: &StepResult) -> String {
    let mut text = match (&step.error, step.exit_code) {
        (Some(error), _) => error.to_string(),
        (None, Some(code)) => format!("exit {}", code),
        (None, None) => "killed by signal".to_string(),
    };
    if step.suppressed() {
        text.push_str(" (continue on error)");
    }
    if step.truncated {
        text.push_str(" [output truncated]");
    }
    format!("{} in {}", text, format_ms(step.duration_ms))
}

fn describe_status(status: &RunStatus) -> String {
    match status {
        RunStatus::Failed { stage } => format!("failed at stage '{}'", stage),
        RunStatus::Aborted { cause } => format!("aborted: {}", cause),
        other => other.label().to_string(),
    }
}

/// Print a run reconstructed from its event log
pub fn print_snapshot(snapshot: &RunSnapshot) {
    println!("Run ID: {}", snapshot.id);
    println!("Pipeline: {}", snapshot.pipeline_name);
    println!("State: {}", snapshot.state);
    println!("Started: {}", snapshot.started_at);
    match snapshot.completed_at {
        Some(completed) => println!("Completed: {}", completed),
        None => println!("Completed: (no result recorded)"),
    }
    println!("\nStage statuses:");
    for (stage, status) in &snapshot.stages {
        println!("  {}: {}", stage, status);
    }
}

/// Print the `runs` table
pub fn print_run_table<'a>(runs: impl Iterator<Item = &'a RunSummary>) {
    println!(
        "{:<38} {:<20} {:<12} {}",
        "RUN ID", "PIPELINE", "STATE", "STARTED"
    );
    println!("{}", "-".repeat(95));

    for run in runs {
        println!(
            "{:<38} {:<20} {:<12} {}",
            run.id,
            run.pipeline_name,
            run.state,
            run.started_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

/// Print the resolved configuration
pub fn print_config(cfg: &ResolvedConfig) {
    println!("gantry configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Runs:      {}", cfg.runs_dir().display());
    println!("  Pipelines: {}", cfg.pipelines.display());
    println!();
    println!("Shell: {}", cfg.shell.join(" "));
    println!();
    println!("Limits:");
    println!("  Step timeout:     {}s", cfg.limits.step_timeout_seconds);
    println!("  Run timeout:      {}s", cfg.limits.run_timeout_seconds);
    println!("  Max output:       {} bytes", cfg.limits.max_output_bytes);
    println!(
        "  Sensitive names:  {}",
        cfg.limits.sensitive_patterns.join(", ")
    );
}

fn format_ms(ms: u64) -> String {
    if ms < 1000 {
        format!("{}ms", ms)
    } else {
        format!("{:.1}s", ms as f64 / 1000.0)
    }
}
