//! Command-line interface for gantry.
//!
//! Provides commands for running and validating pipelines, checking the
//! status of a run and listing past runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config;
use crate::core::{Environment, EventStore, Pipeline, PipelineEngine, Variable};
use crate::domain::{RunResult, RunSnapshot};

pub mod report;

/// gantry - Sequential stage pipeline runner
#[derive(Parser, Debug)]
#[command(name = "gantry")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline
    Run {
        /// Pipeline file, or name looked up as <pipelines>/<name>.yaml
        pipeline: String,

        /// Timeout applied to every step, in seconds
        #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
        timeout: Option<u64>,

        /// Validate and print the plan without executing anything
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        bindings: Bindings,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check a pipeline definition without running it
    Validate {
        /// Pipeline file or name
        pipeline: String,

        #[command(flatten)]
        bindings: Bindings,
    },

    /// Check the status of a run
    Status {
        /// Run ID (UUID)
        run_id: String,

        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },

    /// List recent runs
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show resolved configuration
    Config,
}

/// Variable overrides given on the command line
#[derive(Args, Debug, Default)]
pub struct Bindings {
    /// Set a variable (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE", value_parser = parse_binding)]
    pub vars: Vec<(String, String)>,

    /// Set a secret variable; its value is masked in all output (repeatable)
    #[arg(long = "secret", value_name = "NAME=VALUE", value_parser = parse_binding)]
    pub secrets: Vec<(String, String)>,
}

impl Bindings {
    fn variables(&self) -> Vec<Variable> {
        self.vars
            .iter()
            .map(|(name, value)| Variable::new(name, value))
            .chain(
                self.secrets
                    .iter()
                    .map(|(name, value)| Variable::secret(name, value)),
            )
            .collect()
    }
}

/// Parse `NAME=VALUE`
fn parse_binding(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
        _ => Err(format!("expected NAME=VALUE, got '{}'", s)),
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline,
                timeout,
                dry_run,
                bindings,
                json,
            } => {
                run_pipeline(&pipeline, timeout, dry_run, &bindings, json).await
            }
            Commands::Validate { pipeline, bindings } => {
                validate_pipeline(&pipeline, &bindings).await
            }
            Commands::Status { run_id, json } => {
                show_status(&run_id, json).await
            }
            Commands::Runs { limit } => {
                list_runs(limit).await
            }
            Commands::Config => {
                show_config().await
            }
        }
    }
}

/// Engine configured from the resolved configuration
fn build_engine(timeout: Option<u64>) -> Result<PipelineEngine> {
    let cfg = config::config()?;
    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    Ok(PipelineEngine::new(cwd)
        .with_limits(cfg.limits.clone())
        .with_shell(cfg.shell.clone())
        .with_timeout_override(timeout.map(Duration::from_secs))
        .with_runs_dir(cfg.runs_dir()))
}

fn prepare(
    pipeline_ref: &str,
    timeout: Option<u64>,
    bindings: &Bindings,
) -> Result<(PipelineEngine, Pipeline, Environment)> {
    let pipeline = load_pipeline(pipeline_ref, &config::pipelines_dir()?)?;
    let engine = build_engine(timeout)?;
    let env = engine
        .environment(&pipeline, bindings.variables())
        .context("Invalid variable binding")?;
    Ok((engine, pipeline, env))
}

/// Run a pipeline to completion, exiting with the run's exit code
async fn run_pipeline(
    pipeline_ref: &str,
    timeout: Option<u64>,
    dry_run: bool,
    bindings: &Bindings,
    json: bool,
) -> Result<()> {
    let (engine, pipeline, env) = prepare(pipeline_ref, timeout, bindings)?;

    if dry_run {
        let validation = engine.validate(&pipeline, &env);
        report::print_plan(&engine, &pipeline, &validation);
        if validation.is_err() {
            std::process::exit(2);
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, cancelling run");
                cancel.cancel();
            }
        })
    };

    let run = engine.run(&pipeline, &env, cancel).await;
    interrupt.abort();

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        report::print_run(&run);
    }

    if !run.is_success() {
        std::process::exit(run.exit_code());
    }
    Ok(())
}

/// Validate a pipeline and its variable references
async fn validate_pipeline(pipeline_ref: &str, bindings: &Bindings) -> Result<()> {
    let (engine, pipeline, env) = prepare(pipeline_ref, None, bindings)?;

    match engine.validate(&pipeline, &env) {
        Ok(()) => {
            println!(
                "Pipeline '{}' is valid ({} stages, {} steps, {} artifacts)",
                pipeline.name,
                pipeline.stages.len(),
                pipeline.step_count(),
                pipeline.artifacts.len()
            );
            Ok(())
        }
        Err(cause) => {
            eprintln!("Pipeline '{}' is invalid: {}", pipeline.name, cause);
            std::process::exit(2);
        }
    }
}

/// Show the status of a run
async fn show_status(run_id_str: &str, json: bool) -> Result<()> {
    let run_id = Uuid::parse_str(run_id_str)
        .with_context(|| format!("Invalid run ID: {}", run_id_str))?;

    let runs_dir = config::runs_dir()?;
    if !runs_dir.join(run_id.to_string()).is_dir() {
        anyhow::bail!("Run {} not found in {}", run_id, runs_dir.display());
    }

    let store = EventStore::open(&runs_dir, run_id).await?;
    if let Some(run) = store.load_result().await? {
        if json {
            println!("{}", serde_json::to_string_pretty(&run)?);
        } else {
            report::print_run(&run);
        }
        return Ok(());
    }

    // No result yet: the run is still going or the process died
    let events = store.replay().await?;
    let snapshot = RunSnapshot::from_events(&events)
        .with_context(|| format!("No events recorded for run {}", run_id))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    } else {
        report::print_snapshot(&snapshot);
    }
    Ok(())
}

/// One line of the `runs` listing
pub struct RunSummary {
    pub id: Uuid,
    pub pipeline_name: String,
    pub state: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl From<&RunResult> for RunSummary {
    fn from(run: &RunResult) -> Self {
        Self {
            id: run.id,
            pipeline_name: run.pipeline_name.clone(),
            state: run.status.label().to_string(),
            started_at: run.started_at,
        }
    }
}

impl From<RunSnapshot> for RunSummary {
    fn from(snapshot: RunSnapshot) -> Self {
        Self {
            id: snapshot.id,
            pipeline_name: snapshot.pipeline_name,
            state: snapshot.state,
            started_at: snapshot.started_at,
        }
    }
}

/// Summaries of every recorded run, newest first
async fn collect_runs(runs_dir: &Path) -> Result<Vec<RunSummary>> {
    let mut summaries = Vec::new();

    for run_id in EventStore::list_runs(runs_dir).await? {
        let store = EventStore::open(runs_dir, run_id).await?;
        let summary = match store.load_result().await {
            Ok(Some(run)) => Some(RunSummary::from(&run)),
            Ok(None) => RunSnapshot::from_events(&store.replay().await.unwrap_or_default())
                .map(RunSummary::from),
            Err(e) => {
                warn!(%run_id, error = %format!("{:#}", e), "Skipping unreadable run");
                None
            }
        };
        summaries.extend(summary);
    }

    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(summaries)
}

/// List recent runs
async fn list_runs(limit: usize) -> Result<()> {
    let runs = collect_runs(&config::runs_dir()?).await?;

    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    report::print_run_table(runs.iter().take(limit));
    Ok(())
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;
    report::print_config(cfg);
    Ok(())
}

/// Locate and parse a pipeline
///
/// `pipeline_ref` is tried as a file path first, then as a name in
/// `pipelines_dir`, then as `<name>.yaml` in the current directory.
pub fn load_pipeline(pipeline_ref: &str, pipelines_dir: &Path) -> Result<Pipeline> {
    let direct = PathBuf::from(pipeline_ref);
    if direct.is_file() {
        return Pipeline::from_file(&direct);
    }

    let named = pipelines_dir.join(format!("{}.yaml", pipeline_ref));
    if named.is_file() {
        return Pipeline::from_file(&named);
    }

    let local = PathBuf::from(format!("{}.yaml", pipeline_ref));
    if local.is_file() {
        return Pipeline::from_file(&local);
    }

    anyhow::bail!(
        "Pipeline '{}' not found. Looked for:\n  - {}\n  - {}\n  - {}",
        pipeline_ref,
        direct.display(),
        named.display(),
        local.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PIPELINE: &str = "name: image\nstages:\n  - name: build\n    steps:\n      - name: b\n        run: 'true'\n";

    #[test]
    fn test_parse_binding() {
        assert_eq!(
            parse_binding("IMAGE=app:1").unwrap(),
            ("IMAGE".to_string(), "app:1".to_string())
        );
        assert_eq!(
            parse_binding("ARGS=a=b").unwrap(),
            ("ARGS".to_string(), "a=b".to_string())
        );
        assert_eq!(parse_binding("EMPTY=").unwrap().1, "");
        assert!(parse_binding("IMAGE").is_err());
        assert!(parse_binding("=value").is_err());
    }

    #[test]
    fn test_bindings_mark_secrets() {
        let bindings = Bindings {
            vars: vec![("IMAGE".to_string(), "app:1".to_string())],
            secrets: vec![("TOKEN".to_string(), "s3cret".to_string())],
        };

        let vars = bindings.variables();
        assert_eq!(vars.len(), 2);
        assert!(!vars[0].secret);
        assert!(vars[1].secret);
    }

    #[test]
    fn test_load_pipeline_by_path_and_name() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("image.yaml");
        std::fs::write(&path, PIPELINE).unwrap();

        let by_path = load_pipeline(path.to_str().unwrap(), Path::new("/nonexistent")).unwrap();
        assert_eq!(by_path.name, "image");

        let by_name = load_pipeline("image", temp.path()).unwrap();
        assert_eq!(by_name.name, "image");

        let missing = load_pipeline("nope-not-here", temp.path()).unwrap_err();
        assert!(missing.to_string().contains("not found"));
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "gantry",
            "run",
            "image",
            "--timeout",
            "30",
            "--dry-run",
            "--var",
            "IMAGE=app:1",
            "--secret",
            "TOKEN=x",
        ]);

        match cli.command {
            Commands::Run {
                pipeline,
                timeout,
                dry_run,
                bindings,
                json,
            } => {
                assert_eq!(pipeline, "image");
                assert_eq!(timeout, Some(30));
                assert!(dry_run);
                assert!(!json);
                assert_eq!(bindings.vars.len(), 1);
                assert_eq!(bindings.secrets.len(), 1);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_zero_timeout() {
        let parsed = Cli::try_parse_from(["gantry", "run", "image", "--timeout", "0"]);
        assert!(parsed.is_err());
    }

    #[tokio::test]
    async fn test_collect_runs_newest_first() {
        let temp = TempDir::new().unwrap();
        let engine = PipelineEngine::new(temp.path()).with_runs_dir(temp.path().join("runs"));
        let pipeline = Pipeline::from_yaml(PIPELINE).unwrap();

        let first = engine
            .run(&pipeline, &Environment::default(), CancellationToken::new())
            .await;
        let second = engine
            .run(&pipeline, &Environment::default(), CancellationToken::new())
            .await;

        let runs = collect_runs(&temp.path().join("runs")).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, second.id);
        assert_eq!(runs[1].id, first.id);
        assert!(runs.iter().all(|r| r.state == "succeeded"));
    }
}
