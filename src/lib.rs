//! gantry - Sequential stage pipeline runner
//!
//! Runs pipelines of ordered stages, each made of ordered shell steps, with
//! secret redaction, per-step timeouts and tolerant artifact publishing.
//!
//! # Architecture
//!
//! - `PipelineEngine` drives a run through `Pending -> Running -> {Succeeded,
//!   Failed, Aborted}` and returns a [`RunResult`]
//! - `StageExecutor` runs the steps of one stage and stops at the first failure
//! - `StepRunner` executes one step and masks secret values in its output
//! - `ArtifactPublisher` registers output files after the stages finish
//! - Every transition is appended to a JSONL event log per run
//!
//! # Modules
//!
//! - `core`: Execution logic (Environment, Runner, Engine, EventStore)
//! - `domain`: Data structures (RunResult, Event, ArtifactRecord)
//! - `config`: Path and default resolution
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! gantry run image --var IMAGE=app:1 --secret REGISTRY_PASSWORD=...
//!
//! # Show the plan without executing
//! gantry run image --dry-run
//!
//! # Check run status
//! gantry status <run-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Environment, Pipeline, PipelineEngine, Variable};
pub use domain::{
    AbortCause, Event, EventType, PublishOutcome, RunResult, RunStatus, StageResult,
    StageStatus, StepError, StepResult,
};
