//! Core execution logic.
//!
//! This module contains:
//! - Environment: Variable bindings, interpolation and secret flags
//! - Redact: Streaming secret masking and bounded output capture
//! - Runner: Single step execution in a subprocess
//! - Stage: In-order step execution with fail-fast
//! - Engine: Run state machine over all stages
//! - Publisher: Artifact registration after a run
//! - EventStore: Append-only run log

pub mod engine;
pub mod environment;
pub mod event_store;
pub mod limits;
pub mod pipeline;
pub mod publisher;
pub mod redact;
pub mod runner;
pub mod stage;

// Re-export commonly used types
pub use engine::PipelineEngine;
pub use environment::{Environment, EnvironmentBuilder, EnvironmentError, Variable};
pub use event_store::EventStore;
pub use limits::{LimitError, LimitOverrides, Limits, LimitViolation, RunBudget};
pub use pipeline::{DefinitionError, Pipeline, ReferenceError, Stage, Step, VariableDecl};
pub use publisher::ArtifactPublisher;
pub use redact::{OutputCapture, Redactor, MASK};
pub use runner::StepRunner;
pub use stage::{NoopObserver, StageExecutor, StepObserver};
