//! Domain types for the gantry engine.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of state changes
//! - Run: Run, stage and step results
//! - Artifact: Published files and publish warnings

pub mod artifact;
pub mod events;
pub mod run;

// Re-export commonly used types
pub use artifact::{ArtifactRecord, PublishOutcome, PublishWarning};
pub use events::{Event, EventType};
pub use run::{
    AbortCause, RunResult, RunSnapshot, RunStatus, StageResult, StageStatus, StepError,
    StepResult,
};
