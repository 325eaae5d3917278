//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML and consist of ordered stages, each holding
//! ordered shell steps, plus the artifact files the run is expected to leave
//! behind.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::environment::{is_valid_name, Environment, EnvironmentError};
use super::limits::{LimitError, LimitOverrides, Limits};

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI and run records)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Directory steps run in and artifact paths are relative to
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Shell invocation prefix, e.g. `["bash", "-c"]` (engine default if unset)
    #[serde(default)]
    pub shell: Option<Vec<String>>,

    /// Limits layered over the engine defaults
    #[serde(default)]
    pub limits: LimitOverrides,

    /// Declared variables
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,

    /// Ordered list of stages to execute
    pub stages: Vec<Stage>,

    /// Expected output files: logical name -> path template
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Invalid pipeline file: {}", path.display()))
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the structure of the definition
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.name.trim().is_empty() {
            return Err(DefinitionError::EmptyName);
        }

        if self.stages.is_empty() {
            return Err(DefinitionError::NoStages);
        }

        if let Some(shell) = &self.shell {
            if shell.is_empty() {
                return Err(DefinitionError::EmptyShell);
            }
        }

        self.limits.validate()?;

        for name in self.variables.keys() {
            if !is_valid_name(name) {
                return Err(DefinitionError::InvalidVariableName { name: name.clone() });
            }
        }

        let mut stage_names = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.trim().is_empty() {
                return Err(DefinitionError::EmptyStageName { index: i });
            }
            if !stage_names.insert(stage.name.as_str()) {
                return Err(DefinitionError::DuplicateStage {
                    stage: stage.name.clone(),
                });
            }
            if stage.steps.is_empty() {
                return Err(DefinitionError::EmptyStage {
                    stage: stage.name.clone(),
                });
            }

            let mut step_names = HashSet::new();
            for (j, step) in stage.steps.iter().enumerate() {
                if step.name.trim().is_empty() {
                    return Err(DefinitionError::EmptyStepName {
                        stage: stage.name.clone(),
                        index: j,
                    });
                }
                if !step_names.insert(step.name.as_str()) {
                    return Err(DefinitionError::DuplicateStep {
                        stage: stage.name.clone(),
                        step: step.name.clone(),
                    });
                }
                if step.run.trim().is_empty() {
                    return Err(DefinitionError::EmptyCommand {
                        stage: stage.name.clone(),
                        step: step.name.clone(),
                    });
                }
                if step.timeout_seconds == Some(0) {
                    return Err(DefinitionError::ZeroTimeout {
                        stage: stage.name.clone(),
                        step: step.name.clone(),
                    });
                }
            }
        }

        for (name, path) in &self.artifacts {
            if name.trim().is_empty() || path.trim().is_empty() {
                return Err(DefinitionError::EmptyArtifact { name: name.clone() });
            }
        }

        Ok(())
    }

    /// Check that every step command and artifact path resolves against `env`
    pub fn check_references(&self, env: &Environment) -> Result<(), ReferenceError> {
        for stage in &self.stages {
            for step in &stage.steps {
                env.check(&step.run).map_err(|source| ReferenceError {
                    location: format!("stage '{}' step '{}'", stage.name, step.name),
                    source,
                })?;
            }
        }

        for (name, path) in &self.artifacts {
            env.check(path).map_err(|source| ReferenceError {
                location: format!("artifact '{}'", name),
                source,
            })?;
        }

        Ok(())
    }

    /// Total number of steps across all stages
    pub fn step_count(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    /// Working directory resolved against `base`
    pub fn working_dir(&self, base: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => base.join(dir),
            None => base.to_path_buf(),
        }
    }
}

/// An ordered group of steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// When true, a failure here does not abort the pipeline
    #[serde(default)]
    pub best_effort: bool,

    /// Ordered list of steps
    pub steps: Vec<Step>,
}

/// A single shell command in a stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step name (unique within stage)
    pub name: String,

    /// Command template, `${NAME}` references are interpolated
    pub run: String,

    /// Record a nonzero exit (or timeout) without failing the stage
    #[serde(default)]
    pub continue_on_error: bool,

    /// Override timeout for this step (uses limits.step_timeout_seconds if not set)
    pub timeout_seconds: Option<u64>,
}

impl Step {
    /// Get the effective timeout for this step
    pub fn timeout(&self, limits: &Limits) -> Duration {
        let seconds = self.timeout_seconds.unwrap_or(limits.step_timeout_seconds);
        Duration::from_secs(seconds)
    }
}

/// Source of a declared variable
///
/// Supports multiple YAML formats:
/// - Simple: `IMAGE: app:latest`
/// - Inline: `IMAGE: { value: app:latest, secret: false }`
/// - Host environment: `REGISTRY_PASSWORD: { env: CI_REGISTRY_PASSWORD, secret: true }`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VariableDecl {
    /// Literal value
    Plain(String),

    /// Literal value with flags
    Value {
        value: String,
        #[serde(default)]
        secret: bool,
    },

    /// Read from the host process environment when the run is prepared
    FromEnv {
        env: String,
        #[serde(default)]
        secret: bool,
    },
}

/// Structural problems in a pipeline definition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    #[error("Pipeline name cannot be empty")]
    EmptyName,

    #[error("Pipeline must have at least one stage")]
    NoStages,

    #[error("Shell invocation cannot be empty")]
    EmptyShell,

    #[error("Invalid variable name '{name}'")]
    InvalidVariableName { name: String },

    #[error("Stage {index} has an empty name")]
    EmptyStageName { index: usize },

    #[error("Stage '{stage}' is declared more than once")]
    DuplicateStage { stage: String },

    #[error("Stage '{stage}' has no steps")]
    EmptyStage { stage: String },

    #[error("Step {index} in stage '{stage}' has an empty name")]
    EmptyStepName { stage: String, index: usize },

    #[error("Step '{step}' is declared more than once in stage '{stage}'")]
    DuplicateStep { stage: String, step: String },

    #[error("Step '{step}' in stage '{stage}' has an empty command")]
    EmptyCommand { stage: String, step: String },

    #[error("Step '{step}' in stage '{stage}' has a zero timeout")]
    ZeroTimeout { stage: String, step: String },

    #[error("Artifact '{name}' has an empty name or path")]
    EmptyArtifact { name: String },

    #[error("Invalid limits: {0}")]
    Limits(#[from] LimitError),
}

/// A template that does not resolve, with where it was found
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{location}: {source}")]
pub struct ReferenceError {
    pub location: String,
    #[source]
    pub source: EnvironmentError,
}
