//! Artifacts registered after a run.
//!
//! Each declared output file either becomes an [`ArtifactRecord`] or, when it
//! is missing, a [`PublishWarning`]. Neither affects the run status.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A published output file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Logical name from the pipeline definition
    pub name: String,

    /// Resolved path of the file
    pub path: PathBuf,

    /// Size in bytes
    pub size_bytes: u64,

    /// Hex-encoded SHA-256 of the content
    pub sha256: String,

    /// When the artifact was registered
    pub published_at: DateTime<Utc>,
}

/// A declared artifact that could not be published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishWarning {
    /// Logical name from the pipeline definition
    pub name: String,

    /// Path or pattern that was checked
    pub path: String,

    /// Why nothing was published
    pub reason: String,
}

/// Result of publishing one artifact file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PublishOutcome {
    Published(ArtifactRecord),
    Warning(PublishWarning),
}

impl PublishOutcome {
    /// The record, if this outcome published a file
    pub fn record(&self) -> Option<&ArtifactRecord> {
        match self {
            Self::Published(record) => Some(record),
            Self::Warning(_) => None,
        }
    }

    /// The warning, if this outcome published nothing
    pub fn warning(&self) -> Option<&PublishWarning> {
        match self {
            Self::Published(_) => None,
            Self::Warning(warning) => Some(warning),
        }
    }

    /// Logical artifact name
    pub fn name(&self) -> &str {
        match self {
            Self::Published(record) => &record.name,
            Self::Warning(warning) => &warning.name,
        }
    }
}
