//! Artifact publishing.
//!
//! Runs after the stages of a run. Every declared artifact is resolved,
//! checked for existence and registered with its size and SHA-256 digest.
//! A missing file is a [`PublishWarning`], never an error.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use glob::Pattern;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;
use tracing::{info, instrument, warn};

use crate::domain::{ArtifactRecord, PublishOutcome, PublishWarning, RunResult, RunStatus};

use super::environment::Environment;
use super::pipeline::Pipeline;

const HASH_CHUNK: usize = 64 * 1024;

/// Registers the output files a pipeline declares
pub struct ArtifactPublisher {
    working_dir: PathBuf,
}

impl ArtifactPublisher {
    /// Relative artifact paths are resolved against `working_dir`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    /// Publish every declared artifact of `pipeline`
    ///
    /// Runs that were aborted by a configuration error publish nothing.
    #[instrument(skip_all, fields(pipeline = %pipeline.name, run_id = %run.id))]
    pub async fn publish(
        &self,
        pipeline: &Pipeline,
        env: &Environment,
        run: &RunResult,
    ) -> Vec<PublishOutcome> {
        if let RunStatus::Aborted { cause } = &run.status {
            if cause.is_configuration_error() {
                return Vec::new();
            }
        }

        let mut outcomes = Vec::new();
        // BTreeMap iteration is already sorted by logical name
        for (name, template) in &pipeline.artifacts {
            outcomes.extend(self.publish_one(name, template, env).await);
        }
        outcomes
    }

    async fn publish_one(
        &self,
        name: &str,
        template: &str,
        env: &Environment,
    ) -> Vec<PublishOutcome> {
        let resolved = match env.resolve(template) {
            Ok(resolved) => resolved,
            Err(e) => return vec![self.warning(name, template, e.to_string())],
        };

        let path = self.working_dir.join(&resolved);
        let shown = env.redactor().redact(&path.to_string_lossy());

        if !is_pattern(&resolved) {
            return vec![match self.record(name, &path, env).await {
                Ok(outcome) => outcome,
                Err(e) => self.warning(name, &shown, format!("{:#}", e)),
            }];
        }

        // Only the resolved template is a pattern, the working directory is literal
        let pattern = if Path::new(&resolved).is_absolute() {
            resolved.clone()
        } else {
            let base = Pattern::escape(&self.working_dir.to_string_lossy());
            Path::new(&base).join(&resolved).to_string_lossy().into_owned()
        };
        let matches = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => return vec![self.warning(name, &shown, format!("invalid pattern: {}", e))],
        };

        let mut outcomes = Vec::new();
        for entry in matches {
            match entry {
                Ok(found) => match self.record(name, &found, env).await {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => {
                        let shown = env.redactor().redact(&found.to_string_lossy());
                        outcomes.push(self.warning(name, &shown, format!("{:#}", e)));
                    }
                },
                Err(e) => {
                    let shown = env.redactor().redact(&e.path().to_string_lossy());
                    outcomes.push(self.warning(name, &shown, e.error().to_string()));
                }
            }
        }

        if outcomes.is_empty() {
            outcomes.push(self.warning(name, &shown, "no files match pattern".to_string()));
        }
        outcomes
    }

    /// Stat and hash one file
    async fn record(&self, name: &str, path: &Path, env: &Environment) -> Result<PublishOutcome> {
        let shown = env.redactor().redact(&path.to_string_lossy());

        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(self.warning(name, &shown, "file not found".to_string()));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", shown));
            }
        };

        if !metadata.is_file() {
            return Ok(self.warning(name, &shown, "not a regular file".to_string()));
        }

        let sha256 = sha256_file(path)
            .await
            .with_context(|| format!("Failed to hash {}", shown))?;

        info!(artifact = %name, path = %shown, size = metadata.len(), "Artifact published");

        Ok(PublishOutcome::Published(ArtifactRecord {
            name: name.to_string(),
            path: PathBuf::from(shown),
            size_bytes: metadata.len(),
            sha256,
            published_at: Utc::now(),
        }))
    }

    fn warning(&self, name: &str, path: &str, reason: String) -> PublishOutcome {
        warn!(artifact = %name, path = %path, reason = %reason, "Artifact not published");
        PublishOutcome::Warning(PublishWarning {
            name: name.to_string(),
            path: path.to_string(),
            reason,
        })
    }
}

fn is_pattern(path: &str) -> bool {
    path.contains(|c: char| matches!(c, '*' | '?' | '['))
}

/// Hex-encoded SHA-256 of a file's content
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}
