//! Execution limits and sensitive-name detection.
//!
//! Prevents runaway execution through configurable limits on:
//! - Per-step timeouts
//! - Total run duration
//! - Captured output size
//!
//! Also holds the name patterns that mark a variable as sensitive even when
//! it was not declared `secret`.

use std::time::{Duration, Instant};

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Limits applied to a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    /// Default per-step timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_step_timeout")]
    pub step_timeout_seconds: u64,

    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Maximum captured output per step in bytes (default: 1MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Glob patterns over variable names that are always treated as secret
    #[serde(default = "default_sensitive_patterns")]
    pub sensitive_patterns: Vec<String>,
}

fn default_step_timeout() -> u64 {
    300
} // 5 min
fn default_run_timeout() -> u64 {
    3600
} // 1 hour
fn default_max_output_bytes() -> usize {
    1024 * 1024
} // 1MB

fn default_sensitive_patterns() -> Vec<String> {
    vec![
        "*PASSWORD*".to_string(),
        "*PASSWD*".to_string(),
        "*SECRET*".to_string(),
        "*TOKEN*".to_string(),
        "*CREDENTIAL*".to_string(),
        "*API_KEY*".to_string(),
    ]
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            step_timeout_seconds: default_step_timeout(),
            run_timeout_seconds: default_run_timeout(),
            max_output_bytes: default_max_output_bytes(),
            sensitive_patterns: default_sensitive_patterns(),
        }
    }
}

/// Partial limits from a pipeline or config file
///
/// Unset fields inherit from the layer below. Sensitive patterns only ever
/// add to the inherited list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sensitive_patterns: Vec<String>,
}

impl LimitOverrides {
    /// Reject timeouts that would fail every step immediately
    pub fn validate(&self) -> Result<(), LimitError> {
        if self.step_timeout_seconds == Some(0) {
            return Err(LimitError::ZeroTimeout {
                field: "step_timeout_seconds",
            });
        }
        if self.run_timeout_seconds == Some(0) {
            return Err(LimitError::ZeroTimeout {
                field: "run_timeout_seconds",
            });
        }
        Ok(())
    }
}

impl Limits {
    /// Layer `overrides` on top of these limits
    pub fn overlay(&self, overrides: &LimitOverrides) -> Limits {
        let mut limits = self.clone();
        if let Some(seconds) = overrides.step_timeout_seconds {
            limits.step_timeout_seconds = seconds;
        }
        if let Some(seconds) = overrides.run_timeout_seconds {
            limits.run_timeout_seconds = seconds;
        }
        if let Some(bytes) = overrides.max_output_bytes {
            limits.max_output_bytes = bytes;
        }
        limits.extend_sensitive_patterns(&overrides.sensitive_patterns);
        limits
    }

    /// Add patterns not already present
    pub fn extend_sensitive_patterns(&mut self, patterns: &[String]) {
        for pattern in patterns {
            if !self.sensitive_patterns.contains(pattern) {
                self.sensitive_patterns.push(pattern.clone());
            }
        }
    }

    /// Check if a variable name matches any sensitive pattern (case-insensitive)
    pub fn is_sensitive_name(&self, name: &str) -> bool {
        is_sensitive_name(self.sensitive_patterns.as_slice(), name)
    }

    /// Default step timeout as a duration
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_seconds)
    }

    /// Run timeout as a duration
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_seconds)
    }
}

/// Match a name against glob patterns, ignoring case
pub fn is_sensitive_name<S: AsRef<str>>(patterns: &[S], name: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: false,
        ..Default::default()
    };

    patterns.iter().any(|pattern_str| {
        Pattern::new(pattern_str.as_ref())
            .map(|pattern| pattern.matches_with(name, options))
            .unwrap_or(false)
    })
}

/// Tracks the time budget of one run
#[derive(Debug, Clone)]
pub struct RunBudget {
    /// When the run started
    started_at: Instant,

    /// Total allowed duration
    limit: Duration,
}

impl RunBudget {
    /// Start tracking a run with the given total duration
    pub fn start(limit: Duration) -> Self {
        Self {
            started_at: Instant::now(),
            limit,
        }
    }

    /// Time left before the run exceeds its budget
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started_at.elapsed())
    }

    /// Cap a step timeout to what is left of the run
    pub fn cap(&self, timeout: Duration) -> Duration {
        timeout.min(self.remaining())
    }

    /// Fail once the budget is spent
    pub fn check(&self) -> Result<(), LimitViolation> {
        let elapsed = self.started_at.elapsed();
        if elapsed >= self.limit {
            return Err(LimitViolation::RunTimeout {
                elapsed_seconds: elapsed.as_secs(),
                limit_seconds: self.limit.as_secs(),
            });
        }
        Ok(())
    }
}

/// Invalid limit settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimitError {
    #[error("{field} must be greater than zero")]
    ZeroTimeout { field: &'static str },
}

/// Limit violation errors
#[derive(Debug, Clone, Error)]
pub enum LimitViolation {
    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
