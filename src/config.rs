//! Configuration for gantry.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (GANTRY_HOME, GANTRY_PIPELINES)
//! 2. Config file (.gantry/config.yaml)
//! 3. Defaults (~/.gantry)
//!
//! Config file discovery:
//! - Searches current directory and parents for .gantry/config.yaml
//! - `paths.home` is relative to the .gantry/ directory, `paths.pipelines`
//!   to the project root (the parent of .gantry/)

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::limits::{LimitOverrides, Limits};
use crate::core::runner::default_shell;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub limits: LimitOverrides,
    /// Default shell invocation, e.g. `["bash", "-c"]`
    #[serde(default)]
    pub shell: Option<Vec<String>>,
    /// Extra sensitive-name patterns, added to the built-in ones
    #[serde(default)]
    pub sensitive_patterns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .gantry/)
    pub home: Option<String>,
    /// Pipeline definitions directory (relative to the project root)
    pub pipelines: Option<String>,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Absolute path to gantry home (run logs)
    pub home: PathBuf,
    /// Directory searched for `<name>.yaml` pipelines
    pub pipelines: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    /// Default limits for pipelines that declare none
    pub limits: Limits,
    /// Default shell invocation
    pub shell: Vec<String>,
}

impl ResolvedConfig {
    /// `$GANTRY_HOME/runs`
    pub fn runs_dir(&self) -> PathBuf {
        self.home.join("runs")
    }
}

/// Environment variable overrides
#[derive(Debug, Clone, Default)]
struct EnvOverrides {
    home: Option<String>,
    pipelines: Option<String>,
}

impl EnvOverrides {
    fn from_process() -> Self {
        Self {
            home: std::env::var("GANTRY_HOME").ok(),
            pipelines: std::env::var("GANTRY_PIPELINES").ok(),
        }
    }
}

/// Find config file by searching `start` and its parents
fn find_config_file(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();

    loop {
        let config_path = current.join(".gantry").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to `base`
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn resolve_limits(file: &ConfigFile) -> Result<Limits> {
    file.limits.validate().context("Invalid limits in config file")?;

    let mut limits = Limits::default().overlay(&file.limits);
    limits.extend_sensitive_patterns(&file.sensitive_patterns);
    Ok(limits)
}

/// Combine the config file (if any), env overrides and defaults
fn resolve(
    config_file: Option<PathBuf>,
    overrides: EnvOverrides,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let file = match config_file {
        Some(ref path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // .gantry/ and the project root above it
    let gantry_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);
    let project_root = gantry_dir
        .as_deref()
        .and_then(Path::parent)
        .map(Path::to_path_buf);

    let home = match (overrides.home, &file.paths.home, &gantry_dir) {
        (Some(env_home), _, _) => PathBuf::from(env_home),
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home,
    };

    let pipelines = match (overrides.pipelines, &file.paths.pipelines, &project_root) {
        (Some(env_pipelines), _, _) => PathBuf::from(env_pipelines),
        (None, Some(pipelines), Some(root)) => resolve_path(root, pipelines),
        _ => home.join("pipelines"),
    };

    let limits = resolve_limits(&file)?;
    let shell = file.shell.clone().unwrap_or_else(default_shell);

    Ok(ResolvedConfig {
        home,
        pipelines,
        config_file,
        limits,
        shell,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".gantry");

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;

    resolve(
        find_config_file(&cwd),
        EnvOverrides::from_process(),
        default_home,
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Get the runs directory ($GANTRY_HOME/runs)
pub fn runs_dir() -> Result<PathBuf> {
    Ok(config()?.runs_dir())
}

/// Get the pipelines directory
pub fn pipelines_dir() -> Result<PathBuf> {
    Ok(config()?.pipelines.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_config(root: &Path, content: &str) -> PathBuf {
        let gantry_dir = root.join(".gantry");
        std::fs::create_dir_all(&gantry_dir).unwrap();
        let config_path = gantry_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "{}", content).unwrap();
        config_path
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, EnvOverrides::default(), PathBuf::from("/home/ci/.gantry"))
            .unwrap();

        assert_eq!(config.home, PathBuf::from("/home/ci/.gantry"));
        assert_eq!(config.pipelines, PathBuf::from("/home/ci/.gantry/pipelines"));
        assert_eq!(config.runs_dir(), PathBuf::from("/home/ci/.gantry/runs"));
        assert!(config.config_file.is_none());
        assert_eq!(config.shell, default_shell());
        assert_eq!(config.limits.step_timeout_seconds, 300);
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(
            temp.path(),
            r#"
version: "1.0"
paths:
  home: ./state
  pipelines: ci
limits:
  step_timeout_seconds: 60
  max_output_bytes: 4096
shell: [bash, -c]
sensitive_patterns:
  - "*_PAT"
"#,
        );

        let file = load_config_file(&config_path).unwrap();
        assert_eq!(file.version.as_deref(), Some("1.0"));
        assert_eq!(file.paths.home.as_deref(), Some("./state"));

        let config = resolve(
            Some(config_path),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(config.home, temp.path().join(".gantry").join("./state"));
        assert_eq!(config.pipelines, temp.path().join("ci"));
        assert_eq!(config.limits.step_timeout_seconds, 60);
        assert_eq!(config.limits.run_timeout_seconds, 3600);
        assert_eq!(config.limits.max_output_bytes, 4096);
        assert_eq!(config.shell, vec!["bash".to_string(), "-c".to_string()]);
        assert!(config.limits.is_sensitive_name("GITHUB_PAT"));
        assert!(config.limits.is_sensitive_name("DB_PASSWORD"));
    }

    #[test]
    fn test_zero_timeout_in_config_rejected() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "limits:\n  step_timeout_seconds: 0\n");

        let err = resolve(
            Some(config_path),
            EnvOverrides::default(),
            PathBuf::from("/unused"),
        )
        .unwrap_err();

        assert!(format!("{:#}", err).contains("step_timeout_seconds"));
    }

    #[test]
    fn test_env_overrides_win() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "paths:\n  home: ./state\n");

        let config = resolve(
            Some(config_path),
            EnvOverrides {
                home: Some("/srv/gantry".to_string()),
                pipelines: Some("/srv/pipelines".to_string()),
            },
            PathBuf::from("/unused"),
        )
        .unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/gantry"));
        assert_eq!(config.pipelines, PathBuf::from("/srv/pipelines"));
    }

    #[test]
    fn test_find_config_file_in_parent() {
        let temp = TempDir::new().unwrap();
        let config_path = write_config(temp.path(), "version: \"1.0\"");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file(&nested), Some(config_path));
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
