//! Step runner: executes one shell step in a fresh subprocess.
//!
//! All subprocess output passes through a [`Redactor`] before it is
//! captured or logged, so secret values never leave this module verbatim.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::domain::{StepError, StepResult};

use super::environment::Environment;
use super::limits::Limits;
use super::pipeline::Step;
use super::redact::{OutputCapture, Redactor};

/// How long readers may keep draining after the process is gone
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Read buffer size for subprocess pipes
const READ_CHUNK: usize = 8 * 1024;

/// Longest line forwarded to the log before it is split
const MAX_LOG_LINE: usize = 8 * 1024;

/// Default shell invocation (`sh -c <command>`)
pub fn default_shell() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}

/// Runs single steps as shell subprocesses
#[derive(Debug, Clone)]
pub struct StepRunner {
    /// Program and leading arguments; the resolved command is appended
    shell: Vec<String>,

    /// Directory the subprocess starts in
    working_dir: PathBuf,

    /// Captured output cap per step
    max_output_bytes: usize,
}

impl StepRunner {
    /// Create a runner using `sh -c` in `working_dir`
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            shell: default_shell(),
            working_dir: working_dir.into(),
            max_output_bytes: Limits::default().max_output_bytes,
        }
    }

    /// Use a different shell invocation
    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    /// Change the captured output cap
    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Directory steps run in
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Execute `step` and report what happened
    ///
    /// Never returns an error: spawn failures, timeouts and cancellation
    /// are recorded in the [`StepResult`].
    #[instrument(skip_all, fields(step = %step.name))]
    pub async fn run(
        &self,
        step: &Step,
        env: &Environment,
        step_timeout: Duration,
        cancel: &CancellationToken,
    ) -> StepResult {
        let started = Instant::now();
        let redactor = env.redactor();

        if cancel.is_cancelled() {
            return finish(step, started, None, Captured::default(), Some(StepError::Cancelled));
        }

        let command = match env.resolve(&step.run) {
            Ok(command) => command,
            Err(e) => {
                let error = StepError::Spawn {
                    message: redactor.redact(&e.to_string()),
                };
                return finish(step, started, None, Captured::default(), Some(error));
            }
        };

        let Some((program, args)) = self.shell.split_first() else {
            let error = StepError::Spawn {
                message: "shell invocation is empty".to_string(),
            };
            return finish(step, started, None, Captured::default(), Some(error));
        };

        debug!(timeout_ms = step_timeout.as_millis() as u64, "Spawning step");

        let mut child = match Command::new(program)
            .args(args)
            .arg(&command)
            .current_dir(&self.working_dir)
            .envs(env.exports())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %program, error = %e, "Failed to spawn step process");
                let error = StepError::Spawn {
                    message: redactor.redact(&format!("{}: {}", program, e)),
                };
                return finish(step, started, None, Captured::default(), Some(error));
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(pump(
                stdout,
                redactor.clone(),
                OutputStream::Stdout,
                tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(
                stderr,
                redactor.clone(),
                OutputStream::Stderr,
                tx.clone(),
            )));
        }
        drop(tx);

        let mut sink = OutputSink::new(self.max_output_bytes, redactor);
        let deadline = sleep(step_timeout);
        tokio::pin!(deadline);
        let mut output_open = true;

        let ending = loop {
            tokio::select! {
                chunk = rx.recv(), if output_open => match chunk {
                    Some((stream, bytes)) => sink.push(stream, &bytes),
                    None => output_open = false,
                },
                status = child.wait() => break Ending::Exited(status),
                () = &mut deadline => break Ending::TimedOut,
                () = cancel.cancelled() => break Ending::Cancelled,
            }
        };

        if matches!(ending, Ending::TimedOut | Ending::Cancelled) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill step process");
            }
        }

        let drained = timeout(DRAIN_GRACE, async {
            while let Some((stream, bytes)) = rx.recv().await {
                sink.push(stream, &bytes);
            }
        })
        .await;
        if drained.is_err() {
            debug!("Output pipes still open after process exit, abandoning readers");
        }
        for reader in &readers {
            reader.abort();
        }

        let captured = sink.finish();
        let (exit_code, error) = match ending {
            Ending::Exited(Ok(status)) => (status.code(), None),
            Ending::Exited(Err(e)) => (
                None,
                Some(StepError::Spawn {
                    message: format!("failed to wait for process: {}", e),
                }),
            ),
            Ending::TimedOut => (
                None,
                Some(StepError::Timeout {
                    limit_ms: step_timeout.as_millis() as u64,
                }),
            ),
            Ending::Cancelled => (None, Some(StepError::Cancelled)),
        };

        finish(step, started, exit_code, captured, error)
    }
}

/// Decide the failure flag and build the result
fn finish(
    step: &Step,
    started: Instant,
    exit_code: Option<i32>,
    captured: Captured,
    error: Option<StepError>,
) -> StepResult {
    let failed = match &error {
        Some(StepError::Spawn { .. }) | Some(StepError::Cancelled) => true,
        Some(StepError::Timeout { .. }) => !step.continue_on_error,
        None => exit_code != Some(0) && !step.continue_on_error,
    };

    let result = StepResult {
        name: step.name.clone(),
        command: step.run.clone(),
        exit_code,
        output: captured.output,
        truncated: captured.truncated,
        duration_ms: started.elapsed().as_millis() as u64,
        failed,
        continue_on_error: step.continue_on_error,
        error,
    };

    if result.failed {
        warn!(
            exit_code = ?result.exit_code,
            error = ?result.error,
            duration_ms = result.duration_ms,
            "Step failed"
        );
    } else if result.suppressed() {
        warn!(
            exit_code = ?result.exit_code,
            error = ?result.error,
            duration_ms = result.duration_ms,
            "Step failed, continuing (continue_on_error)"
        );
    } else {
        info!(duration_ms = result.duration_ms, "Step succeeded");
    }

    result
}

/// How the wait loop ended
enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Read a pipe to EOF, forwarding only redacted bytes
async fn pump<R>(
    mut reader: R,
    mut redactor: Redactor,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, Vec<u8>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let safe = redactor.push(&buf[..n]);
                if !safe.is_empty() && tx.send((stream, safe)).is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!(stream = stream.as_str(), error = %e, "Output stream read failed");
                break;
            }
        }
    }

    let tail = redactor.finish();
    if !tail.is_empty() {
        let _ = tx.send((stream, tail));
    }
}

#[derive(Debug, Default)]
struct Captured {
    output: String,
    truncated: bool,
}

/// Collects redacted output and forwards complete lines to the log
///
/// Each pipe is redacted on its own, which cannot see a secret written half
/// to stdout and half to stderr. The interleaved capture therefore goes
/// through its own redactor as well.
struct OutputSink {
    capture: OutputCapture,
    merged: Redactor,
    stdout_line: Vec<u8>,
    stderr_line: Vec<u8>,
}

impl OutputSink {
    fn new(max_output_bytes: usize, merged: Redactor) -> Self {
        Self {
            capture: OutputCapture::new(max_output_bytes),
            merged,
            stdout_line: Vec::new(),
            stderr_line: Vec::new(),
        }
    }

    fn push(&mut self, stream: OutputStream, bytes: &[u8]) {
        let safe = self.merged.push(bytes);
        self.capture.push(&safe);

        let line = match stream {
            OutputStream::Stdout => &mut self.stdout_line,
            OutputStream::Stderr => &mut self.stderr_line,
        };
        for &byte in bytes {
            if byte == b'\n' {
                emit_line(stream, line);
                line.clear();
            } else {
                line.push(byte);
                if line.len() >= MAX_LOG_LINE {
                    emit_line(stream, line);
                    line.clear();
                }
            }
        }
    }

    fn finish(mut self) -> Captured {
        if !self.stdout_line.is_empty() {
            emit_line(OutputStream::Stdout, &self.stdout_line);
            self.stdout_line.clear();
        }
        if !self.stderr_line.is_empty() {
            emit_line(OutputStream::Stderr, &self.stderr_line);
            self.stderr_line.clear();
        }
        let tail = self.merged.finish();
        self.capture.push(&tail);

        Captured {
            truncated: self.capture.truncated(),
            output: self.capture.into_string(),
        }
    }
}

fn emit_line(stream: OutputStream, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    info!(target: "gantry::output", stream = stream.as_str(), "{}", text.trim_end_matches('\r'));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::environment::Variable;
    use tempfile::TempDir;

    fn step(run: &str) -> Step {
        Step {
            name: "test".to_string(),
            run: run.to_string(),
            continue_on_error: false,
            timeout_seconds: None,
        }
    }

    fn secret_env() -> Environment {
        Environment::new([
            Variable::new("IMAGE", "app:1"),
            Variable::secret("REGISTRY_PASSWORD", "hunter2-s3cret"),
        ])
        .unwrap()
    }

    async fn run(runner: &StepRunner, step: &Step, env: &Environment) -> StepResult {
        runner
            .run(step, env, Duration::from_secs(10), &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_successful_step_captures_output() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());

        let result = run(&runner, &step("echo building ${IMAGE}"), &secret_env()).await;

        assert_eq!(result.exit_code, Some(0));
        assert!(!result.failed);
        assert!(result.error.is_none());
        assert_eq!(result.output, "building app:1\n");
        assert_eq!(result.command, "echo building ${IMAGE}");
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());

        let result = run(&runner, &step("exit 3"), &Environment::default()).await;

        assert_eq!(result.exit_code, Some(3));
        assert!(result.failed);
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_exit_code() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());
        let mut scan = step("echo findings; exit 1");
        scan.continue_on_error = true;

        let result = run(&runner, &scan, &Environment::default()).await;

        assert_eq!(result.exit_code, Some(1));
        assert!(!result.failed);
        assert!(result.suppressed());
    }

    #[tokio::test]
    async fn test_secret_redacted_from_stdout_and_stderr() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());
        let login = step("echo login ${REGISTRY_PASSWORD}; echo \"$REGISTRY_PASSWORD\" >&2");

        let result = run(&runner, &login, &secret_env()).await;

        assert!(!result.output.contains("hunter2-s3cret"));
        assert_eq!(result.output.matches("****").count(), 2);
    }

    #[tokio::test]
    async fn test_secret_split_across_writes_is_redacted() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());
        let split = step("printf '%s' hunter2; sleep 0.2; printf '%s\\n' -s3cret");

        let result = run(&runner, &split, &secret_env()).await;

        assert!(!result.output.contains("hunter2-s3cret"));
        assert_eq!(result.output, "****\n");
    }

    #[tokio::test]
    async fn test_secret_split_across_streams_is_redacted() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());
        let split = step("printf '%s' hunter2-; exec 1>&-; sleep 0.3; printf '%s' s3cret >&2");

        let result = run(&runner, &split, &secret_env()).await;

        assert!(!result.output.contains("hunter2-s3cret"));
        assert_eq!(result.output, "****");
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());

        let started = Instant::now();
        let result = runner
            .run(
                &step("exec sleep 30"),
                &Environment::default(),
                Duration::from_millis(200),
                &CancellationToken::new(),
            )
            .await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(result.failed);
        assert_eq!(result.exit_code, None);
        assert_eq!(result.error, Some(StepError::Timeout { limit_ms: 200 }));
    }

    #[tokio::test]
    async fn test_spawn_error_ignores_continue_on_error() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path())
            .with_shell(vec!["/nonexistent/gantry-shell".to_string(), "-c".to_string()]);
        let mut tolerant = step("true");
        tolerant.continue_on_error = true;

        let result = run(&runner, &tolerant, &Environment::default()).await;

        assert!(result.failed);
        assert!(matches!(result.error, Some(StepError::Spawn { .. })));
        assert_eq!(result.exit_code, None);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner
            .run(&step("true"), &Environment::default(), Duration::from_secs(5), &cancel)
            .await;

        assert!(result.failed);
        assert_eq!(result.error, Some(StepError::Cancelled));
    }

    #[tokio::test]
    async fn test_runs_in_working_dir() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path());

        let result = run(&runner, &step("echo report > report.html"), &Environment::default()).await;

        assert!(!result.failed);
        assert!(temp.path().join("report.html").exists());
    }

    #[tokio::test]
    async fn test_output_truncated_to_limit() {
        let temp = TempDir::new().unwrap();
        let runner = StepRunner::new(temp.path()).with_max_output_bytes(16);

        let result = run(
            &runner,
            &step("for i in 1 2 3 4 5 6 7 8; do echo line$i; done"),
            &Environment::default(),
        )
        .await;

        assert!(result.truncated);
        assert!(result.output.len() <= 16);
        assert!(result.output.ends_with("line8\n"));
    }
}
