//! Process runner: executes a project's entry script inside its environment.
//!
//! Key responsibilities:
//! - Spawn the environment's interpreter on the entry script
//! - Stream stdout/stderr line by line to the notification channel as they
//!   are produced, while capturing bounded copies for classification
//! - Enforce the run timeout and cooperative cancellation
//!
//! No retries happen here; retry policy lives in the correction loop.

use chrono::Utc;
use forge_core::events::{LogLinePayload, LogStream, LoopEvent};
use forge_core::types::RunOutcome;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between heartbeat log messages during long-running scripts.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Timeout for capturing remaining output after the process exits or is
/// killed. Pipes normally close immediately; this is a hang guard.
const IO_CAPTURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum bytes captured per stream. Prevents runaway memory when a
/// generated script floods its output.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("interpreter not found: {0}")]
    InterpreterNotFound(String),
    #[error("entry script not found: {0}")]
    ScriptNotFound(String),
}

pub type Result<T> = std::result::Result<T, RunnerError>;

/// How the process wait loop terminated.
enum ProcessEnd {
    Completed(std::process::ExitStatus),
    TimedOut,
    Cancelled,
}

/// Runner configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Wall-clock limit per run in seconds (0 = no timeout).
    pub timeout_sec: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self { timeout_sec: 120 }
    }
}

/// Runner for executing entry scripts.
#[derive(Debug)]
pub struct Runner {
    config: RunnerConfig,
}

impl Runner {
    pub fn new(config: RunnerConfig) -> Self {
        Self { config }
    }

    /// Execute `script` with `interpreter`, suspending until the process
    /// exits, the timeout elapses, or the token fires, whichever comes first.
    /// Timeout and cancellation are reported in the outcome, not as errors.
    pub async fn run(
        &self,
        project: &str,
        interpreter: &Path,
        script: &Path,
        working_dir: &Path,
        cancel_token: CancellationToken,
        events: &UnboundedSender<LoopEvent>,
    ) -> Result<RunOutcome> {
        if !script.exists() {
            return Err(RunnerError::ScriptNotFound(script.display().to_string()));
        }

        let start = Utc::now();

        let mut cmd = Command::new(interpreter);
        cmd.arg(script)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(
            project = %project,
            interpreter = %interpreter.display(),
            script = %script.display(),
            "spawning script process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunnerError::InterpreterNotFound(interpreter.display().to_string())
            } else {
                RunnerError::Io(e)
            }
        })?;

        // Stream both pipes as they are produced so a live-log consumer
        // sees partial output before the process exits.
        let stdout_task = child.stdout.take().map(|stdout| {
            tokio::spawn(stream_lines(
                stdout,
                LogStream::Stdout,
                project.to_string(),
                events.clone(),
            ))
        });
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(stream_lines(
                stderr,
                LogStream::Stderr,
                project.to_string(),
                events.clone(),
            ))
        });

        // Wait for the process with periodic progress logging.
        let started = Instant::now();
        let timeout_duration = Duration::from_secs(u64::from(self.config.timeout_sec));

        let end = loop {
            let elapsed = started.elapsed();

            if self.config.timeout_sec > 0 && elapsed >= timeout_duration {
                warn!(
                    project = %project,
                    timeout_sec = self.config.timeout_sec,
                    "script timed out; killing"
                );
                if let Err(err) = child.kill().await {
                    warn!(project = %project, error = %err, "failed to kill timed-out process");
                }
                let _ = child.wait().await;
                break ProcessEnd::TimedOut;
            }

            let remaining = if self.config.timeout_sec > 0 {
                timeout_duration.saturating_sub(elapsed)
            } else {
                Duration::MAX
            };
            let sleep_duration = HEARTBEAT_INTERVAL.min(remaining);

            tokio::select! {
                result = child.wait() => {
                    match result {
                        Ok(status) => break ProcessEnd::Completed(status),
                        Err(e) => return Err(RunnerError::Io(e)),
                    }
                }
                () = cancel_token.cancelled() => {
                    info!(project = %project, "cancellation requested; killing process");
                    if let Err(err) = child.kill().await {
                        warn!(project = %project, error = %err, "failed to kill cancelled process");
                    }
                    let _ = child.wait().await;
                    break ProcessEnd::Cancelled;
                }
                () = tokio::time::sleep(sleep_duration) => {
                    info!(
                        project = %project,
                        elapsed_sec = started.elapsed().as_secs(),
                        timeout_sec = self.config.timeout_sec,
                        "script still running"
                    );
                }
            }
        };

        let stdout = capture(stdout_task, project, "stdout").await;
        let stderr = capture(stderr_task, project, "stderr").await;

        let duration_ms = (Utc::now() - start).num_milliseconds() as u64;

        let outcome = match end {
            ProcessEnd::Completed(status) => {
                let exit_code = status.code().unwrap_or(-1);
                info!(
                    project = %project,
                    exit_code = exit_code,
                    duration_ms = duration_ms,
                    "script run complete"
                );
                RunOutcome {
                    exit_code,
                    stdout,
                    stderr,
                    timed_out: false,
                    cancelled: false,
                    duration_ms,
                }
            }
            ProcessEnd::TimedOut => RunOutcome {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: true,
                cancelled: false,
                duration_ms,
            },
            ProcessEnd::Cancelled => RunOutcome {
                exit_code: -1,
                stdout,
                stderr,
                timed_out: false,
                cancelled: true,
                duration_ms,
            },
        };

        Ok(outcome)
    }
}

/// Read a pipe line by line, forwarding each line as a log event and
/// accumulating a bounded copy for the outcome.
async fn stream_lines<R: tokio::io::AsyncRead + Unpin>(
    reader: R,
    stream: LogStream,
    project: String,
    events: UnboundedSender<LoopEvent>,
) -> std::io::Result<String> {
    let mut lines = tokio::io::BufReader::new(reader).lines();
    let mut captured = String::new();
    let mut truncated = false;

    while let Some(line) = lines.next_line().await? {
        // Live log first; the channel is unbounded so this never blocks.
        let _ = events.send(LoopEvent::LogLine(LogLinePayload {
            project: project.clone(),
            stream,
            line: line.clone(),
        }));

        if !truncated {
            if captured.len() + line.len() + 1 > MAX_OUTPUT_BYTES {
                warn!(max_bytes = MAX_OUTPUT_BYTES, "output exceeded limit, truncating");
                truncated = true;
            } else {
                captured.push_str(&line);
                captured.push('\n');
            }
        }
    }

    Ok(captured)
}

/// Join a capture task, tolerating slow pipes and panics.
async fn capture(
    task: Option<tokio::task::JoinHandle<std::io::Result<String>>>,
    project: &str,
    which: &str,
) -> String {
    match task {
        Some(task) => match timeout(IO_CAPTURE_TIMEOUT, task).await {
            Ok(Ok(Ok(buf))) => buf,
            Ok(Ok(Err(err))) => {
                warn!(project = %project, error = %err, "{which} capture failed");
                String::new()
            }
            Ok(Err(err)) => {
                warn!(project = %project, error = %err, "{which} task panicked");
                String::new()
            }
            Err(_) => {
                warn!(project = %project, "{which} capture timed out");
                String::new()
            }
        },
        None => String::new(),
    }
}
