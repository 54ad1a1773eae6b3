//! External process execution with concurrent output draining.

use crate::command::CommandLine;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exit code reported when the process could not be started.
pub const LAUNCH_FAILURE: i32 = -1;

/// Exit code reported when the stage timeout elapsed and the child was killed.
pub const TIMED_OUT: i32 = -2;

/// Exit code reported when the run was cancelled and the child was killed.
pub const CANCELLED: i32 = -3;

/// Exit code reported when the child ended without an exit status (signal).
pub const SIGNALLED: i32 = -4;

/// How long output pipes may stay open after the child is gone.
///
/// A grandchild that inherited the pipe can keep it open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Result of a single process invocation.
///
/// A non-zero exit code is never an error at this layer; callers inspect
/// `exit_code` (or [`ExecutionResult::termination`]) themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Exit code (0 = success, negative values are runner sentinels).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl ExecutionResult {
    /// Sentinel result for a process that never started.
    pub fn launch_failure(reason: impl Into<String>) -> Self {
        Self {
            exit_code: LAUNCH_FAILURE,
            stdout: String::new(),
            stderr: reason.into(),
            duration_ms: 0,
        }
    }

    /// Whether the process exited with code 0.
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Classify the exit code.
    pub fn termination(&self) -> Termination {
        match self.exit_code {
            LAUNCH_FAILURE => Termination::LaunchFailed,
            TIMED_OUT => Termination::TimedOut,
            CANCELLED => Termination::Cancelled,
            SIGNALLED => Termination::Signalled,
            code => Termination::Exited(code),
        }
    }
}

/// How a process invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    /// The process ran and exited with this code.
    Exited(i32),

    /// The process could not be started.
    LaunchFailed,

    /// The process was killed after exceeding its timeout.
    TimedOut,

    /// The process was killed because the run was cancelled.
    Cancelled,

    /// The process was terminated by a signal.
    Signalled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exited with code {code}"),
            Termination::LaunchFailed => f.write_str("failed to launch"),
            Termination::TimedOut => f.write_str("timed out"),
            Termination::Cancelled => f.write_str("cancelled"),
            Termination::Signalled => f.write_str("terminated by signal"),
        }
    }
}

/// Per-invocation limits threaded into the runner.
#[derive(Debug, Clone, Default)]
pub struct RunControls {
    /// Kill the process if it runs longer than this.
    pub timeout: Option<Duration>,

    /// Kill the process when this token is cancelled.
    pub cancel: CancellationToken,
}

impl RunControls {
    /// Controls bound to an existing cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            timeout: None,
            cancel,
        }
    }

    /// Set the timeout.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Launches a command and reports how it ended.
///
/// Implementations never fail: launch problems, timeouts and cancellation
/// are all encoded in the returned [`ExecutionResult`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn execute(&self, command: &CommandLine, controls: &RunControls) -> ExecutionResult;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Parse a full command-line string and execute it with no limits.
    ///
    /// An unparseable line yields the launch-failure sentinel.
    pub async fn execute_line(&self, line: &str) -> ExecutionResult {
        match CommandLine::parse(line) {
            Ok(command) => self.execute(&command, &RunControls::default()).await,
            Err(e) => {
                warn!(line = %line, error = %e, "Rejected command line");
                ExecutionResult::launch_failure(format!("invalid command line: {}", e))
            }
        }
    }
}

enum Exit {
    Status(i32),
    Killed(i32),
    WaitFailed(String),
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn execute(&self, command: &CommandLine, controls: &RunControls) -> ExecutionResult {
        let start = Instant::now();
        info!(command = %command, "Executing");

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout also reaches tools the stage started.
        #[cfg(unix)]
        process.process_group(0);
        let spawned = process.spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                warn!(program = %command.program, error = %e, "Failed to launch process");
                let mut result = ExecutionResult::launch_failure(format!(
                    "failed to launch '{}': {}",
                    command.program, e
                ));
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        };

        // Both pipes are read while the child runs. Reading only after exit
        // deadlocks once the child fills a pipe buffer.
        let stop = CancellationToken::new();
        let stdout_task = drain(child.stdout.take(), stop.clone());
        let stderr_task = drain(child.stderr.take(), stop.clone());

        let exit = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Exit::Status(status.code().unwrap_or(SIGNALLED)),
                Err(e) => Exit::WaitFailed(e.to_string()),
            },
            _ = sleep_for(controls.timeout) => Exit::Killed(TIMED_OUT),
            _ = controls.cancel.cancelled() => Exit::Killed(CANCELLED),
        };

        if !matches!(exit, Exit::Status(_)) {
            terminate(&mut child, &command.program).await;
        }

        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(DRAIN_GRACE).await;
                stop.cancel();
            })
        };
        let (stdout, stderr) = tokio::join!(
            collect("stdout", &command.program, stdout_task),
            collect("stderr", &command.program, stderr_task)
        );
        stopper.abort();

        let (exit_code, stderr) = match exit {
            Exit::Status(code) => (code, stderr),
            Exit::Killed(code) => {
                warn!(
                    program = %command.program,
                    timeout_secs = controls.timeout.map(|t| t.as_secs()),
                    cancelled = code == CANCELLED,
                    "Killed process"
                );
                (code, stderr)
            }
            Exit::WaitFailed(reason) => (
                LAUNCH_FAILURE,
                format!("{}failed to wait for '{}': {}", stderr, command.program, reason),
            ),
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(
            program = %command.program,
            exit_code,
            duration_ms,
            stdout_bytes = stdout.len(),
            stderr_bytes = stderr.len(),
            "Process finished"
        );

        ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration_ms,
        }
    }
}

/// Bytes read from one pipe.
#[derive(Debug, Default)]
struct Drained {
    bytes: Vec<u8>,

    /// Reading stopped before EOF.
    truncated: bool,
}

/// Read a pipe to EOF on its own task, stopping early if `stop` fires.
fn drain<R>(reader: Option<R>, stop: CancellationToken) -> JoinHandle<Drained>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut drained = Drained::default();
        let Some(mut reader) = reader else {
            return drained;
        };

        let mut chunk = [0u8; 8192];
        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => break,
                    Ok(n) => drained.bytes.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        warn!(error = %e, "Failed to read process output");
                        break;
                    }
                },
                _ = stop.cancelled() => {
                    drained.truncated = true;
                    break;
                }
            }
        }
        drained
    })
}

async fn collect(stream: &str, program: &str, task: JoinHandle<Drained>) -> String {
    match task.await {
        Ok(drained) => {
            if drained.truncated {
                warn!(
                    program = %program,
                    stream,
                    captured_bytes = drained.bytes.len(),
                    "Pipe still open after process ended; {} truncated",
                    stream
                );
            }
            String::from_utf8_lossy(&drained.bytes).into_owned()
        }
        Err(e) => {
            warn!(error = %e, "Output reader task failed");
            String::new()
        }
    }
}

/// Kill the child and everything in its process group, then reap it.
async fn terminate(child: &mut Child, program: &str) {
    if kill_process_group(child, program) {
        if let Err(e) = child.wait().await {
            warn!(program = %program, error = %e, "Failed to reap process");
        }
        return;
    }
    if let Err(e) = child.kill().await {
        warn!(program = %program, error = %e, "Failed to kill process");
    }
}

#[cfg(unix)]
fn kill_process_group(child: &Child, program: &str) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) => true,
        Err(e) => {
            warn!(program = %program, pid, error = %e, "Failed to kill process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child, _program: &str) -> bool {
    false
}

async fn sleep_for(timeout: Option<Duration>) {
    match timeout {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}
