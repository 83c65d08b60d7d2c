use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio_util::sync::CancellationToken;

/// Why a child was stopped before it exited on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    TimedOut,
    Cancelled,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::TimedOut => f.write_str("timed out"),
            TerminationReason::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A single external command to run.
#[derive(Debug, Clone)]
pub struct ProcessExecutionRequest {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    /// Variables added to (or overriding) the inherited environment.
    pub env: HashMap<String, String>,
    pub cancellation: Option<CancellationToken>,
    pub current_dir: Option<PathBuf>,
}

impl ProcessExecutionRequest {
    pub fn new<I, S>(executable: impl AsRef<Path>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable: executable.as_ref().to_path_buf(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
            env: HashMap::new(),
            cancellation: None,
            current_dir: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_secs(self, seconds: u64) -> Self {
        self.with_timeout(Duration::from_secs(seconds))
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Human-readable command line for logs.
    pub fn display_command(&self) -> String {
        std::iter::once(self.executable.display().to_string())
            .chain(self.args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Outcome of a finished, timed-out or cancelled child.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessExecutionResult {
    stdout: String,
    stderr: String,
    exit_code: i32,
    succeeded: bool,
    termination: Option<TerminationReason>,
    dropped_lines: u64,
    duration_ms: u64,
}

impl ProcessExecutionResult {
    pub(crate) fn new(
        stdout: String,
        stderr: String,
        exit_code: i32,
        termination: Option<TerminationReason>,
        dropped_lines: u64,
        duration: Duration,
    ) -> Self {
        Self {
            stdout,
            stderr,
            exit_code,
            succeeded: exit_code == 0 && termination.is_none(),
            termination,
            dropped_lines,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn stdout(&self) -> &str {
        &self.stdout
    }

    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Exit code of the child, or -1 when it was ended by a signal.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Stdout lines captured but not delivered to a streaming callback.
    pub fn dropped_lines(&self) -> u64 {
        self.dropped_lines
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}
