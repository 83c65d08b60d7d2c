//! # Core Configuration
//!
//! Runtime settings for the process, session and artifact layers. Every field has
//! a default so an empty TOML document is a valid configuration; a file only needs
//! to name what it changes.
//!
//! ```toml
//! [executor]
//! default_timeout_seconds = 600
//!
//! [artifacts]
//! base_dir = "/tmp/xcbridge-artifacts"
//! ttl_seconds = 0
//!
//! [debugger]
//! executable = "/usr/bin/xcrun"
//! args = ["lldb", "--no-lldbinit"]
//!
//! [log_capture]
//! default_buffer_size = 5000
//! ```
//!
//! Templates in the debugger and log-capture sections may reference `{device_id}`,
//! `{pid}`, `{bundle_id}` and `{marker}`; they are substituted verbatim.

use crate::constants::*;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

/// Top-level configuration, one section per core component.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    pub executor: ExecutorConfig,
    pub artifacts: ArtifactConfig,
    pub debugger: DebuggerConfig,
    pub log_capture: LogCaptureConfig,
}

impl CoreConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        let config: CoreConfig = toml::from_str(text)
            .map_err(|e| CoreError::invalid_input(format!("Invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub async fn load_from_file(path: &Path) -> CoreResult<Self> {
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            CoreError::io(
                format!("Failed to read configuration file '{}'", path.display()),
                e,
            )
        })?;
        Self::from_toml_str(&text)
    }

    /// Reject settings that would make a component unusable.
    pub fn validate(&self) -> CoreResult<()> {
        if self.executor.line_queue_capacity == 0 {
            return Err(CoreError::invalid_input(
                "executor.line_queue_capacity must be at least 1",
            ));
        }
        if !self.debugger.boundary_command.contains(MARKER_PLACEHOLDER) {
            return Err(CoreError::invalid_input(format!(
                "debugger.boundary_command must contain the {MARKER_PLACEHOLDER} placeholder"
            )));
        }
        if self.log_capture.max_buffer_size == 0 {
            return Err(CoreError::invalid_input(
                "log_capture.max_buffer_size must be at least 1",
            ));
        }
        if self.log_capture.default_buffer_size > self.log_capture.max_buffer_size {
            return Err(CoreError::invalid_input(
                "log_capture.default_buffer_size exceeds log_capture.max_buffer_size",
            ));
        }
        Ok(())
    }
}

/// Settings for [`crate::executor::ProcessExecutor`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Timeout applied when a request does not carry its own. `None` means unbounded.
    pub default_timeout_seconds: Option<u64>,
    /// Time between SIGTERM and SIGKILL on forced termination.
    pub termination_grace_ms: u64,
    /// Bound on waiting for pipe readers once the child is gone.
    pub output_drain_ms: u64,
    /// Lines queued for a streaming callback.
    pub line_queue_capacity: usize,
    /// Wait for queue room before a line is dropped for the callback.
    pub line_send_patience_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: None,
            termination_grace_ms: DEFAULT_TERMINATION_GRACE_MS,
            output_drain_ms: DEFAULT_OUTPUT_DRAIN_MS,
            line_queue_capacity: DEFAULT_LINE_QUEUE_CAPACITY,
            line_send_patience_ms: DEFAULT_LINE_SEND_PATIENCE_MS,
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_seconds.map(Duration::from_secs)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn output_drain(&self) -> Duration {
        Duration::from_millis(self.output_drain_ms)
    }

    pub fn line_send_patience(&self) -> Duration {
        Duration::from_millis(self.line_send_patience_ms)
    }
}

/// Settings for [`crate::artifact_store::ArtifactStore`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ArtifactConfig {
    /// Root directory for stored artifacts; defaults to a directory under the system temp dir.
    pub base_dir: Option<PathBuf>,
    /// Maximum artifact age. Zero makes every artifact eligible on the next pass.
    pub ttl_seconds: u64,
    /// Cap on the combined size of tracked artifacts.
    pub max_total_bytes: u64,
    /// Interval of the background sweeper.
    pub sweep_interval_seconds: u64,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            base_dir: None,
            ttl_seconds: DEFAULT_ARTIFACT_TTL_SECS,
            max_total_bytes: DEFAULT_ARTIFACT_MAX_BYTES,
            sweep_interval_seconds: DEFAULT_ARTIFACT_SWEEP_SECS,
        }
    }
}

impl ArtifactConfig {
    pub fn resolved_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("xcbridge-artifacts"))
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

/// Settings for interactive debugger sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct DebuggerConfig {
    /// Debugger launcher; the default runs lldb through xcrun.
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Commands sent before attaching (may use `{device_id}`).
    pub attach_preamble: Vec<String>,
    /// Attach command when a pid is given (uses `{pid}`).
    pub attach_pid_command: String,
    /// Attach command when only a bundle id is given (uses `{bundle_id}`).
    pub attach_bundle_command: String,
    /// Command that makes the debugger print `{marker}` on a line of its own.
    pub boundary_command: String,
    /// Sent best-effort before the debugger is terminated on detach.
    pub detach_commands: Vec<String>,
    pub attach_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    /// Reject pids that do not name a live local process.
    pub verify_local_pid: bool,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_XCRUN_PATH),
            args: vec!["lldb".into(), "--no-lldbinit".into()],
            attach_preamble: vec!["platform select ios-simulator".into()],
            attach_pid_command: "process attach --pid {pid}".into(),
            attach_bundle_command: "process attach --name {bundle_id}".into(),
            boundary_command: "script print('{marker}')".into(),
            detach_commands: vec!["process detach".into(), "quit".into()],
            attach_timeout_seconds: DEFAULT_DEBUGGER_ATTACH_TIMEOUT_SECS,
            command_timeout_seconds: DEFAULT_DEBUGGER_COMMAND_TIMEOUT_SECS,
            verify_local_pid: true,
        }
    }
}

impl DebuggerConfig {
    pub fn attach_timeout(&self) -> Duration {
        Duration::from_secs(self.attach_timeout_seconds)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

/// Settings for streaming log-capture sessions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct LogCaptureConfig {
    pub executable: PathBuf,
    /// Arguments of the log stream command (may use `{device_id}`).
    pub args: Vec<String>,
    /// Flag placed before a caller-supplied predicate.
    pub predicate_flag: String,
    pub default_buffer_size: usize,
    pub max_buffer_size: usize,
}

impl Default for LogCaptureConfig {
    fn default() -> Self {
        Self {
            executable: PathBuf::from(DEFAULT_XCRUN_PATH),
            args: [
                "simctl",
                "spawn",
                "{device_id}",
                "log",
                "stream",
                "--style",
                "ndjson",
                "--level",
                "debug",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            predicate_flag: "--predicate".into(),
            default_buffer_size: DEFAULT_LOG_BUFFER_SIZE,
            max_buffer_size: MAX_LOG_BUFFER_SIZE,
        }
    }
}

/// Substitute `{name}` placeholders in `template`.
pub fn render_template(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}
