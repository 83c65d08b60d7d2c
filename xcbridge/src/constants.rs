//! Application-wide defaults.

/// Grace period between SIGTERM and SIGKILL when forcing a child to stop.
pub const DEFAULT_TERMINATION_GRACE_MS: u64 = 1_000;

/// How long to wait for pipe readers to drain after a child has exited.
pub const DEFAULT_OUTPUT_DRAIN_MS: u64 = 250;

/// Capacity of the queue between a streaming child's stdout and `on_line`.
pub const DEFAULT_LINE_QUEUE_CAPACITY: usize = 1_024;

/// How long a pipe reader waits for room in a full line queue before it
/// starts dropping lines for the callback.
pub const DEFAULT_LINE_SEND_PATIENCE_MS: u64 = 250;

/// Artifacts older than this are removed by an eviction pass.
pub const DEFAULT_ARTIFACT_TTL_SECS: u64 = 3_600;

/// Upper bound on the combined size of tracked artifacts.
pub const DEFAULT_ARTIFACT_MAX_BYTES: u64 = 512 * 1024 * 1024;

/// Interval of the background artifact sweeper.
pub const DEFAULT_ARTIFACT_SWEEP_SECS: u64 = 60;

pub const DEFAULT_XCRUN_PATH: &str = "/usr/bin/xcrun";

pub const DEFAULT_DEBUGGER_ATTACH_TIMEOUT_SECS: u64 = 30;

pub const DEFAULT_DEBUGGER_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Lines buffered between the debugger's pipes and a waiting `send_command`.
pub const DEBUGGER_LINE_QUEUE_CAPACITY: usize = 4_096;

pub const DEFAULT_LOG_BUFFER_SIZE: usize = 1_000;

pub const MAX_LOG_BUFFER_SIZE: usize = 100_000;

/// Placeholder substituted with a per-command boundary marker.
pub const MARKER_PLACEHOLDER: &str = "{marker}";
