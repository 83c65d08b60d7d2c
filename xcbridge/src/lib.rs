//! # xcbridge Core
//!
//! The concurrency and process-lifecycle core of an agent-facing automation
//! server for a native developer toolchain (builds, simulators, devices and
//! the debugger). Individual commands are thin wrappers; this crate is what
//! they all share.
//!
//! ## Components
//!
//! - **`executor`**: runs external binaries with timeout, cancellation and
//!   per-line streaming. Forced stops take down the child's whole process group.
//! - **`resource_lock`**: non-blocking per-key locks. A busy key is reported
//!   immediately as `ResourceBusy`; nothing ever waits on a lock.
//! - **`session`**: long-lived children behind opaque session IDs. Two kinds
//!   share one generic registry: interactive debugger sessions (with a command
//!   denylist) and log-capture sessions feeding a bounded ring buffer.
//! - **`artifact_store`**: short-lived files bounded by age and total size.
//!
//! Data flows from a command handler through the lock registry to the
//! executor or a session manager, and optionally into the artifact store.
//!
//! ## Errors
//!
//! Every fallible operation returns [`CoreError`], whose [`ErrorKind`] is the
//! stable machine-readable classification. A non-zero exit code is never an
//! error: it is an ordinary [`ProcessExecutionResult`] with `succeeded() == false`.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use xcbridge::{ProcessExecutionRequest, ProcessExecutor, ResourceLockRegistry};
//!
//! # async fn demo() -> Result<(), xcbridge::CoreError> {
//! let locks = Arc::new(ResourceLockRegistry::new());
//! let executor = ProcessExecutor::default();
//!
//! let result = locks
//!     .with_lock("simulator:ABCD", "boot", || async {
//!         executor
//!             .execute(
//!                 ProcessExecutionRequest::new("/usr/bin/xcrun", ["simctl", "boot", "ABCD"])
//!                     .with_timeout_secs(120),
//!             )
//!             .await
//!     })
//!     .await?;
//! println!("booted: {}", result.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod artifact_store;
pub mod config;
pub mod constants;
pub mod error;
pub mod executor;
pub mod resource_lock;
pub mod session;
pub mod shell;
pub mod tool_availability;
pub mod utils;

// Re-export main types for easier use
pub use artifact_store::{ArtifactRecord, ArtifactReference, ArtifactStore};
pub use config::CoreConfig;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use executor::{
    ProcessExecutionRequest, ProcessExecutionResult, ProcessExecutor, TerminationReason,
};
pub use resource_lock::{LockEntry, LockLease, ResourceLockRegistry};
pub use session::{
    SessionRegistry, SessionState, SessionSummary, SessionTarget,
    debugger::{AttachRequest, CommandOutput, DebugSessionManager, DetachSummary},
    log_capture::{CaptureRequest, CaptureSummary, LogCaptureManager, LogEntry},
};
pub use xcbridge_common::RingBuffer;
