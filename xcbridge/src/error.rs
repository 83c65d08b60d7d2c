//! Error types shared by every core component.
//!
//! Each [`CoreError`] maps to a stable [`ErrorKind`] so the command layer can
//! report a machine-readable kind next to the human-readable message.

use serde::{Deserialize, Serialize};
use std::{fmt, io, path::Path};

/// Stable classification of core failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A caller parameter is missing or malformed.
    InvalidInput,
    /// A resource lock is already held.
    ResourceBusy,
    /// A child process or debugger command failed.
    CommandFailed,
    /// A required external binary is absent from the host.
    DependencyMissing,
    /// A cached identifier no longer names a live resource.
    StaleDefault,
    /// Unexpected I/O or process-management failure.
    InternalError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::ResourceBusy => "resource_busy",
            ErrorKind::CommandFailed => "command_failed",
            ErrorKind::DependencyMissing => "dependency_missing",
            ErrorKind::StaleDefault => "stale_default",
            ErrorKind::InternalError => "internal_error",
        };
        f.write_str(name)
    }
}

/// Errors raised by the process, lock, session and artifact layers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Resource '{key}' is busy (held by '{owner}')")]
    ResourceBusy { key: String, owner: String },

    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// A debugger command matched the denylist and no override was given.
    #[error("Command '{command}' is not allowed: {reason}. Suggested alternative: {alternative}")]
    CommandDenied {
        command: String,
        reason: String,
        alternative: String,
    },

    #[error("Required dependency '{name}' is missing: {detail}")]
    DependencyMissing { name: String, detail: String },

    #[error("Stale identifier: {0}")]
    StaleDefault(String),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<io::Error>,
    },
}

impl CoreError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        CoreError::InvalidInput(message.into())
    }

    pub fn command_failed(message: impl Into<String>) -> Self {
        CoreError::CommandFailed(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::Internal {
            message: message.into(),
            source: None,
        }
    }

    pub fn io(message: impl Into<String>, source: io::Error) -> Self {
        CoreError::Internal {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Classify a spawn failure for `executable`.
    ///
    /// A missing binary is a dependency problem; anything else (permissions,
    /// resource exhaustion) is an internal process-management failure.
    pub fn launch(executable: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            CoreError::DependencyMissing {
                name: executable.display().to_string(),
                detail: source.to_string(),
            }
        } else {
            CoreError::io(
                format!("Failed to launch '{}'", executable.display()),
                source,
            )
        }
    }

    /// The stable kind for this error.
    ///
    /// Denylist rejections report `CommandFailed` but stay a distinct variant
    /// so callers can surface the reason and alternative.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::InvalidInput(_) => ErrorKind::InvalidInput,
            CoreError::ResourceBusy { .. } => ErrorKind::ResourceBusy,
            CoreError::CommandFailed(_) | CoreError::CommandDenied { .. } => {
                ErrorKind::CommandFailed
            }
            CoreError::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            CoreError::StaleDefault(_) => ErrorKind::StaleDefault,
            CoreError::Internal { .. } => ErrorKind::InternalError,
        }
    }

    /// Whether retrying the same call later could succeed without changes.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CoreError::ResourceBusy { .. })
    }

    pub fn is_denied(&self) -> bool {
        matches!(self, CoreError::CommandDenied { .. })
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_denied_reports_command_failed_kind() {
        let err = CoreError::CommandDenied {
            command: "process kill".into(),
            reason: "terminates the target".into(),
            alternative: "detach instead".into(),
        };
        assert_eq!(err.kind(), ErrorKind::CommandFailed);
        assert!(err.is_denied());
        let message = err.to_string();
        assert!(message.contains("terminates the target"));
        assert!(message.contains("detach instead"));
    }

    #[test]
    fn test_launch_not_found_is_dependency_missing() {
        let err = CoreError::launch(
            &PathBuf::from("/nope/xcrun"),
            io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
        );
        assert_eq!(err.kind(), ErrorKind::DependencyMissing);
        assert!(err.to_string().contains("/nope/xcrun"));
    }

    #[test]
    fn test_launch_permission_denied_is_internal() {
        let err = CoreError::launch(
            &PathBuf::from("/tmp/not-executable"),
            io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied"),
        );
        assert_eq!(err.kind(), ErrorKind::InternalError);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_busy_names_key_and_is_recoverable() {
        let err = CoreError::ResourceBusy {
            key: "simulator:ABC".into(),
            owner: "build".into(),
        };
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("simulator:ABC"));
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::DependencyMissing).unwrap();
        assert_eq!(json, "\"dependency_missing\"");
        assert_eq!(ErrorKind::StaleDefault.to_string(), "stale_default");
    }
}
