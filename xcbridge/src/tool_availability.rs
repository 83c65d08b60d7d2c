//! Presence checks for the external binaries the core launches.

use crate::config::CoreConfig;
use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::fmt::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    /// Which component needs the binary.
    pub role: &'static str,
    pub executable: PathBuf,
    pub available: bool,
    pub message: Option<String>,
}

/// Succeeds if `executable` is an existing, executable regular file.
pub fn check_executable(executable: &Path) -> CoreResult<()> {
    let missing = |detail: String| CoreError::DependencyMissing {
        name: executable.display().to_string(),
        detail,
    };
    let metadata = std::fs::metadata(executable).map_err(|e| missing(e.to_string()))?;
    if !metadata.is_file() {
        return Err(missing("not a regular file".to_string()));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(missing("not executable".to_string()));
        }
    }
    Ok(())
}

/// Check every binary named in `config`.
pub fn check_configured_tools(config: &CoreConfig) -> Vec<ToolStatus> {
    [
        ("debugger", &config.debugger.executable),
        ("log_capture", &config.log_capture.executable),
    ]
    .into_iter()
    .map(|(role, executable)| {
        let outcome = check_executable(executable);
        if let Err(e) = &outcome {
            tracing::warn!("{} unavailable: {}", role, e);
        }
        ToolStatus {
            role,
            executable: executable.clone(),
            available: outcome.is_ok(),
            message: outcome.err().map(|e| e.to_string()),
        }
    })
    .collect()
}

/// Human-friendly summary of `statuses`.
pub fn format_report(statuses: &[ToolStatus]) -> String {
    if statuses.iter().all(|s| s.available) {
        return "All configured tools are available.".to_string();
    }
    let mut output = String::from("Unavailable tools:\n");
    for status in statuses.iter().filter(|s| !s.available) {
        let _ = writeln!(
            output,
            "- {} ({}): {}",
            status.role,
            status.executable.display(),
            status.message.as_deref().unwrap_or("unavailable")
        );
    }
    output.trim_end().to_string()
}
