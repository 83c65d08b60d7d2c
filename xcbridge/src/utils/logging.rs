//! # Logging Initialization
//!
//! Centralized setup of the `tracing` subscriber for the `xcbridge` binary and tests.
//!
//! - **`init_logging()`**: call once at startup. A `std::sync::Once` guards the
//!   installation so repeated calls are harmless.
//! - **Environment filter**: `RUST_LOG` wins when set; otherwise the requested level
//!   applies to dependencies and `debug` applies to `xcbridge` itself.
//! - **File logging (default)**: a daily rolling file in the user cache directory
//!   (resolved with `directories`), written through a non-blocking
//!   `tracing_appender` writer with ANSI colors disabled.
//! - **Stderr logging**: with `log_to_file = false`, or when the cache directory is
//!   unavailable or not writable, logs go to stderr with colors.

use anyhow::Result;
use directories::ProjectDirs;
use std::{io::stderr, path::Path, sync::Once};
use tracing_subscriber::{EnvFilter, fmt::layer, prelude::*};

static INIT: Once = Once::new();

/// Initialize verbose logging for tests (stderr, `trace` level).
pub fn init_test_logging() {
    if let Err(e) = init_logging("trace", false) {
        eprintln!("Failed to initialize test logging: {e:#}");
    }
}

/// Initializes the logging system.
///
/// # Errors
///
/// Currently infallible; the `Result` keeps call sites stable if subscriber
/// installation grows fallible steps.
pub fn init_logging(log_level: &str, log_to_file: bool) -> Result<()> {
    INIT.call_once(|| {
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{log_level},xcbridge=debug")));

        if log_to_file
            && let Some(proj_dirs) = ProjectDirs::from("dev", "XcBridge", "xcbridge")
        {
            let log_dir = proj_dirs.cache_dir();

            // tracing_appender::rolling::daily panics on permission errors, so probe first.
            if test_write_permission(log_dir) {
                let file_appender = tracing_appender::rolling::daily(log_dir, "xcbridge.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                let installed = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(layer().with_writer(non_blocking).with_ansi(false))
                    .try_init();

                if installed.is_ok() {
                    // Leaked so buffered lines are flushed at process exit.
                    Box::leak(Box::new(guard));
                }
                return;
            }
        }

        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(layer().with_writer(stderr).with_ansi(true))
            .try_init();
    });

    Ok(())
}

/// Create `dir` if needed and check that a file can be written inside it.
fn test_write_permission(dir: &Path) -> bool {
    if std::fs::create_dir_all(dir).is_err() {
        return false;
    }

    let probe = dir.join(".xcbridge_log_probe");
    match std::fs::write(&probe, "probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}
