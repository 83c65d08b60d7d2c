//! # xcbridge CLI
//!
//! Command-line definition and entry point for the diagnostic binary.

use crate::{
    artifact_store::ArtifactStore,
    config::CoreConfig,
    executor::{ProcessExecutionRequest, ProcessExecutor},
    resource_lock::{ResourceLockRegistry, resource_key},
    session::log_capture::{CaptureRequest, LogCaptureManager},
    tool_availability,
    utils::logging::init_logging,
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;

/// xcbridge: process, session and artifact core for toolchain automation.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    long_about = "xcbridge exercises the automation core from a terminal.

  exec             Run one executable with timeout and Ctrl-C cancellation.
                   Example: xcbridge exec --timeout 30 -- /usr/bin/xcrun simctl list
  capture-logs     Capture a device log stream for a few seconds.
                   Example: xcbridge capture-logs --device booted --seconds 5
  sweep-artifacts  Remove expired artifacts from the artifact directory.
  doctor           Check that the configured toolchain binaries exist."
)]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log to stderr instead of file
    #[arg(long, global = true)]
    pub log_to_stderr: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an executable, streaming its stdout, then print the JSON result
    Exec {
        /// Timeout in seconds (defaults to the configured executor timeout)
        #[arg(long)]
        timeout: Option<u64>,

        /// Absolute path of the executable followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Capture a device log stream and print the JSON summary
    CaptureLogs {
        /// Device or simulator identifier
        #[arg(long)]
        device: String,

        /// Log predicate passed to the log stream
        #[arg(long)]
        predicate: Option<String>,

        /// Number of records to retain
        #[arg(long)]
        buffer_size: Option<usize>,

        /// How long to capture
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Remove expired artifacts from the configured artifact directory
    SweepArtifacts,

    /// Report whether the configured toolchain binaries are present
    Doctor,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    init_logging(log_level, !cli.log_to_stderr)?;

    let config = load_config(cli.config).await?;
    match cli.command {
        Command::Exec { timeout, command } => run_exec(&config, timeout, command).await,
        Command::CaptureLogs {
            device,
            predicate,
            buffer_size,
            seconds,
        } => run_capture(&config, device, predicate, buffer_size, seconds).await,
        Command::SweepArtifacts => run_sweep(&config).await,
        Command::Doctor => run_doctor(&config),
    }
}

/// Explicit path, else `config.toml` in the user config dir, else defaults.
async fn load_config(explicit: Option<PathBuf>) -> Result<CoreConfig> {
    let path = explicit.or_else(|| {
        ProjectDirs::from("dev", "XcBridge", "xcbridge")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .filter(|path| path.is_file())
    });
    match path {
        Some(path) => {
            tracing::info!("Loading configuration from {}", path.display());
            CoreConfig::load_from_file(&path)
                .await
                .with_context(|| format!("Failed to load configuration '{}'", path.display()))
        }
        None => Ok(CoreConfig::default()),
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl-C received; cancelling");
            cancel.cancel();
        }
    });
    token
}

async fn run_exec(config: &CoreConfig, timeout: Option<u64>, command: Vec<String>) -> Result<()> {
    let (executable, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("No executable given"))?;
    let executor = ProcessExecutor::new(config.executor.clone());
    let mut request = ProcessExecutionRequest::new(executable, args.iter().cloned())
        .with_cancellation(cancel_on_ctrl_c());
    if let Some(seconds) = timeout {
        request = request.with_timeout_secs(seconds);
    }

    let mut on_line = |line: &str| println!("{line}");
    let result = executor.execute_streaming(request, &mut on_line).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.succeeded() {
        bail!(
            "'{}' did not succeed (exit code {}{})",
            executable,
            result.exit_code(),
            result
                .termination()
                .map(|r| format!(", {r}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn run_capture(
    config: &CoreConfig,
    device: String,
    predicate: Option<String>,
    buffer_size: Option<usize>,
    seconds: u64,
) -> Result<()> {
    let executor = Arc::new(ProcessExecutor::new(config.executor.clone()));
    let locks = Arc::new(ResourceLockRegistry::new());
    let manager = LogCaptureManager::new(executor, locks, config.log_capture.clone());

    let id = manager
        .start_capture(CaptureRequest {
            lock_key: Some(resource_key::device(&device)),
            device_id: device,
            predicate,
            buffer_size,
            owner: "xcbridge capture-logs".to_string(),
        })
        .await?;

    let cancel = cancel_on_ctrl_c();
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
        _ = cancel.cancelled() => {}
    }

    let summary = manager.stop_capture(&id).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn run_sweep(config: &CoreConfig) -> Result<()> {
    let store = ArtifactStore::new(&config.artifacts);
    let adopted = store.load_existing().await?;
    let removed = store.evict_expired().await;
    println!(
        "{}: {} artifact(s) found, {} removed, {} bytes remaining",
        store.base_dir().display(),
        adopted,
        removed,
        store.total_size().await
    );
    Ok(())
}

fn run_doctor(config: &CoreConfig) -> Result<()> {
    let statuses = tool_availability::check_configured_tools(config);
    println!("{}", tool_availability::format_report(&statuses));
    if statuses.iter().any(|s| !s.available) {
        bail!("Some configured tools are unavailable");
    }
    Ok(())
}
