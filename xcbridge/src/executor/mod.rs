//! # Process Executor
//!
//! Runs external toolchain binaries as child processes with bounded lifetimes.
//!
//! Every child is started as the leader of its own process group with
//! `kill_on_drop`, so dropping an in-flight `execute` future still takes the
//! child down. A run ends in exactly one of three ways:
//!
//! - the child exits on its own (any exit code is an ordinary result);
//! - the request's timeout elapses;
//! - the request's cancellation token fires.
//!
//! The last two force-terminate the process group (SIGTERM, grace period,
//! SIGKILL) and return a failed result carrying whatever output was captured.
//! Only launch failures are errors.
//!
//! ## Streaming
//!
//! `execute_streaming` delivers stdout lines to a callback in the order the
//! child wrote them, including lines still queued when the child exits. Lines
//! pass through a bounded queue. A reader that finds the queue full waits a
//! short while for the callback to catch up; if it does not, the line is
//! still captured in `stdout` but counted in `dropped_lines` instead of
//! delivered.

mod termination;
mod types;

pub use types::{ProcessExecutionRequest, ProcessExecutionResult, TerminationReason};

use crate::config::ExecutorConfig;
use crate::error::{CoreError, CoreResult};
use std::{
    path::Path,
    process::{ExitStatus, Stdio},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::mpsc::{self, error::SendTimeoutError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    config: ExecutorConfig,
}

enum Step {
    Line(Option<String>),
    Exited(std::io::Result<ExitStatus>),
    DrainElapsed,
    Stop(TerminationReason),
}

impl ProcessExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run a child to completion, timeout or cancellation.
    pub async fn execute(
        &self,
        request: ProcessExecutionRequest,
    ) -> CoreResult<ProcessExecutionResult> {
        self.run(request, None).await
    }

    /// Like [`execute`](Self::execute), also calling `on_line` for each stdout
    /// line while the child runs.
    pub async fn execute_streaming(
        &self,
        request: ProcessExecutionRequest,
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> CoreResult<ProcessExecutionResult> {
        self.run(request, Some(on_line)).await
    }

    /// Spawn a long-lived child with all three stdio streams piped.
    pub fn spawn_interactive(&self, executable: &Path, args: &[String]) -> CoreResult<Child> {
        let mut command = base_command(executable, args)?;
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command
            .spawn()
            .map_err(|e| CoreError::launch(executable, e))?;
        tracing::debug!(
            "Spawned interactive '{}' (pid {:?})",
            executable.display(),
            child.id()
        );
        Ok(child)
    }

    /// Spawn a long-lived child whose output is read until it is stopped.
    pub fn spawn_streaming(&self, executable: &Path, args: &[String]) -> CoreResult<Child> {
        let mut command = base_command(executable, args)?;
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let child = command
            .spawn()
            .map_err(|e| CoreError::launch(executable, e))?;
        tracing::debug!(
            "Spawned streaming '{}' (pid {:?})",
            executable.display(),
            child.id()
        );
        Ok(child)
    }

    /// Force-terminate a child spawned by this executor.
    pub async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        termination::terminate(child, self.config.termination_grace()).await
    }

    async fn run(
        &self,
        request: ProcessExecutionRequest,
        mut on_line: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> CoreResult<ProcessExecutionResult> {
        let command_line = request.display_command();
        let mut command = base_command(&request.executable, &request.args)?;
        command
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &request.current_dir {
            command.current_dir(dir);
        }

        let timeout = request.timeout.or_else(|| self.config.default_timeout());
        let cancel = request
            .cancellation
            .clone()
            .unwrap_or_else(CancellationToken::new);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|e| CoreError::launch(&request.executable, e))?;
        tracing::debug!("Spawned '{}' (pid {:?})", command_line, child.id());

        let stdout_text = Arc::new(Mutex::new(String::new()));
        let stderr_text = Arc::new(Mutex::new(String::new()));
        let dropped = Arc::new(AtomicU64::new(0));
        let (line_tx, mut line_rx) = mpsc::channel(self.config.line_queue_capacity.max(1));
        let forward = on_line.is_some().then(|| LineForward {
            tx: line_tx,
            dropped: Arc::clone(&dropped),
            patience: self.config.line_send_patience(),
            behind: false,
        });

        let mut readers = ReaderTasks::default();
        if let Some(pipe) = child.stdout.take() {
            readers.push(spawn_capture(pipe, Arc::clone(&stdout_text), forward));
        }
        if let Some(pipe) = child.stderr.take() {
            readers.push(spawn_capture(pipe, Arc::clone(&stderr_text), None));
        }

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut lines_open = on_line.is_some();
        let mut status = None;
        // Once the child is gone, lines are still delivered until its stdout
        // reader finishes or stdout stays idle for `output_drain`.
        let mut drain_deadline = None;

        let termination = loop {
            if status.is_some() && !lines_open {
                break None;
            }
            let running = status.is_none();
            let step = tokio::select! {
                biased;

                _ = cancel.cancelled(), if running => Step::Stop(TerminationReason::Cancelled),
                _ = sleep_until_deadline(deadline), if running => Step::Stop(TerminationReason::TimedOut),
                _ = sleep_until_deadline(drain_deadline), if !running => Step::DrainElapsed,
                line = line_rx.recv(), if lines_open => Step::Line(line),
                exited = child.wait(), if running => Step::Exited(exited),
            };
            match step {
                Step::Line(Some(line)) => {
                    if let Some(callback) = on_line.as_deref_mut() {
                        callback(&line);
                    }
                    if !running {
                        drain_deadline =
                            Some(tokio::time::Instant::now() + self.config.output_drain());
                    }
                }
                Step::Line(None) => lines_open = false,
                Step::Exited(Ok(exit_status)) => {
                    status = Some(exit_status);
                    drain_deadline =
                        Some(tokio::time::Instant::now() + self.config.output_drain());
                }
                Step::Exited(Err(e)) => {
                    return Err(CoreError::io(
                        format!("Failed to wait for '{command_line}'"),
                        e,
                    ));
                }
                Step::DrainElapsed => {
                    tracing::debug!("'{}' stdout still open after exit", command_line);
                    break None;
                }
                Step::Stop(reason) => break Some(reason),
            }
        };

        if let Some(reason) = termination {
            tracing::warn!(
                "'{}' {} after {}ms; terminating",
                command_line,
                reason,
                started.elapsed().as_millis()
            );
            status = self.terminate(&mut child).await;
        }

        // Lines queued before this point are still delivered; anything read
        // afterwards is captured and counted as dropped.
        line_rx.close();
        readers.drain(self.config.output_drain()).await;
        if let Some(callback) = on_line.as_deref_mut() {
            while let Ok(line) = line_rx.try_recv() {
                callback(&line);
            }
        }

        let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
        let result = ProcessExecutionResult::new(
            take_text(&stdout_text),
            take_text(&stderr_text),
            exit_code,
            termination,
            dropped.load(Ordering::Relaxed),
            started.elapsed(),
        );
        tracing::info!(
            "'{}' finished: exit code {}, {}ms{}",
            command_line,
            exit_code,
            result.duration().as_millis(),
            termination
                .map(|r| format!(" ({r})"))
                .unwrap_or_default()
        );
        Ok(result)
    }
}

fn base_command(executable: &Path, args: &[String]) -> CoreResult<Command> {
    if !executable.is_absolute() {
        return Err(CoreError::invalid_input(format!(
            "Executable must be an absolute path, got '{}'",
            executable.display()
        )));
    }
    let mut command = Command::new(executable);
    command.args(args).kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    Ok(command)
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn take_text(text: &Mutex<String>) -> String {
    std::mem::take(&mut *text.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Strip one trailing `\n` or `\r\n`.
pub(crate) fn trim_line_ending(raw: &str) -> &str {
    let line = raw.strip_suffix('\n').unwrap_or(raw);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Read `pipe` until EOF, calling `each` with every raw line (line ending
/// included, invalid UTF-8 replaced).
pub(crate) async fn for_each_line<R, F>(pipe: R, mut each: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut reader = BufReader::new(pipe);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => each(&String::from_utf8_lossy(&raw)),
            Err(e) => {
                tracing::debug!("Pipe read failed: {}", e);
                break;
            }
        }
    }
}

/// Sending half of the stdout line queue.
///
/// A full queue is waited on for up to `patience`. If the consumer is still
/// behind after that, lines are dropped without waiting until the queue has
/// room again, so a stalled callback never stalls the pipe for long.
struct LineForward {
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
    patience: Duration,
    behind: bool,
}

impl LineForward {
    async fn offer(&mut self, line: String) {
        let delivered = if self.behind {
            match self.tx.try_send(line) {
                Ok(()) => {
                    self.behind = false;
                    true
                }
                Err(_) => false,
            }
        } else {
            match self.tx.send_timeout(line, self.patience).await {
                Ok(()) => true,
                Err(SendTimeoutError::Timeout(_)) => {
                    self.behind = true;
                    false
                }
                Err(SendTimeoutError::Closed(_)) => false,
            }
        };
        if !delivered {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn spawn_capture<R>(
    pipe: R,
    sink: Arc<Mutex<String>>,
    mut forward: Option<LineForward>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&raw);
                    sink.lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push_str(&text);
                    if let Some(forward) = forward.as_mut() {
                        forward.offer(trim_line_ending(&text).to_string()).await;
                    }
                }
                Err(e) => {
                    tracing::debug!("Pipe read failed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Pipe reader tasks of one run; aborted if the run is dropped early.
#[derive(Default)]
struct ReaderTasks(Vec<JoinHandle<()>>);

impl ReaderTasks {
    fn push(&mut self, handle: JoinHandle<()>) {
        self.0.push(handle);
    }

    /// Wait for each reader to hit EOF, abandoning any that outlive `limit`
    /// (a grandchild may still hold the pipe open).
    async fn drain(&mut self, limit: Duration) {
        for handle in &mut self.0 {
            if tokio::time::timeout(limit, &mut *handle).await.is_err() {
                tracing::debug!("Pipe reader still open after {:?}; abandoning", limit);
                handle.abort();
            }
        }
    }
}

impl Drop for ReaderTasks {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn sh(script: &str) -> ProcessExecutionRequest {
        ProcessExecutionRequest::new("/bin/sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr_separately() {
        let executor = ProcessExecutor::default();
        let result = executor
            .execute(sh("echo out; echo err >&2"))
            .await
            .unwrap();
        assert!(result.succeeded());
        assert_eq!(result.stdout(), "out\n");
        assert_eq!(result.stderr(), "err\n");
        assert_eq!(result.termination(), None);
    }

    #[tokio::test]
    async fn test_env_override_reaches_child() {
        let executor = ProcessExecutor::default();
        let result = executor
            .execute(sh("printf %s \"$XCB_PROBE\"").with_env("XCB_PROBE", "visible"))
            .await
            .unwrap();
        assert_eq!(result.stdout(), "visible");
    }

    #[tokio::test]
    async fn test_current_dir_is_applied() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ProcessExecutor::default();
        let result = executor
            .execute(sh("pwd").current_dir(dir.path()))
            .await
            .unwrap();
        let reported = std::fs::canonicalize(result.stdout().trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_relative_executable_is_invalid_input() {
        let executor = ProcessExecutor::default();
        let err = executor
            .execute(ProcessExecutionRequest::new("echo", ["hi"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_config_default_timeout_applies() {
        let executor = ProcessExecutor::new(ExecutorConfig {
            default_timeout_seconds: Some(1),
            termination_grace_ms: 200,
            ..ExecutorConfig::default()
        });
        let result = executor.execute(sh("sleep 30")).await.unwrap();
        assert_eq!(result.termination(), Some(TerminationReason::TimedOut));
        assert!(result.duration() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_slow_consumer_counts_dropped_lines() {
        let executor = ProcessExecutor::new(ExecutorConfig {
            line_queue_capacity: 1,
            line_send_patience_ms: 1,
            ..ExecutorConfig::default()
        });
        let mut delivered = 0usize;
        let mut on_line = |_: &str| {
            delivered += 1;
            std::thread::sleep(Duration::from_millis(20));
        };
        let result = executor
            .execute_streaming(sh("i=0; while [ $i -lt 200 ]; do echo $i; i=$((i+1)); done"), &mut on_line)
            .await
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.stdout().lines().count(), 200);
        assert_eq!(delivered as u64 + result.dropped_lines(), 200);
    }

    #[tokio::test]
    async fn test_fast_consumer_receives_every_line() {
        let executor = ProcessExecutor::default();
        let mut lines = Vec::new();
        let mut on_line = |line: &str| lines.push(line.to_string());
        let result = executor
            .execute_streaming(
                ProcessExecutionRequest::new("/usr/bin/seq", ["1", "50000"]),
                &mut on_line,
            )
            .await
            .unwrap();

        assert!(result.succeeded());
        assert_eq!(result.dropped_lines(), 0);
        assert_eq!(lines.len(), 50_000);
        assert_eq!(lines.first().map(String::as_str), Some("1"));
        assert_eq!(lines.last().map(String::as_str), Some("50000"));
        assert!(lines.iter().zip(1..).all(|(line, n)| *line == n.to_string()));
    }

    #[tokio::test]
    async fn test_lines_queued_at_exit_are_delivered() {
        let executor = ProcessExecutor::default();
        let mut count = 0usize;
        let mut on_line = |_: &str| count += 1;
        let result = executor
            .execute_streaming(
                sh("i=0; while [ $i -lt 3000 ]; do echo line-$i; i=$((i+1)); done"),
                &mut on_line,
            )
            .await
            .unwrap();
        assert_eq!(result.dropped_lines(), 0);
        assert_eq!(count, 3000);
    }

    #[test]
    fn test_trim_line_ending() {
        assert_eq!(trim_line_ending("a\r\n"), "a");
        assert_eq!(trim_line_ending("b\n"), "b");
        assert_eq!(trim_line_ending("c"), "c");
    }
}
