//! # Debug Sessions
//!
//! Keeps an interactive debugger attached to an app across many calls.
//!
//! Commands are written to the debugger's stdin followed by a boundary
//! command that prints a marker unique to that command. Everything the
//! debugger prints (stdout and stderr, interleaved) up to the marker line is
//! the command's output. A command that times out leaves the session open:
//! the next command first discards everything up to and including the
//! timed-out command's marker, so late output never leaks into a reply.

use super::{Session, SessionRegistry, SessionState, SessionTarget, denylist};
use crate::config::{DebuggerConfig, render_template};
use crate::constants::DEBUGGER_LINE_QUEUE_CAPACITY;
use crate::error::{CoreError, CoreResult};
use crate::executor::{ProcessExecutor, trim_line_ending};
use crate::resource_lock::ResourceLockRegistry;
use serde::Serialize;
use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::ChildStdin,
    sync::{Mutex, mpsc},
};

static BOUNDARY_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_marker() -> String {
    format!(
        "__XCB_BOUNDARY_{}__",
        BOUNDARY_COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

/// Parameters of [`DebugSessionManager::attach`].
#[derive(Debug, Clone, Default)]
pub struct AttachRequest {
    pub device_id: String,
    pub pid: Option<u32>,
    pub bundle_id: Option<String>,
    pub lock_key: Option<String>,
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub output: String,
    /// Set when the command matched the denylist and ran only because the
    /// caller allowed unsafe commands.
    pub bypassed_denylist: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetachSummary {
    pub session_id: String,
    pub released_lock: bool,
}

/// Pipes of one debugger child. Holding the mutex serializes commands.
pub struct DebugChannel {
    io: Mutex<DebugIo>,
}

struct DebugIo {
    stdin: ChildStdin,
    lines: mpsc::Receiver<String>,
    /// Boundary of the last command that timed out. Output up to and
    /// including it belongs to that command and is discarded.
    stale_marker: Option<String>,
}

enum ExchangeError {
    TimedOut,
    Closed,
}

#[derive(Debug)]
pub struct DebugSessionManager {
    registry: Arc<SessionRegistry<DebugChannel>>,
    locks: Arc<ResourceLockRegistry>,
    config: DebuggerConfig,
}

impl DebugSessionManager {
    pub fn new(
        executor: Arc<ProcessExecutor>,
        locks: Arc<ResourceLockRegistry>,
        config: DebuggerConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new("dbg", executor)),
            locks,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<DebugChannel>> {
        &self.registry
    }

    /// Start a debugger and attach it to the requested app.
    pub async fn attach(&self, request: AttachRequest) -> CoreResult<String> {
        if request.device_id.trim().is_empty() {
            return Err(CoreError::invalid_input("device_id is required"));
        }
        let attach_command = match (&request.pid, &request.bundle_id) {
            (Some(pid), _) => {
                render_template(
                    &self.config.attach_pid_command,
                    &[("pid", pid.to_string().as_str())],
                )
            }
            (None, Some(bundle_id)) if !bundle_id.trim().is_empty() => render_template(
                &self.config.attach_bundle_command,
                &[("bundle_id", bundle_id.as_str())],
            ),
            _ => {
                return Err(CoreError::invalid_input(
                    "Either pid or bundle_id is required to attach",
                ));
            }
        };
        if let Some(pid) = request.pid
            && self.config.verify_local_pid
        {
            ensure_process_alive(pid)?;
        }

        let lease = match &request.lock_key {
            Some(key) => Some(self.locks.lease(key, &request.owner)?),
            None => None,
        };

        let mut child = self
            .registry
            .executor()
            .spawn_interactive(&self.config.executable, &self.config.args)?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            self.registry.executor().terminate(&mut child).await;
            return Err(CoreError::internal("Debugger pipes were not captured"));
        };

        let (tx, rx) = mpsc::channel(DEBUGGER_LINE_QUEUE_CAPACITY);
        let id = self.registry.next_id();
        let session = self
            .registry
            .register(Session::new(
                id.clone(),
                SessionTarget {
                    device_id: request.device_id.clone(),
                    pid: request.pid,
                    bundle_id: request.bundle_id.clone(),
                },
                child,
                lease,
                DebugChannel {
                    io: Mutex::new(DebugIo {
                        stdin,
                        lines: rx,
                        stale_marker: None,
                    }),
                },
            ))
            .await;
        spawn_forwarder(stdout, tx.clone(), Arc::downgrade(&session));
        spawn_forwarder(stderr, tx, Arc::downgrade(&session));

        let device_vars = [("device_id", request.device_id.as_str())];
        let startup = self
            .config
            .attach_preamble
            .iter()
            .map(|command| render_template(command, &device_vars))
            .chain(std::iter::once(attach_command));
        for command in startup {
            let outcome = self
                .exchange(&session, &command, self.config.attach_timeout())
                .await;
            let failure = match outcome {
                Ok(output) => attach_error(&output),
                Err(ExchangeError::TimedOut) => Some(format!(
                    "timed out after {:?}",
                    self.config.attach_timeout()
                )),
                Err(ExchangeError::Closed) => Some("debugger exited".to_string()),
            };
            if let Some(reason) = failure {
                tracing::warn!("Attach of {} failed at '{}': {}", id, command, reason);
                let _ = self.registry.teardown(&id).await;
                return Err(CoreError::command_failed(format!(
                    "Debugger attach failed at '{command}': {reason}"
                )));
            }
        }

        session.mark_active();
        tracing::info!(
            "Debug session {} attached to {:?} on {}",
            id,
            request.pid.map(|p| p.to_string()).or(request.bundle_id),
            request.device_id
        );
        Ok(id)
    }

    /// Run one debugger command and return its output.
    ///
    /// `timeout` defaults to the configured command timeout.
    pub async fn send_command(
        &self,
        session_id: &str,
        command: &str,
        timeout: Option<Duration>,
        allow_unsafe: bool,
    ) -> CoreResult<CommandOutput> {
        tracing::info!(
            session = session_id,
            allow_unsafe,
            "Debugger command: {}",
            command
        );
        if command.trim().is_empty() {
            return Err(CoreError::invalid_input("Debugger command is empty"));
        }
        let session = self.registry.get(session_id).await?;

        let mut bypassed_denylist = false;
        if let Some(rule) = denylist::check(command) {
            if !allow_unsafe {
                return Err(CoreError::CommandDenied {
                    command: command.trim().to_string(),
                    reason: rule.reason.to_string(),
                    alternative: rule.alternative.to_string(),
                });
            }
            tracing::warn!(
                session = session_id,
                "Denylisted command '{}' allowed by caller ({})",
                command.trim(),
                rule.reason
            );
            bypassed_denylist = true;
        }

        match session.state() {
            SessionState::Active => {}
            SessionState::Stopped => {
                let _ = self.registry.teardown(session_id).await;
                return Err(CoreError::command_failed(format!(
                    "Debugger of session {session_id} has exited"
                )));
            }
            state => {
                return Err(CoreError::invalid_input(format!(
                    "Session {session_id} is {state}"
                )));
            }
        }

        let timeout = timeout.unwrap_or_else(|| self.config.command_timeout());
        match self.exchange(&session, command.trim(), timeout).await {
            Ok(output) => Ok(CommandOutput {
                output,
                bypassed_denylist,
            }),
            Err(ExchangeError::TimedOut) => Err(CoreError::command_failed(format!(
                "Debugger command '{}' timed out after {:?}; session {} is still open",
                command.trim(),
                timeout,
                session_id
            ))),
            Err(ExchangeError::Closed) => {
                let _ = self.registry.teardown(session_id).await;
                Err(CoreError::command_failed(format!(
                    "Debugger of session {session_id} exited while running '{}'",
                    command.trim()
                )))
            }
        }
    }

    /// Detach and end the session.
    pub async fn detach(&self, session_id: &str) -> CoreResult<DetachSummary> {
        let session = self.registry.take(session_id).await?;
        self.send_detach_commands(&session).await;
        let released_lock = self.registry.finish(&session).await;
        Ok(DetachSummary {
            session_id: session_id.to_string(),
            released_lock,
        })
    }

    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown_all().await
    }

    async fn send_detach_commands(&self, session: &Session<DebugChannel>) {
        if self.config.detach_commands.is_empty() {
            return;
        }
        let script: String = self
            .config
            .detach_commands
            .iter()
            .map(|c| format!("{c}\n"))
            .collect();
        let grace = self.registry.executor().config().termination_grace();
        let write = async {
            let mut io = session.payload().io.lock().await;
            io.stdin.write_all(script.as_bytes()).await?;
            io.stdin.flush().await
        };
        match tokio::time::timeout(grace, write).await {
            Ok(Ok(())) => {
                // Let the debugger act on the commands before it is signalled.
                let mut child = session.child.lock().await;
                if let Some(child) = child.as_mut() {
                    let _ = tokio::time::timeout(grace, child.wait()).await;
                }
            }
            Ok(Err(e)) => tracing::debug!("Detach commands not delivered to {}: {}", session.id(), e),
            Err(_) => tracing::debug!("Timed out delivering detach commands to {}", session.id()),
        }
    }

    async fn exchange(
        &self,
        session: &Session<DebugChannel>,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ExchangeError> {
        let mut guard = session.payload().io.lock().await;
        let io = &mut *guard;

        // Unsolicited output, or the late tail of a timed-out command.
        while let Ok(line) = io.lines.try_recv() {
            if io.stale_marker.as_deref() == Some(line.trim()) {
                io.stale_marker = None;
            }
            tracing::debug!("Discarding stale debugger output: {}", line);
        }

        let marker = next_marker();
        let boundary = render_template(&self.config.boundary_command, &[("marker", marker.as_str())]);
        let script = format!("{command}\n{boundary}\n");
        if let Err(e) = io.stdin.write_all(script.as_bytes()).await {
            tracing::debug!("Debugger stdin write failed: {}", e);
            return Err(ExchangeError::Closed);
        }
        if io.stdin.flush().await.is_err() {
            return Err(ExchangeError::Closed);
        }

        let mut output = Vec::new();
        let read = tokio::time::timeout(timeout, async {
            while let Some(line) = io.lines.recv().await {
                let trimmed = line.trim();
                if io.stale_marker.is_some() {
                    if io.stale_marker.as_deref() == Some(trimmed) {
                        io.stale_marker = None;
                    } else {
                        tracing::debug!("Discarding late debugger output: {}", line);
                    }
                    continue;
                }
                if trimmed == marker {
                    return Ok(());
                }
                output.push(line);
            }
            Err(ExchangeError::Closed)
        })
        .await;

        match read {
            Ok(Ok(())) => Ok(output.join("\n")),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                // Later markers always follow earlier ones, so only the newest matters.
                io.stale_marker = Some(marker);
                Err(ExchangeError::TimedOut)
            }
        }
    }
}

/// First line of attach output that reports a failure.
fn attach_error(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("error:"))
        .map(str::to_string)
}

#[cfg(unix)]
fn ensure_process_alive(pid: u32) -> CoreResult<()> {
    use nix::{errno::Errno, sys::signal, unistd::Pid};

    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => Ok(()),
        Err(Errno::ESRCH) => Err(CoreError::StaleDefault(format!(
            "Process {pid} is no longer running"
        ))),
        Err(e) => {
            tracing::debug!("Liveness probe for pid {} failed: {}", pid, e);
            Ok(())
        }
    }
}

#[cfg(not(unix))]
fn ensure_process_alive(_pid: u32) -> CoreResult<()> {
    Ok(())
}

/// Forward a debugger pipe line by line. When the pipe closes the session is
/// marked exited.
fn spawn_forwarder<R>(pipe: R, tx: mpsc::Sender<String>, session: Weak<Session<DebugChannel>>)
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
                    if tx.send(trim_line_ending(&text).to_string()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Debugger pipe read failed: {}", e);
                    break;
                }
            }
        }
        if let Some(session) = session.upgrade() {
            session.mark_exited();
        }
    });
}
