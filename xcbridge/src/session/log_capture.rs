//! # Log Capture Sessions
//!
//! Streams a device's unified log into a bounded buffer until the capture is
//! stopped. Each stdout line of the log-stream child is parsed as one ndjson
//! record; anything that is not a JSON object with at least one recognised
//! field (banner text, partial lines, trailers) is skipped without counting.
//!
//! Field names vary between OS releases, so each field is looked up under
//! several keys. Missing fields default to an empty string or zero.

use super::{Session, SessionRegistry, SessionSummary, SessionTarget};
use crate::config::{LogCaptureConfig, render_template};
use crate::error::{CoreError, CoreResult};
use crate::executor::{ProcessExecutor, for_each_line, trim_line_ending};
use crate::resource_lock::ResourceLockRegistry;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, Weak,
    atomic::{AtomicU64, Ordering},
};
use xcbridge_common::RingBuffer;

const TIMESTAMP_KEYS: &[&str] = &["timestamp"];
const PROCESS_KEYS: &[&str] = &["process", "processName", "processImagePath"];
const PID_KEYS: &[&str] = &["processID", "pid"];
const SUBSYSTEM_KEYS: &[&str] = &["subsystem"];
const CATEGORY_KEYS: &[&str] = &["category"];
const LEVEL_KEYS: &[&str] = &["messageType", "level"];
const MESSAGE_KEYS: &[&str] = &["eventMessage", "message"];

/// One parsed log record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub process: String,
    pub pid: u64,
    pub subsystem: String,
    pub category: String,
    pub level: String,
    pub message: String,
}

/// Parse one ndjson line, or `None` if it is not a log record.
pub fn parse_log_line(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    let Value::Object(record) = serde_json::from_str::<Value>(line).ok()? else {
        return None;
    };
    let known = [
        TIMESTAMP_KEYS,
        PROCESS_KEYS,
        PID_KEYS,
        SUBSYSTEM_KEYS,
        CATEGORY_KEYS,
        LEVEL_KEYS,
        MESSAGE_KEYS,
    ];
    if !known
        .iter()
        .flat_map(|keys| keys.iter())
        .any(|key| record.contains_key(*key))
    {
        return None;
    }

    let mut process = string_field(&record, PROCESS_KEYS);
    // Image paths carry the whole bundle path; keep the executable name.
    if process.contains('/') {
        process = process
            .rsplit('/')
            .find(|part| !part.is_empty())
            .unwrap_or_default()
            .to_string();
    }

    Some(LogEntry {
        timestamp: string_field(&record, TIMESTAMP_KEYS),
        process,
        pid: integer_field(&record, PID_KEYS),
        subsystem: string_field(&record, SUBSYSTEM_KEYS),
        category: string_field(&record, CATEGORY_KEYS),
        level: string_field(&record, LEVEL_KEYS),
        message: string_field(&record, MESSAGE_KEYS),
    })
}

fn first_value<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| record.get(*key))
        .find(|value| !value.is_null())
}

fn string_field(record: &Map<String, Value>, keys: &[&str]) -> String {
    match first_value(record, keys) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        _ => String::new(),
    }
}

fn integer_field(record: &Map<String, Value>, keys: &[&str]) -> u64 {
    match first_value(record, keys) {
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// Parameters of [`LogCaptureManager::start_capture`].
#[derive(Debug, Clone, Default)]
pub struct CaptureRequest {
    pub device_id: String,
    pub predicate: Option<String>,
    /// Ring buffer capacity; the configured default when `None`.
    pub buffer_size: Option<usize>,
    pub lock_key: Option<String>,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub session_id: String,
    /// Retained records, oldest first.
    pub entries: Vec<LogEntry>,
    pub total_entries_received: u64,
    pub dropped_entry_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaptureStats {
    #[serde(flatten)]
    pub session: SessionSummary,
    pub buffered: usize,
    pub capacity: usize,
    pub total_entries_received: u64,
    pub dropped_entry_count: u64,
}

/// Records of one capture.
#[derive(Debug)]
pub struct CaptureBuffer {
    entries: Mutex<RingBuffer<LogEntry>>,
    received: AtomicU64,
}

impl CaptureBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(RingBuffer::new(capacity)),
            received: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, RingBuffer<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, entry: LogEntry) {
        let mut entries = self.entries();
        entries.push(entry);
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    fn totals(&self) -> (u64, u64) {
        let entries = self.entries();
        (self.received.load(Ordering::Relaxed), entries.dropped_count())
    }
}

#[derive(Debug)]
pub struct LogCaptureManager {
    registry: Arc<SessionRegistry<CaptureBuffer>>,
    locks: Arc<ResourceLockRegistry>,
    config: LogCaptureConfig,
}

impl LogCaptureManager {
    pub fn new(
        executor: Arc<ProcessExecutor>,
        locks: Arc<ResourceLockRegistry>,
        config: LogCaptureConfig,
    ) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new("log", executor)),
            locks,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry<CaptureBuffer>> {
        &self.registry
    }

    /// Start streaming the device log into a new capture session.
    pub async fn start_capture(&self, request: CaptureRequest) -> CoreResult<String> {
        if request.device_id.trim().is_empty() {
            return Err(CoreError::invalid_input("device_id is required"));
        }
        let capacity = request
            .buffer_size
            .unwrap_or(self.config.default_buffer_size);
        if capacity == 0 || capacity > self.config.max_buffer_size {
            return Err(CoreError::invalid_input(format!(
                "buffer_size must be between 1 and {}, got {}",
                self.config.max_buffer_size, capacity
            )));
        }

        let vars = [("device_id", request.device_id.as_str())];
        let mut args: Vec<String> = self
            .config
            .args
            .iter()
            .map(|arg| render_template(arg, &vars))
            .collect();
        if let Some(predicate) = request.predicate.as_deref().filter(|p| !p.trim().is_empty()) {
            args.push(self.config.predicate_flag.clone());
            args.push(predicate.to_string());
        }

        let lease = match &request.lock_key {
            Some(key) => Some(self.locks.lease(key, &request.owner)?),
            None => None,
        };
        let mut child = self
            .registry
            .executor()
            .spawn_streaming(&self.config.executable, &args)?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let id = self.registry.next_id();
        let session = self
            .registry
            .register(Session::new(
                id.clone(),
                SessionTarget {
                    device_id: request.device_id.clone(),
                    ..SessionTarget::default()
                },
                child,
                lease,
                CaptureBuffer::new(capacity),
            ))
            .await;

        if let Some(stdout) = stdout {
            let session = Arc::downgrade(&session);
            tokio::spawn(async move {
                for_each_line(stdout, |raw| {
                    if let Some(entry) = parse_log_line(trim_line_ending(raw))
                        && let Some(session) = session.upgrade()
                    {
                        session.payload().record(entry);
                    }
                })
                .await;
                if let Some(session) = Weak::upgrade(&session) {
                    session.mark_exited();
                }
            });
        }
        if let Some(stderr) = stderr {
            let id = id.clone();
            tokio::spawn(async move {
                for_each_line(stderr, |raw| {
                    tracing::debug!("log stream {} stderr: {}", id, trim_line_ending(raw));
                })
                .await;
            });
        }

        session.mark_active();
        tracing::info!(
            "Log capture {} started on {} (buffer {})",
            id,
            request.device_id,
            capacity
        );
        Ok(id)
    }

    /// Stop the capture and return everything it retained.
    pub async fn stop_capture(&self, session_id: &str) -> CoreResult<CaptureSummary> {
        let (session, _) = self.registry.teardown(session_id).await?;
        let buffer = session.payload();
        let (total_entries_received, dropped_entry_count) = buffer.totals();
        let entries = buffer.entries().to_vec();
        tracing::info!(
            "Log capture {} stopped: {} received, {} retained",
            session_id,
            total_entries_received,
            entries.len()
        );
        Ok(CaptureSummary {
            session_id: session_id.to_string(),
            entries,
            total_entries_received,
            dropped_entry_count,
        })
    }

    /// Counters of a capture that keeps running.
    pub async fn capture_stats(&self, session_id: &str) -> CoreResult<CaptureStats> {
        let session = self.registry.get(session_id).await?;
        let buffer = session.payload();
        let (total_entries_received, dropped_entry_count) = buffer.totals();
        let (buffered, capacity) = {
            let entries = buffer.entries();
            (entries.len(), entries.capacity())
        };
        Ok(CaptureStats {
            session: session.summary(),
            buffered,
            capacity,
            total_entries_received,
            dropped_entry_count,
        })
    }

    /// The newest `limit` records of a running capture, oldest first.
    pub async fn recent_entries(&self, session_id: &str, limit: usize) -> CoreResult<Vec<LogEntry>> {
        let session = self.registry.get(session_id).await?;
        let entries = session.payload().entries().tail(limit);
        Ok(entries)
    }

    pub async fn shutdown(&self) -> usize {
        self.registry.shutdown_all().await
    }
}
