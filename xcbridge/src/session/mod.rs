//! # Session Lifecycle
//!
//! A session wraps one long-lived child process (a debugger, a log stream)
//! that outlives the call that started it. [`SessionRegistry`] is generic over
//! the per-session payload so the debugger and log-capture managers share the
//! bookkeeping: ID allocation, the state machine, stopping the child, and
//! releasing the session's lock key exactly once.
//!
//! Sessions move through `Starting -> Active -> Stopping -> Stopped`. A child
//! that dies on its own moves its session straight to `Stopped` and frees its
//! lock; the session stays in the table until it is explicitly stopped.

pub mod debugger;
pub mod denylist;
pub mod log_capture;

use crate::executor::ProcessExecutor;
use crate::error::{CoreError, CoreResult};
use crate::resource_lock::LockLease;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::SystemTime,
};
use tokio::{process::Child, sync::RwLock};
use xcbridge_common::StateMachine;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Active,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// What a session is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionTarget {
    pub device_id: String,
    pub pid: Option<u32>,
    pub bundle_id: Option<String>,
}

/// One live session and its child process.
pub struct Session<P> {
    id: String,
    target: SessionTarget,
    started_at: SystemTime,
    child_pid: Option<u32>,
    state: StateMachine<SessionState>,
    child: tokio::sync::Mutex<Option<Child>>,
    lease: Mutex<Option<LockLease>>,
    payload: P,
}

impl<P> fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("state", &self.state())
            .field("child_pid", &self.child_pid)
            .finish_non_exhaustive()
    }
}

impl<P> Session<P> {
    pub fn new(
        id: String,
        target: SessionTarget,
        child: Child,
        lease: Option<LockLease>,
        payload: P,
    ) -> Self {
        Self {
            id,
            target,
            started_at: SystemTime::now(),
            child_pid: child.id(),
            state: StateMachine::new(SessionState::Starting),
            child: tokio::sync::Mutex::new(Some(child)),
            lease: Mutex::new(lease),
            payload,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &SessionTarget {
        &self.target
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn child_pid(&self) -> Option<u32> {
        self.child_pid
    }

    pub fn lock_key(&self) -> Option<String> {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|lease| !lease.is_released())
            .map(|lease| lease.key().to_string())
    }

    /// `Starting -> Active`. Returns false from any other state.
    pub fn mark_active(&self) -> bool {
        self.state.transition(|state| {
            if *state == SessionState::Starting {
                *state = SessionState::Active;
                true
            } else {
                false
            }
        })
    }

    /// Record that the child went away without being asked to.
    ///
    /// Frees the lock straight away. A session already being stopped is left
    /// to the stopper.
    pub fn mark_exited(&self) {
        let exited = self.state.transition(|state| match state {
            SessionState::Starting | SessionState::Active => {
                *state = SessionState::Stopped;
                true
            }
            SessionState::Stopping | SessionState::Stopped => false,
        });
        if exited {
            tracing::info!("Session {} child exited on its own", self.id);
            self.release_lock();
        }
    }

    /// Release the session's lock key if it still holds one.
    pub fn release_lock(&self) -> bool {
        self.lease
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some_and(|lease| lease.release())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            state: self.state(),
            target: self.target.clone(),
            child_pid: self.child_pid,
            lock_key: self.lock_key(),
            started_at: self.started_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub state: SessionState,
    pub target: SessionTarget,
    pub child_pid: Option<u32>,
    pub lock_key: Option<String>,
    #[serde(with = "crate::utils::time")]
    pub started_at: SystemTime,
}

/// Table of live sessions sharing one ID prefix.
pub struct SessionRegistry<P> {
    prefix: &'static str,
    sessions: Arc<RwLock<HashMap<String, Arc<Session<P>>>>>,
    executor: Arc<ProcessExecutor>,
}

impl<P> fmt::Debug for SessionRegistry<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl<P> SessionRegistry<P> {
    pub fn new(prefix: &'static str, executor: Arc<ProcessExecutor>) -> Self {
        Self {
            prefix,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            executor,
        }
    }

    pub fn executor(&self) -> &Arc<ProcessExecutor> {
        &self.executor
    }

    /// Allocate an ID. The counter is shared by every registry in the process,
    /// so IDs never repeat across kinds or restarts of a kind.
    pub fn next_id(&self) -> String {
        format!(
            "{}_{}",
            self.prefix,
            SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    pub async fn register(&self, session: Session<P>) -> Arc<Session<P>> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), Arc::clone(&session));
        tracing::info!(
            "Registered session {} (child pid {:?})",
            session.id,
            session.child_pid
        );
        session
    }

    pub async fn get(&self, id: &str) -> CoreResult<Arc<Session<P>>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| unknown_session(id))
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn summaries(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<_> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.summary())
            .collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Remove `id` from the table and mark it stopping.
    ///
    /// Only one caller can take a given session; later calls get
    /// `InvalidInput` and have no side effects.
    pub async fn take(&self, id: &str) -> CoreResult<Arc<Session<P>>> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| unknown_session(id))?;
        session.state.transition(|state| {
            if matches!(state, SessionState::Starting | SessionState::Active) {
                *state = SessionState::Stopping;
            }
        });
        Ok(session)
    }

    /// Stop a taken session's child and free its lock. Returns whether this
    /// call released the lock.
    pub async fn finish(&self, session: &Session<P>) -> bool {
        let child = session.child.lock().await.take();
        if let Some(mut child) = child {
            self.executor.terminate(&mut child).await;
        }
        session.state.replace(SessionState::Stopped);
        let released = session.release_lock();
        tracing::info!("Session {} stopped (lock released: {})", session.id, released);
        released
    }

    /// `take` followed by `finish`.
    pub async fn teardown(&self, id: &str) -> CoreResult<(Arc<Session<P>>, bool)> {
        let session = self.take(id).await?;
        let released = self.finish(&session).await;
        Ok((session, released))
    }

    /// Stop every session. Returns how many were stopped.
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        let count = drained.len();
        for (_, session) in drained {
            session.state.transition(|state| {
                if *state != SessionState::Stopped {
                    *state = SessionState::Stopping;
                }
            });
            self.finish(&session).await;
        }
        if count > 0 {
            tracing::info!("Stopped {} {} session(s) on shutdown", count, self.prefix);
        }
        count
    }
}

fn unknown_session(id: &str) -> CoreError {
    CoreError::invalid_input(format!("Unknown or already stopped session '{id}'"))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::resource_lock::ResourceLockRegistry;
    use std::path::Path;

    fn registry() -> SessionRegistry<()> {
        SessionRegistry::new("test", Arc::new(ProcessExecutor::default()))
    }

    fn sleeper(registry: &SessionRegistry<()>) -> Child {
        registry
            .executor()
            .spawn_streaming(Path::new("/bin/sleep"), &["60".to_string()])
            .unwrap()
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_prefixed() {
        let a = registry();
        let b = SessionRegistry::<()>::new("other", Arc::new(ProcessExecutor::default()));
        let first = a.next_id();
        let second = b.next_id();
        assert!(first.starts_with("test_"));
        assert!(second.starts_with("other_"));
        assert_ne!(
            first.trim_start_matches("test_"),
            second.trim_start_matches("other_")
        );
    }

    #[tokio::test]
    async fn test_teardown_releases_lock_once_and_rejects_second_stop() {
        let locks = Arc::new(ResourceLockRegistry::new());
        let registry = registry();
        let lease = locks.lease("simulator:S1", "test").unwrap();
        let id = registry.next_id();
        let session = Session::new(
            id.clone(),
            SessionTarget::default(),
            sleeper(&registry),
            Some(lease),
            (),
        );
        registry.register(session).await;
        assert!(locks.is_held("simulator:S1"));

        let (session, released) = registry.teardown(&id).await.unwrap();
        assert!(released);
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!locks.is_held("simulator:S1"));

        // Someone else takes the key; a second stop must not disturb it.
        locks.acquire("simulator:S1", "next").unwrap();
        let err = registry.teardown(&id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(locks.holder("simulator:S1").unwrap().owner, "next");
    }

    #[tokio::test]
    async fn test_mark_exited_frees_lock_but_keeps_session() {
        let locks = Arc::new(ResourceLockRegistry::new());
        let registry = registry();
        let id = registry.next_id();
        let session = registry
            .register(Session::new(
                id.clone(),
                SessionTarget::default(),
                sleeper(&registry),
                Some(locks.lease("device:D", "test").unwrap()),
                (),
            ))
            .await;
        assert!(session.mark_active());

        session.mark_exited();
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(!locks.is_held("device:D"));
        assert!(registry.contains(&id).await);

        let (_, released) = registry.teardown(&id).await.unwrap();
        assert!(!released);
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_everything() {
        let registry = registry();
        for _ in 0..3 {
            let id = registry.next_id();
            registry
                .register(Session::new(id, SessionTarget::default(), sleeper(&registry), None, ()))
                .await;
        }
        assert_eq!(registry.summaries().await.len(), 3);
        assert_eq!(registry.shutdown_all().await, 3);
        assert!(registry.ids().await.is_empty());
    }
}
