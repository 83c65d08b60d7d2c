//! # Resource Lock Registry
//!
//! Non-blocking, per-key mutual exclusion for operations that touch the same
//! external resource (a simulator, a build target, a debugger target).
//!
//! Acquisition never waits: a held key is reported as [`CoreError::ResourceBusy`]
//! straight away, so the registry cannot deadlock. Distinct keys are fully
//! independent. Keys are cooperative; the registry enforces nothing about what
//! a key names, so callers must agree on a naming scheme (see [`resource_key`]).

use crate::error::{CoreError, CoreResult};
use serde::Serialize;
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::SystemTime,
};

/// Conventional key builders.
pub mod resource_key {
    pub fn simulator(udid: &str) -> String {
        format!("simulator:{udid}")
    }

    pub fn device(udid: &str) -> String {
        format!("device:{udid}")
    }

    pub fn build(target: &str) -> String {
        format!("build:{target}")
    }

    pub fn debugger(pid: u32) -> String {
        format!("lldb:{pid}")
    }
}

/// A held lock.
#[derive(Debug, Clone, Serialize)]
pub struct LockEntry {
    pub key: String,
    /// Diagnostic label of the holder; never used for matching.
    pub owner: String,
    #[serde(with = "crate::utils::time")]
    pub acquired_at: SystemTime,
    /// Identifies this acquisition so a guard only ever frees its own entry.
    #[serde(skip)]
    claim: u64,
}

/// Table of held resource keys.
#[derive(Debug, Default)]
pub struct ResourceLockRegistry {
    entries: Mutex<HashMap<String, LockEntry>>,
    next_claim: AtomicU64,
}

impl ResourceLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, LockEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `key` as held by `owner`.
    ///
    /// Fails with `ResourceBusy` if the key is held by anyone, including `owner`.
    pub fn acquire(&self, key: &str, owner: &str) -> CoreResult<()> {
        self.claim(key, owner).map(|_| ())
    }

    fn claim(&self, key: &str, owner: &str) -> CoreResult<u64> {
        let mut table = self.table();
        if let Some(existing) = table.get(key) {
            tracing::debug!(
                "Lock '{}' requested by '{}' is held by '{}'",
                key,
                owner,
                existing.owner
            );
            return Err(CoreError::ResourceBusy {
                key: key.to_string(),
                owner: existing.owner.clone(),
            });
        }
        let claim = self.next_claim.fetch_add(1, Ordering::Relaxed);
        table.insert(
            key.to_string(),
            LockEntry {
                key: key.to_string(),
                owner: owner.to_string(),
                acquired_at: SystemTime::now(),
                claim,
            },
        );
        tracing::debug!("Lock '{}' acquired by '{}'", key, owner);
        Ok(claim)
    }

    /// Clear any entry for `key`. Returns whether an entry was removed.
    pub fn release(&self, key: &str) -> bool {
        let removed = self.table().remove(key);
        if let Some(entry) = &removed {
            tracing::debug!("Lock '{}' released (held by '{}')", key, entry.owner);
        }
        removed.is_some()
    }

    /// Clear `key` only if it is still held by the acquisition `claim`.
    fn release_claim(&self, key: &str, claim: u64) -> bool {
        let mut table = self.table();
        if table.get(key).is_none_or(|entry| entry.claim != claim) {
            return false;
        }
        let removed = table.remove(key);
        if let Some(entry) = &removed {
            tracing::debug!("Lock '{}' released (held by '{}')", key, entry.owner);
        }
        removed.is_some()
    }

    pub fn is_held(&self, key: &str) -> bool {
        self.table().contains_key(key)
    }

    pub fn holder(&self, key: &str) -> Option<LockEntry> {
        self.table().get(key).cloned()
    }

    /// Snapshot of every held lock, oldest first.
    pub fn held(&self) -> Vec<LockEntry> {
        let mut entries: Vec<_> = self.table().values().cloned().collect();
        entries.sort_by_key(|e| e.acquired_at);
        entries
    }

    /// Acquire `key` and return a handle that releases it exactly once,
    /// explicitly or when dropped.
    pub fn lease(self: &Arc<Self>, key: &str, owner: &str) -> CoreResult<LockLease> {
        let claim = self.claim(key, owner)?;
        Ok(LockLease {
            registry: Arc::clone(self),
            key: key.to_string(),
            claim,
            released: AtomicBool::new(false),
        })
    }

    /// Run `body` while holding `key`.
    ///
    /// If the key is busy the busy error is returned and `body` never runs.
    /// Otherwise the key is released however `body` finishes: normal return,
    /// error, panic, or the returned future being dropped before completion.
    /// If `body` gives the key up early and someone else takes it, that
    /// holder's entry is left alone.
    pub async fn with_lock<T, E, F, Fut>(&self, key: &str, owner: &str, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CoreError>,
    {
        let claim = self.claim(key, owner)?;
        let _release = ReleaseOnDrop {
            registry: self,
            key,
            claim,
        };
        body().await
    }
}

struct ReleaseOnDrop<'a> {
    registry: &'a ResourceLockRegistry,
    key: &'a str,
    claim: u64,
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.registry.release_claim(self.key, self.claim);
    }
}

/// Owned handle on a held key.
#[derive(Debug)]
pub struct LockLease {
    registry: Arc<ResourceLockRegistry>,
    key: String,
    claim: u64,
    released: AtomicBool,
}

impl LockLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the key. Only the first call has an effect, and only while the
    /// key is still held by this lease; returns whether an entry was removed.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.registry.release_claim(&self.key, self.claim)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_second_acquire_is_busy_until_release() {
        let locks = ResourceLockRegistry::new();
        locks.acquire("simulator:A", "owner-a").unwrap();

        let err = locks.acquire("simulator:A", "owner-b").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceBusy);
        assert!(err.to_string().contains("simulator:A"));
        assert!(err.to_string().contains("owner-a"));

        assert!(locks.release("simulator:A"));
        locks.acquire("simulator:A", "owner-b").unwrap();
        assert_eq!(locks.holder("simulator:A").unwrap().owner, "owner-b");
    }

    #[test]
    fn test_same_owner_is_also_busy() {
        let locks = ResourceLockRegistry::new();
        locks.acquire("build:App", "same").unwrap();
        assert!(locks.acquire("build:App", "same").is_err());
    }

    #[test]
    fn test_release_is_idempotent() {
        let locks = ResourceLockRegistry::new();
        assert!(!locks.release("never-held"));
        locks.acquire("k", "o").unwrap();
        assert!(locks.release("k"));
        assert!(!locks.release("k"));
        assert!(!locks.is_held("k"));
    }

    #[test]
    fn test_distinct_keys_are_independent() {
        let locks = ResourceLockRegistry::new();
        locks.acquire(&resource_key::simulator("A"), "x").unwrap();
        locks.acquire(&resource_key::simulator("B"), "x").unwrap();
        locks.acquire(&resource_key::debugger(42), "x").unwrap();
        assert_eq!(locks.held().len(), 3);
        locks.release("simulator:A");
        assert!(locks.is_held("simulator:B"));
        assert!(locks.is_held("lldb:42"));
    }

    #[test]
    fn test_lease_releases_once_on_drop() {
        let locks = Arc::new(ResourceLockRegistry::new());
        {
            let lease = locks.lease("device:X", "capture").unwrap();
            assert_eq!(lease.key(), "device:X");
            assert!(locks.lease("device:X", "other").is_err());
        }
        assert!(!locks.is_held("device:X"));
    }

    #[test]
    fn test_explicit_lease_release_does_not_free_a_later_holder() {
        let locks = Arc::new(ResourceLockRegistry::new());
        let lease = locks.lease("k", "first").unwrap();
        assert!(lease.release());
        locks.acquire("k", "second").unwrap();

        // Neither a second release nor the drop may clear the new holder's entry.
        assert!(!lease.release());
        drop(lease);
        assert_eq!(locks.holder("k").unwrap().owner, "second");
    }

    #[tokio::test]
    async fn test_with_lock_runs_body_and_releases() {
        let locks = ResourceLockRegistry::new();
        let value: Result<u32, CoreError> = locks
            .with_lock("k", "o", || async {
                assert!(locks.is_held("k"));
                Ok(7)
            })
            .await;
        assert_eq!(value.unwrap(), 7);
        assert!(!locks.is_held("k"));
    }

    #[tokio::test]
    async fn test_with_lock_busy_skips_body() {
        let locks = ResourceLockRegistry::new();
        locks.acquire("k", "holder").unwrap();
        let mut ran = false;
        let result: Result<(), CoreError> = locks
            .with_lock("k", "o", || {
                ran = true;
                async { Ok(()) }
            })
            .await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::ResourceBusy);
        assert!(!ran);
        assert_eq!(locks.holder("k").unwrap().owner, "holder");
    }

    #[tokio::test]
    async fn test_with_lock_leaves_a_later_holder_alone() {
        let locks = ResourceLockRegistry::new();
        let result: Result<(), CoreError> = locks
            .with_lock("simulator:A", "first", || async {
                assert!(locks.release("simulator:A"));
                locks.acquire("simulator:A", "second")?;
                Ok(())
            })
            .await;
        result.unwrap();
        assert_eq!(locks.holder("simulator:A").unwrap().owner, "second");
    }

    #[test]
    fn test_lease_does_not_free_key_released_behind_its_back() {
        let locks = Arc::new(ResourceLockRegistry::new());
        let lease = locks.lease("device:X", "capture").unwrap();
        locks.release("device:X");
        locks.acquire("device:X", "other").unwrap();

        assert!(!lease.release());
        drop(lease);
        assert_eq!(locks.holder("device:X").unwrap().owner, "other");
    }

    #[tokio::test]
    async fn test_with_lock_releases_after_error() {
        let locks = ResourceLockRegistry::new();
        let result: Result<(), CoreError> = locks
            .with_lock("k", "o", || async {
                Err(CoreError::command_failed("body failed"))
            })
            .await;
        assert!(result.is_err());
        locks.acquire("k", "anyone").unwrap();
    }
}
