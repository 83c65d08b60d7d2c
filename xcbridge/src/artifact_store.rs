//! # Artifact Store
//!
//! Short-lived files produced by commands (screenshots, recordings, crash
//! logs) that a client fetches by path shortly afterwards. Each artifact gets
//! its own freshly created directory under the base dir, so names never
//! collide, and removing an artifact removes that directory.
//!
//! Two limits bound disk use:
//!
//! - age: [`ArtifactStore::evict_expired`] removes artifacts older than the
//!   TTL (a zero TTL makes every artifact eligible on the next pass);
//! - total size: [`ArtifactStore::store`] evicts the oldest artifacts until
//!   the new one fits. The new artifact itself is never evicted, even when it
//!   alone exceeds the cap.

use crate::config::ArtifactConfig;
use crate::error::{CoreError, CoreResult};
use crate::utils::time::age;
use serde::Serialize;
use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
    sync::{Arc, Weak},
    time::{Duration, SystemTime},
};
use tokio::{sync::Mutex, task::JoinHandle};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Handle returned to the caller of [`ArtifactStore::store`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactReference {
    pub path: PathBuf,
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactRecord {
    pub path: PathBuf,
    pub mime_type: String,
    pub size_bytes: u64,
    #[serde(with = "crate::utils::time")]
    pub created_at: SystemTime,
    #[serde(skip)]
    dir: PathBuf,
}

#[derive(Debug)]
pub struct ArtifactStore {
    base_dir: PathBuf,
    ttl: Duration,
    max_total_bytes: u64,
    /// Oldest first.
    index: Mutex<VecDeque<ArtifactRecord>>,
}

impl ArtifactStore {
    pub fn new(config: &ArtifactConfig) -> Self {
        Self::with_limits(
            config.resolved_base_dir(),
            config.ttl(),
            config.max_total_bytes,
        )
    }

    pub fn with_limits(base_dir: impl Into<PathBuf>, ttl: Duration, max_total_bytes: u64) -> Self {
        Self {
            base_dir: base_dir.into(),
            ttl,
            max_total_bytes,
            index: Mutex::new(VecDeque::new()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write `data` as a new artifact named after the last path component of
    /// `filename`.
    pub async fn store(
        &self,
        data: &[u8],
        filename: &str,
        mime_type: &str,
    ) -> CoreResult<ArtifactReference> {
        let name = sanitize_filename(filename)?;
        let mime_type = match mime_type.trim() {
            "" => DEFAULT_MIME_TYPE.to_string(),
            other => other.to_string(),
        };

        tokio::fs::create_dir_all(&self.base_dir).await.map_err(|e| {
            CoreError::io(
                format!(
                    "Failed to create artifact directory '{}'",
                    self.base_dir.display()
                ),
                e,
            )
        })?;
        let dir = tempfile::Builder::new()
            .prefix("artifact-")
            .tempdir_in(&self.base_dir)
            .map_err(|e| CoreError::io("Failed to allocate artifact directory", e))?
            .keep();
        let path = dir.join(name);
        if let Err(e) = tokio::fs::write(&path, data).await {
            remove_dir(&dir).await;
            return Err(CoreError::io(
                format!("Failed to write artifact '{}'", path.display()),
                e,
            ));
        }

        // Stamped under the index lock so queue order is creation order.
        let mut index = self.index.lock().await;
        let record = ArtifactRecord {
            path: path.clone(),
            mime_type: mime_type.clone(),
            size_bytes: data.len() as u64,
            created_at: SystemTime::now(),
            dir,
        };
        tracing::debug!(
            "Stored artifact {} ({} bytes, {})",
            path.display(),
            record.size_bytes,
            mime_type
        );
        index.push_back(record);
        let mut total: u64 = index.iter().map(|r| r.size_bytes).sum();
        while total > self.max_total_bytes && index.len() > 1 {
            let Some(oldest) = index.pop_front() else {
                break;
            };
            total -= oldest.size_bytes;
            tracing::info!(
                "Evicting artifact {} to stay under {} bytes",
                oldest.path.display(),
                self.max_total_bytes
            );
            remove_dir(&oldest.dir).await;
        }

        Ok(ArtifactReference { path, mime_type })
    }

    /// Combined size of every tracked artifact.
    pub async fn total_size(&self) -> u64 {
        self.index.lock().await.iter().map(|r| r.size_bytes).sum()
    }

    /// Remove artifacts past the TTL. Returns how many were removed.
    pub async fn evict_expired(&self) -> usize {
        let mut index = self.index.lock().await;
        let (expired, kept): (VecDeque<_>, VecDeque<_>) = index
            .drain(..)
            .partition(|record| self.ttl.is_zero() || age(record.created_at) > self.ttl);
        *index = kept;
        for record in &expired {
            remove_dir(&record.dir).await;
        }
        if !expired.is_empty() {
            tracing::info!("Evicted {} expired artifact(s)", expired.len());
        }
        expired.len()
    }

    /// Snapshot of tracked artifacts, oldest first.
    pub async fn list(&self) -> Vec<ArtifactRecord> {
        self.index.lock().await.iter().cloned().collect()
    }

    /// Index artifacts left in the base dir by an earlier process, using file
    /// modification times as creation times. Returns how many were adopted.
    pub async fn load_existing(&self) -> CoreResult<usize> {
        let mut entries = match tokio::fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CoreError::io(
                    format!("Failed to read '{}'", self.base_dir.display()),
                    e,
                ));
            }
        };

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::io("Failed to scan artifact directory", e))?
        {
            let dir = entry.path();
            let is_artifact_dir = entry.file_name().to_string_lossy().starts_with("artifact-")
                && entry.file_type().await.is_ok_and(|t| t.is_dir());
            if !is_artifact_dir {
                continue;
            }
            let mut files = match tokio::fs::read_dir(&dir).await {
                Ok(files) => files,
                Err(_) => continue,
            };
            if let Ok(Some(file)) = files.next_entry().await
                && let Ok(metadata) = file.metadata().await
                && metadata.is_file()
            {
                found.push(ArtifactRecord {
                    path: file.path(),
                    mime_type: DEFAULT_MIME_TYPE.to_string(),
                    size_bytes: metadata.len(),
                    created_at: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
                    dir,
                });
            }
        }

        let mut index = self.index.lock().await;
        let adopted = found
            .into_iter()
            .filter(|record| !index.iter().any(|known| known.dir == record.dir))
            .collect::<Vec<_>>();
        let count = adopted.len();
        index.extend(adopted);
        index.make_contiguous().sort_by_key(|record| record.created_at);
        tracing::debug!("Adopted {} artifact(s) from {}", count, self.base_dir.display());
        Ok(count)
    }

    /// Run `evict_expired` every `interval` until the store is dropped.
    pub fn start_background_eviction(store: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(store);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(store) = store.upgrade() else {
                    tracing::debug!("Artifact store dropped; stopping sweeper");
                    break;
                };
                store.evict_expired().await;
            }
        })
    }
}

fn sanitize_filename(filename: &str) -> CoreResult<&str> {
    let name = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        return Err(CoreError::invalid_input(format!(
            "Invalid artifact filename '{filename}'"
        )));
    }
    Ok(name)
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove artifact directory {}: {}", dir.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_filename_is_reduced_to_last_component() {
        assert_eq!(sanitize_filename("shot.png").unwrap(), "shot.png");
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\tmp\\log.txt").unwrap(), "log.txt");
        assert_eq!(
            sanitize_filename("dir/").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert!(sanitize_filename("").is_err());
        assert!(sanitize_filename("a/..").is_err());
    }

    #[tokio::test]
    async fn test_store_writes_file_under_base_dir() {
        let base = tempfile::tempdir().unwrap();
        let store = ArtifactStore::with_limits(base.path(), Duration::from_secs(60), 1024);
        let reference = store
            .store(b"png-bytes", "nested/screen.png", "image/png")
            .await
            .unwrap();

        assert!(reference.path.starts_with(base.path()));
        assert_eq!(reference.path.file_name().unwrap(), "screen.png");
        assert_eq!(reference.mime_type, "image/png");
        assert_eq!(std::fs::read(&reference.path).unwrap(), b"png-bytes");
        assert_eq!(store.total_size().await, 9);
    }

    #[tokio::test]
    async fn test_same_name_does_not_collide() {
        let base = tempfile::tempdir().unwrap();
        let store = ArtifactStore::with_limits(base.path(), Duration::from_secs(60), 1024);
        let a = store.store(b"a", "log.txt", "text/plain").await.unwrap();
        let b = store.store(b"b", "log.txt", "").await.unwrap();
        assert_ne!(a.path, b.path);
        assert_eq!(b.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(store.list().await.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_artifact_is_kept_alone() {
        let base = tempfile::tempdir().unwrap();
        let store = ArtifactStore::with_limits(base.path(), Duration::from_secs(60), 4);
        let first = store.store(b"12", "a.bin", "").await.unwrap();
        let big = store.store(b"123456789", "b.bin", "").await.unwrap();

        assert!(!first.path.exists());
        assert!(big.path.exists());
        assert_eq!(store.total_size().await, 9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stores_keep_index_in_creation_order() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::with_limits(
            base.path(),
            Duration::from_secs(60),
            1024 * 1024,
        ));
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store
                        .store(&vec![0u8; 64 * (i % 4 + 1)], &format!("{i}.bin"), "")
                        .await
                        .unwrap()
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let listed = store.list().await;
        assert_eq!(listed.len(), 32);
        assert!(
            listed
                .windows(2)
                .all(|pair| pair[0].created_at <= pair[1].created_at)
        );
    }

    #[tokio::test]
    async fn test_unexpired_artifacts_survive_sweep() {
        let base = tempfile::tempdir().unwrap();
        let store = ArtifactStore::with_limits(base.path(), Duration::from_secs(3600), 1024);
        let kept = store.store(b"x", "x.txt", "").await.unwrap();
        assert_eq!(store.evict_expired().await, 0);
        assert!(kept.path.exists());
    }

    #[tokio::test]
    async fn test_load_existing_adopts_previous_artifacts() {
        let base = tempfile::tempdir().unwrap();
        let first = ArtifactStore::with_limits(base.path(), Duration::ZERO, 1024);
        let reference = first.store(b"left over", "crash.log", "text/plain").await.unwrap();
        std::fs::create_dir_all(base.path().join("unrelated")).unwrap();

        let second = ArtifactStore::with_limits(base.path(), Duration::ZERO, 1024);
        assert_eq!(second.load_existing().await.unwrap(), 1);
        assert_eq!(second.load_existing().await.unwrap(), 0);
        assert_eq!(second.total_size().await, 9);

        assert_eq!(second.evict_expired().await, 1);
        assert!(!reference.path.exists());
        assert!(base.path().join("unrelated").exists());
    }

    #[tokio::test]
    async fn test_background_eviction_stops_when_store_dropped() {
        let base = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::with_limits(base.path(), Duration::ZERO, 1024));
        let reference = store.store(b"x", "x.txt", "").await.unwrap();

        let sweeper = ArtifactStore::start_background_eviction(&store, Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!reference.path.exists());

        drop(store);
        tokio::time::timeout(Duration::from_secs(2), sweeper)
            .await
            .expect("sweeper should exit once the store is gone")
            .unwrap();
    }
}
