//! Size-capped eviction of the staging directory.
//!
//! A background pass wakes periodically, measures aggregate disk usage, and
//! while usage exceeds the configured cap removes the least-recently-touched
//! tracked file. Paths with open handles, or whose path lock is held (a
//! download in flight), are skipped for that pass rather than waited on:
//! files in active use are never evicted.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use blobgate_common::{from_posix_path, EVICTION_INTERVAL_SECS};

use crate::pathlock::{PathLock, PathLockMap};

/// Time-aware LRU over the staging directory, keyed by relative path.
pub struct EvictionPolicy {
    staging: PathBuf,
    limit: u64,
    locks: Arc<PathLockMap>,
    index: Mutex<HashMap<String, Instant>>,
    stop: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EvictionPolicy {
    /// Create a policy capping `staging` at `limit` bytes.
    pub fn new(staging: impl Into<PathBuf>, limit: u64, locks: Arc<PathLockMap>) -> Arc<Self> {
        Arc::new(Self {
            staging: staging.into(),
            limit,
            locks,
            index: Mutex::new(HashMap::new()),
            stop: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }

    /// Launch the periodic eviction task.
    pub fn start(self: &Arc<Self>) {
        let policy: Arc<Self> = self.clone();
        let handle: JoinHandle<()> = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = policy.stop.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_secs(EVICTION_INTERVAL_SECS)) => {
                        policy.pass();
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the eviction task and drop all recency tracking.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle: Option<JoinHandle<()>> = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("eviction task exited abnormally: {e}");
            }
        }
        self.index.lock().unwrap().clear();
    }

    /// Register `path` or refresh its recency.
    pub fn touch(&self, path: &str) {
        self.index
            .lock()
            .unwrap()
            .insert(path.to_string(), Instant::now());
    }

    /// Drop `path` from recency tracking.
    pub fn forget(&self, path: &str) {
        self.index.lock().unwrap().remove(path);
    }

    /// Aggregate staging-directory usage in bytes.
    pub fn disk_usage(&self) -> u64 {
        walkdir::WalkDir::new(&self.staging)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    /// Run one eviction pass.
    pub fn pass(&self) {
        let usage: u64 = self.disk_usage();
        let mut need: u64 = usage.saturating_sub(self.limit);
        if need == 0 {
            return;
        }
        log::debug!("staging usage {usage} over limit {}, evicting", self.limit);

        // Oldest touch first.
        let mut candidates: Vec<(String, Instant)> = {
            let index = self.index.lock().unwrap();
            index.iter().map(|(p, t)| (p.clone(), *t)).collect()
        };
        candidates.sort_by_key(|(_, touched)| *touched);

        for (path, _) in candidates {
            if need == 0 {
                break;
            }

            let entry: Arc<PathLock> = self.locks.entry(&path);
            if entry.open_handles() > 0 {
                log::debug!("eviction skipping {path}: file is open");
                continue;
            }
            // A held lock means the file is mid-download or mid-open.
            let Some(_guard) = entry.try_lock() else {
                log::debug!("eviction skipping {path}: lock contended");
                continue;
            };

            let Ok(local) = from_posix_path(&path, &self.staging) else {
                self.forget(&path);
                continue;
            };
            let size: u64 = match std::fs::metadata(&local) {
                Ok(meta) => meta.len(),
                Err(_) => {
                    // Already gone; just stop tracking it.
                    self.forget(&path);
                    continue;
                }
            };

            match std::fs::remove_file(&local) {
                Ok(()) => {
                    log::info!("evicted {path} ({size} bytes)");
                    self.forget(&path);
                    need = need.saturating_sub(size);
                }
                Err(e) => log::warn!("failed to evict {path}: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(staging: &std::path::Path, path: &str, len: usize) {
        let full = staging.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, vec![0u8; len]).unwrap();
    }

    #[tokio::test]
    async fn test_under_limit_keeps_everything() {
        let dir: TempDir = TempDir::new().unwrap();
        write_file(dir.path(), "a.bin", 100);

        let locks: Arc<PathLockMap> = Arc::new(PathLockMap::new());
        let policy = EvictionPolicy::new(dir.path(), 1000, locks);
        policy.touch("a.bin");
        policy.pass();

        assert!(dir.path().join("a.bin").exists());
    }

    #[tokio::test]
    async fn test_evicts_least_recently_touched_first() {
        let dir: TempDir = TempDir::new().unwrap();
        write_file(dir.path(), "old.bin", 600);
        write_file(dir.path(), "new.bin", 600);

        let locks: Arc<PathLockMap> = Arc::new(PathLockMap::new());
        let policy = EvictionPolicy::new(dir.path(), 1000, locks);
        policy.touch("old.bin");
        std::thread::sleep(Duration::from_millis(5));
        policy.touch("new.bin");

        policy.pass();

        // Removing the oldest 600 bytes brings usage back under the cap.
        assert!(!dir.path().join("old.bin").exists());
        assert!(dir.path().join("new.bin").exists());
    }

    #[tokio::test]
    async fn test_open_path_is_never_evicted() {
        let dir: TempDir = TempDir::new().unwrap();
        write_file(dir.path(), "open.bin", 600);
        write_file(dir.path(), "idle.bin", 600);

        let locks: Arc<PathLockMap> = Arc::new(PathLockMap::new());
        let policy = EvictionPolicy::new(dir.path(), 1000, locks.clone());
        // "open.bin" is the LRU candidate, but it is held open.
        policy.touch("open.bin");
        std::thread::sleep(Duration::from_millis(5));
        policy.touch("idle.bin");
        locks.entry("open.bin").add_handle();

        policy.pass();

        assert!(dir.path().join("open.bin").exists());
        assert!(!dir.path().join("idle.bin").exists());
    }

    #[tokio::test]
    async fn test_locked_path_is_skipped() {
        let dir: TempDir = TempDir::new().unwrap();
        write_file(dir.path(), "busy.bin", 600);

        let locks: Arc<PathLockMap> = Arc::new(PathLockMap::new());
        let policy = EvictionPolicy::new(dir.path(), 100, locks.clone());
        policy.touch("busy.bin");

        let entry = locks.entry("busy.bin");
        let _guard = entry.lock().await;
        policy.pass();

        // Mid-download file survives the pass; the next pass can evict it.
        assert!(dir.path().join("busy.bin").exists());
        drop(_guard);
        policy.pass();
        assert!(!dir.path().join("busy.bin").exists());
    }

    #[tokio::test]
    async fn test_stop_clears_tracking() {
        let dir: TempDir = TempDir::new().unwrap();
        let locks: Arc<PathLockMap> = Arc::new(PathLockMap::new());
        let policy = EvictionPolicy::new(dir.path(), 100, locks);
        policy.start();
        policy.touch("a.bin");
        policy.stop().await;
        assert!(policy.index.lock().unwrap().is_empty());
    }
}
