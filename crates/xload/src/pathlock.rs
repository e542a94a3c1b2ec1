//! Per-path reference-counted locks.
//!
//! Every open/evict/download decision about a local file happens under that
//! path's lock: the splitter holds it while assembling the file, `open_file`
//! holds it while checking existence and bumping the handle count, and the
//! eviction pass skips any path whose lock is contended or whose handle
//! count is positive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, MutexGuard};

/// Lock state for one path.
#[derive(Default)]
pub struct PathLock {
    mutex: Mutex<()>,
    open_handles: AtomicU32,
}

impl PathLock {
    /// Acquire this path's lock, waiting if another task holds it.
    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.mutex.lock().await
    }

    /// Acquire this path's lock only if it is free.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, ()>> {
        self.mutex.try_lock().ok()
    }

    /// Number of open file handles on this path.
    pub fn open_handles(&self) -> u32 {
        self.open_handles.load(Ordering::Acquire)
    }

    /// Record one more open handle.
    pub fn add_handle(&self) {
        self.open_handles.fetch_add(1, Ordering::AcqRel);
    }

    /// Record one handle released. Saturates at zero so a double release
    /// cannot wrap the counter.
    pub fn remove_handle(&self) {
        let _ = self
            .open_handles
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Lazily-populated map of per-path locks, keyed by relative path.
///
/// Entries are never explicitly destroyed; a path with no handles and no
/// pending open/evict is simply inert.
#[derive(Default)]
pub struct PathLockMap {
    map: DashMap<String, Arc<PathLock>>,
}

impl PathLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the lock entry for `path`, creating it on first access.
    pub fn entry(&self, path: &str) -> Arc<PathLock> {
        self.map.entry(path.to_string()).or_default().clone()
    }
}
