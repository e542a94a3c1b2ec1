//! The pipeline orchestrator.
//!
//! `Xload` owns the configuration, wires Lister -> Splitter -> DataManager
//! into a chain, and brackets their lifetimes: downstream stages start
//! first so no stage ever schedules into a queue that is not yet running,
//! and stop proceeds upstream-first under a grace timeout so shutdown can
//! never hang. It also exposes the two operations the mount pipeline calls
//! into: `open_file` and `release_file`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use blobgate_common::{from_posix_path, to_posix_path, STOP_GRACE_SECS};
use blobgate_remote::{ObjectAttributes, RemoteStore};

use crate::block::BlockPool;
use crate::config::{ResolvedConfig, XloadConfig};
use crate::data::{DataManager, RemoteTransferer};
use crate::error::XloadError;
use crate::evict::EvictionPolicy;
use crate::hint::{HintSink, HintWatcher};
use crate::item::WorkItem;
use crate::lister::{Lister, RemoteEnumerator};
use crate::pathlock::{PathLock, PathLockMap};
use crate::pool::{Scheduler, WorkerPool};
use crate::splitter::Splitter;
use crate::stats::{StatsManager, StatsSnapshot};

/// Open-flags access-mode mask (O_RDONLY / O_WRONLY / O_RDWR).
const ACCESS_MODE_MASK: u32 = 0x3;

/// Handle returned by `open_file`; pass it back to `release_file`.
#[derive(Debug)]
pub struct FileHandle {
    path: String,
    file: File,
}

impl FileHandle {
    /// The relative path this handle refers to.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The open local file.
    pub fn file(&self) -> &File {
        &self.file
    }
}

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Configured,
    Started,
    Stopped,
}

/// Shared miss-path downloader: resolves attributes and pushes one priority
/// file item through the splitter, waiting for its response. Used by
/// `open_file` on a cache miss and by the hint watcher.
struct Downloader {
    store: Arc<dyn RemoteStore>,
    splitter: Scheduler,
    cancel: CancellationToken,
}

impl Downloader {
    async fn fetch_file(&self, path: &str) -> Result<(), XloadError> {
        let attrs: ObjectAttributes =
            self.store
                .get_attributes(path)
                .await
                .map_err(|source| XloadError::Transfer {
                    path: path.to_string(),
                    source,
                })?;
        if attrs.is_dir {
            return Err(XloadError::Io {
                path: path.to_string(),
                message: "cannot download a directory".to_string(),
            });
        }

        let (tx, mut rx) = mpsc::channel::<WorkItem>(1);
        let mut item: WorkItem = WorkItem::new("xload", path, self.cancel.clone())
            .with_length(attrs.size)
            .with_priority(true)
            .with_response(tx);
        item.mode = attrs.mode;
        item.atime_us = attrs.atime_us;
        item.mtime_us = attrs.mtime_us;
        item.content_hash = attrs.content_hash;

        self.splitter.schedule(item).await.map_err(|(e, _)| e)?;

        let mut done: WorkItem = rx.recv().await.ok_or(XloadError::Cancelled)?;
        match done.take_err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl HintSink for Downloader {
    async fn fetch(&self, path: &str) -> Result<(), XloadError> {
        self.fetch_file(path).await
    }
}

/// The bulk-preload pipeline.
pub struct Xload {
    config: ResolvedConfig,
    store: Arc<dyn RemoteStore>,
    state: Mutex<State>,
    cancel: CancellationToken,
    locks: Arc<PathLockMap>,
    block_pool: Option<Arc<BlockPool>>,
    stats: Option<StatsManager>,
    evict: Option<Arc<EvictionPolicy>>,
    lister_pool: Option<WorkerPool>,
    splitter_pool: Option<WorkerPool>,
    data_pool: Option<WorkerPool>,
    hint: Option<HintWatcher>,
    downloader: Option<Arc<Downloader>>,
}

impl Xload {
    /// Validate `config` and prepare a pipeline over `store`.
    ///
    /// # Errors
    /// Returns `XloadError::InvalidConfig` for any configuration the
    /// pipeline cannot run with; nothing is started in that case.
    pub fn new(config: &XloadConfig, store: Arc<dyn RemoteStore>) -> Result<Self, XloadError> {
        let config: ResolvedConfig = config.resolve()?;
        Ok(Self {
            config,
            store,
            state: Mutex::new(State::Configured),
            cancel: CancellationToken::new(),
            locks: Arc::new(PathLockMap::new()),
            block_pool: None,
            stats: None,
            evict: None,
            lister_pool: None,
            splitter_pool: None,
            data_pool: None,
            hint: None,
            downloader: None,
        })
    }

    /// Wire and start every component, downstream-first.
    pub async fn start(&mut self) -> Result<(), XloadError> {
        {
            let state = self.state.lock().unwrap();
            if *state != State::Configured {
                return Err(XloadError::InvalidConfig {
                    message: format!("cannot start pipeline in state {:?}", *state),
                });
            }
        }

        let block_pool: Arc<BlockPool> = Arc::new(BlockPool::new(
            self.config.block_size,
            self.config.pool_size,
        )?);
        let mut stats: StatsManager = StatsManager::new(self.config.export_path.clone());
        stats.start();

        let evict: Option<Arc<EvictionPolicy>> = self.config.cache_limit.map(|limit| {
            let policy = EvictionPolicy::new(&self.config.staging_path, limit, self.locks.clone());
            policy.start();
            policy
        });

        // Data manager first: the most-downstream stage must be pulling
        // before anything above it can schedule.
        let transferer = Arc::new(RemoteTransferer::new(self.store.clone()));
        let mut data_pool: WorkerPool =
            WorkerPool::new(self.config.workers, Arc::new(DataManager::new(transferer)))?;
        data_pool.start();

        let splitter: Splitter = Splitter::new(
            block_pool.clone(),
            data_pool.scheduler(),
            &self.config.staging_path,
            self.config.block_size,
            stats.sender(),
            self.locks.clone(),
        )
        .with_eviction(evict.clone())
        .with_validation(self.config.validate_md5);
        let mut splitter_pool: WorkerPool =
            WorkerPool::new(self.config.workers, Arc::new(splitter))?;
        splitter_pool.start();

        let downloader: Arc<Downloader> = Arc::new(Downloader {
            store: self.store.clone(),
            splitter: splitter_pool.scheduler(),
            cancel: self.cancel.clone(),
        });

        if let Some(hint_file) = &self.config.hint_file {
            // Hint-driven operation: no full walk, downloads come from the
            // hint file (and from foreground opens).
            let watcher: HintWatcher = HintWatcher::new(
                hint_file,
                self.config.hint_poll_secs,
                downloader.clone(),
                self.cancel.child_token(),
            );
            watcher.start();
            self.hint = Some(watcher);
        } else {
            let lister: Arc<Lister> = Arc::new(Lister::new(
                Arc::new(RemoteEnumerator::new(self.store.clone())),
                splitter_pool.scheduler(),
                &self.config.staging_path,
                stats.sender(),
            ));
            let mut lister_pool: WorkerPool =
                WorkerPool::new(self.config.lister_workers, lister.clone())?;
            lister.bind(lister_pool.scheduler());
            lister_pool.start();

            // Seed the walk at the namespace root.
            lister_pool
                .scheduler()
                .schedule(WorkItem::new("xload", "", self.cancel.clone()))
                .await
                .map_err(|(e, _)| e)?;
            self.lister_pool = Some(lister_pool);
        }

        self.block_pool = Some(block_pool);
        self.stats = Some(stats);
        self.evict = evict;
        self.splitter_pool = Some(splitter_pool);
        self.data_pool = Some(data_pool);
        self.downloader = Some(downloader);
        *self.state.lock().unwrap() = State::Started;
        log::info!(
            "preload pipeline started (staging {})",
            self.config.staging_path.display()
        );
        Ok(())
    }

    /// Stop every component: cancel the shared scope, stop stages
    /// upstream-first under a grace period, drain stats, and clean the
    /// staging directory.
    ///
    /// Returns the final statistics snapshot. Never hangs: stages that do
    /// not drain within the grace period are abandoned with a warning.
    pub async fn stop(&mut self) -> StatsSnapshot {
        {
            let mut state = self.state.lock().unwrap();
            if *state != State::Started {
                return StatsSnapshot::default();
            }
            *state = State::Stopped;
        }

        self.cancel.cancel();

        if let Some(hint) = self.hint.take() {
            hint.stop().await;
        }

        let grace: Duration = Duration::from_secs(STOP_GRACE_SECS);
        for (name, pool) in [
            ("lister", self.lister_pool.take()),
            ("splitter", self.splitter_pool.take()),
            ("datamgr", self.data_pool.take()),
        ] {
            let Some(mut pool) = pool else { continue };
            if tokio::time::timeout(grace, pool.stop()).await.is_err() {
                log::warn!("{name} pool did not drain within {STOP_GRACE_SECS}s, abandoning");
            }
        }

        let snapshot: StatsSnapshot = match self.stats.take() {
            Some(mut stats) => stats.stop().await,
            None => StatsSnapshot::default(),
        };
        log::info!(
            "preload finished: {}/{} files, {} bytes down",
            snapshot.success,
            snapshot.total_files,
            snapshot.bytes_downloaded
        );

        if let Some(block_pool) = self.block_pool.take() {
            block_pool.terminate();
        }
        if let Some(evict) = self.evict.take() {
            evict.stop().await;
        }
        self.downloader = None;

        self.cleanup_staging();
        snapshot
    }

    /// Open `path`, downloading it first when absent.
    ///
    /// Only read access is served; the gateway is read-only. `mode` is
    /// applied to the local copy when this open caused the download.
    pub async fn open_file(
        &self,
        path: &str,
        flags: u32,
        mode: u32,
    ) -> Result<FileHandle, XloadError> {
        if *self.state.lock().unwrap() != State::Started {
            return Err(XloadError::NotRunning);
        }
        if flags & ACCESS_MODE_MASK != 0 {
            return Err(XloadError::Io {
                path: path.to_string(),
                message: "write access is not supported on a preload mount".to_string(),
            });
        }

        let local: PathBuf = from_posix_path(path, &self.config.staging_path)?;
        let entry: Arc<PathLock> = self.locks.entry(path);

        // Fast path: already staged.
        {
            let _guard = entry.lock().await;
            if local.is_file() {
                return self.open_present(path, &local, &entry);
            }
        }

        // Miss: synchronous priority download through the splitter, then
        // open. The path lock is released while the splitter holds it.
        log::debug!("open miss for {path}, downloading with priority");
        let downloader: &Arc<Downloader> =
            self.downloader.as_ref().ok_or(XloadError::NotRunning)?;
        downloader.fetch_file(path).await?;

        let _guard = entry.lock().await;
        if mode > 0 {
            apply_mode(&local, mode);
        }
        self.open_present(path, &local, &entry)
    }

    /// Open an already-staged file and record the handle. Caller holds the
    /// path lock.
    fn open_present(
        &self,
        path: &str,
        local: &Path,
        entry: &PathLock,
    ) -> Result<FileHandle, XloadError> {
        let file: File = std::fs::OpenOptions::new()
            .read(true)
            .open(local)
            .map_err(|e| XloadError::from_io(path.to_string(), e))?;
        entry.add_handle();
        if let Some(evict) = &self.evict {
            evict.touch(path);
        }
        Ok(FileHandle {
            path: path.to_string(),
            file,
        })
    }

    /// Release a handle returned by `open_file`.
    pub async fn release_file(&self, handle: FileHandle) -> Result<(), XloadError> {
        let entry: Arc<PathLock> = self.locks.entry(&handle.path);
        let _guard = entry.lock().await;
        entry.remove_handle();
        drop(handle);
        Ok(())
    }

    /// Drop the local copy of `path` so the next access re-fetches it.
    /// A file currently held open is left alone.
    pub async fn invalidate_path(&self, path: &str) -> Result<(), XloadError> {
        let local: PathBuf = from_posix_path(path, &self.config.staging_path)?;
        let entry: Arc<PathLock> = self.locks.entry(path);
        let _guard = entry.lock().await;

        if entry.open_handles() > 0 {
            log::debug!("invalidation skipping {path}: file is open");
            return Ok(());
        }

        match std::fs::remove_file(&local) {
            Ok(()) => log::debug!("invalidated {path}"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(XloadError::from_io(path.to_string(), e)),
        }
        if let Some(evict) = &self.evict {
            evict.forget(path);
        }
        Ok(())
    }

    /// Invalidate every staged file under `dir_path`, then prune the empty
    /// directories left behind.
    pub async fn invalidate_directory(&self, dir_path: &str) -> Result<(), XloadError> {
        let local_dir: PathBuf = from_posix_path(dir_path, &self.config.staging_path)?;
        if !local_dir.is_dir() {
            return Ok(());
        }

        let files: Vec<String> = walkdir::WalkDir::new(&local_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| {
                e.path()
                    .strip_prefix(&self.config.staging_path)
                    .ok()
                    .map(to_posix_path)
            })
            .collect();
        for file in files {
            self.invalidate_path(&file).await?;
        }

        // Prune now-empty directories bottom-up; anything still occupied
        // (an open file survived invalidation) is left in place.
        for entry in walkdir::WalkDir::new(&local_dir)
            .contents_first(true)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
        {
            let _ = std::fs::remove_dir(entry.path());
        }
        Ok(())
    }

    /// Best-effort wipe of the staging directory contents.
    fn cleanup_staging(&self) {
        let staging: &Path = &self.config.staging_path;
        let Ok(read_dir) = std::fs::read_dir(staging) else {
            return;
        };
        for entry in read_dir.filter_map(|e| e.ok()) {
            let path: PathBuf = entry.path();
            let result: std::io::Result<()> = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if let Err(e) = result {
                log::debug!("staging cleanup left {:?} behind: {e}", path);
            }
        }
    }
}

#[cfg(unix)]
fn apply_mode(local: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(mode & 0o7777);
    if let Err(e) = std::fs::set_permissions(local, perms) {
        log::warn!("failed to set permissions on {:?}: {e}", local);
    }
}

#[cfg(not(unix))]
fn apply_mode(_local: &Path, _mode: u32) {}
