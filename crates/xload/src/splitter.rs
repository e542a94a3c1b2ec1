//! File splitting and reassembly stage.
//!
//! One work item per file: the splitter partitions the file into block-sized
//! ranges, leases a buffer per range, fans the blocks out to the data
//! manager, and reassembles completions into the destination file. Block
//! writes are positional, so out-of-order completion is correct by
//! construction. A failed block fails the whole file and no partial file is
//! left behind.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use blobgate_common::{from_posix_path, hash_file};

use crate::block::{Block, BlockPool};
use crate::error::XloadError;
use crate::evict::EvictionPolicy;
use crate::item::WorkItem;
use crate::pathlock::{PathLock, PathLockMap};
use crate::pool::{Scheduler, Stage};
use crate::stats::{StatsItem, StatsSender};

/// The splitting/reassembly pipeline stage.
pub struct Splitter {
    block_pool: Arc<BlockPool>,
    next: Scheduler,
    staging: PathBuf,
    stats: StatsSender,
    locks: Arc<PathLockMap>,
    evict: Option<Arc<EvictionPolicy>>,
    block_size: u64,
    validate_md5: bool,
}

impl Splitter {
    pub fn new(
        block_pool: Arc<BlockPool>,
        next: Scheduler,
        staging: impl Into<PathBuf>,
        block_size: u64,
        stats: StatsSender,
        locks: Arc<PathLockMap>,
    ) -> Self {
        Self {
            block_pool,
            next,
            staging: staging.into(),
            stats,
            locks,
            evict: None,
            block_size,
            validate_md5: false,
        }
    }

    /// Touch the eviction policy on every completed download.
    pub fn with_eviction(mut self, evict: Option<Arc<EvictionPolicy>>) -> Self {
        self.evict = evict;
        self
    }

    /// Validate reassembled files against the remote MD5 content hash.
    pub fn with_validation(mut self, validate_md5: bool) -> Self {
        self.validate_md5 = validate_md5;
        self
    }

    /// Download one file: chunk, fan out, reassemble, finalize.
    async fn download_file(&self, item: &mut WorkItem) -> Result<(), XloadError> {
        let path: String = item.path.clone();
        let local: PathBuf = from_posix_path(&path, &self.staging)?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| XloadError::from_io(path.clone(), e))?;
        }

        // Held for the whole assembly so eviction and concurrent opens of
        // the same path stay out.
        let entry: Arc<PathLock> = self.locks.entry(&path);
        let _guard = entry.lock().await;

        let file: Arc<File> = Arc::new(
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&local)
                .map_err(|e| XloadError::from_io(path.clone(), e))?,
        );

        let num_blocks: u64 = item.data_length.div_ceil(self.block_size);
        let (tx, rx) = mpsc::channel::<WorkItem>(num_blocks.max(1) as usize);
        let collector = tokio::spawn(Self::collect(rx, num_blocks, self.block_pool.clone()));

        let mut schedule_err: Option<XloadError> = None;
        for index in 0..num_blocks {
            let mut block: Block = tokio::select! {
                _ = item.cancel.cancelled() => {
                    schedule_err = Some(XloadError::Cancelled);
                    break;
                }
                leased = self.block_pool.get(item.priority) => match leased {
                    Ok(block) => block,
                    Err(e) => {
                        schedule_err = Some(e);
                        break;
                    }
                }
            };

            let offset: u64 = index * self.block_size;
            block.index = index as u32;
            block.offset = offset;
            // The final block may be short; never ask for more than the
            // buffer can hold.
            block.length = (item.data_length - offset).min(block.capacity() as u64);

            let mut child: WorkItem =
                WorkItem::new("splitter", path.clone(), item.cancel.clone())
                    .with_priority(item.priority)
                    .with_response(tx.clone());
            child.download = item.download;
            child.block = Some(block);
            child.file = Some(file.clone());

            if let Err((e, mut rejected)) = self.next.schedule(child).await {
                if let Some(block) = rejected.block.take() {
                    self.block_pool.release(block);
                }
                schedule_err = Some(e);
                break;
            }
        }
        drop(tx);

        let collected: Result<(), XloadError> = collector.await.unwrap_or_else(|e| {
            Err(XloadError::Io {
                path: path.clone(),
                message: format!("block collector failed: {e}"),
            })
        });

        let result: Result<(), XloadError> = match (schedule_err, collected) {
            (Some(e), _) => Err(e),
            (None, other) => other,
        };

        let result: Result<(), XloadError> =
            result.and_then(|()| self.finalize(item, &file, &local));
        drop(file);

        if let Err(e) = result {
            // No partial files are left behind.
            if let Err(remove_err) = std::fs::remove_file(&local) {
                if remove_err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove partial file {}: {remove_err}", path);
                }
            }
            return Err(e);
        }

        if let Some(evict) = &self.evict {
            evict.touch(&path);
        }
        Ok(())
    }

    /// Wait for exactly one response per dispatched block, writing each
    /// completed block at its offset and always returning the buffer to the
    /// pool.
    async fn collect(
        mut rx: mpsc::Receiver<WorkItem>,
        expected: u64,
        pool: Arc<BlockPool>,
    ) -> Result<(), XloadError> {
        let mut completed: u64 = 0;
        let mut first_err: Option<XloadError> = None;

        while let Some(mut done) = rx.recv().await {
            let block: Option<Block> = done.block.take();
            let err: Option<XloadError> = done.take_err();

            // After the first failure the file is already lost; keep
            // draining so every leased buffer still comes home.
            if first_err.is_none() {
                if let Some(e) = err {
                    first_err = Some(e);
                } else {
                    match (&block, &done.file) {
                        (Some(block), Some(file)) => {
                            let filled: usize = done.data_length as usize;
                            if let Err(e) =
                                write_at(file, &block.data()[..filled], block.offset)
                            {
                                first_err = Some(XloadError::from_io(done.path.clone(), e));
                            }
                        }
                        _ => {
                            first_err = Some(XloadError::Io {
                                path: done.path.clone(),
                                message: "block response without buffer or file".to_string(),
                            });
                        }
                    }
                }
            }

            if let Some(block) = block {
                pool.release(block);
            }
            completed += 1;
            if completed == expected {
                break;
            }
        }

        match first_err {
            Some(e) => Err(e),
            None if completed < expected => Err(XloadError::Cancelled),
            None => Ok(()),
        }
    }

    /// Truncate to the exact length, validate the content hash, and apply
    /// remote metadata.
    fn finalize(
        &self,
        item: &WorkItem,
        file: &File,
        local: &std::path::Path,
    ) -> Result<(), XloadError> {
        // Exact final size: covers zero-block files and a short final block.
        file.set_len(item.data_length)
            .map_err(|e| XloadError::from_io(item.path.clone(), e))?;
        file.sync_all()
            .map_err(|e| XloadError::from_io(item.path.clone(), e))?;

        if self.validate_md5 {
            if let Some(expected) = &item.content_hash {
                let actual: String = hash_file(local)
                    .map_err(|e| XloadError::from_io(item.path.clone(), e))?;
                if !actual.eq_ignore_ascii_case(expected) {
                    return Err(XloadError::HashMismatch {
                        path: item.path.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }

        // Remote metadata is best-effort; a failure here does not fail the
        // file.
        if item.mtime_us > 0 {
            let atime = file_time(if item.atime_us > 0 {
                item.atime_us
            } else {
                item.mtime_us
            });
            if let Err(e) = filetime::set_file_times(local, atime, file_time(item.mtime_us)) {
                log::warn!("failed to set file times on {}: {e}", item.path);
            }
        }
        set_mode(local, item.mode);

        Ok(())
    }
}

#[async_trait]
impl Stage for Splitter {
    fn name(&self) -> &'static str {
        "splitter"
    }

    async fn process(&self, item: &mut WorkItem) -> Result<u64, XloadError> {
        if item.cancel.is_cancelled() {
            return Err(XloadError::Cancelled);
        }
        if !item.download {
            return Err(XloadError::Io {
                path: item.path.clone(),
                message: "upload splitting is not implemented".to_string(),
            });
        }

        let bytes: u64 = item.data_length;
        let result: Result<(), XloadError> = self.download_file(item).await;

        self.stats
            .send(StatsItem::Transfer {
                path: item.path.clone(),
                success: result.is_ok(),
                download: true,
                bytes: if result.is_ok() { bytes } else { 0 },
            })
            .await;

        result.map(|()| bytes)
    }
}

/// Convert microseconds since the Unix epoch to a FileTime.
fn file_time(us: i64) -> filetime::FileTime {
    filetime::FileTime::from_unix_time(us / 1_000_000, ((us % 1_000_000) * 1000) as u32)
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written: usize = 0;
    while written < buf.len() {
        written += file.seek_write(&buf[written..], offset + written as u64)?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(local: &std::path::Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return;
    }
    let perms = std::fs::Permissions::from_mode(mode & 0o7777);
    if let Err(e) = std::fs::set_permissions(local, perms) {
        log::warn!("failed to set permissions on {:?}: {e}", local);
    }
}

#[cfg(not(unix))]
fn set_mode(_local: &std::path::Path, _mode: u32) {}
