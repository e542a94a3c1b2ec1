//! Configuration for the preload pipeline.
//!
//! `XloadConfig` mirrors the mount pipeline's key/value configuration
//! surface (the mount layer owns parsing and file formats); `resolve()`
//! validates it into the fixed sizes and paths the pipeline runs with.

use std::path::PathBuf;

use serde::Deserialize;

use blobgate_common::{
    lexical_normalize, to_absolute, DEFAULT_BLOCK_SIZE_MB, DEFAULT_HINT_POLL_SECS,
    MAX_LISTER_WORKERS, MAX_WORKER_COUNT, MB,
};

use crate::error::XloadError;

/// Transfer direction of the pipeline. Only `Preload` is implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Bulk download of the remote namespace into the staging directory.
    #[default]
    Preload,
    /// Bulk upload of the staging directory (not implemented).
    Upload,
    /// Bidirectional sync (not implemented).
    Sync,
}

/// Raw configuration keys for the preload pipeline.
///
/// Field names map 1:1 onto the mount configuration's kebab-case keys
/// (`block-size-mb`, `prefetch-hint-file`, ...). The two `file_cache_*`
/// fields are legacy fallbacks honored when the explicit keys are absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct XloadConfig {
    /// Transfer mode; only `preload` is implemented.
    pub mode: TransferMode,
    /// Local staging directory where preloaded files are materialized.
    pub path: Option<PathBuf>,
    /// The mount point; the staging directory must be distinct from it.
    pub mount_path: Option<PathBuf>,
    /// Whether the mount is read-only. Preload requires it.
    pub read_only: bool,
    /// Transfer block size in MB.
    pub block_size_mb: Option<f64>,
    /// Periodically export a progress snapshot next to the staging directory.
    pub export_progress: bool,
    /// Validate reassembled files against the remote MD5 content hash.
    pub validate_md5: bool,
    /// Worker count for the splitter and data-manager stages.
    pub workers: Option<usize>,
    /// Number of transfer buffers in the block pool.
    pub pool_size: Option<usize>,
    /// Cap on staging-directory disk usage in MB; enables eviction when set.
    pub cache_limit_mb: Option<u64>,
    /// Optional hint file naming paths to download with priority. When set,
    /// the full namespace walk does not run.
    pub prefetch_hint_file: Option<PathBuf>,
    /// Poll interval for the hint file, in seconds.
    pub prefetch_hint_poll_sec: Option<u64>,
    /// Legacy key: staging directory previously configured on the file cache.
    pub file_cache_path: Option<PathBuf>,
    /// Legacy key: block size previously configured on the file cache.
    pub file_cache_block_size_mb: Option<f64>,
}

/// Validated, fully-resolved pipeline configuration.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Staging directory (absolute, exists, empty at configure time).
    pub staging_path: PathBuf,
    /// Transfer block size in bytes.
    pub block_size: u64,
    /// Worker count for splitter and data-manager pools.
    pub workers: usize,
    /// Block pool size (number of buffers).
    pub pool_size: usize,
    /// Worker count for the listing pool.
    pub lister_workers: usize,
    /// Disk usage cap in bytes, when eviction is enabled.
    pub cache_limit: Option<u64>,
    /// Hint file path, when hint-driven operation is enabled.
    pub hint_file: Option<PathBuf>,
    /// Hint poll interval in seconds.
    pub hint_poll_secs: u64,
    /// Whether to validate content hashes after reassembly.
    pub validate_md5: bool,
    /// Progress snapshot path, when export is enabled.
    pub export_path: Option<PathBuf>,
}

impl XloadConfig {
    /// Validate this configuration and resolve defaults.
    ///
    /// # Errors
    /// Returns `XloadError::InvalidConfig` for an unsupported mode, a
    /// writable mount, or a missing/non-empty/conflicting staging directory.
    pub fn resolve(&self) -> Result<ResolvedConfig, XloadError> {
        if self.mode != TransferMode::Preload {
            return Err(XloadError::InvalidConfig {
                message: format!("mode {:?} is not implemented, only preload", self.mode),
            });
        }
        if !self.read_only {
            return Err(XloadError::InvalidConfig {
                message: "preload requires a read-only mount".to_string(),
            });
        }

        let staging: &PathBuf = self
            .path
            .as_ref()
            .or(self.file_cache_path.as_ref())
            .ok_or_else(|| XloadError::InvalidConfig {
                message: "staging path is required (path, or the legacy file cache path)"
                    .to_string(),
            })?;
        let staging_path: PathBuf = lexical_normalize(&to_absolute(staging)?);

        if let Some(mount) = &self.mount_path {
            let mount: PathBuf = lexical_normalize(&to_absolute(mount)?);
            if mount == staging_path {
                return Err(XloadError::InvalidConfig {
                    message: format!(
                        "staging path {} must be distinct from the mount path",
                        staging_path.display()
                    ),
                });
            }
        }

        std::fs::create_dir_all(&staging_path)
            .map_err(|e| XloadError::from_io(staging_path.display().to_string(), e))?;
        let occupied: bool = std::fs::read_dir(&staging_path)
            .map_err(|e| XloadError::from_io(staging_path.display().to_string(), e))?
            .next()
            .is_some();
        if occupied {
            return Err(XloadError::InvalidConfig {
                message: format!(
                    "staging path {} must be empty",
                    staging_path.display()
                ),
            });
        }

        let block_size_mb: f64 = self
            .block_size_mb
            .or(self.file_cache_block_size_mb)
            .unwrap_or(DEFAULT_BLOCK_SIZE_MB);
        let block_size: u64 = (block_size_mb * MB as f64) as u64;
        if block_size == 0 {
            return Err(XloadError::InvalidConfig {
                message: format!("block size {block_size_mb} MB is too small"),
            });
        }

        let cpus: usize = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers: usize = self.workers.unwrap_or(3 * cpus).min(MAX_WORKER_COUNT);
        if workers == 0 {
            return Err(XloadError::InvalidConfig {
                message: "workers must be greater than zero".to_string(),
            });
        }
        let pool_size: usize = self.pool_size.unwrap_or(3 * workers).max(1);
        let lister_workers: usize = (cpus / 2).clamp(1, MAX_LISTER_WORKERS);

        let export_path: Option<PathBuf> = self.export_progress.then(|| {
            let mut name = staging_path.as_os_str().to_owned();
            name.push(".stats.json");
            PathBuf::from(name)
        });

        Ok(ResolvedConfig {
            staging_path,
            block_size,
            workers,
            pool_size,
            lister_workers,
            cache_limit: self.cache_limit_mb.map(|mb| mb * MB),
            hint_file: self.prefetch_hint_file.clone(),
            hint_poll_secs: self
                .prefetch_hint_poll_sec
                .unwrap_or(DEFAULT_HINT_POLL_SECS)
                .max(1),
            validate_md5: self.validate_md5,
            export_path,
        })
    }
}
