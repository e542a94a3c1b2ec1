//! Shared constants used across blobgate crates.

/// One mebibyte, the unit most configuration sizes are expressed in.
pub const MB: u64 = 1024 * 1024;

/// Default transfer block size in MB when neither the explicit key nor the
/// legacy file-cache key is configured.
pub const DEFAULT_BLOCK_SIZE_MB: f64 = 16.0;

/// Upper bound on the per-stage worker count, regardless of CPU count or
/// explicit configuration.
pub const MAX_WORKER_COUNT: usize = 100;

/// Upper bound on the listing pool's worker count (listing is metadata-bound
/// and saturates well before the transfer stages do).
pub const MAX_LISTER_WORKERS: usize = 16;

/// Default polling interval for the prefetch hint file, in seconds.
pub const DEFAULT_HINT_POLL_SECS: u64 = 2;

/// Interval between eviction passes, in seconds.
pub const EVICTION_INTERVAL_SECS: u64 = 5;

/// Interval between progress-snapshot exports, in seconds.
pub const STATS_EXPORT_INTERVAL_SECS: u64 = 3;

/// Grace period granted to each pipeline stage during shutdown, in seconds.
/// A stage that does not drain within this window is abandoned, not waited on.
pub const STOP_GRACE_SECS: u64 = 5;
