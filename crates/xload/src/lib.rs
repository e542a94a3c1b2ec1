//! Bulk-preload pipeline for blobgate.
//!
//! Walks a remote namespace, fans file content out across bounded worker
//! pools in fixed-size blocks drawn from a reusable buffer pool, reassembles
//! blocks into local files under a staging directory, tracks live progress,
//! and evicts cached files under a size cap while honoring in-flight
//! readers.
//!
//! # Architecture
//!
//! ```text
//! Lister ──items──> Splitter ──blocks──> DataManager ──> RemoteStore
//!    │                 │  ^                  │
//!    │                 │  └──responses───────┘
//!    └──stats──> StatsManager <──stats───────┘
//!
//! Xload wires the chain, owns the BlockPool / PathLockMap / EvictionPolicy,
//! and exposes open_file / release_file to the mount pipeline.
//! ```

pub mod block;
pub mod config;
pub mod data;
pub mod error;
pub mod evict;
pub mod hint;
pub mod item;
pub mod lister;
pub mod pathlock;
pub mod pool;
pub mod splitter;
pub mod stats;
pub mod xload;

pub use block::{Block, BlockPool};
pub use config::{ResolvedConfig, TransferMode, XloadConfig};
pub use error::XloadError;
pub use evict::EvictionPolicy;
pub use hint::{HintSink, HintWatcher};
pub use item::WorkItem;
pub use lister::{Enumerator, Lister, LocalEnumerator, RemoteEnumerator};
pub use pathlock::{PathLock, PathLockMap};
pub use pool::{Scheduler, Stage, WorkerPool};
pub use splitter::Splitter;
pub use stats::{StatsItem, StatsManager, StatsSender, StatsSnapshot};
pub use xload::{FileHandle, Xload};

pub use data::{DataManager, LocalTransferer, RemoteTransferer, Transferer};
