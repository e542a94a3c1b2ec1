//! Block-level transfer stage.
//!
//! The data manager is a pass-through: it holds no state beyond the
//! transfer backend and performs exactly one remote (or local) block
//! operation per work item. Byte counts and errors flow back to the
//! splitter through the item's response channel.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use blobgate_common::from_posix_path;
use blobgate_remote::RemoteStore;

use crate::error::XloadError;
use crate::item::WorkItem;
use crate::pool::Stage;

/// Capability interface for moving one block of data.
///
/// Two implementations exist: [`RemoteTransferer`] against the remote store
/// and [`LocalTransferer`] against a local source tree, selected at
/// construction time.
#[async_trait]
pub trait Transferer: Send + Sync {
    /// Move one block for `item`, returning the number of bytes moved.
    async fn transfer(&self, item: &mut WorkItem) -> Result<u64, XloadError>;

    /// Tie previously staged blocks into the final remote object (upload
    /// direction only).
    async fn commit(&self, path: &str, block_ids: &[String]) -> Result<(), XloadError>;
}

/// Transfers blocks against the remote store.
pub struct RemoteTransferer {
    store: Arc<dyn RemoteStore>,
}

impl RemoteTransferer {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }
}

/// Identifier for a staged block, derived from its index.
fn block_id(index: u32) -> String {
    format!("{index:016x}")
}

#[async_trait]
impl Transferer for RemoteTransferer {
    async fn transfer(&self, item: &mut WorkItem) -> Result<u64, XloadError> {
        let path: String = item.path.clone();
        let Some(block) = item.block.as_mut() else {
            return Err(XloadError::Io {
                path,
                message: "block item carries no buffer".to_string(),
            });
        };
        let len: usize = block.length as usize;

        if item.download {
            let offset: u64 = block.offset;
            let n: usize = self
                .store
                .read_range(&path, offset, &mut block.data_mut()[..len])
                .await
                .map_err(|source| XloadError::Transfer { path, source })?;
            Ok(n as u64)
        } else {
            let id: String = block_id(block.index);
            self.store
                .stage_block(&path, &id, &block.data()[..len])
                .await
                .map_err(|source| XloadError::Transfer { path, source })?;
            Ok(len as u64)
        }
    }

    async fn commit(&self, path: &str, block_ids: &[String]) -> Result<(), XloadError> {
        self.store
            .commit_blocks(path, block_ids)
            .await
            .map_err(|source| XloadError::Transfer {
                path: path.to_string(),
                source,
            })
    }
}

/// Transfers blocks by reading a local source tree. The symmetric local
/// counterpart to [`RemoteTransferer`], used when the namespace being
/// preloaded is a local mirror.
pub struct LocalTransferer {
    source_root: PathBuf,
}

impl LocalTransferer {
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }
}

#[async_trait]
impl Transferer for LocalTransferer {
    async fn transfer(&self, item: &mut WorkItem) -> Result<u64, XloadError> {
        if !item.download {
            return Err(XloadError::Io {
                path: item.path.clone(),
                message: "local transfer supports downloads only".to_string(),
            });
        }

        let path: String = item.path.clone();
        let local: PathBuf = from_posix_path(&path, &self.source_root)?;
        let Some(block) = item.block.as_mut() else {
            return Err(XloadError::Io {
                path,
                message: "block item carries no buffer".to_string(),
            });
        };
        let len: usize = block.length as usize;

        let mut file: tokio::fs::File = tokio::fs::File::open(&local)
            .await
            .map_err(|e| XloadError::from_io(path.clone(), e))?;
        file.seek(std::io::SeekFrom::Start(block.offset))
            .await
            .map_err(|e| XloadError::from_io(path.clone(), e))?;

        let buf: &mut [u8] = &mut block.data_mut()[..len];
        let mut read: usize = 0;
        while read < buf.len() {
            let n: usize = file
                .read(&mut buf[read..])
                .await
                .map_err(|e| XloadError::from_io(path.clone(), e))?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read as u64)
    }

    async fn commit(&self, path: &str, _block_ids: &[String]) -> Result<(), XloadError> {
        Err(XloadError::Io {
            path: path.to_string(),
            message: "local transfer has no commit step".to_string(),
        })
    }
}

/// The pipeline stage driving a [`Transferer`].
pub struct DataManager {
    transferer: Arc<dyn Transferer>,
}

impl DataManager {
    pub fn new(transferer: Arc<dyn Transferer>) -> Self {
        Self { transferer }
    }

    /// Finalize an uploaded object from its staged blocks.
    pub async fn commit(&self, path: &str, block_ids: &[String]) -> Result<(), XloadError> {
        self.transferer.commit(path, block_ids).await
    }
}

#[async_trait]
impl Stage for DataManager {
    fn name(&self) -> &'static str {
        "datamgr"
    }

    async fn process(&self, item: &mut WorkItem) -> Result<u64, XloadError> {
        if item.cancel.is_cancelled() {
            return Err(XloadError::Cancelled);
        }
        self.transferer.transfer(item).await
    }
}
