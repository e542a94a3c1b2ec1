//! The unit of work flowing through every pipeline stage.

use std::fmt;
use std::fs::File;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::block::Block;
use crate::error::XloadError;

/// Channel on which a downstream stage reports a completed item back to the
/// upstream coordinator that issued it.
pub type ResponseSender = mpsc::Sender<WorkItem>;

/// One unit of work: a directory to enumerate, a file to split, or a block
/// to transfer. Created fresh per unit, destroyed by its terminal stage.
pub struct WorkItem {
    /// Name of the stage that created this item.
    pub stage: &'static str,
    /// Path relative to the namespace root, POSIX format.
    pub path: String,
    /// Total bytes for this unit (file size, or bytes moved by a block).
    pub data_length: u64,
    /// Unix permission bits from the remote attributes.
    pub mode: u32,
    /// Remote access time in microseconds since the Unix epoch.
    pub atime_us: i64,
    /// Remote modification time in microseconds since the Unix epoch.
    pub mtime_us: i64,
    /// Leased transfer buffer, present on block-level items only.
    pub block: Option<Block>,
    /// Open destination file, present on block-level items only.
    pub file: Option<Arc<File>>,
    /// Error recorded by the stage that processed this item.
    pub err: Option<XloadError>,
    /// Where to report this item once processed, if anyone is waiting.
    pub response: Option<ResponseSender>,
    /// Transfer direction: true = download, false = upload.
    pub download: bool,
    /// Whether this item travels in the priority lane.
    pub priority: bool,
    /// Cancellation scope for the pipeline run this item belongs to.
    pub cancel: CancellationToken,
    /// Remote MD5 content hash, when the store reported one.
    pub content_hash: Option<String>,
}

impl WorkItem {
    /// Create a bare item for `path`, owned by `stage`.
    pub fn new(stage: &'static str, path: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            stage,
            path: path.into(),
            data_length: 0,
            mode: 0,
            atime_us: 0,
            mtime_us: 0,
            block: None,
            file: None,
            err: None,
            response: None,
            download: true,
            priority: false,
            cancel,
            content_hash: None,
        }
    }

    /// Set the total byte length for this unit.
    pub fn with_length(mut self, data_length: u64) -> Self {
        self.data_length = data_length;
        self
    }

    /// Mark this item as priority work.
    pub fn with_priority(mut self, priority: bool) -> Self {
        self.priority = priority;
        self
    }

    /// Attach a response channel.
    pub fn with_response(mut self, response: ResponseSender) -> Self {
        self.response = Some(response);
        self
    }

    /// Take the recorded error, leaving `None` behind.
    pub fn take_err(&mut self) -> Option<XloadError> {
        self.err.take()
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem")
            .field("stage", &self.stage)
            .field("path", &self.path)
            .field("data_length", &self.data_length)
            .field("priority", &self.priority)
            .field("download", &self.download)
            .field("block", &self.block)
            .field("err", &self.err)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_chain() {
        let item: WorkItem = WorkItem::new("lister", "dir/file.bin", CancellationToken::new())
            .with_length(1024)
            .with_priority(true);

        assert_eq!(item.stage, "lister");
        assert_eq!(item.path, "dir/file.bin");
        assert_eq!(item.data_length, 1024);
        assert!(item.priority);
        assert!(item.download);
        assert!(item.block.is_none());
        assert!(item.response.is_none());
    }

    #[test]
    fn test_take_err() {
        let mut item: WorkItem = WorkItem::new("splitter", "f", CancellationToken::new());
        item.err = Some(XloadError::Cancelled);
        assert!(matches!(item.take_err(), Some(XloadError::Cancelled)));
        assert!(item.err.is_none());
    }
}
