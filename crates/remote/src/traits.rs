//! The RemoteStore capability trait and its data types.

use async_trait::async_trait;

use crate::error::RemoteError;

/// Attributes of one object (file or directory) in the remote namespace.
///
/// Listing pages and single-object lookups both return this shape, so a
/// bulk walk never needs a second round-trip per file.
#[derive(Debug, Clone)]
pub struct ObjectAttributes {
    /// Path relative to the namespace root, POSIX format.
    pub path: String,
    /// Whether this entry is a directory.
    pub is_dir: bool,
    /// Object size in bytes (0 for directories).
    pub size: u64,
    /// Unix permission bits.
    pub mode: u32,
    /// Last access time in microseconds since the Unix epoch.
    pub atime_us: i64,
    /// Last modification time in microseconds since the Unix epoch.
    pub mtime_us: i64,
    /// MD5 content hash as lowercase hex, when the store tracks one.
    pub content_hash: Option<String>,
}

/// One page of a paginated directory listing.
#[derive(Debug, Clone)]
pub struct ListPage {
    /// Entries in this page.
    pub entries: Vec<ObjectAttributes>,
    /// Continuation token for the next page; `None` when the listing is
    /// complete.
    pub next_token: Option<String>,
}

/// Low-level remote namespace operations - implemented by each backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List one page of a directory.
    ///
    /// # Arguments
    /// * `path` - Directory path relative to the namespace root ("" = root)
    /// * `token` - Continuation token from the previous page, if any
    async fn list_directory(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<ListPage, RemoteError>;

    /// Fetch the attributes of a single object.
    async fn get_attributes(&self, path: &str) -> Result<ObjectAttributes, RemoteError>;

    /// Read object bytes starting at `offset` into `buf`.
    ///
    /// Returns the number of bytes read, which is less than `buf.len()` only
    /// at end of object.
    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, RemoteError>;

    /// Stage one block of an object for a later commit.
    async fn stage_block(&self, path: &str, block_id: &str, data: &[u8])
        -> Result<(), RemoteError>;

    /// Assemble previously staged blocks, in the given order, into the final
    /// object.
    async fn commit_blocks(&self, path: &str, block_ids: &[String]) -> Result<(), RemoteError>;

    /// Create a directory in the remote namespace.
    async fn create_directory(&self, path: &str, mode: u32) -> Result<(), RemoteError>;
}
