//! Local-filesystem RemoteStore backend.
//!
//! Serves a directory tree as the remote namespace. Used as the backing
//! store for local-mirror operation and as the test double for the
//! pipeline: listing is genuinely paginated and content hashes are real
//! MD5 digests, so callers exercise the same code paths a blob-store
//! backend would.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use blobgate_common::{from_posix_path, hash_file};

use crate::error::RemoteError;
use crate::traits::{ListPage, ObjectAttributes, RemoteStore};

/// Default number of entries per listing page.
const DEFAULT_PAGE_SIZE: usize = 500;

/// Subdirectory where staged blocks live until committed.
const STAGED_DIR: &str = ".staged";

/// A RemoteStore backed by a local directory tree.
pub struct LocalFsStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalFsStore {
    /// Create a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Override the listing page size (small values force pagination in
    /// tests).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Resolve a namespace path to a local path, rejecting escapes.
    fn resolve(&self, path: &str) -> Result<PathBuf, RemoteError> {
        from_posix_path(path, &self.root).map_err(|_| RemoteError::InvalidPath {
            path: path.to_string(),
        })
    }

    /// Build attributes for one local entry.
    fn attributes_for(&self, local: &Path, path: String) -> Result<ObjectAttributes, RemoteError> {
        let meta: std::fs::Metadata =
            std::fs::metadata(local).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RemoteError::NotFound { path: path.clone() },
                _ => RemoteError::from_io(path.clone(), e),
            })?;

        let content_hash: Option<String> = if meta.is_file() {
            Some(hash_file(local).map_err(|e| RemoteError::from_io(path.clone(), e))?)
        } else {
            None
        };

        Ok(ObjectAttributes {
            path,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            mode: mode_bits(&meta),
            atime_us: meta.accessed().map(system_time_us).unwrap_or(0),
            mtime_us: meta.modified().map(system_time_us).unwrap_or(0),
            content_hash,
        })
    }

    fn staged_dir(&self, path: &str) -> Result<PathBuf, RemoteError> {
        let rel: &str = path.trim_start_matches('/');
        from_posix_path(rel, &self.root.join(STAGED_DIR)).map_err(|_| {
            RemoteError::InvalidPath {
                path: path.to_string(),
            }
        })
    }
}

#[async_trait]
impl RemoteStore for LocalFsStore {
    async fn list_directory(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<ListPage, RemoteError> {
        let dir: PathBuf = self.resolve(path)?;

        let mut names: Vec<(String, PathBuf)> = Vec::new();
        let read_dir =
            std::fs::read_dir(&dir).map_err(|e| RemoteError::from_io(path.to_string(), e))?;
        for entry in read_dir {
            let entry: std::fs::DirEntry =
                entry.map_err(|e| RemoteError::from_io(path.to_string(), e))?;
            let name: String = entry.file_name().to_string_lossy().into_owned();
            if name == STAGED_DIR {
                continue;
            }
            names.push((name, entry.path()));
        }
        // Stable order so continuation tokens stay meaningful between pages.
        names.sort_by(|a, b| a.0.cmp(&b.0));

        let start: usize = match token {
            Some(t) => t.parse().map_err(|_| RemoteError::InvalidPath {
                path: format!("continuation token {t}"),
            })?,
            None => 0,
        };
        let end: usize = (start + self.page_size).min(names.len());

        let mut entries: Vec<ObjectAttributes> = Vec::with_capacity(end.saturating_sub(start));
        for (name, local) in &names[start..end] {
            let entry_path: String = if path.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", path.trim_end_matches('/'), name)
            };
            entries.push(self.attributes_for(local, entry_path)?);
        }

        let next_token: Option<String> = if end < names.len() {
            Some(end.to_string())
        } else {
            None
        };

        Ok(ListPage {
            entries,
            next_token,
        })
    }

    async fn get_attributes(&self, path: &str) -> Result<ObjectAttributes, RemoteError> {
        let local: PathBuf = self.resolve(path)?;
        self.attributes_for(&local, path.to_string())
    }

    async fn read_range(
        &self,
        path: &str,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, RemoteError> {
        let local: PathBuf = self.resolve(path)?;
        let mut file: tokio::fs::File =
            tokio::fs::File::open(&local).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RemoteError::NotFound {
                    path: path.to_string(),
                },
                _ => RemoteError::from_io(path.to_string(), e),
            })?;
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(|e| RemoteError::from_io(path.to_string(), e))?;

        let mut read: usize = 0;
        while read < buf.len() {
            let n: usize = file
                .read(&mut buf[read..])
                .await
                .map_err(|e| RemoteError::from_io(path.to_string(), e))?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    async fn stage_block(
        &self,
        path: &str,
        block_id: &str,
        data: &[u8],
    ) -> Result<(), RemoteError> {
        let staged: PathBuf = self.staged_dir(path)?;
        tokio::fs::create_dir_all(&staged)
            .await
            .map_err(|e| RemoteError::from_io(path.to_string(), e))?;
        tokio::fs::write(staged.join(block_id), data)
            .await
            .map_err(|e| RemoteError::from_io(path.to_string(), e))
    }

    async fn commit_blocks(&self, path: &str, block_ids: &[String]) -> Result<(), RemoteError> {
        let staged: PathBuf = self.staged_dir(path)?;
        let local: PathBuf = self.resolve(path)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RemoteError::from_io(path.to_string(), e))?;
        }

        let mut out: tokio::fs::File = tokio::fs::File::create(&local)
            .await
            .map_err(|e| RemoteError::from_io(path.to_string(), e))?;
        for id in block_ids {
            let data: Vec<u8> = tokio::fs::read(staged.join(id))
                .await
                .map_err(|e| RemoteError::from_io(path.to_string(), e))?;
            out.write_all(&data)
                .await
                .map_err(|e| RemoteError::from_io(path.to_string(), e))?;
        }
        out.flush()
            .await
            .map_err(|e| RemoteError::from_io(path.to_string(), e))?;

        // Staged blocks are one-shot; a failed cleanup only leaks temp files.
        if let Err(e) = tokio::fs::remove_dir_all(&staged).await {
            log::debug!("failed to clean staged blocks for {path}: {e}");
        }
        Ok(())
    }

    async fn create_directory(&self, path: &str, mode: u32) -> Result<(), RemoteError> {
        let local: PathBuf = self.resolve(path)?;
        tokio::fs::create_dir_all(&local)
            .await
            .map_err(|e| RemoteError::from_io(path.to_string(), e))?;
        set_mode(&local, mode).map_err(|e| RemoteError::from_io(path.to_string(), e))
    }
}

/// Convert a SystemTime to microseconds since the Unix epoch.
fn system_time_us(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn mode_bits(meta: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(_meta: &std::fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), std::io::Error> {
    use std::os::unix::fs::PermissionsExt;
    if mode == 0 {
        return Ok(());
    }
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), std::io::Error> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed_tree(root: &Path) {
        std::fs::write(root.join("a.txt"), b"alpha").unwrap();
        std::fs::write(root.join("b.txt"), b"bravo!").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub/c.txt"), b"charlie").unwrap();
    }

    #[tokio::test]
    async fn test_list_directory_root() {
        let dir: TempDir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let store: LocalFsStore = LocalFsStore::new(dir.path());
        let page: ListPage = store.list_directory("", None).await.unwrap();

        assert!(page.next_token.is_none());
        assert_eq!(page.entries.len(), 3);
        let names: Vec<&str> = page.entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
        assert!(page.entries[2].is_dir);
        assert_eq!(page.entries[0].size, 5);
    }

    #[tokio::test]
    async fn test_list_directory_paginated() {
        let dir: TempDir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let store: LocalFsStore = LocalFsStore::new(dir.path()).with_page_size(2);

        let first: ListPage = store.list_directory("", None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        let token: String = first.next_token.unwrap();

        let second: ListPage = store.list_directory("", Some(&token)).await.unwrap();
        assert_eq!(second.entries.len(), 1);
        assert!(second.next_token.is_none());
        assert_eq!(second.entries[0].path, "sub");
    }

    #[tokio::test]
    async fn test_list_subdirectory_paths_are_relative() {
        let dir: TempDir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let store: LocalFsStore = LocalFsStore::new(dir.path());
        let page: ListPage = store.list_directory("sub", None).await.unwrap();
        assert_eq!(page.entries.len(), 1);
        assert_eq!(page.entries[0].path, "sub/c.txt");
    }

    #[tokio::test]
    async fn test_get_attributes_hash() {
        let dir: TempDir = TempDir::new().unwrap();
        seed_tree(dir.path());

        let store: LocalFsStore = LocalFsStore::new(dir.path());
        let attrs: ObjectAttributes = store.get_attributes("a.txt").await.unwrap();
        assert!(!attrs.is_dir);
        assert_eq!(attrs.size, 5);
        assert_eq!(
            attrs.content_hash.as_deref(),
            Some(blobgate_common::hash_bytes(b"alpha").as_str())
        );
    }

    #[tokio::test]
    async fn test_get_attributes_not_found() {
        let dir: TempDir = TempDir::new().unwrap();
        let store: LocalFsStore = LocalFsStore::new(dir.path());
        assert!(matches!(
            store.get_attributes("missing.txt").await,
            Err(RemoteError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_read_range() {
        let dir: TempDir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("data.bin"), b"0123456789").unwrap();

        let store: LocalFsStore = LocalFsStore::new(dir.path());

        let mut buf: Vec<u8> = vec![0u8; 4];
        let n: usize = store.read_range("data.bin", 3, &mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"3456");

        // Short read at end of object.
        let n: usize = store.read_range("data.bin", 8, &mut buf).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..n], b"89");
    }

    #[tokio::test]
    async fn test_stage_and_commit_blocks() {
        let dir: TempDir = TempDir::new().unwrap();
        let store: LocalFsStore = LocalFsStore::new(dir.path());

        store.stage_block("out/file.bin", "b0", b"hello ").await.unwrap();
        store.stage_block("out/file.bin", "b1", b"world").await.unwrap();
        store
            .commit_blocks("out/file.bin", &["b0".into(), "b1".into()])
            .await
            .unwrap();

        let content: Vec<u8> = std::fs::read(dir.path().join("out/file.bin")).unwrap();
        assert_eq!(content, b"hello world");
    }

    #[tokio::test]
    async fn test_create_directory() {
        let dir: TempDir = TempDir::new().unwrap();
        let store: LocalFsStore = LocalFsStore::new(dir.path());

        store.create_directory("nested/dir", 0o755).await.unwrap();
        assert!(dir.path().join("nested/dir").is_dir());

        // Creating it again is not an error.
        store.create_directory("nested/dir", 0o755).await.unwrap();
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let dir: TempDir = TempDir::new().unwrap();
        let store: LocalFsStore = LocalFsStore::new(dir.path());
        assert!(matches!(
            store.get_attributes("../etc/passwd").await,
            Err(RemoteError::InvalidPath { .. })
        ));
    }
}
