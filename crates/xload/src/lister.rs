//! Namespace enumeration stage.
//!
//! The lister walks the namespace breadth-first: each work item names one
//! directory, whose files are forwarded to the splitter and whose
//! subdirectories are created locally and re-scheduled onto the lister's own
//! pool. Concurrency is therefore bounded by the pool's worker count rather
//! than by the width of the tree.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;

use blobgate_common::{from_posix_path, to_posix_path};
use blobgate_remote::{ListPage, ObjectAttributes, RemoteStore};

use crate::error::XloadError;
use crate::item::WorkItem;
use crate::pool::{Scheduler, Stage};
use crate::stats::{StatsItem, StatsSender};

/// Capability interface for listing one directory page of a namespace.
///
/// Two implementations exist: [`RemoteEnumerator`] over the remote store's
/// paginated listing and [`LocalEnumerator`] over a local mirror tree,
/// selected at construction time.
#[async_trait]
pub trait Enumerator: Send + Sync {
    /// List one page of `path`. A `None` token requests the first page;
    /// a `None` token in the result means the listing is complete.
    async fn list_page(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<ListPage, XloadError>;
}

/// Lists the remote namespace through the store's paginated listing.
pub struct RemoteEnumerator {
    store: Arc<dyn RemoteStore>,
}

impl RemoteEnumerator {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Enumerator for RemoteEnumerator {
    async fn list_page(
        &self,
        path: &str,
        token: Option<&str>,
    ) -> Result<ListPage, XloadError> {
        self.store
            .list_directory(path, token)
            .await
            .map_err(|source| XloadError::Listing {
                path: path.to_string(),
                source,
            })
    }
}

/// Lists a local mirror tree as the namespace (single-page: directory reads
/// are not paginated locally).
pub struct LocalEnumerator {
    root: PathBuf,
}

impl LocalEnumerator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl Enumerator for LocalEnumerator {
    async fn list_page(
        &self,
        path: &str,
        _token: Option<&str>,
    ) -> Result<ListPage, XloadError> {
        let dir: PathBuf = from_posix_path(path, &self.root)?;
        let mut entries: Vec<ObjectAttributes> = Vec::new();

        let read_dir = std::fs::read_dir(&dir)
            .map_err(|e| XloadError::from_io(path.to_string(), e))?;
        for entry in read_dir {
            let entry: std::fs::DirEntry =
                entry.map_err(|e| XloadError::from_io(path.to_string(), e))?;
            let meta: std::fs::Metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("skipping unreadable entry {:?}: {e}", entry.path());
                    continue;
                }
            };
            let name: String = entry.file_name().to_string_lossy().into_owned();
            let entry_path: String = if path.is_empty() {
                name
            } else {
                format!("{}/{}", path.trim_end_matches('/'), name)
            };
            entries.push(ObjectAttributes {
                path: entry_path,
                is_dir: meta.is_dir(),
                size: if meta.is_dir() { 0 } else { meta.len() },
                mode: 0,
                atime_us: 0,
                mtime_us: 0,
                content_hash: None,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(ListPage {
            entries,
            next_token: None,
        })
    }
}

/// The listing pipeline stage.
pub struct Lister {
    enumerator: Arc<dyn Enumerator>,
    next: Scheduler,
    staging: PathBuf,
    stats: StatsSender,
    // The lister's own scheduler, bound after its pool is constructed.
    own: OnceLock<Scheduler>,
}

impl Lister {
    pub fn new(
        enumerator: Arc<dyn Enumerator>,
        next: Scheduler,
        staging: impl Into<PathBuf>,
        stats: StatsSender,
    ) -> Self {
        Self {
            enumerator,
            next,
            staging: staging.into(),
            stats,
            own: OnceLock::new(),
        }
    }

    /// Bind the lister to its own pool's scheduler so discovered
    /// subdirectories can be re-scheduled. Must be called before the pool
    /// starts.
    pub fn bind(&self, own: Scheduler) {
        let _ = self.own.set(own);
    }

    /// Forward one file entry to the splitter.
    async fn emit_file(
        &self,
        entry: &ObjectAttributes,
        parent: &WorkItem,
    ) -> Result<(), XloadError> {
        let mut item: WorkItem =
            WorkItem::new("lister", entry.path.clone(), parent.cancel.clone())
                .with_length(entry.size)
                .with_priority(parent.priority);
        item.mode = entry.mode;
        item.atime_us = entry.atime_us;
        item.mtime_us = entry.mtime_us;
        item.content_hash = entry.content_hash.clone();
        self.next.schedule(item).await.map_err(|(e, _)| e)
    }

    /// Create the local directory for a discovered subdirectory and
    /// re-schedule it for enumeration.
    fn emit_directory(&self, entry: &ObjectAttributes, parent: &WorkItem) {
        match from_posix_path(&entry.path, &self.staging) {
            // Racing branches may both discover the same directory;
            // create_dir_all treats "already exists" as success.
            Ok(local) => {
                if let Err(e) = std::fs::create_dir_all(&local) {
                    log::warn!("failed to create {}: {e}", to_posix_path(&local));
                    return;
                }
            }
            Err(e) => {
                log::warn!("skipping directory with unsafe path {}: {e}", entry.path);
                return;
            }
        }

        let child: WorkItem = WorkItem::new("lister", entry.path.clone(), parent.cancel.clone())
            .with_priority(parent.priority);
        let Some(own) = self.own.get().cloned() else {
            log::warn!("lister has no scheduler bound, dropping {}", entry.path);
            return;
        };
        // Detached send: a worker must never suspend on its own pool's
        // queue, or a full queue would deadlock the whole listing pool.
        tokio::spawn(async move {
            if let Err((e, dropped)) = own.schedule(child).await {
                log::debug!("subdirectory listing of {} dropped: {e}", dropped.path);
            }
        });
    }
}

#[async_trait]
impl Stage for Lister {
    fn name(&self) -> &'static str {
        "lister"
    }

    async fn process(&self, item: &mut WorkItem) -> Result<u64, XloadError> {
        let mut dirs: u64 = 0;
        let mut files: u64 = 0;
        let mut token: Option<String> = None;

        loop {
            if item.cancel.is_cancelled() {
                return Err(XloadError::Cancelled);
            }

            let page: ListPage = match self.enumerator.list_page(&item.path, token.as_deref()).await
            {
                Ok(page) => page,
                Err(e) => {
                    // Partial-result policy: abandon this branch, keep the
                    // rest of the walk going.
                    log::warn!("listing page failed, abandoning {}: {e}", item.path);
                    break;
                }
            };

            for entry in &page.entries {
                if entry.is_dir {
                    self.emit_directory(entry, item);
                    dirs += 1;
                } else {
                    self.emit_file(entry, item).await?;
                    files += 1;
                }
            }

            token = page.next_token;
            if token.is_none() {
                break;
            }
        }

        self.stats.send(StatsItem::Listed { dirs, files }).await;
        Ok(files)
    }
}
