//! Prefetch hint watcher.
//!
//! When a hint file is configured the full namespace walk does not run;
//! instead this watcher polls the hint file and hands every
//! previously-unseen line to its sink as a priority single-file download,
//! the same path a foreground open miss takes. An mtime check short-circuits
//! polls while the file is unchanged.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::XloadError;

/// Receiver of hint-nominated paths.
#[async_trait]
pub trait HintSink: Send + Sync {
    /// Synchronously download one nominated path with priority.
    async fn fetch(&self, path: &str) -> Result<(), XloadError>;
}

/// Polls the hint file and schedules new entries for priority download.
pub struct HintWatcher {
    hint_file: PathBuf,
    poll: Duration,
    sink: Arc<dyn HintSink>,
    cancel: CancellationToken,
    seen: Arc<Mutex<HashSet<String>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HintWatcher {
    pub fn new(
        hint_file: impl Into<PathBuf>,
        poll_secs: u64,
        sink: Arc<dyn HintSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            hint_file: hint_file.into(),
            poll: Duration::from_secs(poll_secs.max(1)),
            sink,
            cancel,
            seen: Arc::new(Mutex::new(HashSet::new())),
            task: Mutex::new(None),
        }
    }

    /// Launch the polling task.
    pub fn start(&self) {
        let hint_file: PathBuf = self.hint_file.clone();
        let poll: Duration = self.poll;
        let sink: Arc<dyn HintSink> = self.sink.clone();
        let cancel: CancellationToken = self.cancel.clone();
        let seen: Arc<Mutex<HashSet<String>>> = self.seen.clone();

        let handle: JoinHandle<()> = tokio::spawn(async move {
            let mut last_mtime: Option<SystemTime> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }

                let meta: std::fs::Metadata = match std::fs::metadata(&hint_file) {
                    Ok(meta) => meta,
                    // Absent hint file just means nothing is nominated yet.
                    Err(_) => continue,
                };
                let mtime: Option<SystemTime> = meta.modified().ok();
                if mtime.is_some() && mtime == last_mtime {
                    continue;
                }
                last_mtime = mtime;

                let content: String = match std::fs::read_to_string(&hint_file) {
                    Ok(content) => content,
                    Err(e) => {
                        log::warn!("failed to read hint file {:?}: {e}", hint_file);
                        continue;
                    }
                };

                for line in content.lines() {
                    let path: &str = line.trim();
                    if path.is_empty() {
                        continue;
                    }
                    let fresh: bool = seen.lock().unwrap().insert(path.to_string());
                    if !fresh {
                        continue;
                    }
                    log::info!("hint nominated {path} for priority download");
                    if let Err(e) = sink.fetch(path).await {
                        log::warn!("hint download of {path} failed: {e}");
                    }
                }
            }
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// Stop the polling task. The shared cancellation scope must already be
    /// cancelled (or will be by this watcher's own token).
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle: Option<JoinHandle<()>> = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::warn!("hint watcher exited abnormally: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Sink that records every fetched path.
    struct RecordingSink {
        fetched: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetched: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl HintSink for RecordingSink {
        async fn fetch(&self, path: &str) -> Result<(), XloadError> {
            self.fetched.lock().unwrap().push(path.to_string());
            Ok(())
        }
    }

    async fn wait_for(sink: &RecordingSink, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while sink.fetched.lock().unwrap().len() < count {
            assert!(tokio::time::Instant::now() < deadline, "hint watcher stalled");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_new_lines_trigger_fetch_once() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let hint: PathBuf = dir.path().join("hints.txt");
        std::fs::write(&hint, "a.bin\nb.bin\n").unwrap();

        let sink = RecordingSink::new();
        let watcher: HintWatcher =
            HintWatcher::new(&hint, 1, sink.clone(), CancellationToken::new());
        watcher.start();

        wait_for(&sink, 2).await;

        // Rewrite with one repeated and one fresh line: only the fresh one
        // is fetched again.
        std::fs::write(&hint, "a.bin\nc.bin\n").unwrap();
        wait_for(&sink, 3).await;
        watcher.stop().await;

        let fetched: Vec<String> = sink.fetched.lock().unwrap().clone();
        assert_eq!(fetched, vec!["a.bin", "b.bin", "c.bin"]);
    }

    #[tokio::test]
    async fn test_missing_hint_file_is_tolerated() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let hint: PathBuf = dir.path().join("not-yet.txt");

        let sink = RecordingSink::new();
        let watcher: HintWatcher =
            HintWatcher::new(&hint, 1, sink.clone(), CancellationToken::new());
        watcher.start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&hint, "late.bin\n").unwrap();
        wait_for(&sink, 1).await;
        watcher.stop().await;

        assert_eq!(sink.fetched.lock().unwrap().as_slice(), &["late.bin"]);
    }

    #[tokio::test]
    async fn test_stop_halts_polling() {
        let dir: tempfile::TempDir = tempfile::tempdir().unwrap();
        let hint: PathBuf = dir.path().join("hints.txt");
        std::fs::write(&hint, "a.bin\n").unwrap();

        let sink = RecordingSink::new();
        let watcher: HintWatcher =
            HintWatcher::new(&hint, 1, sink.clone(), CancellationToken::new());
        watcher.start();
        wait_for(&sink, 1).await;
        watcher.stop().await;

        std::fs::write(&hint, "a.bin\nb.bin\n").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.fetched.lock().unwrap().len(), 1);
    }
}
