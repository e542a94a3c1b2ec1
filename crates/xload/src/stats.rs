//! Asynchronous statistics aggregation for the pipeline.
//!
//! Stages fire-and-forget [`StatsItem`]s into a bounded queue; a single
//! consumer task folds them into cumulative counters and periodically
//! exports a JSON snapshot when progress export is enabled. Because there is
//! only one consumer, the counters always update atomically with respect to
//! each other.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use blobgate_common::STATS_EXPORT_INTERVAL_SECS;

/// Queue depth for pending stats events.
const STATS_QUEUE_CAPACITY: usize = 1024;

/// One event emitted by a pipeline stage.
#[derive(Debug, Clone)]
pub enum StatsItem {
    /// A directory finished listing: how many subdirectories and files it
    /// contributed to the walk.
    Listed { dirs: u64, files: u64 },
    /// A file-level transfer finished.
    Transfer {
        path: String,
        success: bool,
        download: bool,
        bytes: u64,
    },
}

/// Cumulative pipeline statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatsSnapshot {
    /// Files discovered by listing.
    pub total_files: u64,
    /// Directories discovered by listing.
    pub dirs: u64,
    /// Files transferred successfully.
    pub success: u64,
    /// Files that failed to transfer.
    pub failed: u64,
    /// Bytes downloaded.
    pub bytes_downloaded: u64,
    /// Bytes uploaded.
    pub bytes_uploaded: u64,
    /// Share of discovered files resolved so far, 0-100.
    pub percent_complete: f64,
    /// Aggregate throughput in megabits per second.
    pub bandwidth_mbps: f64,
    /// Seconds since the pipeline started.
    pub elapsed_secs: f64,
}

impl StatsSnapshot {
    fn apply(&mut self, item: StatsItem, started: Instant) {
        match item {
            StatsItem::Listed { dirs, files } => {
                self.dirs += dirs;
                self.total_files += files;
            }
            StatsItem::Transfer {
                path,
                success,
                download,
                bytes,
            } => {
                if success {
                    self.success += 1;
                    if download {
                        self.bytes_downloaded += bytes;
                    } else {
                        self.bytes_uploaded += bytes;
                    }
                } else {
                    self.failed += 1;
                    log::debug!("transfer of {path} counted as failed");
                }
            }
        }

        self.elapsed_secs = started.elapsed().as_secs_f64();
        if self.total_files > 0 {
            self.percent_complete =
                (self.success + self.failed) as f64 / self.total_files as f64 * 100.0;
        }
        if self.elapsed_secs > 0.0 {
            let bits: f64 = 8.0 * (self.bytes_downloaded + self.bytes_uploaded) as f64;
            self.bandwidth_mbps = bits / self.elapsed_secs / 1_000_000.0;
        }
    }
}

/// Cloneable producer handle held by pipeline stages.
#[derive(Clone)]
pub struct StatsSender {
    tx: mpsc::Sender<StatsItem>,
}

impl StatsSender {
    /// Submit one event. A full queue applies backpressure; a closed queue
    /// (manager already stopped) drops the event with a debug log.
    pub async fn send(&self, item: StatsItem) {
        if self.tx.send(item).await.is_err() {
            log::debug!("stats manager stopped, event dropped");
        }
    }
}

/// Single-consumer aggregator over the stats queue.
pub struct StatsManager {
    tx: mpsc::Sender<StatsItem>,
    rx: Option<mpsc::Receiver<StatsItem>>,
    export_path: Option<PathBuf>,
    stop: CancellationToken,
    consumer: Option<JoinHandle<StatsSnapshot>>,
    started: Instant,
}

impl StatsManager {
    /// Create a manager; pass an export path to enable periodic snapshot
    /// files.
    pub fn new(export_path: Option<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(STATS_QUEUE_CAPACITY);
        Self {
            tx,
            rx: Some(rx),
            export_path,
            stop: CancellationToken::new(),
            consumer: None,
            started: Instant::now(),
        }
    }

    /// Producer handle for stages.
    pub fn sender(&self) -> StatsSender {
        StatsSender {
            tx: self.tx.clone(),
        }
    }

    /// Launch the consumer task.
    pub fn start(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };
        let export_path: Option<PathBuf> = self.export_path.clone();
        let stop: CancellationToken = self.stop.clone();
        let started: Instant = self.started;

        self.consumer = Some(tokio::spawn(async move {
            let mut snapshot: StatsSnapshot = StatsSnapshot::default();
            let mut tick: tokio::time::Interval =
                tokio::time::interval(Duration::from_secs(STATS_EXPORT_INTERVAL_SECS));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    item = rx.recv() => match item {
                        Some(item) => snapshot.apply(item, started),
                        None => break,
                    },
                    _ = stop.cancelled() => {
                        // Drain whatever was already submitted, then exit.
                        while let Ok(item) = rx.try_recv() {
                            snapshot.apply(item, started);
                        }
                        break;
                    }
                    _ = tick.tick(), if export_path.is_some() => {
                        export(&export_path, &snapshot);
                    }
                }
            }

            snapshot.elapsed_secs = started.elapsed().as_secs_f64();
            export(&export_path, &snapshot);
            snapshot
        }));
    }

    /// Stop the consumer, draining already-queued events, and return the
    /// final snapshot.
    pub async fn stop(&mut self) -> StatsSnapshot {
        self.stop.cancel();
        match self.consumer.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                log::warn!("stats consumer exited abnormally: {e}");
                StatsSnapshot::default()
            }),
            None => StatsSnapshot::default(),
        }
    }
}

/// Write the snapshot to the export path, if one is configured.
fn export(path: &Option<PathBuf>, snapshot: &StatsSnapshot) {
    let Some(path) = path else {
        return;
    };
    match serde_json::to_string_pretty(snapshot) {
        Ok(json) => {
            if let Err(e) = std::fs::write(path, json) {
                log::warn!("failed to export progress to {}: {e}", path.display());
            }
        }
        Err(e) => log::warn!("failed to serialize progress snapshot: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn transfer(path: &str, success: bool, bytes: u64) -> StatsItem {
        StatsItem::Transfer {
            path: path.to_string(),
            success,
            download: true,
            bytes,
        }
    }

    #[tokio::test]
    async fn test_counters_consistent_after_drain() {
        let mut manager: StatsManager = StatsManager::new(None);
        let sender: StatsSender = manager.sender();
        manager.start();

        sender.send(StatsItem::Listed { dirs: 2, files: 3 }).await;
        sender.send(transfer("a", true, 100)).await;
        sender.send(transfer("b", true, 50)).await;
        sender.send(transfer("c", false, 0)).await;

        let snapshot: StatsSnapshot = manager.stop().await;
        assert_eq!(snapshot.total_files, 3);
        assert_eq!(snapshot.dirs, 2);
        assert_eq!(snapshot.success + snapshot.failed, snapshot.total_files);
        assert_eq!(snapshot.bytes_downloaded, 150);
        assert!((snapshot.percent_complete - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stop_drains_pending_items() {
        let mut manager: StatsManager = StatsManager::new(None);
        let sender: StatsSender = manager.sender();
        manager.start();

        for i in 0..50 {
            sender.send(transfer(&format!("f{i}"), true, 10)).await;
        }
        // Stop immediately; every already-submitted event must still count.
        let snapshot: StatsSnapshot = manager.stop().await;
        assert_eq!(snapshot.success, 50);
        assert_eq!(snapshot.bytes_downloaded, 500);
    }

    #[tokio::test]
    async fn test_export_writes_snapshot() {
        let dir: TempDir = TempDir::new().unwrap();
        let export: PathBuf = dir.path().join("progress.json");

        let mut manager: StatsManager = StatsManager::new(Some(export.clone()));
        let sender: StatsSender = manager.sender();
        manager.start();

        sender.send(StatsItem::Listed { dirs: 0, files: 1 }).await;
        sender.send(transfer("a", true, 42)).await;
        manager.stop().await;

        let content: String = std::fs::read_to_string(&export).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["success"], 1);
        assert_eq!(parsed["bytes_downloaded"], 42);
    }

    #[tokio::test]
    async fn test_percent_complete_partial() {
        let mut manager: StatsManager = StatsManager::new(None);
        let sender: StatsSender = manager.sender();
        manager.start();

        sender.send(StatsItem::Listed { dirs: 0, files: 4 }).await;
        sender.send(transfer("a", true, 1)).await;
        let snapshot: StatsSnapshot = manager.stop().await;
        assert!((snapshot.percent_complete - 25.0).abs() < f64::EPSILON);
    }
}
