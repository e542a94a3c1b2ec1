//! Generic bounded worker pool used by every pipeline stage.
//!
//! Each pool owns two bounded queues (priority and normal) and a fixed set
//! of workers that invoke the stage's callback per item. Queue sends
//! suspend when full, which is how backpressure propagates upstream: a slow
//! data manager throttles the splitter, which throttles the lister.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::XloadError;
use crate::item::WorkItem;

/// A pipeline stage: the callback a worker pool drives.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Stage name used in logs and on the items it creates.
    fn name(&self) -> &'static str;

    /// Process one item, returning the number of bytes it moved.
    async fn process(&self, item: &mut WorkItem) -> Result<u64, XloadError>;
}

/// Cloneable handle for scheduling work onto a pool.
#[derive(Clone)]
pub struct Scheduler {
    priority_tx: mpsc::Sender<WorkItem>,
    normal_tx: mpsc::Sender<WorkItem>,
    closing: CancellationToken,
}

impl Scheduler {
    /// Enqueue an item, suspending while the target queue is full.
    ///
    /// Priority items go to the priority queue, everything else to the
    /// normal queue.
    ///
    /// # Errors
    /// Returns `XloadError::PoolStopped` if the pool is no longer accepting
    /// work, handing the rejected item back so the caller can release any
    /// resources (e.g. a leased block) it carries.
    pub async fn schedule(&self, item: WorkItem) -> Result<(), (XloadError, WorkItem)> {
        if self.closing.is_cancelled() {
            return Err((XloadError::PoolStopped, item));
        }
        let tx: &mpsc::Sender<WorkItem> = if item.priority {
            &self.priority_tx
        } else {
            &self.normal_tx
        };
        tx.send(item)
            .await
            .map_err(|e| (XloadError::PoolStopped, e.0))
    }
}

/// The pool's receive side, shared by all of its workers.
struct Inputs {
    priority: mpsc::Receiver<WorkItem>,
    normal: mpsc::Receiver<WorkItem>,
}

/// A bounded pool of workers driving one stage.
pub struct WorkerPool {
    stage: Arc<dyn Stage>,
    worker_count: usize,
    scheduler: Scheduler,
    inputs: Arc<Mutex<Inputs>>,
    closing: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Create a pool of `worker_count` workers for `stage`.
    ///
    /// Both queues are bounded at `2 * worker_count` so a stage can never
    /// buffer more than a small multiple of what it can actually process.
    ///
    /// # Errors
    /// Returns `XloadError::InvalidConfig` if `worker_count` is zero.
    pub fn new(worker_count: usize, stage: Arc<dyn Stage>) -> Result<Self, XloadError> {
        if worker_count == 0 {
            return Err(XloadError::InvalidConfig {
                message: format!("{} pool requires at least one worker", stage.name()),
            });
        }

        let capacity: usize = 2 * worker_count;
        let (priority_tx, priority_rx) = mpsc::channel(capacity);
        let (normal_tx, normal_rx) = mpsc::channel(capacity);
        let closing: CancellationToken = CancellationToken::new();

        Ok(Self {
            stage,
            worker_count,
            scheduler: Scheduler {
                priority_tx,
                normal_tx,
                closing: closing.clone(),
            },
            inputs: Arc::new(Mutex::new(Inputs {
                priority: priority_rx,
                normal: normal_rx,
            })),
            closing,
            workers: Vec::new(),
        })
    }

    /// Handle for scheduling work onto this pool.
    pub fn scheduler(&self) -> Scheduler {
        self.scheduler.clone()
    }

    /// Launch the pool's workers.
    pub fn start(&mut self) {
        for _ in 0..self.worker_count {
            let stage: Arc<dyn Stage> = self.stage.clone();
            let inputs: Arc<Mutex<Inputs>> = self.inputs.clone();
            let closing: CancellationToken = self.closing.clone();
            self.workers.push(tokio::spawn(async move {
                while let Some(item) = Self::next_item(&inputs, &closing).await {
                    Self::run_item(&stage, item).await;
                }
            }));
        }
    }

    /// Stop accepting work and wait for the workers to drain what is already
    /// enqueued.
    pub async fn stop(&mut self) {
        self.closing.cancel();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                log::warn!("{} worker exited abnormally: {e}", self.stage.name());
            }
        }
    }

    /// Pull the next item, always draining the priority queue first. Returns
    /// `None` once the pool is closing and both queues are empty.
    async fn next_item(
        inputs: &Mutex<Inputs>,
        closing: &CancellationToken,
    ) -> Option<WorkItem> {
        let mut guard = inputs.lock().await;
        let queues: &mut Inputs = &mut guard;
        loop {
            // An available priority item always wins over a normal one.
            if let Ok(item) = queues.priority.try_recv() {
                return Some(item);
            }
            if closing.is_cancelled() {
                return queues.normal.try_recv().ok();
            }
            tokio::select! {
                biased;
                _ = closing.cancelled() => continue,
                item = queues.priority.recv() => return item,
                item = queues.normal.recv() => return item,
            }
        }
    }

    /// Invoke the stage callback, record the outcome on the item, and
    /// forward it on its response channel if a coordinator is waiting.
    async fn run_item(stage: &Arc<dyn Stage>, mut item: WorkItem) {
        match stage.process(&mut item).await {
            Ok(bytes) => item.data_length = bytes,
            Err(e) => {
                if item.response.is_none() {
                    log::warn!("{}: work item {} failed: {e}", stage.name(), item.path);
                }
                item.err = Some(e);
            }
        }
        if let Some(response) = item.response.take() {
            if response.send(item).await.is_err() {
                log::debug!("{}: response receiver dropped", stage.name());
            }
        }
    }
}
