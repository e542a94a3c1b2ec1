//! Fixed-size transfer buffers and the bounded pool that recycles them.
//!
//! The pool is the memory throttle for the whole pipeline: every in-flight
//! block download owns exactly one buffer, and `get` suspends callers when
//! none are free. One buffer is set aside in a priority lane so a foreground
//! open is never starved by bulk background traffic.

use std::fmt;
use std::sync::Mutex;

use tokio::sync::Semaphore;

use crate::error::XloadError;

/// A fixed-capacity buffer carrying one chunk of file data.
///
/// Exclusively owned by the work item it travels with; returned to the pool
/// exactly once when that item is consumed.
pub struct Block {
    /// Block index within its file.
    pub index: u32,
    /// Byte offset of this block within its file.
    pub offset: u64,
    /// Number of valid bytes for this block (<= capacity).
    pub length: u64,
    data: Vec<u8>,
    from_priority_lane: bool,
}

impl Block {
    fn new(capacity: usize, from_priority_lane: bool) -> Self {
        Self {
            index: 0,
            offset: 0,
            length: 0,
            data: vec![0u8; capacity],
            from_priority_lane,
        }
    }

    /// Clear per-lease fields so a recycled buffer carries nothing over from
    /// its previous lease.
    fn reset(&mut self) {
        self.index = 0;
        self.offset = 0;
        self.length = 0;
    }

    /// Full buffer contents (capacity bytes; only `length` are meaningful).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable buffer contents.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Buffer capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("index", &self.index)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("capacity", &self.data.len())
            .finish()
    }
}

/// One bounded lane of free buffers.
struct Lane {
    free: Mutex<Vec<Block>>,
    available: Semaphore,
}

impl Lane {
    fn new(blocks: Vec<Block>) -> Self {
        let count: usize = blocks.len();
        Self {
            free: Mutex::new(blocks),
            available: Semaphore::new(count),
        }
    }

    fn take(&self) -> Block {
        let mut block: Block = self
            .free
            .lock()
            .expect("block lane poisoned")
            .pop()
            .expect("semaphore permit without a free block");
        block.reset();
        block
    }

    fn put(&self, block: Block) {
        self.free.lock().expect("block lane poisoned").push(block);
        self.available.add_permits(1);
    }
}

/// Bounded pool of reusable transfer buffers with a reserved priority lane.
pub struct BlockPool {
    block_size: u64,
    total: usize,
    normal: Lane,
    priority: Lane,
}

impl BlockPool {
    /// Create a pool of `max_blocks` buffers of `block_size` bytes each.
    ///
    /// When `max_blocks > 1`, one buffer is reserved for priority callers;
    /// a single-buffer pool cannot reserve without starving bulk traffic.
    ///
    /// # Errors
    /// Returns `XloadError::InvalidConfig` if either argument is zero.
    pub fn new(block_size: u64, max_blocks: usize) -> Result<Self, XloadError> {
        if block_size == 0 || max_blocks == 0 {
            return Err(XloadError::InvalidConfig {
                message: format!(
                    "block pool requires non-zero sizing (block_size={block_size}, max_blocks={max_blocks})"
                ),
            });
        }

        let reserved: usize = if max_blocks > 1 { 1 } else { 0 };
        let normal: Vec<Block> = (0..max_blocks - reserved)
            .map(|_| Block::new(block_size as usize, false))
            .collect();
        let priority: Vec<Block> = (0..reserved)
            .map(|_| Block::new(block_size as usize, true))
            .collect();

        Ok(Self {
            block_size,
            total: max_blocks,
            normal: Lane::new(normal),
            priority: Lane::new(priority),
        })
    }

    /// Acquire a buffer, suspending until one is free.
    ///
    /// Priority callers may draw from either lane (whichever frees first);
    /// normal callers only from the normal lane, so the reserve stays
    /// available for foreground requests.
    ///
    /// # Errors
    /// Returns `XloadError::Cancelled` once the pool has been terminated.
    pub async fn get(&self, priority: bool) -> Result<Block, XloadError> {
        if priority {
            tokio::select! {
                permit = self.priority.available.acquire() => {
                    permit.map_err(|_| XloadError::Cancelled)?.forget();
                    Ok(self.priority.take())
                }
                permit = self.normal.available.acquire() => {
                    permit.map_err(|_| XloadError::Cancelled)?.forget();
                    Ok(self.normal.take())
                }
            }
        } else {
            let permit = self
                .normal
                .available
                .acquire()
                .await
                .map_err(|_| XloadError::Cancelled)?;
            permit.forget();
            Ok(self.normal.take())
        }
    }

    /// Return a buffer to the lane it was drawn from.
    pub fn release(&self, block: Block) {
        if block.from_priority_lane {
            self.priority.put(block);
        } else {
            self.normal.put(block);
        }
    }

    /// Bytes currently leased out of the pool.
    pub fn usage(&self) -> u64 {
        let free: usize =
            self.normal.available.available_permits() + self.priority.available.available_permits();
        self.block_size * (self.total - free.min(self.total)) as u64
    }

    /// Close both lanes so blocked `get` callers return `Cancelled` instead
    /// of waiting forever.
    pub fn terminate(&self) {
        self.normal.available.close();
        self.priority.available.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_rejects_zero_sizing() {
        assert!(BlockPool::new(0, 4).is_err());
        assert!(BlockPool::new(1024, 0).is_err());
    }

    #[tokio::test]
    async fn test_accounting_invariant() {
        let pool: BlockPool = BlockPool::new(64, 4).unwrap();
        assert_eq!(pool.usage(), 0);

        let b1: Block = pool.get(false).await.unwrap();
        let b2: Block = pool.get(false).await.unwrap();
        assert_eq!(pool.usage(), 128);

        pool.release(b1);
        assert_eq!(pool.usage(), 64);
        pool.release(b2);
        assert_eq!(pool.usage(), 0);
    }

    #[tokio::test]
    async fn test_reuse_resets_index() {
        let pool: BlockPool = BlockPool::new(64, 2).unwrap();

        let mut block: Block = pool.get(false).await.unwrap();
        block.index = 7;
        block.offset = 4096;
        block.length = 64;
        pool.release(block);

        let block: Block = pool.get(false).await.unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.offset, 0);
        assert_eq!(block.length, 0);
    }

    #[tokio::test]
    async fn test_priority_reserve_survives_bulk_exhaustion() {
        // 3 buffers total: 2 normal + 1 reserved.
        let pool: BlockPool = BlockPool::new(16, 3).unwrap();

        let _n1: Block = pool.get(false).await.unwrap();
        let _n2: Block = pool.get(false).await.unwrap();

        // Normal lane exhausted: a normal caller would now block...
        let starved =
            tokio::time::timeout(Duration::from_millis(50), pool.get(false)).await;
        assert!(starved.is_err());

        // ...but a priority caller still gets the reserved buffer.
        let p: Block = pool.get(true).await.unwrap();
        assert_eq!(pool.usage(), 48);
        pool.release(p);
    }

    #[tokio::test]
    async fn test_get_blocks_until_release() {
        let pool: std::sync::Arc<BlockPool> = std::sync::Arc::new(BlockPool::new(16, 2).unwrap());

        let b1: Block = pool.get(false).await.unwrap();
        // max_blocks=2 means one normal buffer; the second normal get waits.
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        pool.release(b1);
        let b2: Block = waiter.await.unwrap().unwrap();
        pool.release(b2);
    }

    #[tokio::test]
    async fn test_terminate_wakes_waiters() {
        let pool: std::sync::Arc<BlockPool> = std::sync::Arc::new(BlockPool::new(16, 2).unwrap());
        let _held: Block = pool.get(false).await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get(false).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        pool.terminate();
        let result: Result<Block, XloadError> = waiter.await.unwrap();
        assert!(matches!(result, Err(XloadError::Cancelled)));
    }
}
