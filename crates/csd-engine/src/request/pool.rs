//! Free list of reusable work requests

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use super::WorkRequest;
use crate::error::{EngineError, EngineResult};
use crate::memory::RegisteredMemoryAllocator;

/// Pool statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Requests alive (idle or in flight)
    pub total: usize,
    /// Requests on the free list
    pub idle: usize,
}

/// Mutex-guarded free list of work requests.
///
/// Each request is created together with its own registered header buffer.
/// When the free list runs dry the pool grows by `expand_batch` requests.
pub struct WorkRequestPool {
    free: Mutex<Vec<Box<WorkRequest>>>,
    allocator: Arc<RegisteredMemoryAllocator>,
    header_size: usize,
    expand_batch: usize,
    next_id: AtomicU64,
    total: AtomicUsize,
}

impl WorkRequestPool {
    /// Create an empty pool whose requests carry `header_size`-byte header
    /// buffers
    pub fn new(
        allocator: Arc<RegisteredMemoryAllocator>,
        header_size: usize,
        expand_batch: usize,
    ) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            allocator,
            header_size,
            expand_batch: expand_batch.max(1),
            next_id: AtomicU64::new(0),
            total: AtomicUsize::new(0),
        }
    }

    /// Take one request, growing the pool if needed
    pub fn allocate_one(&self) -> EngineResult<Box<WorkRequest>> {
        let mut free = self.free.lock();
        if free.is_empty() {
            self.expand_locked(&mut free, self.expand_batch)?;
        }
        // `expand_locked` either pushed at least one request or returned Err.
        free.pop().ok_or(EngineError::OutOfMemory {
            size: self.header_size,
        })
    }

    /// Take `n` requests, growing the pool if needed
    pub fn allocate_many(&self, n: usize) -> EngineResult<Vec<Box<WorkRequest>>> {
        let mut free = self.free.lock();
        if free.len() < n {
            let missing = n - free.len();
            self.expand_locked(&mut free, missing.max(self.expand_batch))?;
        }
        let at = free.len() - n;
        Ok(free.split_off(at))
    }

    /// Return a request to the free list. Its data buffer is released.
    pub fn free(&self, mut req: Box<WorkRequest>) {
        req.reset();
        self.free.lock().push(req);
    }

    /// Pre-create `n` idle requests
    pub fn expand(&self, n: usize) -> EngineResult<()> {
        let mut free = self.free.lock();
        self.expand_locked(&mut free, n)
    }

    /// Destroy up to `n` idle requests, returning how many were destroyed
    pub fn purge(&self, n: usize) -> usize {
        let mut free = self.free.lock();
        let count = n.min(free.len());
        let at = free.len() - count;
        free.truncate(at);
        self.total.fetch_sub(count, Ordering::Relaxed);
        if count > 0 {
            debug!("Purged {} work requests", count);
        }
        count
    }

    /// Pool statistics
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total.load(Ordering::Relaxed),
            idle: self.free.lock().len(),
        }
    }

    fn expand_locked(&self, free: &mut Vec<Box<WorkRequest>>, n: usize) -> EngineResult<()> {
        free.reserve(n);
        for _ in 0..n {
            let header = self.allocator.allocate(self.header_size)?;
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            free.push(Box::new(WorkRequest::new(id, header)));
            self.total.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            "Work request pool grew by {} (total={})",
            n,
            self.total.load(Ordering::Relaxed)
        );
        Ok(())
    }
}

impl std::fmt::Debug for WorkRequestPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkRequestPool")
            .field("header_size", &self.header_size)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::memory::MemoryRegistry;
    use crate::request::RequestStatus;

    fn pool(max_slabs: usize) -> WorkRequestPool {
        let allocator = RegisteredMemoryAllocator::new(
            MemoryConfig {
                slab_size: 64 * 1024,
                min_block: 1024,
                max_block: 8192,
                max_slabs,
                expand_retries: 3,
            },
            Arc::new(MemoryRegistry::new()),
        )
        .unwrap();
        WorkRequestPool::new(Arc::new(allocator), 4160, 4)
    }

    #[test]
    fn test_grows_on_demand() {
        let pool = pool(1);
        assert_eq!(pool.stats(), PoolStats { total: 0, idle: 0 });

        let req = pool.allocate_one().unwrap();
        assert_eq!(req.status(), RequestStatus::Free);
        assert_eq!(req.header_capacity(), 4160);
        assert_eq!(pool.stats(), PoolStats { total: 4, idle: 3 });

        pool.free(req);
        assert_eq!(pool.stats(), PoolStats { total: 4, idle: 4 });
    }

    #[test]
    fn test_reuse_resets_state() {
        let pool = pool(1);
        let mut req = pool.allocate_one().unwrap();
        let id = req.id();
        req.set_tag(42);
        req.set_status(RequestStatus::Error);
        pool.free(req);

        let again = pool.allocate_one().unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.tag(), 0);
        assert_eq!(again.status(), RequestStatus::Free);
    }

    #[test]
    fn test_allocate_many_and_purge() {
        let pool = pool(1);
        let batch = pool.allocate_many(6).unwrap();
        assert_eq!(batch.len(), 6);
        let mut ids: Vec<_> = batch.iter().map(|r| r.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 6);

        for req in batch {
            pool.free(req);
        }
        let total = pool.stats().total;
        assert_eq!(pool.purge(2), 2);
        assert_eq!(pool.stats().total, total - 2);
        assert_eq!(pool.purge(100), total - 2);
        assert_eq!(pool.stats(), PoolStats { total: 0, idle: 0 });
    }

    #[test]
    fn test_exhausted_memory_is_reported() {
        // One 64 KiB slab holds eight 8 KiB header blocks.
        let pool = pool(1);
        let held = pool.allocate_many(8).unwrap();
        assert!(matches!(
            pool.allocate_one(),
            Err(EngineError::OutOfMemory { .. })
        ));
        drop(held);
    }
}
