//! Registered memory allocator: a growable set of buddy-managed slabs

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::buffer::RegisteredBuffer;
use super::registry::MemoryRegistry;
use super::slab::{Slab, SlabRegion};
use crate::config::MemoryConfig;
use crate::error::{EngineError, EngineResult};

/// Hands out registered buffers from pre-registered slabs.
///
/// Registration is expensive, so buffers are carved from a few large
/// regions. When every slab is exhausted the allocator registers a new one
/// and retries, at most `expand_retries` times and never beyond
/// `max_slabs`.
pub struct RegisteredMemoryAllocator {
    config: MemoryConfig,
    registry: Arc<MemoryRegistry>,
    slabs: RwLock<Vec<Arc<Slab>>>,
    expand_lock: Mutex<()>,
}

impl RegisteredMemoryAllocator {
    /// Create an allocator with one slab registered up front
    pub fn new(config: MemoryConfig, registry: Arc<MemoryRegistry>) -> EngineResult<Self> {
        let allocator = Self {
            config,
            registry,
            slabs: RwLock::new(Vec::new()),
            expand_lock: Mutex::new(()),
        };
        allocator.expand(0)?;
        Ok(allocator)
    }

    /// Allocate a buffer of `size` bytes
    pub fn allocate(&self, size: usize) -> EngineResult<RegisteredBuffer> {
        if size == 0 {
            return Err(EngineError::InvalidSize(0));
        }
        if size > self.config.max_block {
            return Err(EngineError::TooLarge {
                size,
                max: self.config.max_block,
            });
        }

        let mut retries = 0;
        loop {
            let (buffer, observed) = self.try_allocate(size);
            if let Some(buffer) = buffer {
                return Ok(buffer);
            }
            if retries == self.config.expand_retries {
                break;
            }
            retries += 1;
            if !self.expand(observed)? {
                break;
            }
        }

        warn!(
            "Registered memory exhausted: {} bytes requested, {} slabs, {} bytes used",
            size,
            self.get_mr_num(),
            self.get_mem_used()
        );
        Err(EngineError::OutOfMemory { size })
    }

    /// Return a buffer to its slab. Equivalent to dropping it.
    pub fn free(&self, buffer: RegisteredBuffer) {
        drop(buffer);
    }

    /// Bytes handed out across all slabs
    pub fn get_mem_used(&self) -> usize {
        self.slabs.read().iter().map(|slab| slab.used()).sum()
    }

    /// Bytes registered across all slabs
    pub fn get_mem_reged(&self) -> usize {
        self.slabs.read().len() * self.config.slab_size
    }

    /// Number of registered slabs
    pub fn get_mr_num(&self) -> usize {
        self.slabs.read().len()
    }

    /// Registry the slabs are registered with
    pub fn registry(&self) -> &Arc<MemoryRegistry> {
        &self.registry
    }

    /// Largest size class
    pub fn max_block(&self) -> usize {
        self.config.max_block
    }

    /// Try every slab once. Also reports how many slabs were seen, so a
    /// failed attempt can tell whether another thread has expanded since.
    fn try_allocate(&self, size: usize) -> (Option<RegisteredBuffer>, usize) {
        let slabs = self.slabs.read();
        let buffer = slabs.iter().find_map(|slab| slab.allocate(size));
        (buffer, slabs.len())
    }

    /// Register one more slab unless another thread already did after
    /// `observed` slabs were seen. Returns `false` once `max_slabs` is hit.
    fn expand(&self, observed: usize) -> EngineResult<bool> {
        let _guard = self.expand_lock.lock();

        let count = self.slabs.read().len();
        if count > observed {
            return Ok(true);
        }
        if count >= self.config.max_slabs {
            debug!("Slab limit reached ({} slabs)", count);
            return Ok(false);
        }

        let region = Arc::new(SlabRegion::new(self.config.slab_size)?);
        let keys = self.registry.register(region.clone());
        let slab = Arc::new(Slab::new(
            count as u32,
            region,
            keys,
            self.config.min_block,
            self.config.max_block,
        ));
        self.slabs.write().push(slab);

        info!(
            "Registered slab {} ({} bytes, rkey={:#x})",
            count, self.config.slab_size, keys.rkey
        );
        Ok(true)
    }
}

impl Drop for RegisteredMemoryAllocator {
    fn drop(&mut self) {
        for slab in self.slabs.get_mut().drain(..) {
            self.registry.deregister(slab.keys().rkey);
        }
    }
}

impl std::fmt::Debug for RegisteredMemoryAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredMemoryAllocator")
            .field("slabs", &self.get_mr_num())
            .field("mem_used", &self.get_mem_used())
            .field("mem_reged", &self.get_mem_reged())
            .finish()
    }
}
