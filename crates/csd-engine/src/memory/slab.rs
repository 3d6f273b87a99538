//! Registered slabs: one pinned region carved up by a buddy allocator

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::buddy::{Block, BuddyAllocator};
use super::buffer::RegisteredBuffer;
use super::registry::MemoryKeys;
use crate::error::{EngineError, EngineResult};

/// Alignment of every slab region
pub const PAGE_SIZE: usize = 4096;

/// Page-aligned, zero-initialised memory backing one slab.
pub struct SlabRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is plain memory; access is coordinated by buffer
// ownership and by the RDMA contract that a peer only touches memory it was
// handed a descriptor for.
unsafe impl Send for SlabRegion {}
unsafe impl Sync for SlabRegion {}

impl SlabRegion {
    /// Allocate `len` zeroed bytes aligned to [`PAGE_SIZE`]
    pub fn new(len: usize) -> EngineResult<Self> {
        let layout = Layout::from_size_align(len, PAGE_SIZE)
            .map_err(|e| EngineError::Config(format!("invalid slab layout: {e}")))?;
        if layout.size() == 0 {
            return Err(EngineError::InvalidSize(0));
        }
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(EngineError::OutOfMemory { size: len })?;
        Ok(Self { ptr, layout })
    }

    /// Base address
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    /// Whether the region is empty (never true for a constructed region)
    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Whether `[addr, addr + len)` lies inside the region
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let base = self.addr();
        match addr.checked_add(len as u64) {
            Some(end) => addr >= base && end <= base + self.len() as u64,
            None => false,
        }
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for SlabRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl fmt::Debug for SlabRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabRegion")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len())
            .finish()
    }
}

/// A registered region plus the buddy state that carves it into buffers.
pub struct Slab {
    id: u32,
    region: Arc<SlabRegion>,
    keys: MemoryKeys,
    buddy: Mutex<BuddyAllocator>,
}

impl Slab {
    pub(crate) fn new(
        id: u32,
        region: Arc<SlabRegion>,
        keys: MemoryKeys,
        min_block: usize,
        max_block: usize,
    ) -> Self {
        let buddy = BuddyAllocator::new(region.len(), min_block, max_block);
        Self {
            id,
            region,
            keys,
            buddy: Mutex::new(buddy),
        }
    }

    /// Slab id within its allocator
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Registration keys
    pub fn keys(&self) -> MemoryKeys {
        self.keys
    }

    /// Backing region
    pub fn region(&self) -> &Arc<SlabRegion> {
        &self.region
    }

    /// Bytes handed out from this slab
    pub fn used(&self) -> usize {
        self.buddy.lock().used()
    }

    /// Try to carve a `size`-byte buffer out of this slab
    pub(crate) fn allocate(self: &Arc<Self>, size: usize) -> Option<RegisteredBuffer> {
        let block = self.buddy.lock().allocate(size)?;
        Some(RegisteredBuffer::new(self.clone(), block, size))
    }

    pub(crate) fn release(&self, block: Block) {
        self.buddy.lock().free(block);
        debug!(
            "Released {} bytes at offset {:#x} to slab {}",
            block.size(),
            block.offset,
            self.id
        );
    }
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("id", &self.id)
            .field("region", &self.region)
            .field("keys", &self.keys)
            .field("used", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_alignment_and_zeroing() {
        let region = SlabRegion::new(64 * 1024).unwrap();
        assert_eq!(region.addr() % PAGE_SIZE as u64, 0);
        assert_eq!(region.len(), 64 * 1024);
        // SAFETY: region is live and `len` bytes long.
        let bytes = unsafe { std::slice::from_raw_parts(region.as_ptr(), region.len()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_region_contains() {
        let region = SlabRegion::new(4096).unwrap();
        let base = region.addr();
        assert!(region.contains(base, 4096));
        assert!(region.contains(base + 4000, 96));
        assert!(!region.contains(base + 4000, 97));
        assert!(!region.contains(base - 1, 1));
    }

    #[test]
    fn test_zero_sized_region_rejected() {
        assert!(matches!(SlabRegion::new(0), Err(EngineError::InvalidSize(0))));
    }
}
