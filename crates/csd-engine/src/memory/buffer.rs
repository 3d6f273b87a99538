//! Buffers carved out of registered slabs

use std::fmt;
use std::sync::Arc;

use csd_proto::MemoryDescriptor;

use super::buddy::Block;
use super::slab::Slab;

/// An exclusively owned, registered buffer.
///
/// The block returns to its slab when the buffer is dropped.
pub struct RegisteredBuffer {
    slab: Arc<Slab>,
    block: Block,
    len: usize,
}

impl RegisteredBuffer {
    pub(crate) fn new(slab: Arc<Slab>, block: Block, len: usize) -> Self {
        Self { slab, block, len }
    }

    /// Start address
    pub fn addr(&self) -> u64 {
        self.slab.region().addr() + self.block.offset as u64
    }

    /// Requested length
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the requested length is zero
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying block (at least `len`)
    pub fn capacity(&self) -> usize {
        self.block.size()
    }

    /// Local-access key
    pub fn lkey(&self) -> u32 {
        self.slab.keys().lkey
    }

    /// Remote-access key
    pub fn rkey(&self) -> u32 {
        self.slab.keys().rkey
    }

    /// Id of the owning slab
    pub fn slab_id(&self) -> u32 {
        self.slab.id()
    }

    /// Descriptor a peer uses to read or write this buffer
    pub fn descriptor(&self) -> MemoryDescriptor {
        MemoryDescriptor::new(self.addr(), self.len as u32, self.rkey())
    }

    /// Buffer contents
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the block lies inside the slab region, which outlives us
        // through `self.slab`, and the block is owned by this buffer alone.
        unsafe {
            std::slice::from_raw_parts(
                self.slab.region().as_ptr().add(self.block.offset),
                self.len,
            )
        }
    }

    /// Mutable buffer contents
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` makes the borrow exclusive.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.slab.region().as_ptr().add(self.block.offset),
                self.len,
            )
        }
    }
}

impl Drop for RegisteredBuffer {
    fn drop(&mut self) {
        self.slab.release(self.block);
    }
}

impl fmt::Debug for RegisteredBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredBuffer")
            .field("slab", &self.slab.id())
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("rkey", &format_args!("{:#x}", self.rkey()))
            .finish()
    }
}
