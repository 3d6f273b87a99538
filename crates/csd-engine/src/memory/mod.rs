//! Registered memory: slabs, buddy allocation, buffers and remote-key registry

mod allocator;
mod buddy;
mod buffer;
mod registry;
mod slab;

pub use allocator::RegisteredMemoryAllocator;
pub use buddy::{Block, BuddyAllocator};
pub use buffer::RegisteredBuffer;
pub use registry::{MemoryKeys, MemoryRegistry};
pub use slab::{PAGE_SIZE, Slab, SlabRegion};
