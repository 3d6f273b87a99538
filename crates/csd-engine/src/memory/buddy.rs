//! Power-of-two buddy allocator over an offset range.
//!
//! Manages offsets only; the memory itself belongs to the slab. Free blocks
//! of each order are kept in a `BTreeSet` so the lowest offset is reused
//! first and buddy lookup on free is a set removal.

use std::collections::BTreeSet;

/// A block handed out by [`BuddyAllocator::allocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    /// Offset from the start of the managed range
    pub offset: usize,
    /// log2 of the block size
    pub order: u32,
}

impl Block {
    /// Block size in bytes
    pub fn size(&self) -> usize {
        1 << self.order
    }
}

/// Buddy allocator for `capacity` bytes split into blocks between
/// `min_block` and `max_block` bytes.
#[derive(Debug)]
pub struct BuddyAllocator {
    min_order: u32,
    max_order: u32,
    capacity: usize,
    /// Free offsets per order, indexed by `order - min_order`
    free: Vec<BTreeSet<usize>>,
    used: usize,
}

impl BuddyAllocator {
    /// Create an allocator. All three sizes must be powers of two with
    /// `min_block <= max_block <= capacity`.
    pub fn new(capacity: usize, min_block: usize, max_block: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!(min_block.is_power_of_two() && max_block.is_power_of_two());
        debug_assert!(min_block <= max_block && max_block <= capacity);

        let min_order = min_block.trailing_zeros();
        let max_order = max_block.trailing_zeros();
        let mut free = vec![BTreeSet::new(); (max_order - min_order + 1) as usize];
        free[(max_order - min_order) as usize] = (0..capacity).step_by(max_block).collect();

        Self {
            min_order,
            max_order,
            capacity,
            free,
            used: 0,
        }
    }

    /// Smallest order able to hold `size` bytes, or `None` above the largest
    /// size class
    pub fn order_for(&self, size: usize) -> Option<u32> {
        let order = size
            .max(1)
            .checked_next_power_of_two()?
            .trailing_zeros()
            .max(self.min_order);
        (order <= self.max_order).then_some(order)
    }

    /// Allocate a block of at least `size` bytes
    pub fn allocate(&mut self, size: usize) -> Option<Block> {
        let order = self.order_for(size)?;

        let mut current = (order..=self.max_order).find(|&o| !self.free_list(o).is_empty())?;
        let offset = self.free_list_mut(current).pop_first()?;

        while current > order {
            current -= 1;
            self.free_list_mut(current).insert(offset + (1 << current));
        }

        self.used += 1 << order;
        Some(Block { offset, order })
    }

    /// Return a block, merging it with free buddies
    pub fn free(&mut self, block: Block) {
        let Block { mut offset, mut order } = block;
        self.used -= 1 << order;

        while order < self.max_order {
            let buddy = offset ^ (1 << order);
            if !self.free_list_mut(order).remove(&buddy) {
                break;
            }
            offset = offset.min(buddy);
            order += 1;
        }
        self.free_list_mut(order).insert(offset);
    }

    /// Bytes currently handed out (rounded to block sizes)
    pub fn used(&self) -> usize {
        self.used
    }

    /// Bytes managed
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest block size
    pub fn max_block(&self) -> usize {
        1 << self.max_order
    }

    /// Whether nothing is allocated
    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    fn free_list(&self, order: u32) -> &BTreeSet<usize> {
        &self.free[(order - self.min_order) as usize]
    }

    fn free_list_mut(&mut self, order: u32) -> &mut BTreeSet<usize> {
        &mut self.free[(order - self.min_order) as usize]
    }
}
