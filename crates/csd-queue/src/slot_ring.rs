//! Slotted ring with deferred reclamation.
//!
//! Unlike [`RingQueue`](crate::RingQueue), a slot is not reusable the moment
//! its element is read. Consumers mark a slot *loaded*; an element may also be
//! *removed* out of order through its [`SlotId`] before any consumer reaches
//! it. A slot only becomes writable again once [`trim`](SlotRing::trim) has
//! walked over it, and trimming stops at the first slot that is still pending,
//! so reclamation always covers a contiguous prefix.
//!
//! Each slot carries a stamp `(position << 3) | state`. Encoding the absolute
//! position makes stale CAS attempts from a previous lap fail.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

use crate::policy::SpinPolicy;
use crate::sync::{AtomicUsize, Ordering};

const STATE_BITS: u32 = 3;
const STATE_MASK: usize = (1 << STATE_BITS) - 1;

const EMPTY: usize = 0;
const FILLED: usize = 1;
const TAKING: usize = 2;
const LOADED: usize = 3;
const REMOVED: usize = 4;

#[inline]
const fn stamp(pos: usize, state: usize) -> usize {
    (pos << STATE_BITS) | state
}

/// Handle to a saved element, usable with [`SlotRing::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

impl SlotId {
    /// Rebuild an id from a stored position. An id that no longer names a
    /// live element is harmless: [`SlotRing::remove`] returns `None` for it.
    pub fn from_position(position: usize) -> Self {
        Self(position)
    }

    /// Absolute position of the element in the ring's history
    pub fn position(&self) -> usize {
        self.0
    }
}

struct Slot<T> {
    stamp: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPMC ring supporting out-of-order removal.
pub struct SlotRing<T> {
    slots: Box<[Slot<T>]>,
    save_reserve: CachePadded<AtomicUsize>,
    save_commit: CachePadded<AtomicUsize>,
    load_reserve: CachePadded<AtomicUsize>,
    trim: CachePadded<AtomicUsize>,
    policy: SpinPolicy,
}

// SAFETY: slot contents are handed off through the stamp protocol; at most
// one thread owns a slot's value at a time (the saver until FILLED, then the
// thread that wins FILLED -> TAKING).
unsafe impl<T: Send> Send for SlotRing<T> {}
unsafe impl<T: Send> Sync for SlotRing<T> {}

impl<T> SlotRing<T> {
    /// Create a ring with `capacity` slots and the default spin policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_policy(capacity, SpinPolicy::default())
    }

    /// Create a ring with an explicit spin policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn with_policy(capacity: usize, policy: SpinPolicy) -> Self {
        assert!(capacity > 0, "slot ring capacity must be non-zero");

        let slots = (0..capacity)
            .map(|pos| Slot {
                stamp: AtomicUsize::new(stamp(pos, EMPTY)),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            save_reserve: CachePadded::new(AtomicUsize::new(0)),
            save_commit: CachePadded::new(AtomicUsize::new(0)),
            load_reserve: CachePadded::new(AtomicUsize::new(0)),
            trim: CachePadded::new(AtomicUsize::new(0)),
            policy,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots saved but not yet reclaimed by [`trim`](Self::trim)
    pub fn occupied(&self) -> usize {
        let saved = self.save_reserve.load(Ordering::Acquire);
        let trimmed = self.trim.load(Ordering::Acquire);
        saved.saturating_sub(trimmed)
    }

    /// Committed slots not yet claimed by a consumer. Slots already removed
    /// out of order are still counted until a consumer skips over them.
    pub fn pending(&self) -> usize {
        let committed = self.save_commit.load(Ordering::Acquire);
        let loaded = self.load_reserve.load(Ordering::Acquire);
        committed.saturating_sub(loaded)
    }

    fn slot(&self, pos: usize) -> &Slot<T> {
        &self.slots[pos % self.slots.len()]
    }

    /// Save without waiting for reclamation. Returns the value back if every
    /// slot is still awaiting trim.
    pub fn try_save(&self, value: T) -> Result<SlotId, T> {
        match self.reserve_save() {
            Some(pos) => Ok(self.fill(pos, value)),
            None => Err(value),
        }
    }

    /// Save, waiting according to the spin policy while the ring is full.
    pub fn save(&self, value: T) -> Result<SlotId, T> {
        let mut wait = self.policy.waiter();
        loop {
            if let Some(pos) = self.reserve_save() {
                return Ok(self.fill(pos, value));
            }
            if !wait.wait() {
                return Err(value);
            }
        }
    }

    /// Take the oldest committed element that has not been removed. The slot
    /// stays occupied until the next [`trim`](Self::trim).
    pub fn load(&self) -> Option<T> {
        loop {
            let pos = self.reserve_load()?;
            let slot = self.slot(pos);
            if slot
                .stamp
                .compare_exchange(
                    stamp(pos, FILLED),
                    stamp(pos, TAKING),
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                // SAFETY: winning FILLED -> TAKING grants sole ownership.
                let value = unsafe { (*slot.value.get()).assume_init_read() };
                slot.stamp.store(stamp(pos, LOADED), Ordering::Release);
                return Some(value);
            }
            // Removed before we got here; move on to the next position.
        }
    }

    /// Remove a saved element before a consumer loads it.
    ///
    /// Returns `None` if the element was already loaded or removed.
    pub fn remove(&self, id: SlotId) -> Option<T> {
        let pos = id.0;
        let slot = self.slot(pos);
        slot.stamp
            .compare_exchange(
                stamp(pos, FILLED),
                stamp(pos, TAKING),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .ok()?;
        // SAFETY: winning FILLED -> TAKING grants sole ownership.
        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.stamp.store(stamp(pos, REMOVED), Ordering::Release);
        Some(value)
    }

    /// Reclaim the contiguous prefix of loaded or removed slots. Returns the
    /// number of slots reclaimed by this call.
    pub fn trim(&self) -> usize {
        let mut reclaimed = 0;
        let mut t = self.trim.load(Ordering::Acquire);
        loop {
            let current = self.slot(t).stamp.load(Ordering::Acquire);
            if current != stamp(t, LOADED) && current != stamp(t, REMOVED) {
                return reclaimed;
            }
            match self
                .trim
                .compare_exchange(t, t + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.slot(t)
                        .stamp
                        .store(stamp(t + self.slots.len(), EMPTY), Ordering::Release);
                    reclaimed += 1;
                    t += 1;
                }
                Err(actual) => t = actual,
            }
        }
    }

    /// Save an element; alias of [`save`](Self::save)
    pub fn push(&self, value: T) -> Result<SlotId, T> {
        self.save(value)
    }

    /// Load the next element and reclaim whatever prefix is now trimmable
    pub fn pop(&self) -> Option<T> {
        let value = self.load();
        self.trim();
        value
    }

    fn reserve_save(&self) -> Option<usize> {
        let mut pos = self.save_reserve.load(Ordering::Relaxed);
        loop {
            let trimmed = self.trim.load(Ordering::Acquire);
            if pos.saturating_sub(trimmed) >= self.slots.len() {
                let fresh = self.save_reserve.load(Ordering::Relaxed);
                if fresh == pos {
                    return None;
                }
                pos = fresh;
                continue;
            }
            match self.save_reserve.compare_exchange_weak(
                pos,
                pos + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(pos),
                Err(current) => pos = current,
            }
        }
    }

    fn fill(&self, pos: usize, value: T) -> SlotId {
        let slot = self.slot(pos);
        let mut wait = self.policy.waiter();
        // The trimmer that freed this slot may not have re-stamped it yet.
        while slot.stamp.load(Ordering::Acquire) != stamp(pos, EMPTY) {
            wait.snooze();
        }
        // SAFETY: the slot is EMPTY for this lap and `pos` is reserved by us.
        unsafe { (*slot.value.get()).write(value) };
        slot.stamp.store(stamp(pos, FILLED), Ordering::Release);

        let mut wait = self.policy.waiter();
        while self
            .save_commit
            .compare_exchange_weak(pos, pos + 1, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            wait.snooze();
        }
        SlotId(pos)
    }

    fn reserve_load(&self) -> Option<usize> {
        let mut pos = self.load_reserve.load(Ordering::Relaxed);
        loop {
            if pos >= self.save_commit.load(Ordering::Acquire) {
                return None;
            }
            match self.load_reserve.compare_exchange_weak(
                pos,
                pos + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(pos),
                Err(current) => pos = current,
            }
        }
    }
}

impl<T> Drop for SlotRing<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.stamp.load(Ordering::Relaxed) & STATE_MASK == FILLED {
                // SAFETY: exclusive access; FILLED slots hold an initialised
                // value nobody has taken.
                unsafe { slot.value.get_mut().assume_init_drop() };
            }
        }
    }
}

impl<T> fmt::Debug for SlotRing<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRing")
            .field("capacity", &self.capacity())
            .field("occupied", &self.occupied())
            .field("pending", &self.pending())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> SlotRing<u32> {
        SlotRing::with_policy(capacity, SpinPolicy::non_blocking())
    }

    #[test]
    fn test_load_in_order() {
        let ring = ring(4);
        for i in 0..3 {
            ring.try_save(i).unwrap();
        }
        assert_eq!(ring.pending(), 3);
        assert_eq!(ring.load(), Some(0));
        assert_eq!(ring.load(), Some(1));
        assert_eq!(ring.load(), Some(2));
        assert_eq!(ring.load(), None);
        assert_eq!(ring.occupied(), 3);
        assert_eq!(ring.trim(), 3);
        assert_eq!(ring.occupied(), 0);
    }

    #[test]
    fn test_removed_element_is_never_loaded() {
        let ring = ring(4);
        let a = ring.try_save(10).unwrap();
        let b = ring.try_save(20).unwrap();
        ring.try_save(30).unwrap();

        assert_eq!(ring.remove(b), Some(20));
        assert_eq!(ring.remove(b), None);

        assert_eq!(ring.load(), Some(10));
        assert_eq!(ring.load(), Some(30));
        assert_eq!(ring.load(), None);
        assert_eq!(ring.remove(a), None);
    }

    #[test]
    fn test_trim_stops_at_pending_slot() {
        let ring = ring(4);
        ring.try_save(1).unwrap();
        ring.try_save(2).unwrap();
        let third = ring.try_save(3).unwrap();

        // Slot 2 removed out of order, slot 0 and 1 still pending.
        ring.remove(third).unwrap();
        assert_eq!(ring.trim(), 0);

        assert_eq!(ring.load(), Some(1));
        assert_eq!(ring.trim(), 1);
        assert_eq!(ring.load(), Some(2));
        assert_eq!(ring.trim(), 2);
        assert_eq!(ring.occupied(), 0);
    }

    #[test]
    fn test_full_until_trimmed() {
        let ring = ring(2);
        ring.try_save(1).unwrap();
        ring.try_save(2).unwrap();
        assert_eq!(ring.try_save(3), Err(3));

        assert_eq!(ring.load(), Some(1));
        // Loaded but not yet trimmed: still full.
        assert_eq!(ring.try_save(3), Err(3));
        ring.trim();
        let id = ring.try_save(3).unwrap();
        assert_eq!(id.position(), 2);
    }

    #[test]
    fn test_push_pop_wraps_many_laps() {
        let ring = ring(3);
        for i in 0..50 {
            ring.push(i).unwrap();
            assert_eq!(ring.pop(), Some(i));
        }
        assert_eq!(ring.occupied(), 0);
    }

    #[test]
    fn test_stale_slot_id_from_previous_lap() {
        let ring = ring(1);
        let old = ring.try_save(5).unwrap();
        assert_eq!(ring.pop(), Some(5));
        ring.try_save(6).unwrap();
        assert_eq!(ring.remove(old), None);
        assert_eq!(ring.load(), Some(6));
    }
}
