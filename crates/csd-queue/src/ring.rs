//! Bounded MPMC ring queue.
//!
//! Four monotonically increasing cursors describe the ring:
//!
//! ```text
//!   read_commit <= read_reserve <= write_commit <= write_reserve
//!        |             |               |               |
//!   slots free     slots being      slots ready     slots being
//!   for reuse      read             to be read      written
//! ```
//!
//! A producer reserves a position by advancing `write_reserve`, but only while
//! the ring is not full relative to `read_commit`. After writing the element it
//! advances `write_commit` from its own position with a CAS retry loop, so
//! `write_commit` only moves across fully written slots and consumers never
//! observe a half-written element. Consumers mirror the same two-step protocol
//! on the read side, which keeps a slot from being recycled while it is still
//! being moved out.
//!
//! One slot is always left empty: a ring created with capacity `n` holds at
//! most `n - 1` elements.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

use crate::policy::SpinPolicy;
use crate::sync::{AtomicUsize, Ordering};

/// Fixed-capacity multi-producer/multi-consumer queue.
pub struct RingQueue<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    capacity: usize,
    write_reserve: CachePadded<AtomicUsize>,
    write_commit: CachePadded<AtomicUsize>,
    read_reserve: CachePadded<AtomicUsize>,
    read_commit: CachePadded<AtomicUsize>,
    policy: SpinPolicy,
}

// SAFETY: a slot is written by exactly one producer (the one that reserved its
// position) and read by exactly one consumer (the one that reserved it on the
// read side); the cursors order those accesses.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Create a ring with `capacity` slots (`capacity - 1` usable) and the
    /// default spin policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2`.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_policy(capacity, SpinPolicy::default())
    }

    /// Create a ring with an explicit spin policy.
    ///
    /// # Panics
    ///
    /// Panics if `capacity < 2`.
    pub fn with_policy(capacity: usize, policy: SpinPolicy) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2");

        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            capacity,
            write_reserve: CachePadded::new(AtomicUsize::new(0)),
            write_commit: CachePadded::new(AtomicUsize::new(0)),
            read_reserve: CachePadded::new(AtomicUsize::new(0)),
            read_commit: CachePadded::new(AtomicUsize::new(0)),
            policy,
        }
    }

    /// Maximum number of elements the ring can hold
    pub fn capacity(&self) -> usize {
        self.capacity - 1
    }

    /// Number of fully published elements not yet consumed (approximate under
    /// contention)
    pub fn len(&self) -> usize {
        let committed = self.write_commit.load(Ordering::Acquire);
        let consumed = self.read_reserve.load(Ordering::Acquire);
        committed.saturating_sub(consumed)
    }

    /// Whether the ring currently holds no published element
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spin policy used by [`push`](Self::push) and [`pop`](Self::pop)
    pub fn policy(&self) -> SpinPolicy {
        self.policy
    }

    /// Push without waiting. Returns the value back if the ring is full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        match self.reserve_write() {
            Some(pos) => {
                self.publish(pos, value);
                Ok(())
            }
            None => Err(value),
        }
    }

    /// Push, waiting according to the ring's spin policy while it is full.
    /// Returns the value back if the policy gives up.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut wait = self.policy.waiter();
        loop {
            if let Some(pos) = self.reserve_write() {
                self.publish(pos, value);
                return Ok(());
            }
            if !wait.wait() {
                return Err(value);
            }
        }
    }

    /// Pop without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let pos = self.reserve_read()?;
        Some(self.consume(pos))
    }

    /// Pop, waiting according to the ring's spin policy while it is empty.
    pub fn pop(&self) -> Option<T> {
        let mut wait = self.policy.waiter();
        loop {
            if let Some(pos) = self.reserve_read() {
                return Some(self.consume(pos));
            }
            if !wait.wait() {
                return None;
            }
        }
    }

    fn reserve_write(&self) -> Option<usize> {
        let mut tail = self.write_reserve.load(Ordering::Relaxed);
        loop {
            let head = self.read_commit.load(Ordering::Acquire);
            if tail.saturating_sub(head) >= self.capacity - 1 {
                // Re-check with a fresh tail before reporting full; a stale
                // tail can only under-report occupancy.
                let fresh = self.write_reserve.load(Ordering::Relaxed);
                if fresh == tail {
                    return None;
                }
                tail = fresh;
                continue;
            }
            match self.write_reserve.compare_exchange_weak(
                tail,
                tail + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(tail),
                Err(current) => tail = current,
            }
        }
    }

    fn reserve_read(&self) -> Option<usize> {
        let mut head = self.read_reserve.load(Ordering::Relaxed);
        loop {
            let committed = self.write_commit.load(Ordering::Acquire);
            if head >= committed {
                return None;
            }
            match self.read_reserve.compare_exchange_weak(
                head,
                head + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(head),
                Err(current) => head = current,
            }
        }
    }

    fn publish(&self, pos: usize, value: T) {
        let slot = &self.slots[pos % self.capacity];
        // SAFETY: `pos` was reserved by this thread and the ring is not full,
        // so the consumer of the previous lap has committed its read.
        unsafe { (*slot.get()).write(value) };
        advance_in_order(&self.write_commit, pos, self.policy);
    }

    fn consume(&self, pos: usize) -> T {
        let slot = &self.slots[pos % self.capacity];
        // SAFETY: `pos < write_commit`, so the producer finished writing it,
        // and this thread holds the only read reservation for it.
        let value = unsafe { (*slot.get()).assume_init_read() };
        advance_in_order(&self.read_commit, pos, self.policy);
        value
    }
}

/// Move `cursor` from `pos` to `pos + 1`, waiting for every earlier position
/// to be committed first.
fn advance_in_order(cursor: &AtomicUsize, pos: usize, policy: SpinPolicy) {
    let mut wait = policy.waiter();
    while cursor
        .compare_exchange_weak(pos, pos + 1, Ordering::Release, Ordering::Relaxed)
        .is_err()
    {
        wait.snooze();
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        let head = self.read_commit.load(Ordering::Relaxed);
        let tail = self.write_commit.load(Ordering::Relaxed);
        for pos in head..tail {
            let slot = &mut self.slots[pos % self.capacity];
            // SAFETY: exclusive access; positions in [read_commit, write_commit)
            // hold initialized elements.
            unsafe { slot.get_mut().assume_init_drop() };
        }
    }
}

impl<T> fmt::Debug for RingQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingQueue")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::policy::WaitStrategy;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    #[test]
    fn test_fifo_single_thread() {
        let ring = RingQueue::with_capacity(8);
        for i in 0..5 {
            ring.try_push(i).unwrap();
        }
        assert_eq!(ring.len(), 5);
        for i in 0..5 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_capacity_leaves_one_slot_empty() {
        let ring = RingQueue::with_policy(4, SpinPolicy::non_blocking());
        assert_eq!(ring.capacity(), 3);
        ring.try_push(1).unwrap();
        ring.try_push(2).unwrap();
        ring.try_push(3).unwrap();
        assert_eq!(ring.try_push(4), Err(4));
        assert_eq!(ring.push(4), Err(4));

        assert_eq!(ring.try_pop(), Some(1));
        ring.try_push(4).unwrap();
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_wraparound() {
        let ring = RingQueue::with_capacity(3);
        for lap in 0..100 {
            ring.try_push(lap * 2).unwrap();
            ring.try_push(lap * 2 + 1).unwrap();
            assert_eq!(ring.try_pop(), Some(lap * 2));
            assert_eq!(ring.try_pop(), Some(lap * 2 + 1));
        }
    }

    #[test]
    fn test_pop_empty_non_blocking() {
        let ring: RingQueue<u8> = RingQueue::with_policy(4, SpinPolicy::non_blocking());
        assert_eq!(ring.pop(), None);
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn test_drop_releases_remaining_elements() {
        let counter = Arc::new(StdAtomicUsize::new(0));

        struct Tracked(Arc<StdAtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }

        {
            let ring = RingQueue::with_capacity(8);
            for _ in 0..4 {
                assert!(ring.try_push(Tracked(counter.clone())).is_ok());
            }
            drop(ring.try_pop());
        }
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 4);
    }

    #[test]
    fn test_blocking_push_waits_for_consumer() {
        let ring = Arc::new(RingQueue::with_policy(
            2,
            SpinPolicy::new(16, WaitStrategy::Yield),
        ));
        ring.try_push(0u64).unwrap();

        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < 2 {
                    if let Some(v) = ring.try_pop() {
                        seen.push(v);
                    }
                    std::thread::yield_now();
                }
                seen
            })
        };

        ring.push(1).unwrap();
        assert_eq!(consumer.join().unwrap(), vec![0, 1]);
    }
}
