//! Unbounded lock-free linked queue.
//!
//! Michael-Scott queue with a sentinel node. `head` always points at the
//! sentinel, whose successor holds the next value to pop. Unlinked sentinels
//! are retired through `crossbeam-epoch`, so a consumer that loaded a stale
//! `head` can still dereference it safely.

use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;

struct Node<T> {
    /// Uninitialised for the sentinel, initialised for every node pushed
    /// after it until the value is moved out by `pop`.
    value: MaybeUninit<T>,
    next: Atomic<Node<T>>,
}

/// Unbounded multi-producer/multi-consumer FIFO.
pub struct LinkedQueue<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
}

// SAFETY: values move between threads only through the atomic links.
unsafe impl<T: Send> Send for LinkedQueue<T> {}
unsafe impl<T: Send> Sync for LinkedQueue<T> {}

impl<T> LinkedQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        let queue = Self {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
        };
        let sentinel = Owned::new(Node {
            value: MaybeUninit::uninit(),
            next: Atomic::null(),
        });
        // SAFETY: the queue is not shared yet.
        unsafe {
            let guard = epoch::unprotected();
            let sentinel = sentinel.into_shared(guard);
            queue.head.store(sentinel, Ordering::Relaxed);
            queue.tail.store(sentinel, Ordering::Relaxed);
        }
        queue
    }

    /// Append a value. Never fails and never blocks.
    pub fn push(&self, value: T) {
        let guard = &epoch::pin();
        let mut node = Owned::new(Node {
            value: MaybeUninit::new(value),
            next: Atomic::null(),
        });

        loop {
            let tail = self.tail.load(Ordering::Acquire, guard);
            // SAFETY: nodes reachable from `tail` are only retired after being
            // unlinked from `head`, which cannot happen while we are pinned.
            let tail_ref = unsafe { tail.deref() };
            let next = tail_ref.next.load(Ordering::Acquire, guard);

            if !next.is_null() {
                // Tail is lagging; help the other producer finish.
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::Release,
                    Ordering::Relaxed,
                    guard,
                );
                continue;
            }

            match tail_ref.next.compare_exchange(
                Shared::null(),
                node,
                Ordering::Release,
                Ordering::Relaxed,
                guard,
            ) {
                Ok(new) => {
                    let _ = self.tail.compare_exchange(
                        tail,
                        new,
                        Ordering::Release,
                        Ordering::Relaxed,
                        guard,
                    );
                    return;
                }
                Err(err) => node = err.new,
            }
        }
    }

    /// Remove the oldest value, if any.
    pub fn pop(&self) -> Option<T> {
        let guard = &epoch::pin();
        self.pop_pinned(guard)
    }

    fn pop_pinned(&self, guard: &Guard) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire, guard);
            // SAFETY: `head` is never null and is protected by the guard.
            let next = unsafe { head.deref() }.next.load(Ordering::Acquire, guard);
            // SAFETY: a non-null successor is protected by the guard.
            let next_ref = unsafe { next.as_ref() }?;

            if self
                .head
                .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed, guard)
                .is_ok()
            {
                let tail = self.tail.load(Ordering::Relaxed, guard);
                if tail == head {
                    let _ = self.tail.compare_exchange(
                        tail,
                        next,
                        Ordering::Release,
                        Ordering::Relaxed,
                        guard,
                    );
                }
                // SAFETY: winning the head CAS gives this thread sole
                // ownership of the value in `next`, which becomes the new
                // sentinel; the old sentinel is unreachable for new readers.
                unsafe {
                    guard.defer_destroy(head);
                    return Some(next_ref.value.assume_init_read());
                }
            }
        }
    }

    /// Whether the queue holds no value (a snapshot under contention)
    pub fn is_empty(&self) -> bool {
        let guard = &epoch::pin();
        let head = self.head.load(Ordering::Acquire, guard);
        // SAFETY: `head` is never null and is protected by the guard.
        unsafe { head.deref() }
            .next
            .load(Ordering::Acquire, guard)
            .is_null()
    }
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` guarantees no other thread touches the queue.
        unsafe {
            let guard = epoch::unprotected();
            while self.pop_pinned(guard).is_some() {}
            let sentinel = self.head.load(Ordering::Relaxed, guard);
            drop(sentinel.into_owned());
        }
    }
}

impl<T> fmt::Debug for LinkedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkedQueue")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fifo_order() {
        let queue = LinkedQueue::new();
        assert!(queue.is_empty());
        for i in 0..10 {
            queue.push(i);
        }
        assert!(!queue.is_empty());
        for i in 0..10 {
            assert_eq!(queue.pop(), Some(i));
        }
        assert_eq!(queue.pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_interleaved_push_pop() {
        let queue = LinkedQueue::new();
        queue.push("a");
        queue.push("b");
        assert_eq!(queue.pop(), Some("a"));
        queue.push("c");
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_drop_releases_remaining_values() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        {
            let queue = LinkedQueue::new();
            for _ in 0..3 {
                queue.push(Tracked(drops.clone()));
            }
            drop(queue.pop());
            assert_eq!(drops.load(Ordering::SeqCst), 1);
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_producers_preserve_per_producer_order() {
        let queue = Arc::new(LinkedQueue::new());
        let producers: Vec<_> = (0..4u64)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..1_000u64 {
                        queue.push((p, i));
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }

        let mut last = [None::<u64>; 4];
        let mut total = 0;
        while let Some((p, i)) = queue.pop() {
            if let Some(prev) = last[p as usize] {
                assert!(i > prev, "producer {p} reordered: {prev} then {i}");
            }
            last[p as usize] = Some(i);
            total += 1;
        }
        assert_eq!(total, 4_000);
    }
}
