//! Loom model checks for the ring and slotted ring cursor protocols.
//!
//! Run with `RUSTFLAGS="--cfg loom" cargo test -p csd-queue --test queue_loom --release`.

#![cfg(loom)]

use loom::sync::Arc;
use loom::thread;

use csd_queue::{RingQueue, SlotRing, SpinPolicy};

#[test]
fn test_ring_two_producers_one_consumer() {
    loom::model(|| {
        let ring = Arc::new(RingQueue::with_policy(3, SpinPolicy::yielding(1)));

        let handles: Vec<_> = (0..2u32)
            .map(|v| {
                let ring = ring.clone();
                thread::spawn(move || {
                    ring.push(v).unwrap();
                })
            })
            .collect();

        let mut got = Vec::new();
        while got.len() < 2 {
            match ring.try_pop() {
                Some(v) => got.push(v),
                None => thread::yield_now(),
            }
        }
        for handle in handles {
            handle.join().unwrap();
        }

        got.sort_unstable();
        assert_eq!(got, vec![0, 1]);
        assert!(ring.try_pop().is_none());
    });
}

#[test]
fn test_ring_full_is_reported_not_overwritten() {
    loom::model(|| {
        let ring = Arc::new(RingQueue::with_policy(2, SpinPolicy::non_blocking()));
        ring.try_push(1u32).unwrap();

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || ring.try_push(2).is_ok())
        };
        let first = ring.try_pop();
        let pushed = producer.join().unwrap();

        assert_eq!(first, Some(1));
        if pushed {
            assert_eq!(ring.try_pop(), Some(2));
        }
        assert!(ring.try_pop().is_none());
    });
}

#[test]
fn test_slot_ring_remove_races_load() {
    loom::model(|| {
        let ring = Arc::new(SlotRing::with_policy(2, SpinPolicy::non_blocking()));
        let id = ring.try_save(7u32).unwrap();

        let remover = {
            let ring = ring.clone();
            thread::spawn(move || ring.remove(id))
        };
        let loaded = ring.load();
        let removed = remover.join().unwrap();

        // Exactly one side observes the element.
        assert!(loaded.is_some() ^ removed.is_some());
        assert_eq!(loaded.or(removed), Some(7));
        assert_eq!(ring.trim(), 1);
    });
}
