//! Queue primitive benchmarks.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use csd_queue::{LinkedQueue, RingQueue, SlotRing, SpinPolicy};

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("push_pop");

    for batch in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(batch as u64));

        group.bench_with_input(BenchmarkId::new("ring", batch), &batch, |b, &batch| {
            let ring = RingQueue::with_policy(1024, SpinPolicy::non_blocking());
            b.iter(|| {
                for i in 0..batch {
                    let _ = ring.try_push(black_box(i));
                }
                for _ in 0..batch {
                    black_box(ring.try_pop());
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("linked", batch), &batch, |b, &batch| {
            let queue = LinkedQueue::new();
            b.iter(|| {
                for i in 0..batch {
                    queue.push(black_box(i));
                }
                for _ in 0..batch {
                    black_box(queue.pop());
                }
            });
        });

        group.bench_with_input(BenchmarkId::new("slot_ring", batch), &batch, |b, &batch| {
            let ring = SlotRing::with_policy(1024, SpinPolicy::non_blocking());
            b.iter(|| {
                for i in 0..batch {
                    let _ = ring.try_save(black_box(i));
                }
                for _ in 0..batch {
                    black_box(ring.pop());
                }
            });
        });
    }

    group.finish();
}

fn bench_contended_ring(c: &mut Criterion) {
    use std::sync::Arc;
    use std::thread;

    c.bench_function("ring_spsc_10k", |b| {
        b.iter(|| {
            let ring = Arc::new(RingQueue::with_policy(256, SpinPolicy::yielding(64)));
            let producer = {
                let ring = ring.clone();
                thread::spawn(move || {
                    for i in 0..10_000u32 {
                        let _ = ring.push(i);
                    }
                })
            };
            let mut received = 0;
            while received < 10_000 {
                if ring.try_pop().is_some() {
                    received += 1;
                }
            }
            let _ = producer.join();
        });
    });
}

criterion_group!(benches, bench_single_thread, bench_contended_ring);
criterion_main!(benches);
