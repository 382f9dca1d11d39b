//! Structure Benchmarks
//!
//! | Benchmark | What it measures |
//! |-----------|------------------|
//! | priority_queue/push_pop | Single-thread transaction round trip on the heap |
//! | priority_queue/batch_push | Commit cost as the write set grows |
//! | queue/push_pop | Single-thread round trip through the combiner |
//! | queue/contended_push | Combining under N producer threads |
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench structures
//! cargo bench --bench structures -- "queue"  # specific group
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Instant;
use tmdb::prelude::*;

// =============================================================================
// Priority queue
// =============================================================================

fn priority_queue_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("priority_queue");
    group.throughput(Throughput::Elements(1));

    {
        let db = Database::open().unwrap();
        let slot = db.register_worker().unwrap();
        let pq = db.priority_queue::<u64>();
        // Keep a resident population so pops restructure a real heap
        db.transaction(slot, |txn| {
            for v in 0..1_024u64 {
                pq.push(txn, v * 7 % 1_024)?;
            }
            Ok(())
        })
        .unwrap();

        let mut next = 0u64;
        group.bench_function("push_pop", |b| {
            b.iter(|| {
                next = (next + 7_919) % 1_024;
                db.transaction(slot, |txn| pq.push(txn, next)).unwrap();
                black_box(db.transaction(slot, |txn| pq.pop(txn)).unwrap())
            })
        });
    }

    for batch in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::new("batch_push", batch), &batch, |b, &batch| {
            let db = Database::open().unwrap();
            let slot = db.register_worker().unwrap();
            let pq = db.priority_queue::<u64>();
            b.iter(|| {
                db.transaction(slot, |txn| {
                    for v in 0..batch as u64 {
                        pq.push(txn, v)?;
                    }
                    Ok(())
                })
                .unwrap();
                db.transaction(slot, |txn| {
                    for _ in 0..batch {
                        black_box(pq.pop(txn)?);
                    }
                    Ok(())
                })
                .unwrap();
            })
        });
    }

    group.finish();
}

// =============================================================================
// Queue
// =============================================================================

fn queue_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    group.throughput(Throughput::Elements(1));

    for strategy in [PopStrategy::MarkInPlace, PopStrategy::Detach] {
        let db = Database::builder()
            .queue(QueueConfig::default().pop_strategy(strategy))
            .open()
            .unwrap();
        let slot = db.register_worker().unwrap();
        let q = db.queue::<u64>();
        let name = format!("{:?}", strategy).to_lowercase();

        group.bench_function(BenchmarkId::new("push_pop", name), |b| {
            b.iter(|| {
                db.transaction(slot, |txn| q.push(txn, 1)).unwrap();
                black_box(db.transaction(slot, |txn| q.pop(txn)).unwrap())
            })
        });
    }

    for threads in [2usize, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("contended_push", threads),
            &threads,
            |b, &threads| {
                b.iter_custom(|iters| {
                    let db = Arc::new(Database::open().unwrap());
                    let q = db.queue::<u64>();
                    let barrier = Arc::new(Barrier::new(threads + 1));
                    let per_thread = (iters as usize + threads - 1) / threads;

                    let handles: Vec<_> = (0..threads)
                        .map(|_| {
                            let db = Arc::clone(&db);
                            let q = Arc::clone(&q);
                            let barrier = Arc::clone(&barrier);
                            thread::spawn(move || {
                                let slot = db.register_worker().unwrap();
                                barrier.wait();
                                for i in 0..per_thread as u64 {
                                    db.transaction(slot, |txn| q.push(txn, i)).unwrap();
                                }
                            })
                        })
                        .collect();

                    barrier.wait();
                    let start = Instant::now();
                    for h in handles {
                        h.join().unwrap();
                    }
                    start.elapsed()
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, priority_queue_benchmarks, queue_benchmarks);
criterion_main!(benches);
