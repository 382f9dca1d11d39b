//! FIFO queue integration tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use tmdb::prelude::*;

fn strategies() -> [PopStrategy; 2] {
    [PopStrategy::MarkInPlace, PopStrategy::Detach]
}

fn open(strategy: PopStrategy) -> Database {
    Database::builder()
        .queue(QueueConfig::default().pop_strategy(strategy))
        .open()
        .unwrap()
}

// ============================================================================
// Ordering and visibility
// ============================================================================

mod ordering {
    use super::*;

    #[test]
    fn test_committed_pushes_pop_in_order() {
        for strategy in strategies() {
            let db = open(strategy);
            let slot = db.register_worker().unwrap();
            let q = db.queue::<&'static str>();

            db.transaction(slot, |txn| {
                q.push(txn, "a")?;
                q.push(txn, "b")
            })
            .unwrap();
            db.transaction(slot, |txn| q.push(txn, "c")).unwrap();

            let popped: Vec<_> = (0..3)
                .map(|_| db.transaction(slot, |txn| q.pop(txn)).unwrap())
                .collect();
            assert_eq!(popped, vec![Some("a"), Some("b"), Some("c")], "{:?}", strategy);
            assert_eq!(db.transaction(slot, |txn| q.pop(txn)).unwrap(), None);
        }
    }

    #[test]
    fn test_pushes_of_one_transaction_stay_together() {
        let db = Database::open().unwrap();
        let slot = db.register_worker().unwrap();
        let q = db.queue::<u32>();

        db.transaction(slot, |txn| {
            for v in 0..10 {
                q.push(txn, v)?;
            }
            Ok(())
        })
        .unwrap();
        let drained = db
            .transaction(slot, |txn| {
                let mut out = Vec::new();
                while let Some(v) = q.pop(txn)? {
                    out.push(v);
                }
                Ok(out)
            })
            .unwrap();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(q.empty(slot));
    }

    #[test]
    fn test_read_my_writes_pop() {
        let db = Database::open().unwrap();
        let slot = db.register_worker().unwrap();
        let q = db.queue::<u32>();
        db.transaction(slot, |txn| q.push(txn, 1)).unwrap();

        // Shared values come first, then this transaction's own pushes
        let got = db
            .transaction(slot, |txn| {
                q.push(txn, 2)?;
                let first = q.pop(txn)?;
                let second = q.pop(txn)?;
                let third = q.pop(txn)?;
                Ok((first, second, third))
            })
            .unwrap();
        assert_eq!(got, (Some(1), Some(2), None));
        assert_eq!(q.size(), 0);
    }
}

// ============================================================================
// Undo
// ============================================================================

mod undo {
    use super::*;

    #[test]
    fn test_aborted_pop_restores_content_and_order() {
        for strategy in strategies() {
            let db = open(strategy);
            let slot = db.register_worker().unwrap();
            let q = db.queue::<u32>();
            db.transaction(slot, |txn| {
                for v in [10, 20, 30] {
                    q.push(txn, v)?;
                }
                Ok(())
            })
            .unwrap();

            let mut txn = db.begin(slot);
            assert_eq!(q.pop(&mut txn).unwrap(), Some(10));
            q.push(&mut txn, 40).unwrap();
            db.abort(&mut txn).unwrap();
            assert_eq!(q.size(), 3);

            let drained: Vec<_> = std::iter::from_fn(|| db.transaction(slot, |txn| q.pop(txn)).unwrap())
                .collect();
            assert_eq!(drained, vec![10, 20, 30], "{:?}", strategy);
        }
    }

    #[test]
    fn test_overlapping_aborts_restore_push_order() {
        for strategy in strategies() {
            let db = open(strategy);
            let first_slot = db.register_worker().unwrap();
            let second_slot = db.register_worker().unwrap();
            let producer = db.register_worker().unwrap();
            let q = db.queue::<u32>();
            db.transaction(producer, |txn| {
                for v in [1, 2, 3] {
                    q.push(txn, v)?;
                }
                Ok(())
            })
            .unwrap();

            let mut first = db.begin(first_slot);
            let mut second = db.begin(second_slot);
            assert_eq!(q.pop(&mut first).unwrap(), Some(1));
            assert_eq!(q.pop(&mut second).unwrap(), Some(2));
            assert_eq!(q.pop(&mut second).unwrap(), Some(3));

            // Later pops abort first
            db.abort(&mut second).unwrap();
            db.transaction(producer, |txn| q.push(txn, 4)).unwrap();
            db.abort(&mut first).unwrap();
            assert_eq!(q.size(), 4);

            let drained: Vec<_> =
                std::iter::from_fn(|| db.transaction(first_slot, |txn| q.pop(txn)).unwrap())
                    .collect();
            assert_eq!(drained, vec![1, 2, 3, 4], "{:?}", strategy);
        }
    }

    #[test]
    fn test_empty_observation_conflicts_with_concurrent_push() {
        let db = Database::open().unwrap();
        let reader = db.register_worker().unwrap();
        let writer = db.register_worker().unwrap();
        let q = db.queue::<u32>();

        let mut txn = db.begin(reader);
        assert_eq!(q.pop(&mut txn).unwrap(), None);
        db.transaction(writer, |t| q.push(t, 5)).unwrap();

        let err = db.commit(&mut txn).unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(db.transaction(reader, |t| q.pop(t)).unwrap(), Some(5));
    }
}

// ============================================================================
// Concurrency
// ============================================================================

mod concurrent {
    use super::*;

    const PRODUCERS: u32 = 2;
    const CONSUMERS: usize = 2;
    const PER_PRODUCER: u32 = 300;

    #[test]
    fn test_producers_and_consumers() {
        for strategy in strategies() {
            let db = Arc::new(open(strategy));
            let q = db.queue::<(u32, u32)>();
            let total = (PRODUCERS * PER_PRODUCER) as usize;
            let consumed = Arc::new(AtomicUsize::new(0));
            let barrier = Arc::new(Barrier::new(PRODUCERS as usize + CONSUMERS));

            let producers: Vec<_> = (0..PRODUCERS)
                .map(|p| {
                    let db = Arc::clone(&db);
                    let q = Arc::clone(&q);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        let slot = db.register_worker().unwrap();
                        barrier.wait();
                        for batch in (0..PER_PRODUCER).collect::<Vec<_>>().chunks(5) {
                            db.transaction(slot, |txn| {
                                for i in batch {
                                    q.push(txn, (p, *i))?;
                                }
                                Ok(())
                            })
                            .unwrap();
                        }
                    })
                })
                .collect();

            let consumers: Vec<_> = (0..CONSUMERS)
                .map(|_| {
                    let db = Arc::clone(&db);
                    let q = Arc::clone(&q);
                    let barrier = Arc::clone(&barrier);
                    let consumed = Arc::clone(&consumed);
                    thread::spawn(move || {
                        let slot = db.register_worker().unwrap();
                        barrier.wait();
                        let mut got = Vec::new();
                        while consumed.load(Ordering::Acquire) < total {
                            match db.transaction(slot, |txn| q.pop(txn)).unwrap() {
                                Some(v) => {
                                    got.push(v);
                                    consumed.fetch_add(1, Ordering::AcqRel);
                                }
                                None => thread::yield_now(),
                            }
                        }
                        got
                    })
                })
                .collect();

            for h in producers {
                h.join().unwrap();
            }
            let per_consumer: Vec<Vec<(u32, u32)>> =
                consumers.into_iter().map(|h| h.join().unwrap()).collect();

            // Each consumer sees each producer's values in push order
            for got in &per_consumer {
                let mut last: HashMap<u32, u32> = HashMap::new();
                for (p, i) in got {
                    if let Some(prev) = last.insert(*p, *i) {
                        assert!(prev < *i, "{:?}: producer {} out of order", strategy, p);
                    }
                }
            }

            let mut all: Vec<(u32, u32)> = per_consumer.into_iter().flatten().collect();
            all.sort_unstable();
            let expected: Vec<(u32, u32)> = (0..PRODUCERS)
                .flat_map(|p| (0..PER_PRODUCER).map(move |i| (p, i)))
                .collect();
            assert_eq!(all, expected, "{:?}", strategy);
            assert_eq!(q.size(), 0);
        }
    }

    #[test]
    fn test_combiner_batches_under_contention() {
        const THREADS: usize = 8;
        let db = Arc::new(Database::open().unwrap());
        let q = db.queue::<usize>();
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let db = Arc::clone(&db);
                let q = Arc::clone(&q);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let slot = db.register_worker().unwrap();
                    barrier.wait();
                    for i in 0..200 {
                        db.transaction(slot, |txn| q.push(txn, t * 1_000 + i)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(q.size(), THREADS * 200);
        let stats = q.stats();
        assert_eq!(stats.operations, (THREADS * 200) as u64);
        assert!(stats.combines <= stats.operations);
    }
}
