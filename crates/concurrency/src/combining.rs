//! Flat combining
//!
//! Threads publish operations on a sequential container to per-slot records;
//! whichever thread wins the container lock becomes the *combiner* and
//! applies every pending operation in a few passes, then hands the replies
//! back. Contention on the container turns into batching.
//!
//! ## Protocol
//!
//! 1. The owner writes its op into its record and marks it `PENDING`.
//! 2. It tries to lock the container.
//!    - **Won**: apply up to `combine_passes` passes over all records.
//!    - **Lost**: spin on its own record, yielding every `spin_before_yield`
//!      rounds, and retry the lock in case the combiner left.
//! 3. Once its record is `DONE` it takes the reply and marks it `IDLE`.
//!
//! ## Record ownership
//!
//! A record's op/reply cells belong to its owner while `IDLE` or `DONE` and
//! to the container lock holder while `PENDING`. The state word's
//! release/acquire pairs carry the handoff.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use tmdb_core::{Error, Result, ThreadSlot, MAX_THREADS};
use tracing::trace;

const IDLE: u8 = 0;
const PENDING: u8 = 1;
const DONE: u8 = 2;

/// A sequential container driven by a combiner.
pub trait Combine: Send {
    /// Operation submitted by a thread
    type Op: Send;
    /// Result handed back to the submitter
    type Reply: Send;

    /// Apply one operation. Only ever called by the current combiner.
    fn apply(&mut self, op: Self::Op) -> Self::Reply;
}

/// Combiner settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Passes over the records per combining round
    pub combine_passes: u32,
    /// Passive spins before yielding the CPU
    pub spin_before_yield: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            combine_passes: 3,
            spin_before_yield: 1024,
        }
    }
}

impl KernelConfig {
    /// Set passes per combining round.
    pub fn combine_passes(mut self, passes: u32) -> Self {
        self.combine_passes = passes;
        self
    }

    /// Set passive spins before yielding.
    pub fn spin_before_yield(mut self, spins: u32) -> Self {
        self.spin_before_yield = spins;
        self
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        if self.combine_passes == 0 {
            return Err(Error::InvalidConfig(
                "combine_passes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of kernel counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KernelStats {
    /// Operations applied
    pub operations: u64,
    /// Combining rounds run
    pub combines: u64,
    /// Waits that ended with another thread's combiner serving the op
    pub passive_waits: u64,
}

/// Per-slot publication record.
#[repr(align(64))]
struct Record<Op, Reply> {
    owned: AtomicBool,
    state: AtomicU8,
    op: UnsafeCell<Option<Op>>,
    reply: UnsafeCell<Option<Reply>>,
}

// SAFETY: the cells are only touched by the owner (IDLE/DONE, guarded by
// `owned`) or the container lock holder (PENDING).
unsafe impl<Op: Send, Reply: Send> Sync for Record<Op, Reply> {}

impl<Op, Reply> Record<Op, Reply> {
    fn new() -> Self {
        Self {
            owned: AtomicBool::new(false),
            state: AtomicU8::new(IDLE),
            op: UnsafeCell::new(None),
            reply: UnsafeCell::new(None),
        }
    }
}

/// Flat-combining wrapper around a sequential container.
pub struct Kernel<C: Combine> {
    container: Mutex<C>,
    records: Box<[Record<C::Op, C::Reply>]>,
    config: KernelConfig,
    operations: AtomicU64,
    combines: AtomicU64,
    passive_waits: AtomicU64,
}

impl<C: Combine> Kernel<C> {
    /// Wrap `container`.
    pub fn new(container: C, config: KernelConfig) -> Self {
        Self {
            container: Mutex::new(container),
            records: (0..MAX_THREADS).map(|_| Record::new()).collect(),
            config,
            operations: AtomicU64::new(0),
            combines: AtomicU64::new(0),
            passive_waits: AtomicU64::new(0),
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Take `slot`'s publication record, waiting if it is in use.
    pub fn acquire_record(&self, slot: ThreadSlot) -> RecordHandle<'_, C> {
        let record = &self.records[slot.index()];
        while record
            .owned
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::thread::yield_now();
        }
        RecordHandle {
            kernel: self,
            record,
        }
    }

    /// Submit `op` through `slot`'s record and wait for the reply.
    pub fn execute(&self, slot: ThreadSlot, op: C::Op) -> C::Reply {
        self.acquire_record(slot).combine(op)
    }

    /// Run `f` on the container under the combiner lock.
    #[cfg(test)]
    pub(crate) fn inspect<R>(&self, f: impl FnOnce(&C) -> R) -> R {
        f(&self.container.lock())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> KernelStats {
        KernelStats {
            operations: self.operations.load(Ordering::Relaxed),
            combines: self.combines.load(Ordering::Relaxed),
            passive_waits: self.passive_waits.load(Ordering::Relaxed),
        }
    }

    /// One combining round; the caller holds the container lock.
    fn combine_locked(&self, container: &mut C) {
        let mut total = 0u64;
        for pass in 0..self.config.combine_passes {
            let mut applied = 0u64;
            for record in self.records.iter() {
                if record.state.load(Ordering::Acquire) != PENDING {
                    continue;
                }
                // SAFETY: a PENDING record's cells belong to the lock holder.
                let op = unsafe { (*record.op.get()).take() };
                if let Some(op) = op {
                    let reply = container.apply(op);
                    // SAFETY: as above; DONE is published after the write.
                    unsafe { *record.reply.get() = Some(reply) };
                    applied += 1;
                }
                record.state.store(DONE, Ordering::Release);
            }
            trace!(pass, applied, "combiner pass");
            total += applied;
            if applied == 0 {
                break;
            }
        }
        self.operations.fetch_add(total, Ordering::Relaxed);
        self.combines.fetch_add(1, Ordering::Relaxed);
    }
}

impl<C: Combine + std::fmt::Debug> std::fmt::Debug for Kernel<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Exclusive use of one publication record. Released on drop.
pub struct RecordHandle<'a, C: Combine> {
    kernel: &'a Kernel<C>,
    record: &'a Record<C::Op, C::Reply>,
}

impl<C: Combine> RecordHandle<'_, C> {
    /// Publish `op` and wait until some combiner (possibly this thread)
    /// applied it.
    pub fn combine(&self, op: C::Op) -> C::Reply {
        let record = self.record;
        // SAFETY: the record is IDLE and owned by this handle.
        unsafe { *record.op.get() = Some(op) };
        record.state.store(PENDING, Ordering::Release);

        let mut combined = false;
        let mut spins = 0u32;
        loop {
            if record.state.load(Ordering::Acquire) == DONE {
                // SAFETY: DONE returns the cells to the owner.
                let reply = unsafe { (*record.reply.get()).take() };
                record.state.store(IDLE, Ordering::Relaxed);
                if let Some(reply) = reply {
                    if !combined {
                        self.kernel.passive_waits.fetch_add(1, Ordering::Relaxed);
                    }
                    return reply;
                }
            }

            if let Some(mut container) = self.kernel.container.try_lock() {
                self.kernel.combine_locked(&mut container);
                combined = true;
                continue;
            }

            spins += 1;
            if spins < self.kernel.config.spin_before_yield {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
                spins = 0;
            }
        }
    }
}

impl<C: Combine> Drop for RecordHandle<'_, C> {
    fn drop(&mut self) {
        self.record.owned.store(false, Ordering::Release);
    }
}
