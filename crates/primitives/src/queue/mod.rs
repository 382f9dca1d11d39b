//! Transactional FIFO queue over a flat-combining kernel
//!
//! Pushes never touch shared state before commit: they are buffered on the
//! transaction and appended by `install`, in order. Pops go through the
//! combiner right away and claim the front value for the popping slot; the
//! claim is made permanent on commit and released on abort. Released values
//! return to their original push position.
//!
//! ## Items
//!
//! | Key          | Read                            | Write                       |
//! |--------------|---------------------------------|-----------------------------|
//! | `PUSH_KEY`   | queue version seen while empty  | pending pushes (`VecDeque`) |
//! | `POP_KEY`    | -                               | [`PopLog`]                  |
//!
//! A pop that finds the queue empty records the queue version, so a push
//! committed by someone else before this transaction commits invalidates it.

mod backing;

pub use backing::{Backing, Claimed, PopStrategy, QueueOp, QueueReply};

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tmdb_concurrency::{
    CommitContext, ItemKey, Kernel, KernelConfig, KernelStats, Key, Shared, TransItem, Transaction,
};
use tmdb_core::{Result, ThreadSlot, VersionWord};
use tracing::debug;

const PUSH_KEY: i32 = -1;
const POP_KEY: i32 = 0;

/// Queue settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How pops claim the front value
    pub pop_strategy: PopStrategy,
    /// Lock the queue version while committing pushes
    pub lock_queue_version: bool,
    /// Combiner settings
    pub kernel: KernelConfig,
}

impl QueueConfig {
    /// Set the pop strategy.
    pub fn pop_strategy(mut self, strategy: PopStrategy) -> Self {
        self.pop_strategy = strategy;
        self
    }

    /// Set whether committing pushes lock the queue version.
    pub fn lock_queue_version(mut self, lock: bool) -> Self {
        self.lock_queue_version = lock;
        self
    }

    /// Set combiner settings.
    pub fn kernel(mut self, kernel: KernelConfig) -> Self {
        self.kernel = kernel;
        self
    }
}

/// Write payload of the pop item.
#[derive(Debug)]
struct PopLog<T> {
    /// Values taken off the front with their push positions (`Detach` only)
    detached: Vec<Claimed<T>>,
}

impl<T> Default for PopLog<T> {
    fn default() -> Self {
        Self {
            detached: Vec::new(),
        }
    }
}

/// Transactional FIFO queue.
pub struct Queue<T: Clone + Send> {
    kernel: Kernel<Backing<T>>,
    version: VersionWord,
    live: Arc<AtomicUsize>,
    config: QueueConfig,
}

impl<T> Queue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        let live = Arc::new(AtomicUsize::new(0));
        let backing = Backing::new(config.pop_strategy, Arc::clone(&live));
        Self {
            kernel: Kernel::new(backing, config.kernel.clone()),
            version: VersionWord::new(0),
            live,
            config,
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Combiner counters.
    pub fn stats(&self) -> KernelStats {
        self.kernel.stats()
    }

    fn shared(self: &Arc<Self>) -> Arc<dyn Shared> {
        let owner: Arc<dyn Shared> = self.clone();
        owner
    }

    /// Append `value` at commit.
    pub fn push(self: &Arc<Self>, txn: &mut Transaction, value: T) -> Result<()> {
        txn.check_not_aborted()?;
        let owner = self.shared();
        let mut item = txn.item(&owner, Key::Sentinel(PUSH_KEY));
        match item.write_value_mut::<VecDeque<T>>() {
            Some(pending) => pending.push_back(value),
            None => {
                item.add_write(VecDeque::from(vec![value]));
            }
        }
        Ok(())
    }

    /// Take the front value. `Ok(None)` if neither the queue nor this
    /// transaction's own pending pushes have one.
    pub fn pop(self: &Arc<Self>, txn: &mut Transaction) -> Result<Option<T>> {
        txn.check_not_aborted()?;
        let owner = self.shared();
        let slot = txn.slot();
        // Observed before the claim, so a push landing in between is caught
        let observed = self.version.load();

        if let QueueReply::Popped(Some(claimed)) =
            self.kernel.execute(slot, QueueOp::MarkDeleted { slot })
        {
            let value = claimed.value.clone();
            let mut item = txn.item(&owner, Key::Sentinel(POP_KEY));
            if !item.has_write() {
                item.add_write(PopLog::<T>::default());
            }
            if self.config.pop_strategy == PopStrategy::Detach {
                if let Some(log) = item.write_value_mut::<PopLog<T>>() {
                    log.detached.push(claimed);
                }
            }
            return Ok(Some(value));
        }

        let mut item = txn.item(&owner, Key::Sentinel(PUSH_KEY));
        item.add_read(observed);
        Ok(item
            .write_value_mut::<VecDeque<T>>()
            .and_then(|pending| pending.pop_front()))
    }

    /// Check if the container holds no records, claimed ones included.
    /// Not transactional.
    pub fn empty(&self, slot: ThreadSlot) -> bool {
        match self.kernel.execute(slot, QueueOp::Empty) {
            QueueReply::Empty(empty) => empty,
            _ => false,
        }
    }

    /// Drop every record. Not transactional.
    pub fn clear(&self, slot: ThreadSlot) {
        self.kernel.execute(slot, QueueOp::Clear);
        debug!(%slot, "queue cleared");
    }

    /// Unclaimed values. An unsynchronized snapshot.
    pub fn size(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

impl<T> Shared for Queue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn lock(&self, item: &mut TransItem, ctx: &CommitContext<'_>) -> bool {
        if item.key() == ItemKey::Sentinel(PUSH_KEY) && self.config.lock_queue_version {
            return ctx.try_lock(item, &self.version);
        }
        true
    }

    fn check(&self, item: &TransItem, ctx: &CommitContext<'_>) -> bool {
        let Some(observed) = item.read_version() else {
            return true;
        };
        let current = self.version.load();
        current.same_version(observed)
            && (!current.is_locked() || current.is_locked_by(ctx.slot()))
    }

    fn install(&self, item: &mut TransItem, ctx: &CommitContext<'_>) {
        let slot = ctx.slot();
        match item.key() {
            ItemKey::Sentinel(POP_KEY) => {
                if self.config.pop_strategy == PopStrategy::MarkInPlace {
                    self.kernel.execute(slot, QueueOp::InstallPops { slot });
                }
            }
            ItemKey::Sentinel(PUSH_KEY) => {
                if let Some(pending) = item.take_write::<VecDeque<T>>() {
                    let handle = self.kernel.acquire_record(slot);
                    for value in pending {
                        handle.combine(QueueOp::Push(value));
                    }
                }
                if !self.version.load().is_locked_by(slot) {
                    self.version.acquire(slot);
                    item.set_locked(true);
                }
                self.version.set_version(ctx.commit_tid());
            }
            _ => {}
        }
    }

    fn unlock(&self, item: &mut TransItem) {
        if item.key() == ItemKey::Sentinel(PUSH_KEY) {
            self.version.release();
        }
    }

    fn cleanup(&self, item: &mut TransItem, slot: ThreadSlot, committed: bool) {
        if item.key() != ItemKey::Sentinel(POP_KEY) {
            return;
        }
        match (self.config.pop_strategy, committed) {
            (PopStrategy::MarkInPlace, true) => {
                self.kernel.execute(slot, QueueOp::ClearPopped);
            }
            (PopStrategy::MarkInPlace, false) => {
                self.kernel.execute(slot, QueueOp::UndoMarkDeleted { slot });
            }
            (PopStrategy::Detach, false) => {
                let detached = item
                    .take_write::<PopLog<T>>()
                    .map(|log| log.detached)
                    .unwrap_or_default();
                if !detached.is_empty() {
                    debug!(%slot, count = detached.len(), "restoring detached values");
                    self.kernel.execute(slot, QueueOp::Restore(detached));
                }
            }
            (PopStrategy::Detach, true) => {}
        }
    }
}

impl<T: Clone + Send> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("size", &self.live.load(Ordering::Relaxed))
            .field("version", &self.version.load())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
