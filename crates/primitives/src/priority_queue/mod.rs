//! Transactional priority queue
//!
//! A max-heap whose values carry their own version words. Inserts are
//! physical and immediate but flagged *inserted* until commit; pops are
//! physical and immediate but undone on abort by re-inserting a copy.
//!
//! ## Design
//!
//! Value word bits:
//!
//! | Bit        | Set by                     | Cleared by                  |
//! |------------|----------------------------|-----------------------------|
//! | `INSERTED` | `push`                     | commit of the push          |
//! | `DELETED`  | abort of the push          | never (reaped by a pop)     |
//! | `DIRTY`    | `pop`, on the new head     | commit or abort of the pop  |
//!
//! Two queue-wide words:
//! - `pop_lock` serializes the pop/top critical section (at most one pop
//!   restructures the head at a time, inserts run concurrently).
//! - `pop_version` is written by every committing pop and read by every
//!   `top`, so a `top` conflicts with any pop that commits before it.
//!
//! Item flags tag what a transaction did to a value: `INSERT_TAG`,
//! `DELETE_TAG`, `DIRTY_TAG`.

mod heap;

pub use heap::{ConcurrentHeap, NodeStatus};

use crate::versioned::VersionedValue;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tmdb_concurrency::{
    object_id, CommitContext, ItemKey, Key, Shared, TransItem, Transaction,
};
use tmdb_core::version::{INCREMENT, USER_BIT0};
use tmdb_core::{AbortReason, Error, Result, ThreadSlot, VersionWord, WordGuard};
use tracing::{debug, warn};

/// Value is a pending insert.
pub(crate) const INSERTED_BIT: u64 = USER_BIT0;
/// Value's insert was aborted; reap on sight.
pub(crate) const DELETED_BIT: u64 = USER_BIT0 << 1;
/// Value is the tentative new head of an in-flight pop.
pub(crate) const DIRTY_BIT: u64 = USER_BIT0 << 2;

const INSERT_TAG: u32 = 1;
const DELETE_TAG: u32 = 1 << 1;
const DIRTY_TAG: u32 = 1 << 2;

/// Sentinel key of the pop sequence.
const POP_KEY: i32 = -2;

/// Priority queue settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityQueueConfig {
    /// Stamp the pop sequence with the commit tid instead of bumping it
    pub opacity: bool,
}

impl PriorityQueueConfig {
    /// Set the pop-sequence stamping mode.
    pub fn opacity(mut self, opacity: bool) -> Self {
        self.opacity = opacity;
        self
    }
}

/// Write payload of a delete-tagged item.
struct PopRecord<T> {
    /// Head marked dirty by the pop, if the heap was not left empty
    new_head: Option<Arc<VersionedValue<T>>>,
}

/// Transactional max-priority queue.
pub struct PriorityQueue<T> {
    heap: ConcurrentHeap<T>,
    pop_lock: VersionWord,
    pop_version: VersionWord,
    config: PriorityQueueConfig,
}

impl<T> PriorityQueue<T>
where
    T: Ord + Clone + Send + Sync + 'static,
{
    /// Create an empty queue.
    pub fn new(config: PriorityQueueConfig) -> Self {
        Self {
            heap: ConcurrentHeap::new(),
            pop_lock: VersionWord::new(0),
            pop_version: VersionWord::new(0),
            config,
        }
    }

    /// Settings in effect.
    pub fn config(&self) -> &PriorityQueueConfig {
        &self.config
    }

    /// Number of physically present values, including pending inserts and
    /// not yet reaped aborted ones. Not transactional.
    pub fn size(&self) -> usize {
        self.heap.len()
    }

    /// Check if no value is physically present. Not transactional.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    fn shared(self: &Arc<Self>) -> Arc<dyn Shared> {
        let owner: Arc<dyn Shared> = self.clone();
        owner
    }

    fn tracked_with(&self, txn: &Transaction, value: &Arc<VersionedValue<T>>, tag: u32) -> bool {
        txn.find(object_id(self), ItemKey::of(value))
            .map_or(false, |item| item.has_flags(tag))
    }

    /// Insert `value`.
    ///
    /// The value is visible to other transactions right away but flagged
    /// *inserted*, which makes them abort if it reaches the head before this
    /// transaction commits.
    pub fn push(self: &Arc<Self>, txn: &mut Transaction, value: T) -> Result<()> {
        txn.check_not_aborted()?;
        let versioned = self.track_insert(txn, value);
        let index = self.heap.append(versioned, txn.slot());
        self.settle_insert(txn, index)
    }

    /// Build the pending value and record it on `txn`. Tracked before it is
    /// reachable, so an abort mid-sift still retires it.
    fn track_insert(self: &Arc<Self>, txn: &mut Transaction, value: T) -> Arc<VersionedValue<T>> {
        let owner = self.shared();
        let versioned = Arc::new(VersionedValue::new(value, INCREMENT | INSERTED_BIT));
        txn.item(&owner, Key::value(&versioned))
            .add_write(())
            .add_flags(INSERT_TAG);
        versioned
    }

    /// Sift the value appended at `index` into place.
    fn settle_insert(&self, txn: &Transaction, index: usize) -> Result<()> {
        self.heap.sift_up(index, txn.slot(), |moved| {
            self.tracked_with(txn, moved, DIRTY_TAG)
        })
    }

    /// Current head, reaping aborted inserts on the way. The pop lock must be
    /// held.
    fn get_max(
        &self,
        txn: &Transaction,
        _pop: &WordGuard<'_>,
    ) -> Result<Option<Arc<VersionedValue<T>>>> {
        let slot = txn.slot();
        loop {
            let Some(head) = self.heap.peek_root(slot) else {
                return Ok(None);
            };
            let version = head.version();
            if version.has(INSERTED_BIT) {
                if self.tracked_with(txn, &head, INSERT_TAG) {
                    return Ok(Some(head));
                }
                debug!(%slot, "head is a foreign pending insert");
                return Err(Error::aborted(AbortReason::ForeignInsert));
            }
            if version.has(DELETED_BIT) {
                self.heap.remove_max(Some(&head), slot);
                continue;
            }
            return Ok(Some(head));
        }
    }

    /// Remove the maximum value. `Ok(None)` if the queue is empty.
    pub fn pop(self: &Arc<Self>, txn: &mut Transaction) -> Result<Option<T>> {
        txn.check_not_aborted()?;
        if self.heap.is_empty() {
            return Ok(None);
        }
        let owner = self.shared();
        let slot = txn.slot();
        let pop = self.pop_lock.lock(slot);

        let popped = loop {
            let Some(head) = self.get_max(txn, &pop)? else {
                return Ok(None);
            };
            if let Some(removed) = self.heap.remove_max(Some(&head), slot) {
                break removed;
            }
        };

        // Recorded before looking further, so an abort below restores it
        txn.item(&owner, Key::value(&popped))
            .add_read(popped.version())
            .add_write(PopRecord::<T> { new_head: None })
            .add_flags(DELETE_TAG);

        let new_head = self.get_max(txn, &pop)?;
        if let Some(head) = &new_head {
            head.word().set_bits(DIRTY_BIT);
            if let Some(record) = txn
                .item(&owner, Key::value(&popped))
                .write_value_mut::<PopRecord<T>>()
            {
                record.new_head = Some(Arc::clone(head));
            }
        }
        drop(pop);

        if let Some(head) = &new_head {
            txn.item(&owner, Key::value(head))
                .add_write(())
                .add_flags(DIRTY_TAG);
        }
        txn.item(&owner, Key::Sentinel(POP_KEY)).add_write(());
        Ok(Some(popped.value().clone()))
    }

    /// Read the maximum value without removing it.
    pub fn top(self: &Arc<Self>, txn: &mut Transaction) -> Result<Option<T>> {
        txn.check_not_aborted()?;
        let owner = self.shared();
        txn.item(&owner, Key::Sentinel(POP_KEY))
            .add_read(self.pop_version.load());

        let head = {
            let pop = self.pop_lock.lock(txn.slot());
            self.get_max(txn, &pop)?
        };
        Ok(head.map(|head| {
            txn.item(&owner, Key::value(&head)).add_read(head.version());
            head.value().clone()
        }))
    }

    /// Settled values, largest first. Only exact while no transaction runs.
    pub fn drain_snapshot(&self, slot: ThreadSlot) -> Vec<T> {
        let mut values: Vec<T> = self
            .heap
            .snapshot(slot)
            .into_iter()
            .filter(|v| !v.version().has(DELETED_BIT))
            .map(|v| v.value().clone())
            .collect();
        values.sort_unstable_by(|a, b| b.cmp(a));
        values
    }

    fn word_of<'a>(&'a self, item: &TransItem, value: &'a Option<Arc<VersionedValue<T>>>) -> Option<&'a VersionWord> {
        match item.key() {
            ItemKey::Sentinel(POP_KEY) => Some(&self.pop_version),
            ItemKey::Sentinel(_) => None,
            ItemKey::Value(_) => value.as_ref().map(|v| v.word()),
        }
    }
}

impl<T> Shared for PriorityQueue<T>
where
    T: Ord + Clone + Send + Sync + 'static,
{
    fn lock(&self, item: &mut TransItem, ctx: &CommitContext<'_>) -> bool {
        let value = item.key_value::<VersionedValue<T>>();
        match self.word_of(item, &value) {
            Some(word) => ctx.try_lock(item, word),
            None => true,
        }
    }

    fn check(&self, item: &TransItem, ctx: &CommitContext<'_>) -> bool {
        let Some(observed) = item.read_version() else {
            return true;
        };
        let value = item.key_value::<VersionedValue<T>>();
        let Some(word) = self.word_of(item, &value) else {
            return true;
        };
        let current = word.load();
        let not_locked = !current.is_locked() || current.is_locked_by(ctx.slot());

        if item.key() == ItemKey::Sentinel(POP_KEY) {
            return current.same_version(observed) && not_locked;
        }
        let same_version = observed.same_except(current, DIRTY_BIT);
        let not_dirty = !observed.has(DIRTY_BIT)
            || !current.has(DIRTY_BIT)
            || current.is_locked_by(ctx.slot());
        same_version && not_locked && not_dirty
    }

    fn install(&self, item: &mut TransItem, ctx: &CommitContext<'_>) {
        if item.key() == ItemKey::Sentinel(POP_KEY) {
            if self.config.opacity {
                self.pop_version.set_version(ctx.commit_tid());
            } else {
                self.pop_version.inc_version();
            }
            return;
        }
        let Some(value) = item.key_value::<VersionedValue<T>>() else {
            return;
        };
        if item.has_flags(INSERT_TAG) {
            value.word().clear_bits(INSERTED_BIT);
        }
        if item.has_flags(DELETE_TAG) {
            let new_head = item
                .write_value::<PopRecord<T>>()
                .and_then(|record| record.new_head.as_ref());
            if let Some(head) = new_head {
                head.word().clear_bits(DIRTY_BIT);
            }
        }
    }

    fn unlock(&self, item: &mut TransItem) {
        let value = item.key_value::<VersionedValue<T>>();
        if let Some(word) = self.word_of(item, &value) {
            word.release();
        }
    }

    fn cleanup(&self, item: &mut TransItem, slot: ThreadSlot, committed: bool) {
        if committed {
            return;
        }
        let Some(value) = item.key_value::<VersionedValue<T>>() else {
            return;
        };

        if item.has_flags(INSERT_TAG) {
            // Left in place; the next pop that meets it reaps it
            value.word().set_bits(DELETED_BIT);
            value.word().clear_bits(INSERTED_BIT);
        }

        if item.has_flags(DELETE_TAG) {
            if !item.has_flags(INSERT_TAG) {
                let copy = Arc::new(VersionedValue::new(value.value().clone(), INCREMENT));
                if let Err(e) = self.heap.add(copy, slot, |_| true) {
                    warn!(%slot, error = %e, "restoring popped value failed");
                }
            }
            let new_head = item
                .take_write::<PopRecord<T>>()
                .and_then(|record| record.new_head);
            if let Some(head) = new_head {
                let _guard = head.word().lock(slot);
                head.word().inc_version();
                head.word().clear_bits(DIRTY_BIT);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("size", &self.heap.len())
            .field("pop_version", &self.pop_version.load())
            .field("config", &self.config)
            .finish()
    }
}
