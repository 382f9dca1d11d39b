//! Sequential container behind the combining queue
//!
//! Only the current combiner touches it. Pops either mark the first
//! unclaimed record for the popping slot (`MarkInPlace`) or take it off the
//! front outright (`Detach`); either way the transaction can be undone.
//!
//! Every record carries the sequence number it was pushed with, and the deque
//! stays sorted by it. A detached value goes back to the position its
//! sequence number dictates, so aborts that overlap in any order rebuild the
//! original order.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tmdb_concurrency::Combine;
use tmdb_core::ThreadSlot;
use tracing::trace;

/// Claimed by an in-flight pop.
const DELETED: u8 = 1;
/// Claimed by a committed pop, awaiting removal from the front.
const POPPED: u8 = 1 << 1;

/// How a pop claims the front value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PopStrategy {
    /// Mark the record; unmark on abort, drop it after commit
    #[default]
    MarkInPlace,
    /// Remove the record; reinsert it in push order on abort
    Detach,
}

/// A value taken off the queue together with its push sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claimed<T> {
    /// Position in push order
    pub seq: u64,
    /// Payload
    pub value: T,
}

#[derive(Debug)]
struct Record<T> {
    seq: u64,
    value: T,
    flags: u8,
    owner: Option<ThreadSlot>,
}

impl<T> Record<T> {
    fn new(seq: u64, value: T) -> Self {
        Self {
            seq,
            value,
            flags: 0,
            owner: None,
        }
    }

    fn is_claimed(&self) -> bool {
        self.flags != 0
    }

    fn is_claimed_by(&self, slot: ThreadSlot) -> bool {
        self.flags & DELETED != 0 && self.owner == Some(slot)
    }
}

/// Operation submitted to the combiner.
#[derive(Debug)]
pub enum QueueOp<T> {
    /// Append a value
    Push(T),
    /// Claim the first unclaimed value for `slot`
    MarkDeleted {
        /// Claiming slot
        slot: ThreadSlot,
    },
    /// Turn `slot`'s claims into committed pops
    InstallPops {
        /// Committing slot
        slot: ThreadSlot,
    },
    /// Release `slot`'s claims
    UndoMarkDeleted {
        /// Aborting slot
        slot: ThreadSlot,
    },
    /// Reinsert detached values at their push-order positions
    Restore(Vec<Claimed<T>>),
    /// Drop committed pops from the front
    ClearPopped,
    /// Drop everything
    Clear,
    /// Ask whether the container holds no records at all
    Empty,
}

/// Combiner reply.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueReply<T> {
    /// Applied
    Done,
    /// Claimed value, or `None` if nothing was left to claim
    Popped(Option<Claimed<T>>),
    /// Answer to [`QueueOp::Empty`]
    Empty(bool),
}

/// Record deque plus a claim hint.
#[derive(Debug)]
pub struct Backing<T> {
    records: VecDeque<Record<T>>,
    /// Every record up to and including this index is claimed
    last_deleted: Option<usize>,
    next_seq: u64,
    strategy: PopStrategy,
    live: Arc<AtomicUsize>,
}

impl<T: Clone> Backing<T> {
    /// Empty container publishing its unclaimed count to `live`.
    pub fn new(strategy: PopStrategy, live: Arc<AtomicUsize>) -> Self {
        live.store(0, Ordering::Release);
        Self {
            records: VecDeque::new(),
            last_deleted: None,
            next_seq: 0,
            strategy,
            live,
        }
    }

    fn publish_live(&self, delta: isize) {
        if delta >= 0 {
            self.live.fetch_add(delta as usize, Ordering::Release);
        } else {
            self.live.fetch_sub(delta.unsigned_abs(), Ordering::Release);
        }
    }

    fn push(&mut self, value: T) {
        self.records.push_back(Record::new(self.next_seq, value));
        self.next_seq += 1;
        self.publish_live(1);
    }

    fn mark_deleted(&mut self, slot: ThreadSlot) -> Option<Claimed<T>> {
        if self.strategy == PopStrategy::Detach {
            let record = self.records.pop_front()?;
            self.publish_live(-1);
            return Some(Claimed {
                seq: record.seq,
                value: record.value,
            });
        }

        let start = self.last_deleted.map_or(0, |i| i + 1);
        let index = (start..self.records.len()).find(|&i| !self.records[i].is_claimed())?;
        let record = &mut self.records[index];
        record.flags = DELETED;
        record.owner = Some(slot);
        let claimed = Claimed {
            seq: record.seq,
            value: record.value.clone(),
        };
        self.last_deleted = Some(index);
        self.publish_live(-1);
        trace!(%slot, index, "claimed record");
        Some(claimed)
    }

    fn install_pops(&mut self, slot: ThreadSlot) {
        for record in self.records.iter_mut().filter(|r| r.is_claimed_by(slot)) {
            record.flags = POPPED;
            record.owner = None;
        }
    }

    fn undo_mark_deleted(&mut self, slot: ThreadSlot) {
        let mut restored = 0;
        for record in self.records.iter_mut().filter(|r| r.is_claimed_by(slot)) {
            record.flags = 0;
            record.owner = None;
            restored += 1;
        }
        if restored > 0 {
            self.last_deleted = None;
            self.publish_live(restored);
        }
    }

    fn restore(&mut self, claimed: Vec<Claimed<T>>) {
        let count = claimed.len() as isize;
        for Claimed { seq, value } in claimed {
            let index = self.records.partition_point(|r| r.seq < seq);
            self.records.insert(index, Record::new(seq, value));
            trace!(seq, index, "restored record");
        }
        self.last_deleted = None;
        self.publish_live(count);
    }

    fn clear_popped(&mut self) {
        let mut removed = 0;
        while self
            .records
            .front()
            .map_or(false, |r| r.flags & POPPED != 0)
        {
            self.records.pop_front();
            removed += 1;
        }
        self.last_deleted = self
            .last_deleted
            .and_then(|i| i.checked_sub(removed));
    }

    fn clear(&mut self) {
        self.records.clear();
        self.last_deleted = None;
        self.live.store(0, Ordering::Release);
    }
}

impl<T: Clone + Send> Combine for Backing<T> {
    type Op = QueueOp<T>;
    type Reply = QueueReply<T>;

    fn apply(&mut self, op: QueueOp<T>) -> QueueReply<T> {
        match op {
            QueueOp::Push(value) => self.push(value),
            QueueOp::MarkDeleted { slot } => return QueueReply::Popped(self.mark_deleted(slot)),
            QueueOp::InstallPops { slot } => self.install_pops(slot),
            QueueOp::UndoMarkDeleted { slot } => self.undo_mark_deleted(slot),
            QueueOp::Restore(claimed) => self.restore(claimed),
            QueueOp::ClearPopped => self.clear_popped(),
            QueueOp::Clear => self.clear(),
            QueueOp::Empty => return QueueReply::Empty(self.records.is_empty()),
        }
        QueueReply::Done
    }
}
