//! Concurrent array-backed max-heap
//!
//! Nodes live in an arena of geometrically growing buckets, so a node's
//! address never moves once allocated and an index always names the same
//! lock. Each node is a [`LockedCell`]; payloads are relocated by swapping
//! node contents, never by swapping nodes.
//!
//! ## Locks
//!
//! - `heap_lock` serializes changes to `size` (append, shrink).
//! - Each node's own word guards its slot.
//!
//! Node locks are always taken in ascending index order. Sift-up locks
//! `(parent, child)`, sift-down holds the parent and locks children, and
//! `remove_max` locks `(root, bottom)`. `heap_lock` is only ever waited for
//! while holding no node lock.
//!
//! ## Node states
//!
//! ```text
//! Busy(slot) ──settle──> Available ──remove──> Empty
//! ```
//!
//! Heap order holds over settled nodes only; a `Busy` node is still being
//! sifted up by its inserting thread.

use crate::versioned::VersionedValue;
use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tmdb_core::{AbortReason, CellGuard, Error, LockedCell, Result, ThreadSlot, VersionWord};
use tracing::trace;

/// Size of bucket 0; bucket `b` holds `FIRST_BUCKET << b` nodes.
const FIRST_BUCKET: usize = 32;

/// Number of buckets.
const BUCKETS: usize = 32;

/// Node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// Settled and live
    Available,
    /// Vacated
    Empty,
    /// Being sifted up by the owning thread
    Busy(ThreadSlot),
}

/// Contents of one heap position.
#[derive(Debug)]
pub struct NodeSlot<T> {
    value: Option<Arc<VersionedValue<T>>>,
    status: NodeStatus,
}

impl<T> NodeSlot<T> {
    const fn empty() -> Self {
        Self {
            value: None,
            status: NodeStatus::Empty,
        }
    }

    fn is_live(&self) -> bool {
        self.status != NodeStatus::Empty && self.value.is_some()
    }
}

type Node<T> = LockedCell<NodeSlot<T>>;

/// Bucket and offset of node `index`.
fn locate(index: usize) -> (usize, usize) {
    let j = index / FIRST_BUCKET + 1;
    let bucket = (usize::BITS - 1 - j.leading_zeros()) as usize;
    let offset = index - FIRST_BUCKET * ((1 << bucket) - 1);
    (bucket, offset)
}

/// Strictly greater, by payload. Vacant slots never win.
fn greater<T: Ord>(a: &NodeSlot<T>, b: &NodeSlot<T>) -> bool {
    match (&a.value, &b.value) {
        (Some(a), Some(b)) => a.value() > b.value(),
        (Some(_), None) => true,
        _ => false,
    }
}

/// Concurrent max-heap of versioned values.
pub struct ConcurrentHeap<T> {
    buckets: Box<[OnceCell<Box<[Node<T>]>>]>,
    heap_lock: VersionWord,
    size: AtomicUsize,
}

impl<T> Default for ConcurrentHeap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConcurrentHeap<T> {
    /// Create an empty heap. Buckets are allocated on first use.
    pub fn new() -> Self {
        Self {
            buckets: (0..BUCKETS).map(|_| OnceCell::new()).collect(),
            heap_lock: VersionWord::new(0),
            size: AtomicUsize::new(0),
        }
    }

    /// Live prefix length. An unsynchronized snapshot.
    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    /// Check if the live prefix is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn node(&self, index: usize) -> &Node<T> {
        let (bucket, offset) = locate(index);
        let nodes = self.buckets[bucket].get_or_init(|| {
            (0..FIRST_BUCKET << bucket)
                .map(|_| LockedCell::new(NodeSlot::empty()))
                .collect()
        });
        &nodes[offset]
    }

    /// Lock two nodes, lower index first.
    fn lock_pair(
        &self,
        lower: usize,
        higher: usize,
        slot: ThreadSlot,
    ) -> (CellGuard<'_, NodeSlot<T>>, CellGuard<'_, NodeSlot<T>>) {
        debug_assert!(lower < higher, "pair must be locked in ascending order");
        let first = self.node(lower).lock(slot);
        let second = self.node(higher).lock(slot);
        (first, second)
    }

    /// Current root value.
    pub fn peek_root(&self, slot: ThreadSlot) -> Option<Arc<VersionedValue<T>>> {
        if self.is_empty() {
            return None;
        }
        let root = self.node(0).lock(slot);
        if root.is_live() {
            root.value.clone()
        } else {
            None
        }
    }

    /// Values in array order. Locks one node at a time, so the result is only
    /// exact when the heap is quiescent.
    pub fn snapshot(&self, slot: ThreadSlot) -> Vec<Arc<VersionedValue<T>>> {
        (0..self.len())
            .filter_map(|i| {
                let node = self.node(i).lock(slot);
                node.value.clone()
            })
            .collect()
    }

    /// Place `value` at the bottom as `Busy(slot)` and return its index.
    /// The caller finishes the insert with [`ConcurrentHeap::sift_up`].
    pub(crate) fn append(&self, value: Arc<VersionedValue<T>>, slot: ThreadSlot) -> usize {
        let _heap = self.heap_lock.lock(slot);
        let index = self.size.load(Ordering::Relaxed);
        let mut node = self.node(index).lock(slot);
        node.value = Some(value);
        node.status = NodeStatus::Busy(slot);
        drop(node);
        self.size.store(index + 1, Ordering::Release);
        index
    }
}

impl<T: Ord> ConcurrentHeap<T> {
    /// Insert `value` and sift it up.
    ///
    /// `dirtied_by_me` tells whether a dirty value met on the way belongs to
    /// the calling transaction. A dirty ancestor owned by someone else fails
    /// with [`AbortReason::DirtyAncestor`]; the new node stays in the heap,
    /// settled, for the caller's cleanup to retire.
    pub fn add<F>(&self, value: Arc<VersionedValue<T>>, slot: ThreadSlot, dirtied_by_me: F) -> Result<()>
    where
        F: Fn(&Arc<VersionedValue<T>>) -> bool,
    {
        let index = self.append(value, slot);
        self.sift_up(index, slot, dirtied_by_me)
    }

    /// Move the `Busy(slot)` node appended at `child` up to its place. A node
    /// moved by a concurrent removal is followed upward; one that reached the
    /// root there was already settled by the remover.
    pub(crate) fn sift_up<F>(&self, mut child: usize, slot: ThreadSlot, dirtied_by_me: F) -> Result<()>
    where
        F: Fn(&Arc<VersionedValue<T>>) -> bool,
    {
        while child > 0 {
            let parent = (child - 1) / 2;
            let (mut up, mut down) = self.lock_pair(parent, child, slot);
            let mine = down.status == NodeStatus::Busy(slot);

            if up.status == NodeStatus::Available && mine {
                if !greater(&down, &up) {
                    down.status = NodeStatus::Available;
                    return Ok(());
                }
                std::mem::swap(&mut *up, &mut *down);
                trace!(from = child, to = parent, "sift up");
                child = parent;

                let dirty_foreign = down.value.as_ref().map_or(false, |moved| {
                    moved.version().has(super::DIRTY_BIT) && !dirtied_by_me(moved)
                });
                if dirty_foreign {
                    up.status = NodeStatus::Available;
                    return Err(Error::aborted(AbortReason::DirtyAncestor));
                }
            } else if !mine {
                // Displaced by a concurrent removal; our node is above us
                child = parent;
            } else {
                drop((up, down));
                std::hint::spin_loop();
            }
        }

        let mut root = self.node(0).lock(slot);
        if root.status == NodeStatus::Busy(slot) {
            root.status = NodeStatus::Available;
        }
        Ok(())
    }

    /// Remove the root and restore heap order below it.
    ///
    /// With `expected`, the removal only happens if the root still is that
    /// exact value; otherwise the heap is left untouched and `None` returned.
    pub fn remove_max(
        &self,
        expected: Option<&Arc<VersionedValue<T>>>,
        slot: ThreadSlot,
    ) -> Option<Arc<VersionedValue<T>>> {
        let matches = |node: &NodeSlot<T>| match (expected, &node.value) {
            (None, _) => true,
            (Some(e), Some(v)) => Arc::ptr_eq(e, v),
            (Some(_), None) => false,
        };

        let heap = self.heap_lock.lock(slot);
        let size = self.size.load(Ordering::Relaxed);
        if size == 0 {
            return None;
        }
        let bottom = size - 1;

        if bottom == 0 {
            let mut root = self.node(0).lock(slot);
            if !matches(&*root) {
                return None;
            }
            let value = root.value.take();
            root.status = NodeStatus::Empty;
            self.size.store(0, Ordering::Release);
            return value;
        }

        let (mut root, mut last) = self.lock_pair(0, bottom, slot);
        if !matches(&*root) {
            return None;
        }
        self.size.store(bottom, Ordering::Release);
        drop(heap);

        let removed = root.value.take();
        root.status = NodeStatus::Empty;
        std::mem::swap(&mut *root, &mut *last);
        drop(last);
        // A node still being inserted is settled where it lands
        if matches!(root.status, NodeStatus::Busy(_)) {
            root.status = NodeStatus::Available;
        }

        let mut parent = 0;
        let mut parent_guard = root;
        loop {
            let left = 2 * parent + 1;
            let right = left + 1;
            let size = self.size.load(Ordering::Acquire);
            if left >= size {
                break;
            }
            let left_guard = self.node(left).lock(slot);
            if !left_guard.is_live() {
                break;
            }
            let right_guard = if right < size {
                Some(self.node(right).lock(slot))
            } else {
                None
            };

            let (child, mut child_guard) = match right_guard {
                Some(r) if r.is_live() && greater(&r, &left_guard) => (right, r),
                _ => (left, left_guard),
            };
            if !greater(&child_guard, &parent_guard) {
                break;
            }
            std::mem::swap(&mut *parent_guard, &mut *child_guard);
            trace!(from = parent, to = child, "sift down");
            parent = child;
            parent_guard = child_guard;
        }
        removed
    }
}
