//! Transaction state and the per-object commit protocol
//!
//! A [`Transaction`] is a log of [`TransItem`]s, one per `(object, key)` pair
//! the transaction touched. Each item carries what the owning structure needs
//! at commit time: an observed [`Version`], a buffered write, and user flag
//! bits. The structure itself interprets them through the [`Shared`] trait.
//!
//! ## Lifecycle
//!
//! ```text
//! Active → Committed { tid }
//!        → Aborted { reason }
//! ```
//!
//! Dropping an active transaction rolls it back, so every touched object sees
//! exactly one `cleanup` call per attempt.

use crate::contention::ContentionManager;
use crate::manager::CommitContext;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tmdb_core::{AbortReason, Error, Result, ThreadSlot, Version};
use tracing::debug;

/// Identity of a shared object: its address.
pub type ObjectId = usize;

/// Identity of `object`.
pub fn object_id<S: ?Sized>(object: &S) -> ObjectId {
    object as *const S as *const () as usize
}

/// Commit protocol implemented by every transactional structure.
///
/// The runtime drives it in phases: `lock` every written item, `check` every
/// read item, `install` every written item, `unlock` every item left locked,
/// then `cleanup` every item. On failure it skips to `unlock` and calls
/// `cleanup(committed = false)`.
///
/// None of the callbacks may block indefinitely; locks go through
/// [`CommitContext::try_lock`], which is spin-bounded.
pub trait Shared: Send + Sync {
    /// Acquire what `install` will need. Returning false aborts the commit.
    fn lock(&self, item: &mut TransItem, ctx: &CommitContext<'_>) -> bool;

    /// Re-validate an observation. Returning false aborts the commit.
    fn check(&self, item: &TransItem, ctx: &CommitContext<'_>) -> bool;

    /// Publish the buffered effect.
    fn install(&self, item: &mut TransItem, ctx: &CommitContext<'_>);

    /// Release what `lock` (or `install`) acquired.
    fn unlock(&self, item: &mut TransItem);

    /// Finalize the item after the outcome is known.
    fn cleanup(&self, item: &mut TransItem, slot: ThreadSlot, committed: bool);
}

// ============================================================================
// Keys
// ============================================================================

/// Item key as seen by a structure.
#[derive(Clone)]
pub enum Key {
    /// Structure-defined constant (e.g. "the pop sequence")
    Sentinel(i32),
    /// A shared value; the item keeps it alive
    Value(Arc<dyn Any + Send + Sync>),
}

impl Key {
    /// Key for the value behind `value`.
    pub fn value<V: Any + Send + Sync>(value: &Arc<V>) -> Self {
        let value: Arc<dyn Any + Send + Sync> = value.clone();
        Key::Value(value)
    }

    fn item_key(&self) -> ItemKey {
        match self {
            Key::Sentinel(k) => ItemKey::Sentinel(*k),
            Key::Value(value) => ItemKey::Value(Arc::as_ptr(value) as *const () as usize),
        }
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.item_key(), f)
    }
}

/// Hashable item key: sentinel constant or value address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKey {
    /// Structure-defined constant
    Sentinel(i32),
    /// Address of a shared value
    Value(usize),
}

impl ItemKey {
    /// Key for the value behind `value`, for lookups.
    pub fn of<V>(value: &Arc<V>) -> Self {
        ItemKey::Value(Arc::as_ptr(value) as *const () as usize)
    }
}

// ============================================================================
// TransItem
// ============================================================================

/// One tracked `(object, key)` entry of a transaction.
pub struct TransItem {
    owner: Arc<dyn Shared>,
    key: ItemKey,
    key_value: Option<Arc<dyn Any + Send + Sync>>,
    flags: u32,
    read: Option<Version>,
    write: Option<Box<dyn Any + Send>>,
    locked: bool,
}

impl TransItem {
    fn new(owner: Arc<dyn Shared>, key: Key) -> Self {
        let item_key = key.item_key();
        let key_value = match key {
            Key::Value(value) => Some(value),
            Key::Sentinel(_) => None,
        };
        Self {
            owner,
            key: item_key,
            key_value,
            flags: 0,
            read: None,
            write: None,
            locked: false,
        }
    }

    /// Owning structure.
    pub fn owner(&self) -> &Arc<dyn Shared> {
        &self.owner
    }

    /// Item key.
    pub fn key(&self) -> ItemKey {
        self.key
    }

    /// The shared value this item is keyed by, if it is a `V`.
    pub fn key_value<V: Any + Send + Sync>(&self) -> Option<Arc<V>> {
        self.key_value.clone()?.downcast::<V>().ok()
    }

    /// Check if all of `flags` are set.
    pub fn has_flags(&self, flags: u32) -> bool {
        self.flags & flags == flags
    }

    /// Flag bits.
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Check if a version was observed.
    pub fn has_read(&self) -> bool {
        self.read.is_some()
    }

    /// Observed version.
    pub fn read_version(&self) -> Option<Version> {
        self.read
    }

    /// Check if a write is buffered.
    pub fn has_write(&self) -> bool {
        self.write.is_some()
    }

    /// Buffered write, if it is a `V`.
    pub fn write_value<V: Any>(&self) -> Option<&V> {
        self.write.as_ref()?.downcast_ref::<V>()
    }

    /// Buffered write, mutably, if it is a `V`.
    pub fn write_value_mut<V: Any>(&mut self) -> Option<&mut V> {
        self.write.as_mut()?.downcast_mut::<V>()
    }

    /// Remove the buffered write, returning it if it is a `V`.
    pub fn take_write<V: Any>(&mut self) -> Option<V> {
        let write = self.write.take()?;
        match write.downcast::<V>() {
            Ok(value) => Some(*value),
            Err(other) => {
                self.write = Some(other);
                None
            }
        }
    }

    /// Drop the buffered write.
    pub fn clear_write(&mut self) {
        self.write = None;
    }

    /// Check if this item holds a lock for the commit in progress.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Record that this item holds (or released) a commit lock.
    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }
}

impl fmt::Debug for TransItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransItem")
            .field("key", &self.key)
            .field("flags", &self.flags)
            .field("read", &self.read)
            .field("has_write", &self.write.is_some())
            .field("locked", &self.locked)
            .finish()
    }
}

/// Mutable handle to a tracked item.
///
/// Writes go through the handle so the contention manager can count them.
pub struct Item<'a> {
    item: &'a mut TransItem,
    contention: &'a ContentionManager,
    slot: ThreadSlot,
}

impl Item<'_> {
    /// Record an observed version. The first observation wins.
    pub fn add_read(&mut self, version: Version) -> &mut Self {
        if self.item.read.is_none() {
            self.item.read = Some(version);
        }
        self
    }

    /// Buffer a write, replacing any previous one.
    pub fn add_write<V: Any + Send>(&mut self, value: V) -> &mut Self {
        if self.item.write.is_none() {
            self.contention.on_write(self.slot);
        }
        self.item.write = Some(Box::new(value));
        self
    }

    /// Set flag bits.
    pub fn add_flags(&mut self, flags: u32) -> &mut Self {
        self.item.flags |= flags;
        self
    }

    /// Buffered write, mutably, if it is a `V`.
    pub fn write_value_mut<V: Any>(&mut self) -> Option<&mut V> {
        self.item.write_value_mut()
    }
}

impl std::ops::Deref for Item<'_> {
    type Target = TransItem;

    fn deref(&self) -> &TransItem {
        self.item
    }
}

// ============================================================================
// Transaction
// ============================================================================

/// Transaction outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Still running
    Active,
    /// Committed with the given tid
    Committed {
        /// Commit tid
        tid: u64,
    },
    /// Rolled back
    Aborted {
        /// Cause
        reason: AbortReason,
    },
}

/// One attempt of a transaction on one thread.
pub struct Transaction {
    slot: ThreadSlot,
    restarted: bool,
    status: TransactionStatus,
    pub(crate) items: Vec<TransItem>,
    index: FxHashMap<(ObjectId, ItemKey), usize>,
    contention: Arc<ContentionManager>,
}

impl Transaction {
    /// Begin an attempt on `slot`. `restarted` keeps contention history.
    pub fn new(contention: Arc<ContentionManager>, slot: ThreadSlot, restarted: bool) -> Self {
        contention.start(slot, restarted);
        Self {
            slot,
            restarted,
            status: TransactionStatus::Active,
            items: Vec::new(),
            index: FxHashMap::default(),
            contention,
        }
    }

    /// Running thread's slot.
    pub fn slot(&self) -> ThreadSlot {
        self.slot
    }

    /// Check if this attempt is a retry.
    pub fn is_restarted(&self) -> bool {
        self.restarted
    }

    /// Current status.
    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Check if still running.
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }

    /// Fail with [`Error::NotActive`] unless running.
    pub fn ensure_active(&self) -> Result<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            TransactionStatus::Committed { tid } => {
                Err(Error::NotActive(format!("committed at {}", tid)))
            }
            TransactionStatus::Aborted { reason } => {
                Err(Error::NotActive(format!("aborted: {}", reason)))
            }
        }
    }

    /// Contention manager of this transaction.
    pub fn contention(&self) -> &ContentionManager {
        &self.contention
    }

    /// Fail if another transaction flagged this one.
    pub fn check_not_aborted(&self) -> Result<()> {
        if self.contention.is_aborted(self.slot) {
            return Err(Error::aborted(AbortReason::AbortedByOthers));
        }
        Ok(())
    }

    /// Number of tracked items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Check if nothing was tracked.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Tracked item for `(owner, key)`, created on first use.
    pub fn item(&mut self, owner: &Arc<dyn Shared>, key: Key) -> Item<'_> {
        let id = (object_id(&**owner), key.item_key());
        let position = match self.index.get(&id) {
            Some(&position) => position,
            None => {
                let position = self.items.len();
                self.items.push(TransItem::new(Arc::clone(owner), key));
                self.index.insert(id, position);
                position
            }
        };
        Item {
            item: &mut self.items[position],
            contention: &self.contention,
            slot: self.slot,
        }
    }

    /// Tracked item for `(object, key)`, without creating one.
    pub fn find(&self, object: ObjectId, key: ItemKey) -> Option<&TransItem> {
        self.index
            .get(&(object, key))
            .map(|&position| &self.items[position])
    }

    pub(crate) fn set_status(&mut self, status: TransactionStatus) {
        self.status = status;
    }

    /// Release held locks, run `cleanup(false)` on every item and mark the
    /// transaction aborted.
    pub(crate) fn rollback(&mut self, reason: AbortReason) {
        for item in self.items.iter_mut().filter(|item| item.locked) {
            let owner = Arc::clone(&item.owner);
            owner.unlock(item);
            item.locked = false;
        }
        for item in self.items.iter_mut() {
            let owner = Arc::clone(&item.owner);
            owner.cleanup(item, self.slot, false);
        }
        self.status = TransactionStatus::Aborted { reason };
        debug!(slot = %self.slot, %reason, items = self.items.len(), "transaction rolled back");
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("slot", &self.slot)
            .field("restarted", &self.restarted)
            .field("status", &self.status)
            .field("items", &self.items)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            self.rollback(AbortReason::User);
        }
    }
}
