//! Version words for optimistic concurrency control.
//!
//! A [`VersionWord`] packs a spin-lock, the lock holder's slot, three user
//! bits and a sequence number into one `u64`. Readers capture a [`Version`]
//! snapshot and compare it again at commit; writers lock the word.
//!
//! # Layout
//!
//! ```text
//! 63 ........ 11 | 10    9     8     | 7    | 6 ... 0
//!    sequence    | user2 user1 user0 | lock | owner slot
//! ```
//!
//! The owner field is only meaningful while the lock bit is set.
//!
//! # Guards
//!
//! [`VersionWord::lock`] and [`LockedCell::lock`] return guards that release
//! the word on drop, so early returns and `?` propagation can never leak a
//! held lock. The raw [`VersionWord::acquire`] / [`VersionWord::release`]
//! pair exists for the commit protocol, where a lock is taken in one callback
//! and released in another.

use crate::slot::{ThreadSlot, MAX_THREADS};
use crossbeam_utils::Backoff;
use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

/// Owner slot field.
pub const THREAD_MASK: u64 = MAX_THREADS as u64 - 1;

/// Lock bit.
pub const LOCK_BIT: u64 = 1 << 7;

/// First user bit. Structures assign meaning to `USER_BIT0 << 0..3`.
pub const USER_BIT0: u64 = 1 << 8;

/// Bit position of the sequence field.
pub const SEQUENCE_SHIFT: u32 = 11;

/// One sequence step.
pub const INCREMENT: u64 = 1 << SEQUENCE_SHIFT;

/// Sequence field.
pub const SEQUENCE_MASK: u64 = !(INCREMENT - 1);

// ============================================================================
// Version snapshot
// ============================================================================

/// Snapshot of a version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Version(u64);

impl Version {
    /// Wrap a raw word.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Version(raw)
    }

    /// Raw word.
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if the lock bit is set.
    #[inline]
    pub fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    /// Holder of the lock, if locked.
    #[inline]
    pub fn owner(self) -> Option<ThreadSlot> {
        if self.is_locked() {
            Some(ThreadSlot::from_bits(self.0 & THREAD_MASK))
        } else {
            None
        }
    }

    /// Check if locked by `slot`.
    #[inline]
    pub fn is_locked_by(self, slot: ThreadSlot) -> bool {
        self.owner() == Some(slot)
    }

    /// Check if all of `bits` are set.
    #[inline]
    pub fn has(self, bits: u64) -> bool {
        self.0 & bits == bits
    }

    /// Sequence number.
    #[inline]
    pub fn sequence(self) -> u64 {
        self.0 >> SEQUENCE_SHIFT
    }

    /// Equal modulo lock and owner bits.
    #[inline]
    pub fn same_version(self, other: Version) -> bool {
        self.same_except(other, 0)
    }

    /// Equal modulo lock, owner and `ignored` bits.
    #[inline]
    pub fn same_except(self, other: Version, ignored: u64) -> bool {
        (self.0 ^ other.0) & !(LOCK_BIT | THREAD_MASK | ignored) == 0
    }
}

// ============================================================================
// VersionWord
// ============================================================================

/// Atomic version word.
#[derive(Debug, Default)]
pub struct VersionWord {
    value: AtomicU64,
}

impl VersionWord {
    /// Create a word holding `initial`. The lock bit must be clear.
    pub const fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial & !(LOCK_BIT | THREAD_MASK)),
        }
    }

    /// Current snapshot.
    #[inline]
    pub fn load(&self) -> Version {
        Version(self.value.load(Ordering::Acquire))
    }

    /// Single lock attempt.
    ///
    /// Returns the observed word if another holder has it. Retries only when
    /// the word changed under the CAS without being locked (a concurrent
    /// user-bit update).
    pub fn try_acquire(&self, slot: ThreadSlot) -> std::result::Result<(), Version> {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            if current & LOCK_BIT != 0 {
                return Err(Version(current));
            }
            let locked = (current & !THREAD_MASK) | LOCK_BIT | slot.bits();
            match self.value.compare_exchange_weak(
                current,
                locked,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    /// Lock with at most `max_spins` retries against a held word.
    pub fn try_acquire_for(
        &self,
        slot: ThreadSlot,
        max_spins: u32,
    ) -> std::result::Result<(), Version> {
        let backoff = Backoff::new();
        let mut spins = 0;
        loop {
            match self.try_acquire(slot) {
                Ok(()) => return Ok(()),
                Err(held) if spins >= max_spins => return Err(held),
                Err(_) => {
                    spins += 1;
                    backoff.spin();
                }
            }
        }
    }

    /// Spin until locked. Pair with [`release`](Self::release).
    pub fn acquire(&self, slot: ThreadSlot) {
        let backoff = Backoff::new();
        while self.try_acquire(slot).is_err() {
            backoff.snooze();
        }
    }

    /// Clear the lock bit and owner field.
    #[inline]
    pub fn release(&self) {
        debug_assert!(self.load().is_locked(), "release of an unlocked word");
        self.value
            .fetch_and(!(LOCK_BIT | THREAD_MASK), Ordering::Release);
    }

    /// Spin until locked; the returned guard releases on drop.
    pub fn lock(&self, slot: ThreadSlot) -> WordGuard<'_> {
        self.acquire(slot);
        WordGuard {
            word: self,
            _marker: PhantomData,
        }
    }

    /// Set `bits`. Safe with or without the lock held.
    #[inline]
    pub fn set_bits(&self, bits: u64) {
        debug_assert_eq!(bits & (LOCK_BIT | THREAD_MASK), 0);
        self.value.fetch_or(bits, Ordering::AcqRel);
    }

    /// Clear `bits`. Safe with or without the lock held.
    #[inline]
    pub fn clear_bits(&self, bits: u64) {
        debug_assert_eq!(bits & (LOCK_BIT | THREAD_MASK), 0);
        self.value.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Advance the sequence by one step.
    #[inline]
    pub fn inc_version(&self) {
        self.value.fetch_add(INCREMENT, Ordering::AcqRel);
    }

    /// Replace the sequence, keeping lock, owner and user bits.
    pub fn set_version(&self, sequence: u64) {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = (current & !SEQUENCE_MASK) | (sequence << SEQUENCE_SHIFT);
            match self.value.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Proof that a [`VersionWord`] is locked. Releases on drop.
///
/// `!Send`: the lock is released by the thread that took it.
#[derive(Debug)]
#[must_use = "dropping the guard releases the lock immediately"]
pub struct WordGuard<'a> {
    word: &'a VersionWord,
    _marker: PhantomData<*mut ()>,
}

impl WordGuard<'_> {
    /// The locked word.
    pub fn word(&self) -> &VersionWord {
        self.word
    }
}

impl Drop for WordGuard<'_> {
    fn drop(&mut self) {
        self.word.release();
    }
}

// ============================================================================
// LockedCell
// ============================================================================

/// Data guarded by its own version word.
///
/// Access to the data only goes through [`CellGuard`], which holds the lock
/// for its whole lifetime.
#[derive(Debug)]
pub struct LockedCell<T> {
    version: VersionWord,
    data: UnsafeCell<T>,
}

// SAFETY: the data is only reachable through a CellGuard, and at most one
// guard exists at a time because creating one requires winning the lock bit.
unsafe impl<T: Send> Send for LockedCell<T> {}
unsafe impl<T: Send> Sync for LockedCell<T> {}

impl<T> LockedCell<T> {
    /// Wrap `data` with an unlocked version word.
    pub const fn new(data: T) -> Self {
        Self {
            version: VersionWord::new(0),
            data: UnsafeCell::new(data),
        }
    }

    /// Spin until locked.
    pub fn lock(&self, slot: ThreadSlot) -> CellGuard<'_, T> {
        self.version.acquire(slot);
        CellGuard {
            cell: self,
            _marker: PhantomData,
        }
    }

    /// The guarding word.
    pub fn version(&self) -> &VersionWord {
        &self.version
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

/// Exclusive access to a [`LockedCell`]'s data. Releases on drop.
#[must_use = "dropping the guard releases the lock immediately"]
pub struct CellGuard<'a, T> {
    cell: &'a LockedCell<T>,
    _marker: PhantomData<*mut ()>,
}

impl<T> Deref for CellGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard holds the cell's lock.
        unsafe { &*self.cell.data.get() }
    }
}

impl<T> DerefMut for CellGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: this guard holds the cell's lock, and &mut self prevents
        // aliasing through the guard itself.
        unsafe { &mut *self.cell.data.get() }
    }
}

impl<T> Drop for CellGuard<'_, T> {
    fn drop(&mut self) {
        self.cell.version.release();
    }
}
