//! Thread slots
//!
//! Every worker thread is assigned a slot at startup. Per-thread state
//! (contention bookkeeping, combining records) lives in fixed-size arrays
//! indexed by the slot, and a locked version word records its holder's slot
//! in its low bits.

use crate::error::{Error, Result};
use std::fmt;

/// Maximum number of concurrently registered worker threads.
///
/// Bounded by the owner field of a version word (7 bits).
pub const MAX_THREADS: usize = 128;

/// Handle for a registered worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadSlot(u8);

impl ThreadSlot {
    /// Create a slot handle for `index`.
    ///
    /// Fails with [`Error::SlotsExhausted`] when `index >= MAX_THREADS`.
    pub fn new(index: usize) -> Result<Self> {
        if index >= MAX_THREADS {
            return Err(Error::SlotsExhausted {
                capacity: MAX_THREADS,
            });
        }
        Ok(ThreadSlot(index as u8))
    }

    /// Index into per-thread arrays.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Slot encoded into the owner field of a version word.
    #[inline]
    pub(crate) fn bits(self) -> u64 {
        self.0 as u64
    }

    /// Decode the owner field of a version word.
    #[inline]
    pub(crate) fn from_bits(bits: u64) -> Self {
        ThreadSlot((bits & (MAX_THREADS as u64 - 1)) as u8)
    }
}

impl fmt::Display for ThreadSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}
