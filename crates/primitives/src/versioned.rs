//! Versioned values
//!
//! An immutable payload paired with a [`VersionWord`]. Structures hand out
//! `Arc`s to them; a value lives until the structure and every transaction
//! that tracked it let go.

use std::cmp::Ordering;
use std::fmt;
use tmdb_core::{Version, VersionWord};

/// Payload plus version word.
pub struct VersionedValue<T> {
    value: T,
    version: VersionWord,
}

impl<T> VersionedValue<T> {
    /// Wrap `value` with an initial word (lock bits are stripped).
    pub fn new(value: T, initial: u64) -> Self {
        Self {
            value,
            version: VersionWord::new(initial),
        }
    }

    /// Payload.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Version word.
    pub fn word(&self) -> &VersionWord {
        &self.version
    }

    /// Current version snapshot.
    pub fn version(&self) -> Version {
        self.version.load()
    }
}

impl<T: fmt::Debug> fmt::Debug for VersionedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionedValue")
            .field("value", &self.value)
            .field("version", &self.version.load())
            .finish()
    }
}

/// Ordered by payload only.
impl<T: PartialEq> PartialEq for VersionedValue<T> {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl<T: Eq> Eq for VersionedValue<T> {}

impl<T: PartialOrd> PartialOrd for VersionedValue<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.value.partial_cmp(&other.value)
    }
}

impl<T: Ord> Ord for VersionedValue<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value.cmp(&other.value)
    }
}
