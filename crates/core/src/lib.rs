//! Core types for tmdb
//!
//! This crate defines the building blocks shared by every layer:
//! - VersionWord: packed lock bit, owner slot, user bits and sequence
//! - LockedCell: data guarded by a version word, released on drop
//! - ThreadSlot: handle for a registered worker thread
//! - Error: transaction-level error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod slot;
pub mod version;

pub use error::{AbortReason, Error, Result};
pub use slot::{ThreadSlot, MAX_THREADS};
pub use version::{CellGuard, LockedCell, Version, VersionWord, WordGuard};
