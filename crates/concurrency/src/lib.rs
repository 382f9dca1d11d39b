//! Concurrency layer for tmdb
//!
//! This crate implements the transactional runtime the structures plug into:
//! - ContentionManager: timestamp-priority conflict resolution and backoff
//! - Transaction / TransItem: per-attempt item log
//! - TransactionManager: phased commit over the `Shared` protocol, retry loop
//! - Kernel: flat combining for sequential containers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod combining;
pub mod contention;
pub mod manager;
pub mod transaction;

pub use combining::{Combine, Kernel, KernelConfig, KernelStats, RecordHandle};
pub use contention::{ContentionConfig, ContentionManager, Resolution};
pub use manager::{CommitContext, TransactionConfig, TransactionManager};
pub use transaction::{
    object_id, Item, ItemKey, Key, ObjectId, Shared, TransItem, Transaction, TransactionStatus,
};
