//! # tmdb
//!
//! Concurrency-control core of a transactional in-memory database.
//!
//! tmdb provides transactional containers that many worker threads use at
//! once, with conflicts resolved by a timestamp-priority contention manager
//! and a phased optimistic commit.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tmdb::prelude::*;
//!
//! let db = Database::open()?;
//! let slot = db.register_worker()?;
//!
//! let tasks = db.priority_queue::<u32>();
//! let log = db.queue::<String>();
//!
//! db.transaction(slot, |txn| {
//!     tasks.push(txn, 7)?;
//!     log.push(txn, "scheduled 7".to_string())
//! })?;
//!
//! let next = db.transaction(slot, |txn| tasks.pop(txn))?;
//! ```
//!
//! ## Structures
//!
//! - [`PriorityQueue`] - max-heap with per-node locks and undoable pops
//! - [`Queue`] - FIFO funneled through a flat-combining kernel
//!
//! ## Layers
//!
//! - `tmdb-core`: version words, thread slots, error taxonomy
//! - `tmdb-concurrency`: contention manager, transactions, commit driver,
//!   combining kernel
//! - `tmdb-primitives`: the structures

#![warn(missing_docs)]

mod config;
mod database;
mod error;

pub mod prelude;

// Re-export main entry points
pub use config::DatabaseConfig;
pub use database::{Database, DatabaseBuilder, Transaction};
pub use error::{Error, Result};

// Re-export structures
pub use tmdb_primitives::{
    PopStrategy, PriorityQueue, PriorityQueueConfig, Queue, QueueConfig,
};

// Re-export runtime types
pub use tmdb_concurrency::{ContentionConfig, KernelConfig, TransactionConfig};
pub use tmdb_core::{AbortReason, ThreadSlot, MAX_THREADS};
