//! Convenient imports for tmdb.
//!
//! ```ignore
//! use tmdb::prelude::*;
//!
//! let db = Database::open()?;
//! let slot = db.register_worker()?;
//! ```

// Main entry point
pub use crate::database::{Database, DatabaseBuilder, Transaction};
pub use crate::config::DatabaseConfig;

// Error handling
pub use crate::error::{Error, Result};

// Structures
pub use tmdb_primitives::{PopStrategy, PriorityQueue, PriorityQueueConfig, Queue, QueueConfig};

// Runtime types
pub use tmdb_concurrency::{ContentionConfig, KernelConfig, TransactionConfig};
pub use tmdb_core::{AbortReason, ThreadSlot};
