//! Transactional structures for tmdb
//!
//! - PriorityQueue: lock-coupled concurrent max-heap with pending inserts,
//!   dirty heads and undoable pops
//! - Queue: FIFO funneled through a flat-combining kernel, with buffered
//!   pushes and claim-based pops
//!
//! Both implement [`tmdb_concurrency::Shared`] and are driven by the
//! transaction manager at commit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod priority_queue;
pub mod queue;
pub mod versioned;

pub use priority_queue::{ConcurrentHeap, PriorityQueue, PriorityQueueConfig};
pub use queue::{PopStrategy, Queue, QueueConfig};
pub use versioned::VersionedValue;
