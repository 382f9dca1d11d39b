//! Main entry point for tmdb.
//!
//! A [`Database`] owns the contention manager and the commit driver shared
//! by every structure it creates. Worker threads register once for a
//! [`ThreadSlot`] and run transactions through it.

use crate::config::DatabaseConfig;
use crate::error::Result;
use std::sync::Arc;
use tmdb_concurrency::{
    ContentionConfig, ContentionManager, TransactionConfig, TransactionManager,
};
use tmdb_core::{AbortReason, ThreadSlot};
use tmdb_primitives::{PriorityQueue, PriorityQueueConfig, Queue, QueueConfig};
use tracing::debug;

pub use tmdb_concurrency::Transaction;

/// The tmdb database.
///
/// # Example
///
/// ```ignore
/// use tmdb::prelude::*;
///
/// let db = Database::builder().max_threads(8).open()?;
/// let slot = db.register_worker()?;
/// let jobs = db.priority_queue::<u64>();
///
/// db.transaction(slot, |txn| jobs.push(txn, 42))?;
/// let top = db.transaction(slot, |txn| jobs.pop(txn))?;
/// ```
pub struct Database {
    manager: Arc<TransactionManager>,
    config: DatabaseConfig,
}

impl Database {
    /// Open with default settings.
    pub fn open() -> Result<Self> {
        Self::builder().open()
    }

    /// Open with `config`.
    pub fn with_config(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let contention = Arc::new(ContentionManager::new(config.contention.clone())?);
        let manager = Arc::new(TransactionManager::new(
            contention,
            config.transaction.clone(),
        ));
        debug!(
            max_threads = config.contention.max_threads,
            max_retries = config.transaction.max_retries,
            "database opened"
        );
        Ok(Self { manager, config })
    }

    /// Create a builder for database configuration.
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::new()
    }

    /// Settings in effect.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Commit driver shared by all structures of this database.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Claim a thread slot for the calling worker.
    ///
    /// Fails with [`Error::CapacityExceeded`](crate::Error::CapacityExceeded)
    /// once every slot is taken. Slots are never returned.
    pub fn register_worker(&self) -> Result<ThreadSlot> {
        Ok(self.manager.register()?)
    }

    /// New priority queue with the database defaults.
    pub fn priority_queue<T>(&self) -> Arc<PriorityQueue<T>>
    where
        T: Ord + Clone + Send + Sync + 'static,
    {
        self.priority_queue_with(self.config.priority_queue.clone())
    }

    /// New priority queue with explicit settings.
    pub fn priority_queue_with<T>(&self, config: PriorityQueueConfig) -> Arc<PriorityQueue<T>>
    where
        T: Ord + Clone + Send + Sync + 'static,
    {
        Arc::new(PriorityQueue::new(config))
    }

    /// New FIFO queue with the database defaults.
    pub fn queue<T>(&self) -> Arc<Queue<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.queue_with(self.config.queue.clone())
    }

    /// New FIFO queue with explicit settings.
    pub fn queue_with<T>(&self, config: QueueConfig) -> Arc<Queue<T>>
    where
        T: Clone + Send + Sync + 'static,
    {
        Arc::new(Queue::new(config))
    }

    /// Run `body` as a transaction on `slot` until it commits.
    ///
    /// Aborts and conflicts re-run the body with backoff; any other error
    /// (including [`AbortReason::User`]) is returned after rolling back.
    pub fn transaction<R, F>(&self, slot: ThreadSlot, body: F) -> Result<R>
    where
        F: FnMut(&mut Transaction) -> tmdb_core::Result<R>,
    {
        Ok(self.manager.run(slot, body)?)
    }

    /// Begin a single attempt, for callers driving commit themselves.
    pub fn begin(&self, slot: ThreadSlot) -> Transaction {
        self.manager.begin(slot)
    }

    /// Commit an attempt started with [`Database::begin`]. Returns the
    /// commit tid.
    pub fn commit(&self, txn: &mut Transaction) -> Result<u64> {
        Ok(self.manager.commit(txn)?)
    }

    /// Roll back an attempt started with [`Database::begin`].
    pub fn abort(&self, txn: &mut Transaction) -> Result<()> {
        Ok(self.manager.abort(txn, AbortReason::User)?)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("version", &self.manager.current_version())
            .field("config", &self.config)
            .finish()
    }
}

/// Builder for database configuration.
///
/// # Example
///
/// ```ignore
/// let db = Database::builder()
///     .max_threads(16)
///     .max_retries(1_000)
///     .queue(QueueConfig::default().pop_strategy(PopStrategy::Detach))
///     .open()?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct DatabaseBuilder {
    config: DatabaseConfig,
}

impl DatabaseBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a complete configuration.
    pub fn config(mut self, config: DatabaseConfig) -> Self {
        self.config = config;
        self
    }

    /// Contention manager settings.
    pub fn contention(mut self, contention: ContentionConfig) -> Self {
        self.config.contention = contention;
        self
    }

    /// Retry settings.
    pub fn transaction(mut self, transaction: TransactionConfig) -> Self {
        self.config.transaction = transaction;
        self
    }

    /// Default settings for queues.
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.config.queue = queue;
        self
    }

    /// Default settings for priority queues.
    pub fn priority_queue(mut self, priority_queue: PriorityQueueConfig) -> Self {
        self.config.priority_queue = priority_queue;
        self
    }

    /// Number of worker slots.
    pub fn max_threads(mut self, n: usize) -> Self {
        self.config.contention = self.config.contention.max_threads(n);
        self
    }

    /// Attempts before a transaction gives up.
    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.transaction = self.config.transaction.max_retries(n);
        self
    }

    /// Open the database.
    pub fn open(self) -> Result<Database> {
        Database::with_config(self.config)
    }
}
