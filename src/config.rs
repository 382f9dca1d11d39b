//! Database configuration.
//!
//! Every section has defaults, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! [contention]
//! max_threads = 16
//! timestamp_threshold = 4
//!
//! [transaction]
//! max_retries = 1000
//!
//! [queue]
//! pop_strategy = "detach"
//!
//! [queue.kernel]
//! combine_passes = 2
//!
//! [priority_queue]
//! opacity = true
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tmdb_concurrency::{ContentionConfig, TransactionConfig};
use tmdb_primitives::{PriorityQueueConfig, QueueConfig};

/// Settings for a [`Database`](crate::Database) and the structures it creates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Contention manager
    pub contention: ContentionConfig,
    /// Commit driver and retry loop
    pub transaction: TransactionConfig,
    /// Defaults for queues created by the database
    pub queue: QueueConfig,
    /// Defaults for priority queues created by the database
    pub priority_queue: PriorityQueueConfig,
}

impl DatabaseConfig {
    /// Parse from TOML text. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Render as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string(self)?)
    }

    /// Reject unusable settings.
    pub fn validate(&self) -> Result<()> {
        self.contention.validate()?;
        self.transaction.validate()?;
        self.queue.kernel.validate()?;
        Ok(())
    }
}
