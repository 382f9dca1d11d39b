//! Unified error type for tmdb.
//!
//! Wraps the core error taxonomy and the configuration loaders behind one
//! stable, user-facing enum.

use thiserror::Error;
use tmdb_core::AbortReason;

/// All tmdb errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The transaction was aborted and not retried
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Cause of the abort
        reason: AbortReason,
    },

    /// Commit-time conflict
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retry budget spent
    #[error("transaction gave up after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// A fixed-size resource ran out
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Operation on a finished transaction
    #[error("transaction not active: {0}")]
    NotActive(String),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Configuration could not be parsed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for tmdb operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Check if this error is retryable.
    ///
    /// Retryable errors may succeed when the transaction is run again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Aborted { reason } => *reason != AbortReason::User,
            Error::Conflict(_) => true,
            _ => false,
        }
    }

    /// Check if this is an abort or conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Aborted { .. } | Error::Conflict(_))
    }

    /// Abort cause, if this is an abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Error::Aborted { reason } => Some(*reason),
            _ => None,
        }
    }
}

// Convert from internal core errors
impl From<tmdb_core::Error> for Error {
    fn from(e: tmdb_core::Error) -> Self {
        use tmdb_core::Error as CoreError;
        match e {
            CoreError::Aborted { reason } => Error::Aborted { reason },
            CoreError::Conflict(msg) => Error::Conflict(msg),
            CoreError::RetriesExhausted { attempts } => Error::RetriesExhausted { attempts },
            CoreError::SlotsExhausted { capacity } => {
                Error::CapacityExceeded(format!("all {} thread slots are in use", capacity))
            }
            CoreError::NotActive(msg) => Error::NotActive(msg),
            CoreError::InvalidConfig(msg) => Error::InvalidConfig(msg),
        }
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
