//! Error types for tmdb.
//!
//! Every failure in this system is transaction-level and recoverable by
//! re-running the transaction body. Structures signal "abort now" by
//! returning [`Error::Aborted`]; callers propagate it with `?` and the
//! runtime discards the transaction's intents.

use std::fmt;
use thiserror::Error;

/// Why a transaction was told to unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbortReason {
    /// Another transaction flagged this one for abort
    AbortedByOthers,
    /// Lost a priority comparison against a lock holder
    PriorityLoss,
    /// Bounded spin on a held lock ran out
    LockContention,
    /// Another in-flight transaction has a pending insert at the head
    ForeignInsert,
    /// An insert met an ancestor dirtied by someone else's pop
    DirtyAncestor,
    /// A captured version changed before commit
    ValidationFailed,
    /// The transaction body asked to abort
    User,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AbortReason::AbortedByOthers => "aborted by a higher-priority transaction",
            AbortReason::PriorityLoss => "yielded to a higher-priority lock holder",
            AbortReason::LockContention => "lock spin limit reached",
            AbortReason::ForeignInsert => "head is a pending insert of another transaction",
            AbortReason::DirtyAncestor => "insert met an ancestor dirtied by a concurrent pop",
            AbortReason::ValidationFailed => "read validation failed",
            AbortReason::User => "aborted by caller",
        };
        f.write_str(s)
    }
}

/// All tmdb errors.
#[derive(Debug, Error)]
pub enum Error {
    /// The current transaction must unwind and retry
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Cause of the abort
        reason: AbortReason,
    },

    /// Commit-time validation failed
    #[error("conflict: {0}")]
    Conflict(String),

    /// Transaction retried too many times
    #[error("transaction gave up after {attempts} attempts")]
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
    },

    /// No free thread slot
    #[error("all {capacity} thread slots are in use")]
    SlotsExhausted {
        /// Registry capacity
        capacity: usize,
    },

    /// The transaction was already committed or aborted
    #[error("transaction not active ({0})")]
    NotActive(String),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for tmdb operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for [`Error::Aborted`].
    pub fn aborted(reason: AbortReason) -> Self {
        Error::Aborted { reason }
    }

    /// Check if this error is retryable.
    ///
    /// Aborts and conflicts may succeed when the transaction is re-run.
    /// An abort requested by the transaction body itself is final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Aborted { reason } => *reason != AbortReason::User,
            Error::Conflict(_) => true,
            _ => false,
        }
    }

    /// Abort cause, if this is an abort.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            Error::Aborted { reason } => Some(*reason),
            _ => None,
        }
    }
}
