//! Error types for WAL operations.

use thiserror::Error;

/// Result type alias for WAL operations
pub type WalResult<T> = Result<T, WalError>;

/// Errors surfaced by the write-ahead log
#[derive(Error, Debug)]
pub enum WalError {
    /// The pending-entry ceiling was reached; the caller must shed load
    #[error("backpressure: {pending} pending entries exceed ceiling {ceiling}")]
    BackpressureExceeded {
        /// Entries currently in the pending state
        pending: usize,
        /// Configured ceiling
        ceiling: usize,
    },

    /// Disk or filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record could not be serialized for the segment file
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No entry with the given id is known to the log
    #[error("entry not found: {0}")]
    EntryNotFound(uuid::Uuid),

    /// A status update would walk a terminal state backwards
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        /// Entry being marked
        id: uuid::Uuid,
        /// Current status
        from: afftok_types::EventStatus,
        /// Requested status
        to: afftok_types::EventStatus,
    },

    /// The payload exceeds the configured size limit
    #[error("payload too large: {size} > {limit} bytes")]
    PayloadTooLarge {
        /// Serialized payload size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// The WAL directory could not be created or opened
    #[error("WAL directory unusable: {0}")]
    DirectoryUnusable(String),
}

impl WalError {
    /// Whether the caller may retry the operation after shedding load.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, WalError::BackpressureExceeded { .. })
    }
}
