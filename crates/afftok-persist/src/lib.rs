#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-persist** – The micro-batching click persister of the Afftok
//! core.
//!
//! Clicks are submitted at single-millisecond latency into a bounded
//! channel; a single worker drains them into bounded database transactions
//! (one bulk insert plus aggregated per-user-offer counter upserts per
//! batch). Real-time counters live in the shared cache, with database
//! fallback memoized for a minute; the dedup window is a set-if-absent key
//! on a deterministic click fingerprint. Conversion recording is idempotent
//! on `(click_id, order_id)`.
//!
//! The database sits behind the [`ClickStore`] port: [`MemoryClickStore`]
//! for tests and development, [`PgClickStore`] (feature `postgres`) for
//! production.

pub mod counters;
pub mod store;
pub mod tracker;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use counters::{CounterUpdater, ReconcileReport};
pub use store::{ClickStore, ConversionOutcome, MemoryClickStore};
pub use tracker::{
    BatchWorker, ClickTracker, FingerprintClaim, PersistAck, TrackOutcome, TrackerConfig,
    TrackerMetrics,
};

#[cfg(feature = "postgres")]
pub use postgres::PgClickStore;

/// Result type alias for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors surfaced by the persistence layer
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The database rejected or failed the operation
    #[error("database error: {0}")]
    Database(String),
    /// The referenced row does not exist
    #[error("not found: {0}")]
    NotFound(String),
}
