#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-cache** – The shared-cache port for the Afftok core.
//!
//! Counters, dedup keys, the L2 queue sorted sets and the event streams all
//! live behind the [`CacheStore`] trait. The default driver is the in-memory
//! [`MemoryCache`], used in tests and single-node deployments; the
//! `redis-cache` feature adds [`RedisCache`] for cross-instance visibility.
//!
//! The operations mirror the shared-cache primitives the rest of the core
//! relies on: atomic increments with TTLs, set-if-absent, score-ordered
//! sorted sets, and append-only streams with one consumer group (block-read,
//! ack, idle-claim, pending count).

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis-cache")]
pub mod redis_driver;

pub use memory::MemoryCache;
#[cfg(feature = "redis-cache")]
pub use redis_driver::RedisCache;

//─────────────────────────────
//  Error types
//─────────────────────────────

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

/// Errors surfaced by a cache driver
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The backing store rejected or failed the operation
    #[error("cache backend error: {0}")]
    Backend(String),
    /// A stored value had an unexpected shape (e.g. non-integer counter)
    #[error("unexpected cache value for {key}: {message}")]
    UnexpectedValue {
        /// Key holding the value
        key: String,
        /// What was wrong with it
        message: String,
    },
    /// The cache is unreachable
    #[error("cache unreachable: {0}")]
    Unreachable(String),
}

//─────────────────────────────
//  Stream entries
//─────────────────────────────

/// One message read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Stream-assigned id, e.g. `1722500000000-3`.
    pub id: String,
    /// Serialized message payload.
    pub payload: String,
}

//─────────────────────────────
//  The cache port
//─────────────────────────────

/// The shared-cache operations the core depends on.
///
/// All operations are atomic with respect to concurrent callers. Drivers
/// must be cheap to clone behind an `Arc` and safe to share across tasks.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Atomically add `delta` to an integer counter, returning the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64>;

    /// As [`CacheStore::incr_by`], also (re)setting the key's TTL.
    async fn incr_by_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64>;

    /// Read a counter; `None` when the key is absent or expired.
    async fn counter(&self, key: &str) -> CacheResult<Option<i64>>;

    /// Read a string value.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Write a string value with an optional TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()>;

    /// Write a value only when the key is absent. Returns `true` when the
    /// write happened. This is the dedup primitive.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> CacheResult<bool>;

    /// Remove a key.
    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Add (or rescore) a member in a sorted set.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()>;

    /// Pop the lowest-scored member, if any.
    async fn zpop_min(&self, key: &str) -> CacheResult<Option<(String, f64)>>;

    /// Remove a member. Returns `true` when it existed.
    async fn zrem(&self, key: &str, member: &str) -> CacheResult<bool>;

    /// Number of members in a sorted set.
    async fn zcard(&self, key: &str) -> CacheResult<u64>;

    /// Members by rank range, lowest score first. Negative indices count
    /// from the end, `-1` being the last member.
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>>;

    /// Append a payload to a stream, returning the assigned entry id.
    async fn stream_append(&self, stream: &str, payload: &str) -> CacheResult<String>;

    /// Create the consumer group if it does not exist. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> CacheResult<()>;

    /// Read up to `count` undelivered entries for `consumer`, blocking up
    /// to `block` when the stream is empty. Entries become pending for the
    /// consumer until acknowledged.
    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CacheResult<Vec<StreamEntry>>;

    /// Acknowledge a pending entry.
    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> CacheResult<()>;

    /// Claim up to `count` pending entries idle for at least `min_idle`,
    /// reassigning them to `consumer` and returning them for reprocessing.
    async fn stream_claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> CacheResult<Vec<StreamEntry>>;

    /// Number of delivered-but-unacknowledged entries in the group.
    async fn stream_pending_count(&self, stream: &str, group: &str) -> CacheResult<u64>;
}
