#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-dispatch** – The outbound postback dispatcher of the Afftok
//! core.
//!
//! Delivers pipeline executions step by step: render templates against the
//! task context, sign the request, send with a per-step timeout, persist a
//! step result. Failures retry in the primary tier with exponential (or
//! fixed) backoff and jitter; exhausted tasks try the pipeline's failover
//! URL once, then park in the DLQ with full context for explicit replay.
//!
//! Each tier is a two-layer queue: a bounded in-process channel in front of
//! a priority sorted set in the shared cache, giving bounded memory with
//! cross-instance visibility. Worker pools are sized from the CPU count.

use std::time::Duration;

pub mod backoff;
pub mod dispatcher;
pub mod pipeline;
pub mod queue;
pub mod results;
pub mod template;

pub use dispatcher::{Dispatcher, DispatcherMetrics};
pub use pipeline::PipelineRegistry;
pub use queue::{queue_key, TieredQueue, QUEUE_DLQ, QUEUE_FAILOVER, QUEUE_PRIMARY};
pub use results::{MemoryResultSink, ResultSink};
pub use template::render;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Dispatcher tuning knobs. Worker pool sizes default to multiples of the
/// CPU count: 4x primary, 2x failover, 1x DLQ.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// L1 capacity of the primary tier.
    pub primary_capacity: usize,
    /// L1 capacity of the failover tier.
    pub failover_capacity: usize,
    /// L1 capacity of the DLQ tier.
    pub dlq_capacity: usize,
    /// Primary worker count.
    pub primary_workers: usize,
    /// Failover worker count.
    pub failover_workers: usize,
    /// DLQ worker count.
    pub dlq_workers: usize,
    /// How long a worker waits on L1 before polling L2.
    pub l2_poll_interval: Duration,
    /// Bytes of response body kept in a step result.
    pub response_excerpt_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        let cpus = num_cpus::get().max(1);
        Self {
            primary_capacity: 10_000,
            failover_capacity: 5_000,
            dlq_capacity: 5_000,
            primary_workers: 4 * cpus,
            failover_workers: 2 * cpus,
            dlq_workers: cpus,
            l2_poll_interval: Duration::from_millis(500),
            response_excerpt_limit: 1024,
        }
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Result type alias for dispatch operations
pub type DispatchResult<T> = Result<T, DispatchError>;

/// Errors surfaced by the dispatcher
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// No pipeline is registered under the given id
    #[error("unknown pipeline: {0}")]
    UnknownPipeline(uuid::Uuid),
    /// The pipeline has no steps to execute
    #[error("pipeline {0} has no steps")]
    EmptyPipeline(uuid::Uuid),
    /// The shared cache failed or is unreachable
    #[error(transparent)]
    Cache(#[from] afftok_cache::CacheError),
    /// A task could not be serialized for the L2 lane
    #[error("task serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The HTTP client could not be constructed
    #[error("http client error: {0}")]
    HttpClient(String),
    /// No DLQ task with the given id exists
    #[error("task not found in DLQ: {0}")]
    TaskNotFound(uuid::Uuid),
}
