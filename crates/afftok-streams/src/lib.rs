#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-streams** – The stream fabric of the Afftok core.
//!
//! Decouples producers from consumers over named streams in the shared
//! cache: `stream:clicks`, `stream:conversions`, `stream:postbacks` and
//! `stream:edge_events`, all consumed by the single `afftok-consumers`
//! group. Delivery is at-least-once; handlers must be idempotent on the
//! logical id. Unacknowledged messages idle past a threshold are reclaimed
//! and reprocessed, and a lag tracker turns excessive pending counts into a
//! warning-severity health signal without ever blocking ingest.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use afftok_cache::CacheStore;
use afftok_types::{EventKind, EventRecord, TenantId};

pub mod consumer;
pub mod lag;

pub use consumer::{ConsumerConfig, ConsumerMetrics, MessageHandler, StreamConsumer};
pub use lag::{LagTracker, LagTrackerConfig};

//─────────────────────────────
//  Stream names
//─────────────────────────────

/// Click events.
pub const STREAM_CLICKS: &str = "stream:clicks";
/// Conversion events.
pub const STREAM_CONVERSIONS: &str = "stream:conversions";
/// Inbound postbacks.
pub const STREAM_POSTBACKS: &str = "stream:postbacks";
/// Edge and API batch events.
pub const STREAM_EDGE_EVENTS: &str = "stream:edge_events";

/// The single consumer group every process joins.
pub const CONSUMER_GROUP: &str = "afftok-consumers";

/// All streams, in the order the lag tracker reports them.
pub fn all_streams() -> [&'static str; 4] {
    [
        STREAM_CLICKS,
        STREAM_CONVERSIONS,
        STREAM_POSTBACKS,
        STREAM_EDGE_EVENTS,
    ]
}

/// The stream an event kind fans out on.
pub fn stream_for_kind(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Click => STREAM_CLICKS,
        EventKind::Conversion => STREAM_CONVERSIONS,
        EventKind::Postback => STREAM_POSTBACKS,
        EventKind::ApiEvent | EventKind::EdgeEvent => STREAM_EDGE_EVENTS,
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Result type alias for stream operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors surfaced by the stream fabric
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// The shared cache failed or is unreachable
    #[error(transparent)]
    Cache(#[from] afftok_cache::CacheError),
    /// A message could not be serialized
    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

//─────────────────────────────
//  Messages
//─────────────────────────────

/// One message on a stream. `logical_id` equals the WAL entry id of the
/// event it carries; exactly one WAL entry exists per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    /// The WAL entry this message corresponds to.
    pub logical_id: Uuid,
    /// Event kind.
    pub kind: EventKind,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Event timestamp.
    pub ts: DateTime<Utc>,
    /// Event payload.
    pub data: Map<String, Value>,
}

impl StreamMessage {
    /// Build the message for a WAL record.
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            logical_id: record.id,
            kind: record.kind,
            tenant_id: record.tenant_id.clone(),
            ts: record.ts,
            data: record.data.clone(),
        }
    }
}

//─────────────────────────────
//  Producer
//─────────────────────────────

/// Publishes WAL-backed events onto their streams.
#[derive(Clone)]
pub struct StreamProducer {
    cache: Arc<dyn CacheStore>,
}

impl StreamProducer {
    /// Create a producer over the shared cache.
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Append the record's message to its stream. The caller must already
    /// hold a durable WAL entry for the same logical id.
    pub async fn publish(&self, record: &EventRecord) -> StreamResult<String> {
        let stream = stream_for_kind(record.kind);
        let payload = serde_json::to_string(&StreamMessage::from_record(record))?;
        let id = self.cache.stream_append(stream, &payload).await?;
        debug!(stream, logical_id = %record.id, stream_id = %id, "published");
        Ok(id)
    }
}
