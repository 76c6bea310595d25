#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-ingest** – The ingest front of the Afftok core.
//!
//! Accepts events in several source shapes (single JSON, batch envelope,
//! gzip-wrapped envelope, JSON-lines) and normalizes them into the internal
//! shape before anything else happens. Admission order is fixed: resolve
//! (clicks must map their tracking code to a user-offer id), append to the
//! WAL, publish to the event stream. An unresolved or malformed event is
//! rejected before it can touch the WAL; a failed publish lands in the
//! failover queue, never on the floor.

use std::io::Read;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use afftok_streams::StreamProducer;
use afftok_types::{BatchEnvelope, EventKind, RawEvent, MAX_BATCH_EVENTS, MAX_TENANT_ID_LEN};
use afftok_wal::{WalError, WriteAheadLog};

pub mod failover;
pub mod resolver;

pub use failover::{FailoverMetrics, FailoverQueue, FailoverWorker, FAILOVER_KEY};
pub use resolver::{CachedResolver, StaticResolver, TrackingCodeResolver};

/// Tenant recorded when an event does not carry one.
pub const DEFAULT_TENANT: &str = "default";

/// Payload key the resolved user-offer id is written under.
pub const KEY_USER_OFFER_ID: &str = "user_offer_id";

//─────────────────────────────
//  Errors and outcomes
//─────────────────────────────

/// Result type alias for ingest operations
pub type IngestResult<T> = Result<T, IngestError>;

/// Errors that abort an ingest call entirely (I/O and durability layers).
/// Per-event validation failures are [`IngestOutcome::Dropped`] instead.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The WAL refused or failed the append
    #[error(transparent)]
    Wal(#[from] WalError),
    /// A batch body could not be decoded at all
    #[error("batch decode failed: {0}")]
    Decode(String),
}

/// Why an event was not admitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// The kind tag is not part of the closed set.
    UnknownKind(String),
    /// The tracking code did not resolve to a user-offer.
    UnresolvedTrackingCode(String),
    /// The tenant id exceeds the configured limit.
    TenantTooLong,
    /// The WAL's pending ceiling was reached.
    Backpressure,
}

/// Outcome of admitting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Durable in the WAL and handed to the stream fabric.
    Admitted {
        /// WAL entry id (also the stream message's logical id).
        id: Uuid,
        /// Assigned sequence number.
        seq: u64,
    },
    /// Rejected before WAL admission.
    Dropped {
        /// Why the event was rejected.
        reason: DropReason,
    },
}

/// Result of a batch ingest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Events admitted.
    pub processed: usize,
    /// Events dropped or failed.
    pub failed: usize,
}

/// Counters exposed by the ingest front.
#[derive(Debug, Default)]
pub struct IngestMetrics {
    /// Events admitted to WAL and stream.
    pub admitted: AtomicU64,
    /// Events dropped for validation reasons.
    pub dropped_validation: AtomicU64,
    /// Events dropped on unresolved tracking codes.
    pub dropped_unresolved: AtomicU64,
    /// Events refused under WAL backpressure.
    pub dropped_backpressure: AtomicU64,
    /// Publishes diverted to the failover queue.
    pub publish_failovers: AtomicU64,
}

//─────────────────────────────
//  The front
//─────────────────────────────

/// Normalizes, resolves and admits events.
pub struct IngestFront {
    wal: WriteAheadLog,
    producer: StreamProducer,
    resolver: Arc<dyn TrackingCodeResolver>,
    failover: Arc<FailoverQueue>,
    metrics: Arc<IngestMetrics>,
}

impl IngestFront {
    /// Wire the front to its collaborators.
    pub fn new(
        wal: WriteAheadLog,
        producer: StreamProducer,
        resolver: Arc<dyn TrackingCodeResolver>,
        failover: Arc<FailoverQueue>,
    ) -> Self {
        Self {
            wal,
            producer,
            resolver,
            failover,
            metrics: Arc::new(IngestMetrics::default()),
        }
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<IngestMetrics> {
        self.metrics.clone()
    }

    /// Admit one event: validate shape, resolve, WAL-append, publish.
    pub async fn ingest_event(&self, raw: RawEvent) -> IngestResult<IngestOutcome> {
        let Ok(kind) = EventKind::from_str(&raw.kind) else {
            self.metrics
                .dropped_validation
                .fetch_add(1, Ordering::Relaxed);
            return Ok(IngestOutcome::Dropped {
                reason: DropReason::UnknownKind(raw.kind),
            });
        };

        let tenant = raw
            .tenant_id
            .unwrap_or_else(|| DEFAULT_TENANT.to_string());
        if tenant.len() > MAX_TENANT_ID_LEN {
            self.metrics
                .dropped_validation
                .fetch_add(1, Ordering::Relaxed);
            return Ok(IngestOutcome::Dropped {
                reason: DropReason::TenantTooLong,
            });
        }

        let mut data = raw.data;
        if kind == EventKind::Click && !data.contains_key(KEY_USER_OFFER_ID) {
            let Some(code) = raw.tracking_code.as_deref() else {
                self.metrics
                    .dropped_unresolved
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(IngestOutcome::Dropped {
                    reason: DropReason::UnresolvedTrackingCode(String::new()),
                });
            };
            match self.resolver.resolve(code).await {
                Ok(Some(user_offer_id)) => {
                    data.insert(
                        KEY_USER_OFFER_ID.to_string(),
                        Value::String(user_offer_id.to_string()),
                    );
                    data.insert(
                        "tracking_code".to_string(),
                        Value::String(code.to_string()),
                    );
                }
                Ok(None) => {
                    debug!(code, "unresolved tracking code");
                    self.metrics
                        .dropped_unresolved
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(IngestOutcome::Dropped {
                        reason: DropReason::UnresolvedTrackingCode(code.to_string()),
                    });
                }
                Err(e) => {
                    warn!(code, error = %e, "resolver failed");
                    self.metrics
                        .dropped_unresolved
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(IngestOutcome::Dropped {
                        reason: DropReason::UnresolvedTrackingCode(code.to_string()),
                    });
                }
            }
        }

        // Durability first; only then downstream work.
        let record = match self.wal.append(kind, &tenant, data).await {
            Ok(record) => record,
            Err(e) if e.is_backpressure() => {
                self.metrics
                    .dropped_backpressure
                    .fetch_add(1, Ordering::Relaxed);
                return Ok(IngestOutcome::Dropped {
                    reason: DropReason::Backpressure,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = self.producer.publish(&record).await {
            // The WAL holds the event; the failover lane retries the publish.
            warn!(id = %record.id, error = %e, "publish failed; diverting to failover queue");
            self.metrics
                .publish_failovers
                .fetch_add(1, Ordering::Relaxed);
            self.failover.push(record.clone()).await;
        }

        self.metrics.admitted.fetch_add(1, Ordering::Relaxed);
        Ok(IngestOutcome::Admitted {
            id: record.id,
            seq: record.seq,
        })
    }

    /// Admit a batch; per-event failures do not abort the rest.
    pub async fn ingest_batch(&self, events: Vec<RawEvent>) -> IngestResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for raw in events.into_iter().take(MAX_BATCH_EVENTS) {
            match self.ingest_event(raw).await {
                Ok(IngestOutcome::Admitted { .. }) => outcome.processed += 1,
                Ok(IngestOutcome::Dropped { .. }) => outcome.failed += 1,
                Err(e) => {
                    warn!(error = %e, "batch event failed");
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }

    /// Decompress a gzip envelope and delegate to [`IngestFront::ingest_batch`].
    pub async fn ingest_gzip(&self, body: &[u8]) -> IngestResult<BatchOutcome> {
        let mut decoder = GzDecoder::new(body);
        let mut decoded = String::new();
        decoder
            .read_to_string(&mut decoded)
            .map_err(|e| IngestError::Decode(format!("gzip: {e}")))?;
        let envelope: BatchEnvelope = serde_json::from_str(&decoded)
            .map_err(|e| IngestError::Decode(format!("envelope: {e}")))?;
        self.ingest_batch(envelope.events).await
    }

    /// Stream one event per line; malformed lines count as failed.
    pub async fn ingest_jsonl(&self, body: &str) -> IngestResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for line in body.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RawEvent>(line) {
                Ok(raw) => match self.ingest_event(raw).await {
                    Ok(IngestOutcome::Admitted { .. }) => outcome.processed += 1,
                    Ok(IngestOutcome::Dropped { .. }) => outcome.failed += 1,
                    Err(e) => {
                        warn!(error = %e, "jsonl event failed");
                        outcome.failed += 1;
                    }
                },
                Err(_) => outcome.failed += 1,
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afftok_cache::{CacheStore, MemoryCache};
    use afftok_streams::{CONSUMER_GROUP, STREAM_CLICKS};
    use afftok_types::EventStatus;
    use afftok_wal::WalConfig;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::{json, Map};
    use std::io::Write;
    use std::time::Duration;
    use tempfile::tempdir;

    fn raw_click(code: &str) -> RawEvent {
        RawEvent {
            kind: "click".to_string(),
            tenant_id: Some("acme".to_string()),
            tracking_code: Some(code.to_string()),
            data: Map::new(),
        }
    }

    async fn front(
        dir: &std::path::Path,
        resolver: StaticResolver,
    ) -> (IngestFront, Arc<MemoryCache>, WriteAheadLog) {
        let wal = WriteAheadLog::open(WalConfig::new(dir)).await.unwrap();
        let cache = Arc::new(MemoryCache::new());
        let producer = StreamProducer::new(cache.clone());
        let (failover, _worker) = FailoverQueue::new(cache.clone(), producer.clone(), 16);
        let front = IngestFront::new(wal.clone(), producer, Arc::new(resolver), failover);
        (front, cache, wal)
    }

    #[tokio::test]
    async fn click_is_resolved_wal_appended_and_published() {
        let dir = tempdir().unwrap();
        let offer = Uuid::new_v4();
        let (front, cache, wal) =
            front(dir.path(), StaticResolver::new().with_code("abc", offer)).await;

        let outcome = front.ingest_event(raw_click("abc")).await.unwrap();
        let IngestOutcome::Admitted { id, seq } = outcome else {
            panic!("expected admission, got {outcome:?}");
        };
        assert!(seq > 0);

        let entry = wal.entry(id).await.unwrap();
        assert_eq!(entry.status, EventStatus::Pending);
        assert_eq!(
            entry.data.get(KEY_USER_OFFER_ID),
            Some(&json!(offer.to_string()))
        );

        let read = cache
            .stream_read_group(STREAM_CLICKS, CONSUMER_GROUP, "c", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn unresolved_code_is_rejected_without_wal_entry() {
        let dir = tempdir().unwrap();
        let (front, _cache, wal) = front(dir.path(), StaticResolver::new()).await;

        let outcome = front.ingest_event(raw_click("ghost")).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Dropped {
                reason: DropReason::UnresolvedTrackingCode("ghost".to_string())
            }
        );
        assert_eq!(wal.metrics().await.appended, 0);
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let dir = tempdir().unwrap();
        let (front, _cache, _wal) = front(dir.path(), StaticResolver::new()).await;
        let raw = RawEvent {
            kind: "telemetry".to_string(),
            tenant_id: None,
            tracking_code: None,
            data: Map::new(),
        };
        let outcome = front.ingest_event(raw).await.unwrap();
        assert_eq!(
            outcome,
            IngestOutcome::Dropped {
                reason: DropReason::UnknownKind("telemetry".to_string())
            }
        );
    }

    #[tokio::test]
    async fn gzip_envelope_round_trips() {
        let dir = tempdir().unwrap();
        let offer = Uuid::new_v4();
        let (front, _cache, _wal) =
            front(dir.path(), StaticResolver::new().with_code("ok", offer)).await;

        let envelope = BatchEnvelope {
            events: vec![raw_click("ok"), raw_click("missing")],
        };
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(serde_json::to_string(&envelope).unwrap().as_bytes())
            .unwrap();
        let body = encoder.finish().unwrap();

        let outcome = front.ingest_gzip(&body).await.unwrap();
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn jsonl_counts_malformed_lines_as_failed() {
        let dir = tempdir().unwrap();
        let offer = Uuid::new_v4();
        let (front, _cache, _wal) =
            front(dir.path(), StaticResolver::new().with_code("ok", offer)).await;

        let body = format!(
            "{}\nnot json at all\n{}\n",
            serde_json::to_string(&raw_click("ok")).unwrap(),
            serde_json::to_string(&RawEvent {
                kind: "edge_event".to_string(),
                tenant_id: None,
                tracking_code: None,
                data: Map::new(),
            })
            .unwrap()
        );
        let outcome = front.ingest_jsonl(&body).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.failed, 1);
    }

    #[tokio::test]
    async fn wal_backpressure_surfaces_as_dropped() {
        let dir = tempdir().unwrap();
        let offer = Uuid::new_v4();
        let mut config = WalConfig::new(dir.path());
        config.max_pending = 1;
        let wal = WriteAheadLog::open(config).await.unwrap();
        let cache = Arc::new(MemoryCache::new());
        let producer = StreamProducer::new(cache.clone());
        let (failover, _worker) = FailoverQueue::new(cache.clone(), producer.clone(), 4);
        let front = IngestFront::new(
            wal,
            producer,
            Arc::new(StaticResolver::new().with_code("ok", offer)),
            failover,
        );

        let first = front.ingest_event(raw_click("ok")).await.unwrap();
        assert!(matches!(first, IngestOutcome::Admitted { .. }));
        let second = front.ingest_event(raw_click("ok")).await.unwrap();
        assert_eq!(
            second,
            IngestOutcome::Dropped {
                reason: DropReason::Backpressure
            }
        );
        assert_eq!(
            front.metrics().dropped_backpressure.load(Ordering::Relaxed),
            1
        );
    }
}
