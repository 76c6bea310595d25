#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-types** – Shared primitive data structures for the Afftok core.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that *every* other crate can depend on it without causing cycles.
//! It defines the event vocabulary (kinds, statuses, records), the click and
//! conversion shapes carried by the batch persister, and the postback task
//! and pipeline configuration consumed by the outbound dispatcher.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub mod task;

pub use task::{
    BackoffMode, Pipeline, PipelineStep, PostbackTask, QueueTier, RetryPolicy, SigningMode,
    StepOutcome, StepResult, TaskContext,
};

//─────────────────────────────
//  Limits
//─────────────────────────────

/// Maximum serialized payload size accepted into the WAL, to prevent a single
/// oversized event from exhausting memory or blowing up a segment.
pub const MAX_PAYLOAD_BYTES: usize = 262_144; // 256 KiB

/// Maximum length of a tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Maximum number of events accepted in one batch envelope.
pub const MAX_BATCH_EVENTS: usize = 10_000;

//─────────────────────────────
//  Identifiers
//─────────────────────────────

/// Unique identifier of a WAL entry and its corresponding stream message.
pub type EventId = Uuid;

/// Internal identifier of a user-offer link (a promoter's enrolment in an
/// offer). Tracking codes resolve to this.
pub type UserOfferId = Uuid;

/// Opaque tenant identifier carried on every event.
pub type TenantId = String;

//─────────────────────────────
//  Event kinds
//─────────────────────────────

/// Closed set of event kinds flowing through the core.
///
/// The wire and the WAL use the snake_case string tags; in-process code uses
/// this variant so that a typo'd kind cannot exist past the ingest boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Edge or API click on a tracking link.
    Click,
    /// Conversion reported for a previously recorded click.
    Conversion,
    /// Inbound advertiser postback.
    Postback,
    /// Event submitted through the backend API.
    ApiEvent,
    /// Event submitted through the edge batch endpoint.
    EdgeEvent,
}

impl EventKind {
    /// The wire tag for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Click => "click",
            EventKind::Conversion => "conversion",
            EventKind::Postback => "postback",
            EventKind::ApiEvent => "api_event",
            EventKind::EdgeEvent => "edge_event",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = UnknownEventKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "click" => Ok(EventKind::Click),
            "conversion" => Ok(EventKind::Conversion),
            "postback" => Ok(EventKind::Postback),
            "api_event" => Ok(EventKind::ApiEvent),
            "edge_event" => Ok(EventKind::EdgeEvent),
            other => Err(UnknownEventKind(other.to_string())),
        }
    }
}

/// Error returned when a wire tag does not name a known event kind.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown event kind: {0}")]
pub struct UnknownEventKind(pub String);

//─────────────────────────────
//  Event status
//─────────────────────────────

/// Processing status of a WAL entry.
///
/// Transitions are monotone: `Pending` may move to any terminal state, and
/// terminal states never regress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    /// Appended but not yet handled downstream.
    Pending,
    /// Handled successfully by its consumer.
    Processed,
    /// Handling failed terminally.
    Failed,
    /// Re-delivered and handled during WAL replay.
    Replayed,
}

impl EventStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, EventStatus::Pending)
    }

    /// Whether the monotone status rule allows moving to `next`.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        match self {
            EventStatus::Pending => true,
            // Terminal states only allow self-transitions (idempotent marks).
            current => *current == next,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventStatus::Pending => "pending",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
            EventStatus::Replayed => "replayed",
        };
        f.write_str(s)
    }
}

//─────────────────────────────
//  WAL entry record
//─────────────────────────────

/// One durable event record, as appended to (and read back from) the WAL.
///
/// Serialized as a single JSONL line; the field names below are the on-disk
/// format. The checksum covers identity, ordering and payload so that any
/// bit flip in a segment is caught on read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Unique event identifier.
    pub id: EventId,
    /// Strictly increasing per-process sequence number.
    pub seq: u64,
    /// Event kind wire tag.
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Current processing status.
    pub status: EventStatus,
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Append timestamp, nanosecond precision UTC.
    pub ts: DateTime<Utc>,
    /// Arbitrary event payload.
    pub data: Map<String, Value>,
    /// First 8 bytes of SHA-256 over the identity fields, hex encoded.
    pub checksum: String,
    /// Number of delivery attempts made so far.
    pub attempts: u32,
    /// Timestamp of the most recent delivery attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<DateTime<Utc>>,
    /// Error message of the most recent failed attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EventRecord {
    /// Build a new pending record and stamp its checksum.
    pub fn new(
        seq: u64,
        kind: EventKind,
        tenant_id: impl Into<TenantId>,
        data: Map<String, Value>,
    ) -> Self {
        let mut record = Self {
            id: Uuid::new_v4(),
            seq,
            kind,
            status: EventStatus::Pending,
            tenant_id: tenant_id.into(),
            ts: Utc::now(),
            data,
            checksum: String::new(),
            attempts: 0,
            last_attempt: None,
            error: None,
        };
        record.checksum = record.compute_checksum();
        record
    }

    /// Compute the checksum for this record: the first 8 bytes of SHA-256
    /// over `id‖seq‖kind‖tenant‖ts_nanos‖canonical payload`, hex encoded.
    ///
    /// `serde_json::Map` keeps keys sorted, so serializing `data` yields a
    /// canonical byte sequence.
    pub fn compute_checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(self.seq.to_be_bytes());
        hasher.update(self.kind.as_str().as_bytes());
        hasher.update(self.tenant_id.as_bytes());
        hasher.update(
            self.ts
                .timestamp_nanos_opt()
                .unwrap_or_default()
                .to_be_bytes(),
        );
        let payload = serde_json::to_vec(&self.data).unwrap_or_default();
        hasher.update(&payload);
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }

    /// Recompute the checksum and compare against the stored one.
    pub fn verify_integrity(&self) -> bool {
        self.compute_checksum() == self.checksum
    }
}

//─────────────────────────────
//  Click and conversion shapes
//─────────────────────────────

/// A single click in the form consumed by the batch persister.
///
/// The fingerprint is a deterministic hash of (IP, user agent, tracking
/// code, date bucket) used for the dedup window; `clicked_at` is always UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickEvent {
    /// Internal click identifier, pre-assigned on submission.
    pub id: Uuid,
    /// Resolved user-offer link this click belongs to.
    pub user_offer_id: UserOfferId,
    /// Client IP address.
    pub ip: String,
    /// Raw user-agent header.
    pub user_agent: String,
    /// Parsed device class, e.g. `mobile` or `desktop`.
    pub device: String,
    /// Parsed browser family.
    pub browser: String,
    /// Parsed operating system.
    pub os: String,
    /// ISO 3166-1 alpha-2 country code, empty when unknown.
    pub country: String,
    /// City name, empty when unknown.
    pub city: String,
    /// Dedup fingerprint (see [`click_fingerprint`]).
    pub fingerprint: String,
    /// Referrer URL, empty when absent.
    pub referrer: String,
    /// Click wall-clock time, UTC.
    pub clicked_at: DateTime<Utc>,
    /// Whether this click was the first within the dedup window.
    pub is_unique: bool,
    /// Risk score assigned by an external policy, 0.0 when unscored.
    pub risk_score: f32,
}

impl ClickEvent {
    /// Create a click with defaults filled: fresh id, current UTC time,
    /// unique until the dedup check says otherwise.
    pub fn new(user_offer_id: UserOfferId) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_offer_id,
            ip: String::new(),
            user_agent: String::new(),
            device: String::new(),
            browser: String::new(),
            os: String::new(),
            country: String::new(),
            city: String::new(),
            fingerprint: String::new(),
            referrer: String::new(),
            clicked_at: Utc::now(),
            is_unique: true,
            risk_score: 0.0,
        }
    }
}

/// Deterministic dedup fingerprint over (IP, user agent, tracking code,
/// date bucket). The date bucket is the UTC day, so the same visitor
/// clicking the same link twice in one day collapses to one fingerprint.
pub fn click_fingerprint(ip: &str, user_agent: &str, tracking_code: &str, day: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    hasher.update(b"|");
    hasher.update(tracking_code.as_bytes());
    hasher.update(b"|");
    hasher.update(day.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

/// A conversion recorded against a click.
///
/// Idempotent on `(click_id, order_id)`: recording the same pair twice
/// yields the original conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversion {
    /// Conversion identifier.
    pub id: Uuid,
    /// The click this conversion attributes to.
    pub click_id: Uuid,
    /// Advertiser-side order identifier.
    pub order_id: String,
    /// Conversion amount in `currency` units.
    pub amount: f64,
    /// ISO 4217 currency code.
    pub currency: String,
    /// Advertiser-reported status, e.g. `approved` or `pending`.
    pub status: String,
    /// Recording time, UTC.
    pub created_at: DateTime<Utc>,
}

//─────────────────────────────
//  Ingest wire shapes
//─────────────────────────────

/// An event as it arrives on the wire, before normalization.
///
/// `kind` is the untrusted string tag; the ingest front converts it to
/// [`EventKind`] or rejects the event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Claimed event kind tag.
    #[serde(rename = "type")]
    pub kind: String,
    /// Tenant the event belongs to.
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    /// Tracking code for click events arriving from the edge.
    #[serde(default)]
    pub tracking_code: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Batch envelope accepted by the edge endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchEnvelope {
    /// The events in submission order.
    pub events: Vec<RawEvent>,
}

//─────────────────────────────
//  Health
//─────────────────────────────

/// Overall health state surfaced by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// All components within thresholds.
    Ok,
    /// One or more warning signals raised (e.g. stream lag); ingest continues.
    Degraded,
}

/// Per-stream lag snapshot, keyed by stream name.
pub type LagSnapshot = HashMap<String, u64>;

/// Serde helper for durations expressed in milliseconds in config files.
pub mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a duration as integer milliseconds.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    /// Deserialize integer milliseconds into a duration.
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trip() {
        for kind in [
            EventKind::Click,
            EventKind::Conversion,
            EventKind::Postback,
            EventKind::ApiEvent,
            EventKind::EdgeEvent,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert!("clicks".parse::<EventKind>().is_err());
    }

    #[test]
    fn status_transitions_are_monotone() {
        assert!(EventStatus::Pending.can_transition_to(EventStatus::Processed));
        assert!(EventStatus::Pending.can_transition_to(EventStatus::Failed));
        assert!(EventStatus::Pending.can_transition_to(EventStatus::Replayed));
        assert!(!EventStatus::Processed.can_transition_to(EventStatus::Pending));
        assert!(!EventStatus::Processed.can_transition_to(EventStatus::Failed));
        // Idempotent re-mark is allowed.
        assert!(EventStatus::Failed.can_transition_to(EventStatus::Failed));
    }

    #[test]
    fn record_checksum_detects_tampering() {
        let mut data = Map::new();
        data.insert("offer".to_string(), Value::String("summer".to_string()));
        let record = EventRecord::new(7, EventKind::Click, "tenant-1", data);
        assert!(record.verify_integrity());

        let mut tampered = record.clone();
        tampered
            .data
            .insert("offer".to_string(), Value::String("winter".to_string()));
        assert!(!tampered.verify_integrity());

        let mut reordered = record;
        reordered.seq += 1;
        assert!(!reordered.verify_integrity());
    }

    #[test]
    fn record_serializes_with_wire_field_names() {
        let record = EventRecord::new(1, EventKind::EdgeEvent, "t", Map::new());
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "edge_event");
        assert_eq!(json["status"], "pending");
        assert!(json.get("seq").is_some());
        assert!(json.get("checksum").is_some());
    }

    #[test]
    fn fingerprint_is_deterministic_and_bucketed() {
        let a = click_fingerprint("1.2.3.4", "UA", "code", "20260801");
        let b = click_fingerprint("1.2.3.4", "UA", "code", "20260801");
        let c = click_fingerprint("1.2.3.4", "UA", "code", "20260802");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
