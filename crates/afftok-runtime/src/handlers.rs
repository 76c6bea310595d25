//! Stream handlers wiring the fabric to the persister and the dispatcher.
//!
//! Every handler is idempotent on the message's logical id: clicks reuse
//! it as the click row id, conversions as the conversion id, and outbound
//! submissions are gated on it in the cache.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use afftok_cache::CacheStore;
use afftok_dispatch::{DispatchError, Dispatcher, PipelineRegistry};
use afftok_ingest::KEY_USER_OFFER_ID;
use afftok_persist::{ClickStore, ClickTracker, FingerprintClaim, PersistAck, TrackOutcome};
use afftok_streams::{MessageHandler, StreamMessage, StreamProducer};
use afftok_types::{click_fingerprint, ClickEvent, Conversion, EventRecord, EventStatus};
use afftok_wal::{ReplayHandler, WalError, WriteAheadLog};

/// How long an outbound-submission gate key lives.
const SUBMIT_GATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Marks WAL entries terminal while swallowing the benign races of
/// at-least-once delivery (already terminal, already compacted).
async fn mark_quietly(wal: &WriteAheadLog, id: Uuid, status: EventStatus, error: Option<String>) {
    match wal.mark(id, status, error).await {
        Ok(())
        | Err(WalError::EntryNotFound(_))
        | Err(WalError::InvalidTransition { .. }) => {}
        Err(e) => warn!(id = %id, error = %e, "WAL mark failed"),
    }
}

//─────────────────────────────
//  Persist acknowledgement
//─────────────────────────────

/// Marks click WAL entries processed once their rows are durable.
pub struct WalPersistAck {
    wal: WriteAheadLog,
}

impl WalPersistAck {
    /// Wrap the WAL.
    pub fn new(wal: WriteAheadLog) -> Self {
        Self { wal }
    }
}

#[async_trait]
impl PersistAck for WalPersistAck {
    async fn persisted(&self, click_ids: &[Uuid]) {
        for id in click_ids {
            mark_quietly(&self.wal, *id, EventStatus::Processed, None).await;
        }
    }
}

//─────────────────────────────
//  Clicks
//─────────────────────────────

/// Builds a [`ClickEvent`] from a click stream message. The logical id
/// becomes the click id, so redeliveries collapse onto one row.
pub fn click_from_message(msg: &StreamMessage) -> Option<ClickEvent> {
    let user_offer_id: Uuid = msg
        .data
        .get(KEY_USER_OFFER_ID)?
        .as_str()?
        .parse()
        .ok()?;
    let text = |key: &str| {
        msg.data
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    let mut click = ClickEvent::new(user_offer_id);
    click.id = msg.logical_id;
    click.clicked_at = msg.ts;
    click.ip = text("ip");
    click.user_agent = text("user_agent");
    click.device = text("device");
    click.browser = text("browser");
    click.os = text("os");
    click.country = text("country");
    click.city = text("city");
    click.referrer = text("referrer");
    click.risk_score = msg
        .data
        .get("risk_score")
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32;
    let code = text("tracking_code");
    let day = msg.ts.format("%Y%m%d").to_string();
    click.fingerprint = click_fingerprint(&click.ip, &click.user_agent, &code, &day);
    Some(click)
}

/// Click stream handler: dedup gate, then the micro-batching submit path,
/// degrading to a synchronous insert when the channel is full.
pub struct ClickStreamHandler {
    tracker: ClickTracker,
    wal: WriteAheadLog,
}

impl ClickStreamHandler {
    /// Wire the handler.
    pub fn new(tracker: ClickTracker, wal: WriteAheadLog) -> Self {
        Self { tracker, wal }
    }
}

#[async_trait]
impl MessageHandler for ClickStreamHandler {
    async fn handle(&self, msg: &StreamMessage) -> anyhow::Result<()> {
        let Some(mut click) = click_from_message(msg) else {
            // Shape is broken beyond retry; terminal-fail the entry so it
            // can never loop and the segment can eventually compact.
            warn!(logical_id = %msg.logical_id, "click payload missing user-offer id");
            mark_quietly(
                &self.wal,
                msg.logical_id,
                EventStatus::Failed,
                Some("unusable click payload".to_string()),
            )
            .await;
            return Ok(());
        };

        match self
            .tracker
            .claim_fingerprint(&click.fingerprint, click.id)
            .await
        {
            FingerprintClaim::Duplicate => {
                // Deterministic outcome, no new row.
                debug!(click_id = %click.id, "duplicate click within dedup window");
                mark_quietly(&self.wal, msg.logical_id, EventStatus::Processed, None).await;
                return Ok(());
            }
            FingerprintClaim::First => click.is_unique = true,
            FingerprintClaim::Retry => {}
        }

        if self.tracker.track_async(click.clone()) == TrackOutcome::DroppedBackpressure {
            // Slow consumer must not become silent loss: persist inline.
            self.tracker
                .track_sync(&click)
                .await
                .map_err(|e| anyhow::anyhow!("synchronous click persist failed: {e}"))?;
        }
        Ok(())
    }
}

//─────────────────────────────
//  Conversions
//─────────────────────────────

/// Conversion stream handler: records conversions idempotently on
/// `(click_id, order_id)`, with the logical id as the conversion id.
pub struct ConversionHandler {
    store: Arc<dyn ClickStore>,
}

impl ConversionHandler {
    /// Wire the handler.
    pub fn new(store: Arc<dyn ClickStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl MessageHandler for ConversionHandler {
    async fn handle(&self, msg: &StreamMessage) -> anyhow::Result<()> {
        let Some(click_id) = msg
            .data
            .get("click_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok())
        else {
            warn!(logical_id = %msg.logical_id, "conversion event without click_id");
            return Ok(());
        };
        let Some(order_id) = msg.data.get("order_id").and_then(Value::as_str) else {
            warn!(logical_id = %msg.logical_id, "conversion event without order_id");
            return Ok(());
        };
        let conversion = Conversion {
            id: msg.logical_id,
            click_id,
            order_id: order_id.to_string(),
            amount: msg.data.get("amount").and_then(Value::as_f64).unwrap_or(0.0),
            currency: msg
                .data
                .get("currency")
                .and_then(Value::as_str)
                .unwrap_or("USD")
                .to_string(),
            status: msg
                .data
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or("pending")
                .to_string(),
            created_at: msg.ts,
        };
        self.store
            .record_conversion(&conversion)
            .await
            .map_err(|e| anyhow::anyhow!("conversion insert failed: {e}"))?;
        Ok(())
    }
}

//─────────────────────────────
//  Postbacks
//─────────────────────────────

/// Postback stream handler: fans one inbound postback out to the
/// advertiser's configured pipelines, gated per (logical id, pipeline) so
/// redeliveries never double-fire an execution.
pub struct PostbackHandler {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<PipelineRegistry>,
    cache: Arc<dyn CacheStore>,
}

impl PostbackHandler {
    /// Wire the handler.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<PipelineRegistry>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            dispatcher,
            registry,
            cache,
        }
    }

    fn build_context(msg: &StreamMessage) -> afftok_types::TaskContext {
        let mut context = afftok_types::TaskContext::default();
        context.postback = msg.data.clone();
        for (section, target) in [("click", true), ("conversion", false)] {
            if let Some(Value::Object(map)) = msg.data.get(section) {
                if target {
                    context.click = map.clone();
                } else {
                    context.conversion = map.clone();
                }
            }
        }
        context
    }
}

#[async_trait]
impl MessageHandler for PostbackHandler {
    async fn handle(&self, msg: &StreamMessage) -> anyhow::Result<()> {
        let advertiser_id = msg
            .data
            .get("advertiser_id")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok());

        let mut pipelines = self.registry.for_advertiser(advertiser_id).await;
        if advertiser_id.is_some() {
            // Unbound pipelines act as catch-alls.
            pipelines.extend(self.registry.for_advertiser(None).await);
        }
        if pipelines.is_empty() {
            debug!(logical_id = %msg.logical_id, "no pipelines for postback");
            return Ok(());
        }

        let context = Self::build_context(msg);
        for pipeline in pipelines {
            let gate = format!("dispatch:submitted:{}:{}", msg.logical_id, pipeline.id);
            let first = self
                .cache
                .set_if_absent(&gate, "1", Some(SUBMIT_GATE_TTL))
                .await
                .unwrap_or(true);
            if !first {
                continue;
            }
            match self
                .dispatcher
                .submit(pipeline.id, context.clone(), 0)
                .await
            {
                Ok(execution_id) => {
                    debug!(pipeline = %pipeline.id, execution = %execution_id, "postback execution submitted");
                }
                Err(DispatchError::UnknownPipeline(_)) | Err(DispatchError::EmptyPipeline(_)) => {
                    // Configuration drift between listing and submit.
                }
                Err(e) => {
                    // Free the gate so the redelivery can submit.
                    let _ = self.cache.delete(&gate).await;
                    return Err(anyhow::anyhow!("postback submission failed: {e}"));
                }
            }
        }
        Ok(())
    }
}

//─────────────────────────────
//  Edge events
//─────────────────────────────

/// Edge and API events are durable and counted; interpretation belongs to
/// external policies, so the handler only confirms receipt.
#[derive(Default)]
pub struct EdgeEventHandler;

#[async_trait]
impl MessageHandler for EdgeEventHandler {
    async fn handle(&self, msg: &StreamMessage) -> anyhow::Result<()> {
        debug!(logical_id = %msg.logical_id, kind = %msg.kind, "edge event received");
        Ok(())
    }
}

//─────────────────────────────
//  Replay
//─────────────────────────────

/// WAL replay handler: pending entries are re-published onto their
/// streams, where the normal (idempotent) consumers pick them up.
pub struct ReplayPublisher {
    producer: StreamProducer,
}

impl ReplayPublisher {
    /// Wrap the producer.
    pub fn new(producer: StreamProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl ReplayHandler for ReplayPublisher {
    async fn handle(&self, record: &EventRecord) -> anyhow::Result<()> {
        self.producer
            .publish(record)
            .await
            .map_err(|e| anyhow::anyhow!("replay publish failed: {e}"))?;
        Ok(())
    }
}
