//! End-to-end scenarios across the whole core: crash recovery, dispatcher
//! failover, poison messages, idempotent postbacks, backpressure and
//! pending reclaim.

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::any;
use axum::Router;
use serde_json::json;
use tempfile::tempdir;
use uuid::Uuid;

use afftok_cache::{CacheStore, MemoryCache};
use afftok_persist::{
    ClickStore, ClickTracker, CounterUpdater, MemoryClickStore, TrackOutcome, TrackerConfig,
};
use afftok_runtime::Core;
use afftok_streams::{
    ConsumerConfig, MessageHandler, StreamConsumer, StreamMessage, StreamProducer,
    CONSUMER_GROUP, STREAM_EDGE_EVENTS,
};
use afftok_types::{
    BackoffMode, EventKind, Pipeline, PipelineStep, RetryPolicy, TaskContext,
};
use afftok_wal::{WalConfig, WriteAheadLog};

use common::{codes, edge_click, quick_core_config, wait_until};

//─────────────────────────────
//  Test HTTP endpoint
//─────────────────────────────

#[derive(Clone)]
struct EndpointState {
    hits: Arc<AtomicUsize>,
    status: Arc<AtomicU16>,
}

async fn endpoint(State(state): State<EndpointState>) -> StatusCode {
    state.hits.fetch_add(1, Ordering::SeqCst);
    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
}

async fn serve_endpoint(status: u16) -> (SocketAddr, EndpointState) {
    let state = EndpointState {
        hits: Arc::new(AtomicUsize::new(0)),
        status: Arc::new(AtomicU16::new(status)),
    };
    let app = Router::new()
        .route("/", any(endpoint))
        .route("/*path", any(endpoint))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

//─────────────────────────────
//  S1 - crash during batch flush
//─────────────────────────────

#[tokio::test]
async fn s1_crash_during_batch_flush_recovers_every_click() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryClickStore::new());
    let offer = Uuid::new_v4();

    // Phase one: flushes happen on batch size only, so a kill strands the
    // partial batch in memory.
    let mut config = quick_core_config(dir.path(), store.clone());
    config.tracking_codes = codes(&[("su77", offer)]);
    config.tracker.batch_size = 100;
    config.tracker.flush_interval = Duration::from_secs(60);
    let core1 = Core::start(config).await.unwrap();

    for n in 0..250 {
        core1
            .ingest()
            .ingest_event(edge_click("su77", n))
            .await
            .unwrap();
    }
    // Let the full batches land; the trailing 50 stay queued.
    let store_probe = store.clone();
    wait_until(Duration::from_secs(5), || {
        let store = store_probe.clone();
        async move { store.total_clicks().await >= 200 }
    })
    .await;

    // Kill: no shutdown, no drain. The WAL directory and the database of
    // record survive; the cache and the in-memory batch do not.
    drop(core1);

    // Phase two: restart over the same WAL dir and database.
    let mut config = quick_core_config(dir.path(), store.clone());
    config.tracking_codes = codes(&[("su77", offer)]);
    let core2 = Core::start(config).await.unwrap();

    let store_probe = store.clone();
    assert!(
        wait_until(Duration::from_secs(10), || {
            let store = store_probe.clone();
            async move { store.total_clicks().await == 250 }
        })
        .await,
        "click rows never converged to 250 (got {})",
        store.total_clicks().await
    );
    assert_eq!(store.click_count(offer).await.unwrap(), 250);

    // The counter cache died with the process; reconciliation restores the
    // authoritative value from the database of record.
    let report = core2.counters().reconcile_offer(offer).await.unwrap();
    assert_eq!(report.database, 250);
    assert_eq!(core2.counters().clicks_for_offer(offer).await.unwrap(), 250);

    core2.shutdown().await.unwrap();
}

//─────────────────────────────
//  S2 - dispatcher failover
//─────────────────────────────

#[tokio::test]
async fn s2_exhausted_primary_takes_failover_then_dlq() {
    let (primary_addr, primary) = serve_endpoint(500).await;
    let (failover_addr, failover) = serve_endpoint(500).await;

    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryClickStore::new());
    let pipeline = Pipeline {
        id: Uuid::new_v4(),
        name: "s2".into(),
        advertiser_id: None,
        steps: vec![PipelineStep::get(format!("http://{primary_addr}/hook"))],
        retry: RetryPolicy {
            mode: BackoffMode::Exponential,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(1),
            max_attempts: 3,
            jitter: 0.2,
        },
        failover_url: Some(format!("http://{failover_addr}/backup")),
    };
    let mut config = quick_core_config(dir.path(), store);
    config.pipelines = vec![pipeline.clone()];
    let core = Core::start(config).await.unwrap();

    core.dispatcher()
        .submit(pipeline.id, TaskContext::default(), 0)
        .await
        .unwrap();

    let dispatcher = core.dispatcher();
    assert!(
        wait_until(Duration::from_secs(8), || {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dlq_tasks(10).await.map(|t| t.len()).unwrap_or(0) == 1 }
        })
        .await,
        "task never reached the DLQ"
    );

    // Exactly three primary attempts, one failover attempt, one DLQ item,
    // and nothing further.
    assert_eq!(primary.hits.load(Ordering::SeqCst), 3);
    assert_eq!(failover.hits.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(primary.hits.load(Ordering::SeqCst), 3);
    assert_eq!(dispatcher.dlq_tasks(10).await.unwrap().len(), 1);

    core.shutdown().await.unwrap();
}

//─────────────────────────────
//  S3 - poison message
//─────────────────────────────

#[tokio::test]
async fn s3_poison_message_is_swallowed_and_flow_continues() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryClickStore::new());
    let offer = Uuid::new_v4();
    let mut config = quick_core_config(dir.path(), store.clone());
    config.tracking_codes = codes(&[("ok", offer)]);
    let core = Core::start(config).await.unwrap();

    // Malformed payload straight onto the click stream.
    core.cache()
        .stream_append("stream:clicks", "{definitely not a message")
        .await
        .unwrap();

    // A well-formed click after the poison one.
    core.ingest()
        .ingest_event(edge_click("ok", 1))
        .await
        .unwrap();

    let store_probe = store.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let store = store_probe.clone();
            async move { store.total_clicks().await == 1 }
        })
        .await,
        "well-formed click was not processed"
    );

    // The poison message was acknowledged, not retried forever.
    let cache = core.cache();
    assert!(
        wait_until(Duration::from_secs(2), || {
            let cache = cache.clone();
            async move {
                cache
                    .stream_pending_count("stream:clicks", CONSUMER_GROUP)
                    .await
                    .unwrap_or(u64::MAX)
                    == 0
            }
        })
        .await,
        "poison message still pending"
    );
    assert_eq!(store.total_clicks().await, 1);

    core.shutdown().await.unwrap();
}

//─────────────────────────────
//  S4 - replayed postback
//─────────────────────────────

#[tokio::test]
async fn s4_duplicate_postback_references_the_same_conversion() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryClickStore::new());
    let offer = Uuid::new_v4();
    let mut config = quick_core_config(dir.path(), store.clone());
    config.tracking_codes = codes(&[("pb", offer)]);
    let core = Core::start(config).await.unwrap();

    let click = afftok_types::ClickEvent::new(offer);
    core.tracker().track_sync(&click).await.unwrap();
    let click_id = click.id;

    let first = core
        .record_postback(click_id, "order-42", 12.5, "EUR", "approved")
        .await
        .unwrap()
        .expect("click exists");
    let second = core
        .record_postback(click_id, "order-42", 12.5, "EUR", "approved")
        .await
        .unwrap()
        .expect("click exists");

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.conversion_id, second.conversion_id);
    assert_eq!(store.conversion_count().await, 1);

    core.shutdown().await.unwrap();
}

//─────────────────────────────
//  S5 - backpressure drop vs WAL admission
//─────────────────────────────

#[tokio::test]
async fn s5_full_click_channel_drops_without_wal_entry() {
    let dir = tempdir().unwrap();
    let wal = WriteAheadLog::open(WalConfig::new(dir.path())).await.unwrap();
    let cache = Arc::new(MemoryCache::new());
    let store = Arc::new(MemoryClickStore::new());
    let counters = Arc::new(CounterUpdater::new(cache.clone(), store.clone()));
    let config = TrackerConfig {
        queue_capacity: 2,
        batch_size: 100,
        flush_interval: Duration::from_secs(60),
        ..TrackerConfig::default()
    };
    // Worker intentionally not spawned: the channel stays full.
    let (tracker, _worker) = ClickTracker::new(store, cache, counters, config, None);

    let offer = Uuid::new_v4();
    assert_eq!(
        tracker.track_async(afftok_types::ClickEvent::new(offer)),
        TrackOutcome::Queued
    );
    assert_eq!(
        tracker.track_async(afftok_types::ClickEvent::new(offer)),
        TrackOutcome::Queued
    );
    let before = wal.metrics().await.appended;
    assert_eq!(
        tracker.track_async(afftok_types::ClickEvent::new(offer)),
        TrackOutcome::DroppedBackpressure
    );
    assert_eq!(
        tracker
            .metrics()
            .dropped
            .load(std::sync::atomic::Ordering::Relaxed),
        1
    );
    // The drop never touched the WAL.
    assert_eq!(wal.metrics().await.appended, before);
}

//─────────────────────────────
//  S6 - reclaim after worker death
//─────────────────────────────

struct SetRecorder {
    seen: Mutex<Vec<Uuid>>,
}

#[async_trait::async_trait]
impl MessageHandler for SetRecorder {
    async fn handle(&self, msg: &StreamMessage) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(msg.logical_id);
        Ok(())
    }
}

#[tokio::test]
async fn s6_dead_consumer_work_is_reclaimed_exactly_once_each() {
    let dir = tempdir().unwrap();
    let wal = WriteAheadLog::open(WalConfig::new(dir.path())).await.unwrap();
    let cache = Arc::new(MemoryCache::new());
    let producer = StreamProducer::new(cache.clone());

    let mut expected = Vec::new();
    for _ in 0..10 {
        let record = wal
            .append(EventKind::EdgeEvent, "t", serde_json::Map::new())
            .await
            .unwrap();
        producer.publish(&record).await.unwrap();
        expected.push(record.id);
    }

    // A consumer reads everything and dies without acknowledging.
    let dead_read = cache
        .stream_read_group(
            STREAM_EDGE_EVENTS,
            CONSUMER_GROUP,
            "dead-consumer",
            10,
            Duration::from_millis(20),
        )
        .await
        .unwrap();
    assert_eq!(dead_read.len(), 10);

    // A living consumer reclaims after the idle threshold.
    let handler = Arc::new(SetRecorder {
        seen: Mutex::new(Vec::new()),
    });
    let mut config = ConsumerConfig::new(STREAM_EDGE_EVENTS);
    config.block_timeout = Duration::from_millis(20);
    config.reclaim_idle = Duration::from_millis(150);
    config.reclaim_interval = Duration::from_millis(60);
    let consumer = Arc::new(StreamConsumer::new(
        cache.clone(),
        wal.clone(),
        handler.clone(),
        config,
    ));

    let (tx, rx) = tokio::sync::watch::channel(false);
    let task = consumer.spawn(rx);

    let cache_probe = cache.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            let cache = cache_probe.clone();
            async move {
                cache
                    .stream_pending_count(STREAM_EDGE_EVENTS, CONSUMER_GROUP)
                    .await
                    .unwrap_or(u64::MAX)
                    == 0
            }
        })
        .await,
        "pending messages were never reclaimed"
    );
    tx.send(true).unwrap();
    task.await.unwrap();

    // Exactly the ten logical ids, each processed once.
    let mut seen = handler.seen.lock().unwrap().clone();
    seen.sort();
    let mut expected_sorted = expected.clone();
    expected_sorted.sort();
    assert_eq!(seen, expected_sorted);
}

//─────────────────────────────
//  Health surface
//─────────────────────────────

#[tokio::test]
async fn health_reports_wal_and_queue_state() {
    let dir = tempdir().unwrap();
    let store = Arc::new(MemoryClickStore::new());
    let offer = Uuid::new_v4();
    let mut config = quick_core_config(dir.path(), store);
    config.tracking_codes = codes(&[("h", offer)]);
    let core = Core::start(config).await.unwrap();

    core.ingest().ingest_event(edge_click("h", 1)).await.unwrap();
    let snapshot = core.health().await;
    assert_eq!(
        serde_json::to_value(&snapshot).unwrap()["status"],
        json!("ok")
    );
    assert!(snapshot.wal.appended >= 1);
    assert_eq!(snapshot.queues.len(), 3);

    core.shutdown().await.unwrap();
}
