#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **afftok-runtime** – Process-wide service registry for the Afftok core.
//!
//! Constructs the whole pipeline once, in dependency order (cache and WAL
//! first, then streams, the failover lane, the ingest front, the batch
//! persister and finally the outbound dispatcher), spawns every worker
//! against one shared shutdown signal, and exposes handles plus a combined
//! health snapshot. No static mutable state: everything is owned here and
//! passed by handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use afftok_cache::{CacheStore, MemoryCache};
use afftok_dispatch::{
    DispatchConfig, Dispatcher, MemoryResultSink, PipelineRegistry, ResultSink,
};
use afftok_ingest::{
    CachedResolver, FailoverQueue, IngestFront, StaticResolver, TrackingCodeResolver,
};
use afftok_persist::{
    ClickStore, ClickTracker, CounterUpdater, MemoryClickStore, PersistAck, TrackerConfig,
};
use afftok_signing::{KeyRing, RequestSigner};
use afftok_streams::{
    all_streams, ConsumerConfig, LagTracker, LagTrackerConfig, MessageHandler, StreamConsumer,
    StreamProducer, STREAM_CLICKS, STREAM_CONVERSIONS, STREAM_EDGE_EVENTS, STREAM_POSTBACKS,
};
use afftok_types::{Conversion, HealthStatus, LagSnapshot, Pipeline};
use afftok_wal::{WalConfig, WalMetrics, WriteAheadLog};

pub mod handlers;

pub use handlers::{
    ClickStreamHandler, ConversionHandler, EdgeEventHandler, PostbackHandler, ReplayPublisher,
    WalPersistAck,
};

#[cfg(feature = "postgres")]
use afftok_persist::PgClickStore;

#[cfg(feature = "redis-cache")]
use afftok_cache::RedisCache;

//─────────────────────────────
//  Configuration
//─────────────────────────────

/// Cache driver selection.
#[derive(Debug, Clone)]
pub enum CacheBackend {
    /// In-process cache (single node, tests, development).
    Memory,
    /// Shared Redis cache.
    #[cfg(feature = "redis-cache")]
    Redis {
        /// Connection URL, e.g. `redis://127.0.0.1/`.
        url: String,
    },
}

/// Relational store selection.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// In-memory store (tests, development).
    Memory,
    /// Postgres store of record.
    #[cfg(feature = "postgres")]
    Postgres {
        /// Connection URL.
        url: String,
        /// Connection pool size.
        max_connections: u32,
    },
}

/// Consumer tuning shared by all four stream consumers.
#[derive(Debug, Clone)]
pub struct ConsumerTuning {
    /// Messages fetched per read.
    pub batch_size: usize,
    /// Block timeout of one read.
    pub block_timeout: Duration,
    /// Idle threshold for pending reclaim.
    pub reclaim_idle: Duration,
    /// Cadence of the reclaim pass.
    pub reclaim_interval: Duration,
}

impl Default for ConsumerTuning {
    fn default() -> Self {
        Self {
            batch_size: 16,
            block_timeout: Duration::from_secs(2),
            reclaim_idle: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
        }
    }
}

/// Everything the core needs to start.
#[derive(Clone)]
pub struct CoreConfig {
    /// WAL settings.
    pub wal: WalConfig,
    /// Cache driver.
    pub cache: CacheBackend,
    /// Relational store driver.
    pub store: StoreBackend,
    /// Pre-built store handle; overrides `store` when set (tests share a
    /// surviving database across simulated restarts).
    pub store_override: Option<Arc<dyn ClickStore>>,
    /// Batch persister settings.
    pub tracker: TrackerConfig,
    /// Dispatcher settings.
    pub dispatch: DispatchConfig,
    /// Lag tracker settings.
    pub lag: LagTrackerConfig,
    /// Stream consumer settings.
    pub consumer: ConsumerTuning,
    /// Capacity of the ingest failover lane.
    pub failover_capacity: usize,
    /// Signing secrets by handle.
    pub signing_keys: HashMap<String, String>,
    /// Pipelines known at startup.
    pub pipelines: Vec<Pipeline>,
    /// Tracking codes known at startup (development; production injects a
    /// resolver via [`CoreConfig::resolver`]).
    pub tracking_codes: HashMap<String, Uuid>,
    /// Storage-backed resolver; falls back to `tracking_codes` when absent.
    pub resolver: Option<Arc<dyn TrackingCodeResolver>>,
    /// How long shutdown waits for workers to drain.
    pub drain_timeout: Duration,
    /// Whether to replay pending WAL entries during startup.
    pub replay_on_start: bool,
}

impl CoreConfig {
    /// Defaults rooted at the given WAL directory, with memory drivers.
    pub fn new(wal_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            wal: WalConfig::new(wal_dir),
            cache: CacheBackend::Memory,
            store: StoreBackend::Memory,
            store_override: None,
            tracker: TrackerConfig::default(),
            dispatch: DispatchConfig::default(),
            lag: LagTrackerConfig::default(),
            consumer: ConsumerTuning::default(),
            failover_capacity: 10_000,
            signing_keys: HashMap::new(),
            pipelines: Vec::new(),
            tracking_codes: HashMap::new(),
            resolver: None,
            drain_timeout: Duration::from_secs(10),
            replay_on_start: true,
        }
    }
}

//─────────────────────────────
//  Health
//─────────────────────────────

/// Queue depths of one dispatcher tier.
#[derive(Debug, Clone, Serialize)]
pub struct QueueDepth {
    /// Tier name.
    pub tier: String,
    /// In-process channel depth (approximate).
    pub l1: usize,
    /// Cache sorted-set depth.
    pub l2: u64,
}

/// Combined health snapshot served by the gateway.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Overall status.
    pub status: HealthStatus,
    /// WAL statistics.
    pub wal: WalMetrics,
    /// Per-stream pending counts.
    pub lag: LagSnapshot,
    /// Dispatcher queue depths.
    pub queues: Vec<QueueDepth>,
    /// Clicks dropped on submission backpressure.
    pub dropped_clicks: u64,
    /// Tasks parked in the DLQ since startup.
    pub dead_lettered: u64,
}

//─────────────────────────────
//  The core
//─────────────────────────────

/// The assembled core: every component, every worker, one stop signal.
pub struct Core {
    wal: WriteAheadLog,
    cache: Arc<dyn CacheStore>,
    producer: StreamProducer,
    store: Arc<dyn ClickStore>,
    tracker: ClickTracker,
    counters: Arc<CounterUpdater>,
    registry: Arc<PipelineRegistry>,
    dispatcher: Arc<Dispatcher>,
    results: Arc<MemoryResultSink>,
    ingest: Arc<IngestFront>,
    signer: Arc<RequestSigner>,
    lag: LagTracker,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    drain_timeout: Duration,
}

impl Core {
    /// Construct everything in dependency order and spawn the workers.
    /// Fails fast when the cache, WAL directory or database is unusable.
    pub async fn start(config: CoreConfig) -> Result<Arc<Core>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Cache first: streams, counters and queues all sit on it.
        let cache: Arc<dyn CacheStore> = match &config.cache {
            CacheBackend::Memory => Arc::new(MemoryCache::new()),
            #[cfg(feature = "redis-cache")]
            CacheBackend::Redis { url } => Arc::new(
                RedisCache::connect(url)
                    .await
                    .context("cache unreachable at startup")?,
            ),
        };

        // Durability layer.
        let wal = WriteAheadLog::open(config.wal.clone())
            .await
            .context("WAL directory not usable")?;
        tasks.push(wal.spawn_sync_task(shutdown_rx.clone()));

        // Stream fabric and the failover lane.
        let producer = StreamProducer::new(cache.clone());
        let (failover, failover_worker) =
            FailoverQueue::new(cache.clone(), producer.clone(), config.failover_capacity);
        tasks.push(failover_worker.spawn(shutdown_rx.clone()));

        // Relational store and the batch persister.
        let store: Arc<dyn ClickStore> = match (&config.store_override, &config.store) {
            (Some(store), _) => store.clone(),
            (None, StoreBackend::Memory) => Arc::new(MemoryClickStore::new()),
            #[cfg(feature = "postgres")]
            (
                None,
                StoreBackend::Postgres {
                    url,
                    max_connections,
                },
            ) => Arc::new(
                PgClickStore::connect(url, *max_connections)
                    .await
                    .context("database not reachable or schema mismatch")?,
            ),
        };
        let counters = Arc::new(CounterUpdater::new(cache.clone(), store.clone()));
        let persist_ack: Arc<dyn PersistAck> = Arc::new(WalPersistAck::new(wal.clone()));
        let (tracker, batch_worker) = ClickTracker::new(
            store.clone(),
            cache.clone(),
            counters.clone(),
            config.tracker.clone(),
            Some(persist_ack),
        );
        tasks.push(batch_worker.spawn(shutdown_rx.clone()));

        // Outbound dispatcher.
        let registry = Arc::new(PipelineRegistry::new());
        for pipeline in &config.pipelines {
            registry.upsert(pipeline.clone()).await;
        }
        let mut ring = KeyRing::new();
        for (handle, secret) in &config.signing_keys {
            ring.insert(handle.clone(), secret.as_bytes().to_vec());
        }
        let signer = Arc::new(RequestSigner::new(ring));
        let results = Arc::new(MemoryResultSink::new());
        let results_sink: Arc<dyn ResultSink> = results.clone();
        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatch.clone(),
            registry.clone(),
            signer.clone(),
            results_sink,
            cache.clone(),
        )?);
        tasks.extend(dispatcher.spawn_workers(shutdown_rx.clone()));

        // Ingest front.
        let storage_resolver: Arc<dyn TrackingCodeResolver> =
            config.resolver.clone().unwrap_or_else(|| {
                let mut table = StaticResolver::new();
                for (code, offer) in &config.tracking_codes {
                    table = table.with_code(code.clone(), *offer);
                }
                Arc::new(table)
            });
        let resolver: Arc<dyn TrackingCodeResolver> =
            Arc::new(CachedResolver::new(cache.clone(), storage_resolver));
        let ingest = Arc::new(IngestFront::new(
            wal.clone(),
            producer.clone(),
            resolver,
            failover,
        ));

        // Stream consumers.
        let consumers: [(&str, Arc<dyn MessageHandler>, bool); 4] = [
            (
                STREAM_CLICKS,
                Arc::new(ClickStreamHandler::new(tracker.clone(), wal.clone())),
                false,
            ),
            (
                STREAM_CONVERSIONS,
                Arc::new(ConversionHandler::new(store.clone())),
                true,
            ),
            (
                STREAM_POSTBACKS,
                Arc::new(PostbackHandler::new(
                    dispatcher.clone(),
                    registry.clone(),
                    cache.clone(),
                )),
                true,
            ),
            (STREAM_EDGE_EVENTS, Arc::new(EdgeEventHandler), true),
        ];
        for (stream, handler, mark_on_ack) in consumers {
            let mut consumer_config = ConsumerConfig::new(stream);
            consumer_config.batch_size = config.consumer.batch_size;
            consumer_config.block_timeout = config.consumer.block_timeout;
            consumer_config.reclaim_idle = config.consumer.reclaim_idle;
            consumer_config.reclaim_interval = config.consumer.reclaim_interval;
            consumer_config.mark_processed_on_ack = mark_on_ack;
            let consumer = Arc::new(StreamConsumer::new(
                cache.clone(),
                wal.clone(),
                handler,
                consumer_config,
            ));
            tasks.push(consumer.spawn(shutdown_rx.clone()));
        }

        // Lag tracking.
        let lag = LagTracker::new(cache.clone(), all_streams(), config.lag.clone());
        tasks.push(lag.clone().spawn(shutdown_rx.clone()));

        let core = Arc::new(Core {
            wal,
            cache,
            producer,
            store,
            tracker,
            counters,
            registry,
            dispatcher,
            results,
            ingest,
            signer,
            lag,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            drain_timeout: config.drain_timeout,
        });

        if config.replay_on_start {
            let replayer = ReplayPublisher::new(core.producer.clone());
            let summary = core.wal.replay(&replayer).await?;
            if summary.replayed > 0 || summary.failed > 0 {
                info!(
                    replayed = summary.replayed,
                    failed = summary.failed,
                    "WAL replay finished"
                );
            }
        }

        info!("afftok core started");
        Ok(core)
    }

    /// Stop accepting new work, drain within the deadline, exit.
    pub async fn shutdown(&self) -> Result<()> {
        info!("core shutting down");
        let _ = self.shutdown_tx.send(true);
        let mut tasks = self.tasks.lock().await;
        let drain = async {
            for task in tasks.drain(..) {
                if let Err(e) = task.await {
                    warn!(error = %e, "worker ended abnormally");
                }
            }
        };
        if tokio::time::timeout(self.drain_timeout, drain).await.is_err() {
            warn!("drain deadline exceeded; remaining work is WAL-recoverable");
        }
        self.wal.sync().await?;
        info!("core stopped");
        Ok(())
    }

    /// Combined health snapshot.
    pub async fn health(&self) -> HealthSnapshot {
        let wal = self.wal.metrics().await;
        let lag = self.lag.snapshot().await;
        let queues = match self.dispatcher.queue_depths().await {
            Ok(depths) => {
                let names = ["primary", "failover", "dlq"];
                depths
                    .iter()
                    .zip(names)
                    .map(|((l1, l2), tier)| QueueDepth {
                        tier: tier.to_string(),
                        l1: *l1,
                        l2: *l2,
                    })
                    .collect()
            }
            Err(_) => Vec::new(),
        };
        let status = if self.lag.is_degraded() {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };
        HealthSnapshot {
            status,
            wal,
            lag,
            queues,
            dropped_clicks: self
                .tracker
                .metrics()
                .dropped
                .load(std::sync::atomic::Ordering::Relaxed),
            dead_lettered: self
                .dispatcher
                .metrics()
                .dead_lettered
                .load(std::sync::atomic::Ordering::Relaxed),
        }
    }

    //─────────────────────────────
    //  Inbound postback flow
    //─────────────────────────────

    /// Handle one inbound postback: resolve the click, record the
    /// conversion idempotently, and (for fresh conversions only) admit a
    /// postback event that fans out to the advertiser pipelines.
    pub async fn record_postback(
        &self,
        click_id: Uuid,
        order_id: &str,
        amount: f64,
        currency: &str,
        status: &str,
    ) -> Result<Option<PostbackRecord>> {
        let Some(click) = self
            .store
            .find_click(click_id)
            .await
            .map_err(|e| anyhow::anyhow!("click lookup failed: {e}"))?
        else {
            return Ok(None);
        };

        let conversion = Conversion {
            id: Uuid::new_v4(),
            click_id,
            order_id: order_id.to_string(),
            amount,
            currency: currency.to_string(),
            status: status.to_string(),
            created_at: chrono::Utc::now(),
        };
        let outcome = self
            .store
            .record_conversion(&conversion)
            .await
            .map_err(|e| anyhow::anyhow!("conversion insert failed: {e}"))?;
        let created = matches!(outcome, afftok_persist::ConversionOutcome::Created(_));

        if created {
            let mut data = serde_json::Map::new();
            data.insert("click_id".into(), serde_json::json!(click_id.to_string()));
            data.insert("order_id".into(), serde_json::json!(order_id));
            data.insert("amount".into(), serde_json::json!(amount));
            data.insert("currency".into(), serde_json::json!(currency));
            data.insert("status".into(), serde_json::json!(status));
            data.insert(
                "conversion_id".into(),
                serde_json::json!(outcome.conversion_id().to_string()),
            );
            data.insert(
                "user_offer_id".into(),
                serde_json::json!(click.user_offer_id.to_string()),
            );
            let raw = afftok_types::RawEvent {
                kind: "postback".to_string(),
                tenant_id: None,
                tracking_code: None,
                data,
            };
            if let Err(e) = self.ingest.ingest_event(raw).await {
                // The conversion row exists; delivery is recoverable later.
                warn!(error = %e, "postback event admission failed");
            }
        }

        Ok(Some(PostbackRecord {
            conversion_id: outcome.conversion_id(),
            created,
        }))
    }

    //─────────────────────────────
    //  Handles
    //─────────────────────────────

    /// The ingest front.
    pub fn ingest(&self) -> Arc<IngestFront> {
        self.ingest.clone()
    }

    /// The WAL.
    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    /// The shared cache.
    pub fn cache(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }

    /// The relational store.
    pub fn store(&self) -> Arc<dyn ClickStore> {
        self.store.clone()
    }

    /// The click tracker.
    pub fn tracker(&self) -> &ClickTracker {
        &self.tracker
    }

    /// Counter reads and reconciliation.
    pub fn counters(&self) -> Arc<CounterUpdater> {
        self.counters.clone()
    }

    /// The outbound dispatcher.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// The pipeline registry.
    pub fn registry(&self) -> Arc<PipelineRegistry> {
        self.registry.clone()
    }

    /// Recorded step results.
    pub fn results(&self) -> Arc<MemoryResultSink> {
        self.results.clone()
    }

    /// The request signer (also verifies inbound signatures).
    pub fn signer(&self) -> Arc<RequestSigner> {
        self.signer.clone()
    }
}

/// Outcome of an inbound postback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostbackRecord {
    /// The conversion this postback maps to (new or pre-existing).
    pub conversion_id: Uuid,
    /// Whether a new conversion row was created.
    pub created: bool,
}
