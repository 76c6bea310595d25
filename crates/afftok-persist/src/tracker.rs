//! The async submit path and the batch worker.
//!
//! `track_async` returns in microseconds: it fires the cache counter
//! update and attempts a non-blocking enqueue. A full channel is a dropped
//! submission surfaced as a backpressure metric; the WAL already holds the
//! event, so replay recovers it. The worker drains the channel into one
//! bounded transaction per batch: a bulk click insert plus per-user-offer
//! counter increments aggregated by destination id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use afftok_cache::CacheStore;
use afftok_types::{ClickEvent, UserOfferId};

use crate::counters::CounterUpdater;
use crate::store::ClickStore;
use crate::StoreResult;

/// Notified once clicks are durably in the store of record. The WAL mark
/// for a click is deferred to this point so a crash between queue
/// admission and the batch flush stays replayable.
#[async_trait]
pub trait PersistAck: Send + Sync {
    /// The given click ids are now in the database.
    async fn persisted(&self, click_ids: &[Uuid]);
}

/// Outcome of claiming a click fingerprint within the dedup window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintClaim {
    /// First sighting within the window.
    First,
    /// The same click claimed it before: an at-least-once redelivery.
    Retry,
    /// A different click holds the fingerprint: a true duplicate.
    Duplicate,
}

/// Batch persister tuning knobs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Capacity of the in-memory submission channel.
    pub queue_capacity: usize,
    /// Clicks per transaction.
    pub batch_size: usize,
    /// Maximum time a partial batch waits before flushing.
    pub flush_interval: Duration,
    /// Window of the fingerprint dedup key.
    pub dedup_window: Duration,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 50_000,
            batch_size: 100,
            flush_interval: Duration::from_millis(100),
            dedup_window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Outcome of an async submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackOutcome {
    /// The click is queued for the next batch.
    Queued,
    /// The channel was full; the click was dropped and counted.
    DroppedBackpressure,
}

/// Counters exposed by the tracker and its worker.
#[derive(Debug, Default)]
pub struct TrackerMetrics {
    /// Clicks accepted into the channel.
    pub submitted: AtomicU64,
    /// Clicks dropped on a full channel.
    pub dropped: AtomicU64,
    /// Batches flushed.
    pub batches_flushed: AtomicU64,
    /// Click rows persisted.
    pub clicks_persisted: AtomicU64,
    /// Batch transactions retried once after a failure.
    pub batch_retries: AtomicU64,
    /// Batches lost after the retry also failed (WAL replay recovers them).
    pub batches_failed: AtomicU64,
}

/// Submission facade for the batch persister.
#[derive(Clone)]
pub struct ClickTracker {
    tx: mpsc::Sender<ClickEvent>,
    cache: Arc<dyn CacheStore>,
    counters: Arc<CounterUpdater>,
    store: Arc<dyn ClickStore>,
    config: TrackerConfig,
    metrics: Arc<TrackerMetrics>,
    ack: Option<Arc<dyn PersistAck>>,
}

impl ClickTracker {
    /// Build the tracker and its worker. The worker must be spawned for
    /// batches to flush. `ack` is notified once rows are durable.
    pub fn new(
        store: Arc<dyn ClickStore>,
        cache: Arc<dyn CacheStore>,
        counters: Arc<CounterUpdater>,
        config: TrackerConfig,
        ack: Option<Arc<dyn PersistAck>>,
    ) -> (Self, BatchWorker) {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let metrics = Arc::new(TrackerMetrics::default());
        let tracker = Self {
            tx,
            cache,
            counters: counters.clone(),
            store: store.clone(),
            config: config.clone(),
            metrics: metrics.clone(),
            ack: ack.clone(),
        };
        let worker = BatchWorker {
            rx,
            store,
            config,
            metrics,
            ack,
        };
        (tracker, worker)
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<TrackerMetrics> {
        self.metrics.clone()
    }

    /// Submit a click without blocking. Fills defaults (id, UTC time),
    /// fires the cache counter update, and enqueues. The caller's latency
    /// is unaffected by a full channel: the drop is counted and returned.
    pub fn track_async(&self, mut click: ClickEvent) -> TrackOutcome {
        if click.id.is_nil() {
            click.id = uuid::Uuid::new_v4();
        }

        // Fire-and-forget counter update; the DB transaction is the record.
        let counters = self.counters.clone();
        let counted = click.clone();
        tokio::spawn(async move {
            counters.record_click(&counted).await;
        });

        match self.tx.try_send(click) {
            Ok(()) => {
                self.metrics.submitted.fetch_add(1, Ordering::Relaxed);
                TrackOutcome::Queued
            }
            Err(_) => {
                self.metrics.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("click channel full; submission dropped");
                TrackOutcome::DroppedBackpressure
            }
        }
    }

    /// Persist one click synchronously, bypassing the batch channel. This
    /// is the degrade path the ingest front uses when the channel is full,
    /// and the path WAL replay drives.
    pub async fn track_sync(&self, click: &ClickEvent) -> StoreResult<()> {
        let deltas = HashMap::from([(click.user_offer_id, 1i64)]);
        self.store
            .insert_click_batch(std::slice::from_ref(click), &deltas)
            .await?;
        self.counters.record_click(click).await;
        if let Some(ack) = &self.ack {
            ack.persisted(&[click.id]).await;
        }
        Ok(())
    }

    /// Dedup gate over the click fingerprint. The claiming click's id is
    /// stored as the key's value, so an at-least-once redelivery of the
    /// same click is distinguishable from a true duplicate. Cache failures
    /// count as first so a cache outage never drops clicks.
    pub async fn claim_fingerprint(&self, fingerprint: &str, click_id: Uuid) -> FingerprintClaim {
        let key = format!("dedup:click:{fingerprint}");
        let claimed = self
            .cache
            .set_if_absent(&key, &click_id.to_string(), Some(self.config.dedup_window))
            .await
            .unwrap_or(true);
        if claimed {
            return FingerprintClaim::First;
        }
        match self.cache.get(&key).await {
            Ok(Some(holder)) if holder == click_id.to_string() => FingerprintClaim::Retry,
            Ok(_) => FingerprintClaim::Duplicate,
            Err(_) => FingerprintClaim::First,
        }
    }

    /// Read-side counter access (cache first, memoized DB fallback).
    pub fn counters(&self) -> Arc<CounterUpdater> {
        self.counters.clone()
    }
}

/// Drains the submission channel into bounded transactions.
pub struct BatchWorker {
    rx: mpsc::Receiver<ClickEvent>,
    store: Arc<dyn ClickStore>,
    config: TrackerConfig,
    metrics: Arc<TrackerMetrics>,
    ack: Option<Arc<dyn PersistAck>>,
}

impl BatchWorker {
    /// Run until the channel closes or `shutdown` flips true. On shutdown
    /// the channel is drained and the final partial batch flushed.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut batch: Vec<ClickEvent> = Vec::with_capacity(self.config.batch_size);
        let mut tick = tokio::time::interval(self.config.flush_interval);
        info!(
            batch_size = self.config.batch_size,
            flush_ms = self.config.flush_interval.as_millis() as u64,
            "batch worker started"
        );

        loop {
            tokio::select! {
                received = self.rx.recv() => {
                    match received {
                        Some(click) => {
                            batch.push(click);
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            info!("click channel closed; batch worker exiting");
                            return;
                        }
                    }
                }
                _ = tick.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain whatever is already queued, then flush.
                        while let Ok(click) = self.rx.try_recv() {
                            batch.push(click);
                            if batch.len() >= self.config.batch_size {
                                self.flush(&mut batch).await;
                            }
                        }
                        self.flush(&mut batch).await;
                        info!("batch worker stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Spawn the worker on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Issue one transaction for the accumulated batch: bulk insert plus
    /// counter deltas aggregated by user-offer. Retried once; a second
    /// failure is surfaced in metrics and logs, and WAL replay recovers
    /// the rows.
    async fn flush(&self, batch: &mut Vec<ClickEvent>) {
        if batch.is_empty() {
            return;
        }
        let mut deltas: HashMap<UserOfferId, i64> = HashMap::new();
        for click in batch.iter() {
            *deltas.entry(click.user_offer_id).or_insert(0) += 1;
        }

        let size = batch.len();
        let mut persisted = false;
        match self.store.insert_click_batch(batch, &deltas).await {
            Ok(()) => persisted = true,
            Err(first) => {
                warn!(size, error = %first, "batch transaction failed; retrying once");
                self.metrics.batch_retries.fetch_add(1, Ordering::Relaxed);
                match self.store.insert_click_batch(batch, &deltas).await {
                    Ok(()) => persisted = true,
                    Err(second) => {
                        error!(size, error = %second, "batch lost after retry; WAL replay will recover");
                        self.metrics.batches_failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
        if persisted {
            self.metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .clicks_persisted
                .fetch_add(size as u64, Ordering::Relaxed);
            debug!(size, "batch flushed");
            if let Some(ack) = &self.ack {
                let ids: Vec<Uuid> = batch.iter().map(|c| c.id).collect();
                ack.persisted(&ids).await;
            }
        }
        batch.clear();
    }
}
