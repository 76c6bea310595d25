//! The consumer loop: block-read, dispatch, ack, reclaim.
//!
//! Acknowledgement discipline: a message is acked only after its handler
//! returned `Ok` and the WAL entry was marked processed. Malformed messages
//! are acked immediately so a poison message can never wedge the stream;
//! they are counted instead of executed. Messages a dead consumer accepted
//! but never acked are claimed back after `reclaim_idle` and reprocessed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use afftok_cache::{CacheStore, StreamEntry};
use afftok_types::EventStatus;
use afftok_wal::{WalError, WriteAheadLog};

use crate::{StreamMessage, StreamResult, CONSUMER_GROUP};

/// Handler invoked for each well-formed message.
///
/// Handlers must be idempotent on `msg.logical_id`: at-least-once delivery
/// means a message can arrive again after a reclaim.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message. `Ok` acknowledges it; `Err` leaves it pending
    /// for the reclaim loop.
    async fn handle(&self, msg: &StreamMessage) -> anyhow::Result<()>;
}

/// Consumer tuning knobs.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Stream to consume.
    pub stream: String,
    /// Consumer group name.
    pub group: String,
    /// Stable consumer id for this process's lifetime.
    pub consumer_id: String,
    /// Maximum messages fetched per read.
    pub batch_size: usize,
    /// Block timeout of one read.
    pub block_timeout: Duration,
    /// Idle threshold after which pending messages are claimed back.
    pub reclaim_idle: Duration,
    /// Cadence of the reclaim pass.
    pub reclaim_interval: Duration,
    /// When true (the default) a successful handler also marks the WAL
    /// entry processed. The click stream sets this false: its handler only
    /// queues the click, and the batch persister marks the entry once the
    /// row is durable, keeping a crash before the flush replayable.
    pub mark_processed_on_ack: bool,
}

impl ConsumerConfig {
    /// Defaults for the given stream, with a process-unique consumer id.
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: CONSUMER_GROUP.to_string(),
            consumer_id: format!("consumer-{}", Uuid::new_v4()),
            batch_size: 16,
            block_timeout: Duration::from_secs(2),
            reclaim_idle: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            mark_processed_on_ack: true,
        }
    }
}

/// Counters exposed by a consumer.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    /// Messages handled successfully and acknowledged.
    pub processed: AtomicU64,
    /// Handler failures (message left pending).
    pub failed: AtomicU64,
    /// Malformed messages acked without execution.
    pub poison: AtomicU64,
    /// Messages taken over from idle consumers.
    pub reclaimed: AtomicU64,
}

/// One stream's consumer: reads for its group, dispatches to the handler,
/// acknowledges, and periodically reclaims idle pending work.
pub struct StreamConsumer {
    cache: Arc<dyn CacheStore>,
    wal: WriteAheadLog,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    metrics: Arc<ConsumerMetrics>,
}

impl StreamConsumer {
    /// Create a consumer. `handler` receives every well-formed message.
    pub fn new(
        cache: Arc<dyn CacheStore>,
        wal: WriteAheadLog,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            cache,
            wal,
            handler,
            config,
            metrics: Arc::new(ConsumerMetrics::default()),
        }
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    /// Run until `shutdown` flips true. Interleaves block-reads with
    /// reclaim passes on their own cadence.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> StreamResult<()> {
        self.cache
            .ensure_group(&self.config.stream, &self.config.group)
            .await?;
        info!(
            stream = %self.config.stream,
            consumer = %self.config.consumer_id,
            "consumer started"
        );

        let mut reclaim_tick = tokio::time::interval(self.config.reclaim_interval);
        // The first tick fires immediately; skip it so startup reads come first.
        reclaim_tick.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(stream = %self.config.stream, "consumer stopping");
                        return Ok(());
                    }
                }
                _ = reclaim_tick.tick() => {
                    if let Err(e) = self.reclaim_pass().await {
                        warn!(stream = %self.config.stream, error = %e, "reclaim pass failed");
                    }
                }
                read = self.cache.stream_read_group(
                    &self.config.stream,
                    &self.config.group,
                    &self.config.consumer_id,
                    self.config.batch_size,
                    self.config.block_timeout,
                ) => {
                    match read {
                        Ok(entries) => {
                            for entry in entries {
                                self.process(entry).await;
                            }
                        }
                        Err(e) => {
                            warn!(stream = %self.config.stream, error = %e, "stream read failed");
                            tokio::time::sleep(Duration::from_millis(250)).await;
                        }
                    }
                }
            }
        }
    }

    /// Spawn [`StreamConsumer::run`] on the runtime.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.run(shutdown).await {
                warn!(error = %e, "consumer exited with error");
            }
        })
    }

    /// One reclaim pass: claim messages idle past the threshold and
    /// reprocess them under this consumer.
    pub async fn reclaim_pass(&self) -> StreamResult<usize> {
        let claimed = self
            .cache
            .stream_claim_idle(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer_id,
                self.config.reclaim_idle,
                self.config.batch_size,
            )
            .await?;
        let count = claimed.len();
        if count > 0 {
            info!(stream = %self.config.stream, count, "reclaimed idle messages");
            self.metrics.reclaimed.fetch_add(count as u64, Ordering::Relaxed);
        }
        for entry in claimed {
            self.process(entry).await;
        }
        Ok(count)
    }

    /// Handle one entry end to end. Never returns an error: failures are
    /// recorded and the entry is left pending for a later attempt.
    async fn process(&self, entry: StreamEntry) {
        let message: StreamMessage = match serde_json::from_str(&entry.payload) {
            Ok(message) => message,
            Err(e) => {
                // Poison message: ack so it can never loop, count, move on.
                warn!(
                    stream = %self.config.stream,
                    stream_id = %entry.id,
                    error = %e,
                    "malformed message acknowledged without execution"
                );
                self.metrics.poison.fetch_add(1, Ordering::Relaxed);
                self.ack(&entry.id).await;
                return;
            }
        };

        match self.handler.handle(&message).await {
            Ok(()) => {
                self.ack(&entry.id).await;
                if self.config.mark_processed_on_ack {
                    self.mark_processed(message.logical_id).await;
                }
                self.metrics.processed.fetch_add(1, Ordering::Relaxed);
                debug!(stream = %self.config.stream, logical_id = %message.logical_id, "processed");
            }
            Err(e) => {
                self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    stream = %self.config.stream,
                    logical_id = %message.logical_id,
                    error = %e,
                    "handler failed; message left pending"
                );
            }
        }
    }

    async fn ack(&self, id: &str) {
        if let Err(e) = self
            .cache
            .stream_ack(&self.config.stream, &self.config.group, id)
            .await
        {
            warn!(stream = %self.config.stream, stream_id = %id, error = %e, "ack failed");
        }
    }

    /// Mark the WAL entry processed. An entry that is already terminal or
    /// unknown (compacted, or written by another process) is not an error
    /// under at-least-once delivery.
    async fn mark_processed(&self, logical_id: Uuid) {
        match self.wal.mark(logical_id, EventStatus::Processed, None).await {
            Ok(())
            | Err(WalError::EntryNotFound(_))
            | Err(WalError::InvalidTransition { .. }) => {}
            Err(e) => {
                warn!(logical_id = %logical_id, error = %e, "WAL mark failed");
            }
        }
    }
}
