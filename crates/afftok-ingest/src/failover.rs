//! The failover queue: a buffered, cache-mirrored retry lane between the
//! ingest front and downstream publishing.
//!
//! When a stream publish fails (cache hiccup, consumer stall), the WAL
//! already holds the event; the failover queue keeps retrying the publish
//! so downstream slowness never blocks ingest. The bounded channel spills
//! to a sorted set in the shared cache, keeping memory bounded while the
//! lane stays visible across instances.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use afftok_cache::CacheStore;
use afftok_streams::StreamProducer;
use afftok_types::EventRecord;

/// Sorted-set key of the mirrored lane.
pub const FAILOVER_KEY: &str = "ingest:failover";

/// Counters exposed by the failover queue.
#[derive(Debug, Default)]
pub struct FailoverMetrics {
    /// Records accepted into the lane.
    pub queued: AtomicU64,
    /// Records spilled to the cache mirror.
    pub spilled: AtomicU64,
    /// Publish retries performed.
    pub retried: AtomicU64,
    /// Records successfully re-published.
    pub delivered: AtomicU64,
}

/// The retry lane.
pub struct FailoverQueue {
    tx: mpsc::Sender<EventRecord>,
    cache: Arc<dyn CacheStore>,
    metrics: Arc<FailoverMetrics>,
}

impl FailoverQueue {
    /// Build the lane and its drain worker.
    pub fn new(
        cache: Arc<dyn CacheStore>,
        producer: StreamProducer,
        capacity: usize,
    ) -> (Arc<Self>, FailoverWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let metrics = Arc::new(FailoverMetrics::default());
        let queue = Arc::new(Self {
            tx,
            cache: cache.clone(),
            metrics: metrics.clone(),
        });
        let worker = FailoverWorker {
            rx,
            cache,
            producer,
            metrics,
        };
        (queue, worker)
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<FailoverMetrics> {
        self.metrics.clone()
    }

    /// Admit a record to the lane: channel first, cache mirror on full.
    pub async fn push(&self, record: EventRecord) {
        self.metrics.queued.fetch_add(1, Ordering::Relaxed);
        if let Err(send_error) = self.tx.try_send(record) {
            let record = match send_error {
                mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
            };
            self.spill(&record).await;
        }
    }

    async fn spill(&self, record: &EventRecord) {
        let score = record
            .ts
            .timestamp_nanos_opt()
            .unwrap_or_default() as f64;
        match serde_json::to_string(record) {
            Ok(member) => {
                if let Err(e) = self.cache.zadd(FAILOVER_KEY, &member, score).await {
                    // The WAL still holds the record; replay recovers it.
                    warn!(id = %record.id, error = %e, "failover spill failed");
                } else {
                    self.metrics.spilled.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) => warn!(id = %record.id, error = %e, "failover record serialization failed"),
        }
    }
}

/// Drains the lane, retrying publishes with backoff until they stick.
pub struct FailoverWorker {
    rx: mpsc::Receiver<EventRecord>,
    cache: Arc<dyn CacheStore>,
    producer: StreamProducer,
    metrics: Arc<FailoverMetrics>,
}

impl FailoverWorker {
    /// Run until `shutdown` flips true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("failover queue worker started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("failover queue worker stopped");
                        return;
                    }
                }
                received = self.rx.recv() => {
                    match received {
                        Some(record) => self.deliver(record, &mut shutdown).await,
                        None => return,
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(500)) => {
                    // Drain one spilled record per idle tick.
                    if let Ok(Some((member, _))) = self.cache.zpop_min(FAILOVER_KEY).await {
                        match serde_json::from_str::<EventRecord>(&member) {
                            Ok(record) => self.deliver(record, &mut shutdown).await,
                            Err(e) => warn!(error = %e, "discarding malformed failover record"),
                        }
                    }
                }
            }
        }
    }

    /// Spawn the worker on the runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Publish one record, retrying with capped exponential backoff until
    /// success or shutdown. The WAL guarantees nothing is lost if we exit.
    async fn deliver(&self, record: EventRecord, shutdown: &mut watch::Receiver<bool>) {
        let mut delay = Duration::from_millis(200);
        loop {
            match self.producer.publish(&record).await {
                Ok(_) => {
                    self.metrics.delivered.fetch_add(1, Ordering::Relaxed);
                    debug!(id = %record.id, "failover publish delivered");
                    return;
                }
                Err(e) => {
                    self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                    warn!(id = %record.id, error = %e, "failover publish failed; backing off");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Park it durably for the next process.
                        let score = record.ts.timestamp_nanos_opt().unwrap_or_default() as f64;
                        if let Ok(member) = serde_json::to_string(&record) {
                            let _ = self.cache.zadd(FAILOVER_KEY, &member, score).await;
                        }
                        return;
                    }
                }
            }
            delay = (delay * 2).min(Duration::from_secs(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afftok_cache::MemoryCache;
    use afftok_streams::{CONSUMER_GROUP, STREAM_CLICKS};
    use afftok_types::EventKind;
    use serde_json::Map;

    #[tokio::test]
    async fn lane_delivers_queued_records() {
        let cache = Arc::new(MemoryCache::new());
        let producer = StreamProducer::new(cache.clone());
        let (queue, worker) = FailoverQueue::new(cache.clone(), producer, 16);

        let (tx, rx) = watch::channel(false);
        let task = worker.spawn(rx);

        let record = EventRecord::new(1, EventKind::Click, "t", Map::new());
        queue.push(record).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(queue.metrics().delivered.load(Ordering::Relaxed), 1);
        let read = cache
            .stream_read_group(STREAM_CLICKS, CONSUMER_GROUP, "c", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn full_channel_spills_to_the_mirror_and_drains() {
        let cache = Arc::new(MemoryCache::new());
        let producer = StreamProducer::new(cache.clone());
        let (queue, worker) = FailoverQueue::new(cache.clone(), producer, 1);

        // No worker yet: the second push must spill.
        queue
            .push(EventRecord::new(1, EventKind::Click, "t", Map::new()))
            .await;
        queue
            .push(EventRecord::new(2, EventKind::Click, "t", Map::new()))
            .await;
        assert_eq!(queue.metrics().spilled.load(Ordering::Relaxed), 1);
        assert_eq!(cache.zcard(FAILOVER_KEY).await.unwrap(), 1);

        let (tx, rx) = watch::channel(false);
        let task = worker.spawn(rx);
        tokio::time::sleep(Duration::from_millis(1200)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(queue.metrics().delivered.load(Ordering::Relaxed), 2);
        assert_eq!(cache.zcard(FAILOVER_KEY).await.unwrap(), 0);
    }
}
