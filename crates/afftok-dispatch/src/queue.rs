//! Two-layer tiered task queues.
//!
//! L1 is a bounded in-process channel; L2 is a priority sorted set in the
//! shared cache keyed by `priority·10^12 + created_unix_nanos`. Producers
//! try L1 first and spill to L2 when it is full; consumers drain L1 first
//! and fall back to the highest-priority L2 item on timeout. Memory stays
//! bounded and spilled work is visible to every instance.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use afftok_cache::CacheStore;
use afftok_types::{PostbackTask, QueueTier};

use crate::DispatchResult;

/// Primary tier sorted-set key.
pub const QUEUE_PRIMARY: &str = "webhook:queue:primary";
/// Failover tier sorted-set key.
pub const QUEUE_FAILOVER: &str = "webhook:queue:failover";
/// DLQ sorted-set key.
pub const QUEUE_DLQ: &str = "webhook:queue:dlq";

/// The L2 sorted-set key of a tier.
pub fn queue_key(tier: QueueTier) -> &'static str {
    match tier {
        QueueTier::Primary => QUEUE_PRIMARY,
        QueueTier::Failover => QUEUE_FAILOVER,
        QueueTier::Dlq => QUEUE_DLQ,
    }
}

/// One tier's two-layer queue.
pub struct TieredQueue {
    tier: QueueTier,
    tx: mpsc::Sender<PostbackTask>,
    rx: Mutex<mpsc::Receiver<PostbackTask>>,
    cache: Arc<dyn CacheStore>,
    l1_depth: AtomicUsize,
}

impl TieredQueue {
    /// Create the queue with the given L1 capacity.
    pub fn new(tier: QueueTier, capacity: usize, cache: Arc<dyn CacheStore>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tier,
            tx,
            rx: Mutex::new(rx),
            cache,
            l1_depth: AtomicUsize::new(0),
        }
    }

    /// The tier this queue serves.
    pub fn tier(&self) -> QueueTier {
        self.tier
    }

    /// Enqueue a task: L1 first, L2 spill when full.
    pub async fn push(&self, task: PostbackTask) -> DispatchResult<()> {
        match self.tx.try_send(task) {
            Ok(()) => {
                self.l1_depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(task))
            | Err(mpsc::error::TrySendError::Closed(task)) => self.spill(task).await,
        }
    }

    /// Put a task directly into the L2 lane (used for future-dated retries
    /// so L1 stays free for runnable work).
    pub async fn push_l2(&self, task: &PostbackTask) -> DispatchResult<()> {
        self.spill_ref(task).await
    }

    /// Dequeue from L1 only, with a timeout. The DLQ parking pool uses
    /// this so it never churns the durable L2 lane.
    pub async fn pop_l1(&self, timeout: Duration) -> Option<PostbackTask> {
        let mut rx = self.rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(task)) => {
                self.l1_depth.fetch_sub(1, Ordering::Relaxed);
                Some(task)
            }
            _ => None,
        }
    }

    /// Dequeue: L1 with a timeout, then the lowest-scored L2 item.
    pub async fn pop(&self, timeout: Duration) -> DispatchResult<Option<PostbackTask>> {
        if let Some(task) = self.pop_l1(timeout).await {
            return Ok(Some(task));
        }
        let Some((member, _score)) = self.cache.zpop_min(queue_key(self.tier)).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<PostbackTask>(&member) {
            Ok(task) => Ok(Some(task)),
            Err(e) => {
                // A malformed L2 member can only loop; drop it loudly.
                warn!(tier = %self.tier, error = %e, "discarding malformed L2 task");
                Ok(None)
            }
        }
    }

    /// Approximate L1 depth and exact L2 depth.
    pub async fn depth(&self) -> DispatchResult<(usize, u64)> {
        let l2 = self.cache.zcard(queue_key(self.tier)).await?;
        Ok((self.l1_depth.load(Ordering::Relaxed), l2))
    }

    async fn spill(&self, task: PostbackTask) -> DispatchResult<()> {
        self.spill_ref(&task).await
    }

    async fn spill_ref(&self, task: &PostbackTask) -> DispatchResult<()> {
        let member = serde_json::to_string(task)?;
        self.cache
            .zadd(queue_key(self.tier), &member, task.score())
            .await?;
        debug!(tier = %self.tier, task_id = %task.task_id, "task spilled to L2");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afftok_cache::MemoryCache;
    use afftok_types::{Pipeline, PipelineStep, RetryPolicy, TaskContext};
    use uuid::Uuid;

    fn task(priority: i64) -> PostbackTask {
        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            name: "t".into(),
            advertiser_id: None,
            steps: vec![PipelineStep::get("https://example.com")],
            retry: RetryPolicy::default(),
            failover_url: None,
        };
        PostbackTask::first_step(&pipeline, TaskContext::default(), priority)
    }

    #[tokio::test]
    async fn l1_serves_before_l2() {
        let cache = Arc::new(MemoryCache::new());
        let queue = TieredQueue::new(QueueTier::Primary, 10, cache);
        let first = task(0);
        queue.push(first.clone()).await.unwrap();
        let popped = queue.pop(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(popped.task_id, first.task_id);
        assert!(queue.pop(Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn full_l1_spills_to_l2_and_pops_by_priority() {
        let cache = Arc::new(MemoryCache::new());
        let queue = TieredQueue::new(QueueTier::Primary, 1, cache.clone());

        let occupant = task(5);
        queue.push(occupant.clone()).await.unwrap();

        let urgent = task(0);
        let casual = task(9);
        queue.push(casual.clone()).await.unwrap();
        queue.push(urgent.clone()).await.unwrap();

        let (l1, l2) = queue.depth().await.unwrap();
        assert_eq!(l1, 1);
        assert_eq!(l2, 2);

        // L1 occupant first, then L2 in priority order.
        assert_eq!(
            queue.pop(Duration::from_millis(5)).await.unwrap().unwrap().task_id,
            occupant.task_id
        );
        assert_eq!(
            queue.pop(Duration::from_millis(5)).await.unwrap().unwrap().task_id,
            urgent.task_id
        );
        assert_eq!(
            queue.pop(Duration::from_millis(5)).await.unwrap().unwrap().task_id,
            casual.task_id
        );
    }

    #[tokio::test]
    async fn malformed_l2_members_are_discarded() {
        let cache = Arc::new(MemoryCache::new());
        cache.zadd(QUEUE_PRIMARY, "junk", 1.0).await.unwrap();
        let queue = TieredQueue::new(QueueTier::Primary, 1, cache.clone());
        assert!(queue.pop(Duration::from_millis(5)).await.unwrap().is_none());
        assert_eq!(cache.zcard(QUEUE_PRIMARY).await.unwrap(), 0);
    }
}
