//! Stream lag tracking.
//!
//! Every `interval` the pending-entry count of each stream is sampled into
//! a snapshot map. A count above `warn_threshold` raises a warning-severity
//! health signal; it never blocks ingest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use afftok_cache::CacheStore;
use afftok_types::LagSnapshot;

use crate::CONSUMER_GROUP;

/// Lag tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct LagTrackerConfig {
    /// Sampling cadence.
    pub interval: Duration,
    /// Pending count above which the degraded signal raises.
    pub warn_threshold: u64,
}

impl Default for LagTrackerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            warn_threshold: 10_000,
        }
    }
}

/// Samples per-stream pending counts and exposes them as a health signal.
#[derive(Clone)]
pub struct LagTracker {
    cache: Arc<dyn CacheStore>,
    streams: Vec<String>,
    config: LagTrackerConfig,
    snapshot: Arc<RwLock<LagSnapshot>>,
    degraded: Arc<AtomicBool>,
}

impl LagTracker {
    /// Create a tracker over the given streams.
    pub fn new(
        cache: Arc<dyn CacheStore>,
        streams: impl IntoIterator<Item = impl Into<String>>,
        config: LagTrackerConfig,
    ) -> Self {
        Self {
            cache,
            streams: streams.into_iter().map(Into::into).collect(),
            config,
            snapshot: Arc::new(RwLock::new(HashMap::new())),
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Latest per-stream pending counts.
    pub async fn snapshot(&self) -> LagSnapshot {
        self.snapshot.read().await.clone()
    }

    /// Whether any stream is currently above the warning threshold.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Take one sample immediately.
    pub async fn sample(&self) {
        let mut fresh = HashMap::with_capacity(self.streams.len());
        let mut over_threshold = false;
        for stream in &self.streams {
            match self.cache.stream_pending_count(stream, CONSUMER_GROUP).await {
                Ok(count) => {
                    if count > self.config.warn_threshold {
                        over_threshold = true;
                        warn!(
                            stream = %stream,
                            pending = count,
                            threshold = self.config.warn_threshold,
                            "stream lag above threshold"
                        );
                    }
                    fresh.insert(stream.clone(), count);
                }
                Err(e) => {
                    debug!(stream = %stream, error = %e, "lag sample failed");
                }
            }
        }
        *self.snapshot.write().await = fresh;
        self.degraded.store(over_threshold, Ordering::Relaxed);
    }

    /// Spawn the sampling loop; exits when `shutdown` flips true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.config.interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => self.sample().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
