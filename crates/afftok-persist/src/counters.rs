//! Real-time click counters in the shared cache.
//!
//! Counters are additive and approximate: the database of record is the
//! batch persister's transactions, and [`CounterUpdater::reconcile_offer`]
//! repairs drift. On cache loss, reads degrade to database aggregation
//! (memoized for a minute), never to wrong values.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use afftok_cache::CacheStore;
use afftok_types::{ClickEvent, UserOfferId};

use crate::store::ClickStore;
use crate::StoreResult;

/// TTL of the hourly counter buckets.
pub const TTL_HOURLY: Duration = Duration::from_secs(48 * 60 * 60);
/// TTL of the daily counter buckets.
pub const TTL_DAILY: Duration = Duration::from_secs(31 * 24 * 60 * 60);
/// How long a database fallback read is memoized.
pub const FALLBACK_MEMO: Duration = Duration::from_secs(60);

/// Key of the global click total.
pub const KEY_TOTAL: &str = "counter:clicks:total";

fn offer_tag(user_offer_id: UserOfferId) -> String {
    user_offer_id.simple().to_string()[..8].to_string()
}

/// `counter:clicks:offer:<first-8-of-uuid>`
pub fn offer_key(user_offer_id: UserOfferId) -> String {
    format!("counter:clicks:offer:{}", offer_tag(user_offer_id))
}

/// `counter:clicks:hourly:<offer>:<YYYYMMDDHH>`
pub fn hourly_key(user_offer_id: UserOfferId, at: DateTime<Utc>) -> String {
    format!(
        "counter:clicks:hourly:{}:{}",
        offer_tag(user_offer_id),
        at.format("%Y%m%d%H")
    )
}

/// `counter:clicks:daily:<offer>:<YYYYMMDD>`
pub fn daily_key(user_offer_id: UserOfferId, at: DateTime<Utc>) -> String {
    format!(
        "counter:clicks:daily:{}:{}",
        offer_tag(user_offer_id),
        at.format("%Y%m%d")
    )
}

/// `counter:clicks:country:<cc>`
pub fn country_key(country: &str) -> String {
    format!("counter:clicks:country:{country}")
}

/// `counter:clicks:device:<d>`
pub fn device_key(device: &str) -> String {
    format!("counter:clicks:device:{device}")
}

/// Drift report produced by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Click rows in the database of record.
    pub database: i64,
    /// Cache counter value before reconciliation.
    pub cached: i64,
    /// `cached - database`.
    pub drift: i64,
}

/// Maintains the hot counter set and serves counter reads.
pub struct CounterUpdater {
    cache: Arc<dyn CacheStore>,
    store: Arc<dyn ClickStore>,
    memo: DashMap<UserOfferId, (Instant, i64)>,
    memo_ttl: Duration,
}

impl CounterUpdater {
    /// Create an updater over the shared cache and the store of record.
    pub fn new(cache: Arc<dyn CacheStore>, store: Arc<dyn ClickStore>) -> Self {
        Self {
            cache,
            store,
            memo: DashMap::new(),
            memo_ttl: FALLBACK_MEMO,
        }
    }

    /// Override the fallback memoization window (tests).
    pub fn with_memo_ttl(mut self, ttl: Duration) -> Self {
        self.memo_ttl = ttl;
        self
    }

    /// Apply one click to the whole counter set. Best-effort: a cache
    /// failure is logged and the database of record stays authoritative.
    pub async fn record_click(&self, click: &ClickEvent) {
        let cache = &self.cache;
        let results = [
            cache.incr_by(KEY_TOTAL, 1).await,
            cache.incr_by(&offer_key(click.user_offer_id), 1).await,
            cache
                .incr_by_with_ttl(&hourly_key(click.user_offer_id, click.clicked_at), 1, TTL_HOURLY)
                .await,
            cache
                .incr_by_with_ttl(&daily_key(click.user_offer_id, click.clicked_at), 1, TTL_DAILY)
                .await,
        ];
        for result in results {
            if let Err(e) = result {
                debug!(error = %e, "counter update failed");
            }
        }
        if !click.country.is_empty() {
            if let Err(e) = cache.incr_by(&country_key(&click.country), 1).await {
                debug!(error = %e, "country counter update failed");
            }
        }
        if !click.device.is_empty() {
            if let Err(e) = cache.incr_by(&device_key(&click.device), 1).await {
                debug!(error = %e, "device counter update failed");
            }
        }
    }

    /// Click count for a user-offer: cache first, then the database of
    /// record with a memoized result.
    pub async fn clicks_for_offer(&self, user_offer_id: UserOfferId) -> StoreResult<i64> {
        if let Ok(Some(count)) = self.cache.counter(&offer_key(user_offer_id)).await {
            return Ok(count);
        }
        if let Some(memoized) = self.memo.get(&user_offer_id) {
            let (at, count) = *memoized;
            if at.elapsed() < self.memo_ttl {
                return Ok(count);
            }
        }
        let count = self.store.click_count(user_offer_id).await?;
        self.memo.insert(user_offer_id, (Instant::now(), count));
        Ok(count)
    }

    /// Global click total from the cache; zero when the key is cold.
    pub async fn total(&self) -> i64 {
        self.cache
            .counter(KEY_TOTAL)
            .await
            .ok()
            .flatten()
            .unwrap_or(0)
    }

    /// Compare the cache counter for a user-offer against the database of
    /// record and overwrite the cache with the authoritative value.
    pub async fn reconcile_offer(&self, user_offer_id: UserOfferId) -> StoreResult<ReconcileReport> {
        let database = self.store.click_count(user_offer_id).await?;
        let cached = self
            .cache
            .counter(&offer_key(user_offer_id))
            .await
            .ok()
            .flatten()
            .unwrap_or(0);
        let drift = cached - database;
        if drift != 0 {
            let key = offer_key(user_offer_id);
            let _ = self.cache.set(&key, &database.to_string(), None).await;
        }
        self.memo.remove(&user_offer_id);
        Ok(ReconcileReport {
            database,
            cached,
            drift,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryClickStore;
    use afftok_cache::MemoryCache;
    use std::collections::HashMap;

    fn click(offer: UserOfferId) -> ClickEvent {
        let mut c = ClickEvent::new(offer);
        c.country = "DE".to_string();
        c.device = "mobile".to_string();
        c
    }

    #[tokio::test]
    async fn record_click_populates_the_whole_key_space() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryClickStore::new());
        let updater = CounterUpdater::new(cache.clone(), store);

        let offer = Uuid::new_v4();
        let c = click(offer);
        updater.record_click(&c).await;
        updater.record_click(&c).await;

        assert_eq!(cache.counter(KEY_TOTAL).await.unwrap(), Some(2));
        assert_eq!(cache.counter(&offer_key(offer)).await.unwrap(), Some(2));
        assert_eq!(
            cache
                .counter(&hourly_key(offer, c.clicked_at))
                .await
                .unwrap(),
            Some(2)
        );
        assert_eq!(
            cache.counter(&daily_key(offer, c.clicked_at)).await.unwrap(),
            Some(2)
        );
        assert_eq!(cache.counter(&country_key("DE")).await.unwrap(), Some(2));
        assert_eq!(cache.counter(&device_key("mobile")).await.unwrap(), Some(2));
    }

    #[tokio::test]
    async fn reads_fall_back_to_the_database_on_cache_loss() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryClickStore::new());
        let offer = Uuid::new_v4();
        let rows = vec![click(offer), click(offer)];
        store
            .insert_click_batch(&rows, &HashMap::from([(offer, 2i64)]))
            .await
            .unwrap();

        let updater = CounterUpdater::new(cache.clone(), store.clone());
        // Cold cache: the database answers.
        assert_eq!(updater.clicks_for_offer(offer).await.unwrap(), 2);

        // The memo answers while fresh, even if rows change underneath.
        store
            .insert_click_batch(&[click(offer)], &HashMap::from([(offer, 1i64)]))
            .await
            .unwrap();
        assert_eq!(updater.clicks_for_offer(offer).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reconcile_overwrites_cache_with_authoritative_count() {
        let cache = Arc::new(MemoryCache::new());
        let store = Arc::new(MemoryClickStore::new());
        let offer = Uuid::new_v4();
        store
            .insert_click_batch(&[click(offer)], &HashMap::from([(offer, 1i64)]))
            .await
            .unwrap();
        // Simulated drift: cache says five.
        cache.incr_by(&offer_key(offer), 5).await.unwrap();

        let updater = CounterUpdater::new(cache.clone(), store);
        let report = updater.reconcile_offer(offer).await.unwrap();
        assert_eq!(report.database, 1);
        assert_eq!(report.cached, 5);
        assert_eq!(report.drift, 4);
        assert_eq!(cache.counter(&offer_key(offer)).await.unwrap(), Some(1));
    }
}
