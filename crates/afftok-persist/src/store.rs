//! The `ClickStore` port and its in-memory driver.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use afftok_types::{ClickEvent, Conversion, UserOfferId};

use crate::{StoreError, StoreResult};

/// Outcome of an idempotent conversion insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionOutcome {
    /// A new conversion row was created.
    Created(Uuid),
    /// The `(click_id, order_id)` pair already existed; no new row.
    Existing(Uuid),
}

impl ConversionOutcome {
    /// The conversion id, whether fresh or pre-existing.
    pub fn conversion_id(&self) -> Uuid {
        match self {
            ConversionOutcome::Created(id) | ConversionOutcome::Existing(id) => *id,
        }
    }
}

/// The relational store the batch persister writes to.
///
/// The batch persister is the sole writer of click rows and their
/// aggregated per-user-offer stats; both land in one transaction per batch.
#[async_trait]
pub trait ClickStore: Send + Sync {
    /// Insert a batch of clicks and apply the aggregated per-user-offer
    /// click-count deltas, atomically. Each click ends up in exactly one
    /// row; a failed transaction inserts nothing.
    async fn insert_click_batch(
        &self,
        clicks: &[ClickEvent],
        counter_deltas: &HashMap<UserOfferId, i64>,
    ) -> StoreResult<()>;

    /// Number of click rows recorded for a user-offer.
    async fn click_count(&self, user_offer_id: UserOfferId) -> StoreResult<i64>;

    /// Look up one click by id.
    async fn find_click(&self, id: Uuid) -> StoreResult<Option<ClickEvent>>;

    /// Record a conversion, idempotently on `(click_id, order_id)`.
    async fn record_conversion(&self, conversion: &Conversion) -> StoreResult<ConversionOutcome>;
}

#[derive(Default)]
struct MemoryStoreInner {
    clicks: HashMap<Uuid, ClickEvent>,
    stats: HashMap<UserOfferId, i64>,
    conversions: HashMap<(Uuid, String), Conversion>,
}

/// In-memory `ClickStore` for tests and development.
///
/// `fail_next_batches` injects transaction failures so retry behaviour can
/// be exercised without a database.
#[derive(Clone, Default)]
pub struct MemoryClickStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
    fail_next: Arc<AtomicU32>,
}

impl MemoryClickStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` batch inserts fail with a database error.
    pub fn fail_next_batches(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total click rows across all user-offers.
    pub async fn total_clicks(&self) -> usize {
        self.inner.read().await.clicks.len()
    }

    /// Number of conversion rows.
    pub async fn conversion_count(&self) -> usize {
        self.inner.read().await.conversions.len()
    }
}

#[async_trait]
impl ClickStore for MemoryClickStore {
    async fn insert_click_batch(
        &self,
        clicks: &[ClickEvent],
        counter_deltas: &HashMap<UserOfferId, i64>,
    ) -> StoreResult<()> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StoreError::Database("injected transaction failure".into()));
        }
        let mut inner = self.inner.write().await;
        for click in clicks {
            inner.clicks.insert(click.id, click.clone());
        }
        for (offer, delta) in counter_deltas {
            *inner.stats.entry(*offer).or_insert(0) += delta;
        }
        Ok(())
    }

    async fn click_count(&self, user_offer_id: UserOfferId) -> StoreResult<i64> {
        let inner = self.inner.read().await;
        Ok(inner
            .clicks
            .values()
            .filter(|c| c.user_offer_id == user_offer_id)
            .count() as i64)
    }

    async fn find_click(&self, id: Uuid) -> StoreResult<Option<ClickEvent>> {
        Ok(self.inner.read().await.clicks.get(&id).cloned())
    }

    async fn record_conversion(&self, conversion: &Conversion) -> StoreResult<ConversionOutcome> {
        let mut inner = self.inner.write().await;
        let key = (conversion.click_id, conversion.order_id.clone());
        if let Some(existing) = inner.conversions.get(&key) {
            return Ok(ConversionOutcome::Existing(existing.id));
        }
        inner.conversions.insert(key, conversion.clone());
        Ok(ConversionOutcome::Created(conversion.id))
    }
}
