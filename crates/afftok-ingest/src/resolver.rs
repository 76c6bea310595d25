//! Tracking-code resolution.
//!
//! An edge click carries an opaque tracking code issued at link creation;
//! it must resolve to an internal user-offer id before the event is
//! admitted. Resolution is a port so the admin plane can plug its own
//! storage; the cache wrapper keeps hot codes off that storage.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use afftok_cache::CacheStore;
use afftok_types::UserOfferId;

/// How long a resolved code stays cached.
const RESOLUTION_TTL: Duration = Duration::from_secs(60 * 60);

fn cache_key(code: &str) -> String {
    format!("link:code:{code}")
}

/// Resolves tracking codes to user-offer ids.
#[async_trait]
pub trait TrackingCodeResolver: Send + Sync {
    /// `None` means the code is unknown; the event must not be admitted.
    async fn resolve(&self, code: &str) -> anyhow::Result<Option<UserOfferId>>;
}

/// Cache-first wrapper around another resolver.
pub struct CachedResolver {
    cache: Arc<dyn CacheStore>,
    inner: Arc<dyn TrackingCodeResolver>,
}

impl CachedResolver {
    /// Wrap `inner` with the shared cache.
    pub fn new(cache: Arc<dyn CacheStore>, inner: Arc<dyn TrackingCodeResolver>) -> Self {
        Self { cache, inner }
    }
}

#[async_trait]
impl TrackingCodeResolver for CachedResolver {
    async fn resolve(&self, code: &str) -> anyhow::Result<Option<UserOfferId>> {
        let key = cache_key(code);
        if let Ok(Some(cached)) = self.cache.get(&key).await {
            if let Ok(id) = cached.parse::<Uuid>() {
                return Ok(Some(id));
            }
        }
        let resolved = self.inner.resolve(code).await?;
        if let Some(id) = resolved {
            if let Err(e) = self
                .cache
                .set(&key, &id.to_string(), Some(RESOLUTION_TTL))
                .await
            {
                debug!(code, error = %e, "failed to cache resolution");
            }
        }
        Ok(resolved)
    }
}

/// Fixed-table resolver for tests and development.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    codes: HashMap<String, UserOfferId>,
}

impl StaticResolver {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one code.
    pub fn with_code(mut self, code: impl Into<String>, user_offer_id: UserOfferId) -> Self {
        self.codes.insert(code.into(), user_offer_id);
        self
    }
}

#[async_trait]
impl TrackingCodeResolver for StaticResolver {
    async fn resolve(&self, code: &str) -> anyhow::Result<Option<UserOfferId>> {
        Ok(self.codes.get(code).copied())
    }
}
