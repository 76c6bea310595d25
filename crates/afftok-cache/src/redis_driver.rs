//! Redis cache driver (feature `redis-cache`).
//!
//! Maps the cache port onto Redis primitives: `INCRBY`/`PEXPIRE` for
//! counters, `SET NX PX` for dedup, sorted sets for the L2 queue lanes and
//! streams with one consumer group for the event fabric. Reclaim uses
//! `XPENDING` + `XCLAIM` so it works on any server version the platform
//! deploys against.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::cmd;
use tracing::debug;

use crate::{CacheError, CacheResult, CacheStore, StreamEntry};

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_timeout() {
            CacheError::Unreachable(err.to_string())
        } else {
            CacheError::Backend(err.to_string())
        }
    }
}

/// Redis-backed cache driver.
///
/// Cheap to clone; clones share the managed connection, which reconnects
/// automatically after network failures.
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to the given Redis URL.
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Unreachable(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Unreachable(e.to_string()))?;
        debug!(url, "connected to redis");
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

/// Field name carrying the serialized message inside a stream entry.
const PAYLOAD_FIELD: &str = "data";

type RawEntries = Vec<(String, Vec<(String, String)>)>;

fn into_entries(raw: RawEntries) -> Vec<StreamEntry> {
    raw.into_iter()
        .filter_map(|(id, fields)| {
            fields
                .into_iter()
                .find(|(name, _)| name == PAYLOAD_FIELD)
                .map(|(_, payload)| StreamEntry { id, payload })
        })
        .collect()
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut conn = self.conn();
        let value: i64 = cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn incr_by_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
        let mut conn = self.conn();
        let (value, _): (i64, i64) = redis::pipe()
            .cmd("INCRBY")
            .arg(key)
            .arg(delta)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn counter(&self, key: &str) -> CacheResult<Option<i64>> {
        let mut conn = self.conn();
        let value: Option<i64> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.conn();
        let mut command = cmd("SET");
        command.arg(key).arg(value);
        if let Some(ttl) = ttl {
            command.arg("PX").arg(ttl.as_millis() as u64);
        }
        command.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let mut conn = self.conn();
        let mut command = cmd("SET");
        command.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            command.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = command.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn();
        cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let mut conn = self.conn();
        cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn zpop_min(&self, key: &str) -> CacheResult<Option<(String, f64)>> {
        let mut conn = self.conn();
        let popped: Vec<(String, f64)> = cmd("ZPOPMIN").arg(key).query_async(&mut conn).await?;
        Ok(popped.into_iter().next())
    }

    async fn zrem(&self, key: &str, member: &str) -> CacheResult<bool> {
        let mut conn = self.conn();
        let removed: i64 = cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        let mut conn = self.conn();
        let count: u64 = cmd("ZCARD").arg(key).query_async(&mut conn).await?;
        Ok(count)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>> {
        let mut conn = self.conn();
        let members: Vec<String> = cmd("ZRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(members)
    }

    async fn stream_append(&self, stream: &str, payload: &str) -> CacheResult<String> {
        let mut conn = self.conn();
        let id: String = cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> CacheResult<()> {
        let mut conn = self.conn();
        let created: Result<(), redis::RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => Ok(()),
            // The group already existing is the normal steady state.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CacheResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let reply: Option<Vec<(String, RawEntries)>> = cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;
        let Some(streams) = reply else {
            return Ok(Vec::new());
        };
        Ok(streams
            .into_iter()
            .flat_map(|(_, entries)| into_entries(entries))
            .collect())
    }

    async fn stream_ack(&self, stream: &str, group: &str, id: &str) -> CacheResult<()> {
        let mut conn = self.conn();
        cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn stream_claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> CacheResult<Vec<StreamEntry>> {
        let mut conn = self.conn();
        let idle_ms = min_idle.as_millis() as u64;
        let pending: Vec<(String, String, i64, i64)> = cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(idle_ms)
            .arg("-")
            .arg("+")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }
        let mut claim = cmd("XCLAIM");
        claim
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(idle_ms);
        for (id, _, _, _) in &pending {
            claim.arg(id);
        }
        let claimed: RawEntries = claim.query_async(&mut conn).await?;
        Ok(into_entries(claimed))
    }

    async fn stream_pending_count(&self, stream: &str, group: &str) -> CacheResult<u64> {
        let mut conn = self.conn();
        let (count, _min, _max, _consumers): (
            u64,
            Option<String>,
            Option<String>,
            redis::Value,
        ) = cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }
}
