//! In-memory cache driver.
//!
//! Fast, non-persistent, single-process. This is the default driver for
//! tests, development and single-node deployments. TTLs are honored lazily
//! on read; stream consumer-group semantics (deliver-once, pending until
//! ack, idle reclaim) match the shared-cache contract exactly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};

use crate::{CacheError, CacheResult, CacheStore, StreamEntry};

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl ValueEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Debug, Default)]
struct SortedSet {
    // member -> score; pops scan for the minimum, which is fine at queue
    // depths the L2 lane is bounded to.
    members: HashMap<String, f64>,
}

#[derive(Debug)]
struct PendingEntry {
    payload: String,
    #[allow(dead_code)]
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Debug, Default)]
struct StreamState {
    next_seq: u64,
    undelivered: VecDeque<StreamEntry>,
    pending: HashMap<String, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamSlot {
    state: Mutex<StreamState>,
    notify: Notify,
}

/// An in-memory, non-persistent cache.
///
/// Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct MemoryCache {
    values: Arc<DashMap<String, ValueEntry>>,
    sorted: Arc<DashMap<String, Arc<Mutex<SortedSet>>>>,
    streams: Arc<DashMap<String, Arc<StreamSlot>>>,
}

impl MemoryCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn stream_slot(&self, stream: &str) -> Arc<StreamSlot> {
        self.streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(StreamSlot::default()))
            .clone()
    }

    fn sorted_slot(&self, key: &str) -> Arc<Mutex<SortedSet>> {
        self.sorted
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SortedSet::default())))
            .clone()
    }

    fn live_value(&self, key: &str) -> Option<String> {
        let entry = self.values.get(key)?;
        if entry.expired() {
            drop(entry);
            self.values.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn parse_counter(key: &str, value: &str) -> CacheResult<i64> {
        value.parse::<i64>().map_err(|_| CacheError::UnexpectedValue {
            key: key.to_string(),
            message: format!("not an integer: {value:?}"),
        })
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn incr_by(&self, key: &str, delta: i64) -> CacheResult<i64> {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| ValueEntry {
                value: "0".to_string(),
                expires_at: None,
            });
        if entry.expired() {
            entry.value = "0".to_string();
            entry.expires_at = None;
        }
        let next = Self::parse_counter(key, &entry.value)? + delta;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn incr_by_with_ttl(&self, key: &str, delta: i64, ttl: Duration) -> CacheResult<i64> {
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| ValueEntry {
                value: "0".to_string(),
                expires_at: None,
            });
        if entry.expired() {
            entry.value = "0".to_string();
        }
        let next = Self::parse_counter(key, &entry.value)? + delta;
        entry.value = next.to_string();
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(next)
    }

    async fn counter(&self, key: &str) -> CacheResult<Option<i64>> {
        match self.live_value(key) {
            Some(value) => Ok(Some(Self::parse_counter(key, &value)?)),
            None => Ok(None),
        }
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        Ok(self.live_value(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheResult<()> {
        self.values.insert(
            key.to_string(),
            ValueEntry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let mut inserted = false;
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| {
                inserted = true;
                ValueEntry {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                }
            });
        if !inserted && entry.expired() {
            entry.value = value.to_string();
            entry.expires_at = ttl.map(|t| Instant::now() + t);
            inserted = true;
        }
        Ok(inserted)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        self.values.remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> CacheResult<()> {
        let slot = self.sorted_slot(key);
        let mut set = slot.lock().await;
        set.members.insert(member.to_string(), score);
        Ok(())
    }

    async fn zpop_min(&self, key: &str) -> CacheResult<Option<(String, f64)>> {
        let slot = self.sorted_slot(key);
        let mut set = slot.lock().await;
        let min = set
            .members
            .iter()
            .min_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.0.cmp(b.0)))
            .map(|(member, score)| (member.clone(), *score));
        if let Some((member, _)) = &min {
            set.members.remove(member);
        }
        Ok(min)
    }

    async fn zrem(&self, key: &str, member: &str) -> CacheResult<bool> {
        let slot = self.sorted_slot(key);
        let mut set = slot.lock().await;
        Ok(set.members.remove(member).is_some())
    }

    async fn zcard(&self, key: &str) -> CacheResult<u64> {
        let slot = self.sorted_slot(key);
        let set = slot.lock().await;
        Ok(set.members.len() as u64)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> CacheResult<Vec<String>> {
        let slot = self.sorted_slot(key);
        let set = slot.lock().await;
        let mut ranked: Vec<(&String, &f64)> = set.members.iter().collect();
        ranked.sort_by(|a, b| {
            a.1.partial_cmp(b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let len = ranked.len() as isize;
        let clamp = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len.saturating_sub(1))
            }
        };
        if len == 0 {
            return Ok(Vec::new());
        }
        let (start, stop) = (clamp(start), clamp(stop));
        if start > stop {
            return Ok(Vec::new());
        }
        Ok(ranked[start as usize..=stop as usize]
            .iter()
            .map(|(member, _)| (*member).clone())
            .collect())
    }

    async fn stream_append(&self, stream: &str, payload: &str) -> CacheResult<String> {
        let slot = self.stream_slot(stream);
        let mut state = slot.state.lock().await;
        state.next_seq += 1;
        let id = format!("{}-{}", state.next_seq, 0);
        state.undelivered.push_back(StreamEntry {
            id: id.clone(),
            payload: payload.to_string(),
        });
        drop(state);
        slot.notify.notify_one();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, _group: &str) -> CacheResult<()> {
        self.stream_slot(stream);
        Ok(())
    }

    async fn stream_read_group(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> CacheResult<Vec<StreamEntry>> {
        let slot = self.stream_slot(stream);
        let deadline = Instant::now() + block;
        loop {
            {
                let mut state = slot.state.lock().await;
                if !state.undelivered.is_empty() {
                    let take = count.min(state.undelivered.len());
                    let mut out = Vec::with_capacity(take);
                    while out.len() < take {
                        let Some(entry) = state.undelivered.pop_front() else {
                            break;
                        };
                        state.pending.insert(
                            entry.id.clone(),
                            PendingEntry {
                                payload: entry.payload.clone(),
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                deliveries: 1,
                            },
                        );
                        out.push(entry);
                    }
                    return Ok(out);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = slot.notify.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(Vec::new()),
            }
        }
    }

    async fn stream_ack(&self, stream: &str, _group: &str, id: &str) -> CacheResult<()> {
        let slot = self.stream_slot(stream);
        let mut state = slot.state.lock().await;
        state.pending.remove(id);
        Ok(())
    }

    async fn stream_claim_idle(
        &self,
        stream: &str,
        _group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> CacheResult<Vec<StreamEntry>> {
        let slot = self.stream_slot(stream);
        let mut state = slot.state.lock().await;
        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut ids: Vec<String> = state
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| id.clone())
            .collect();
        // Stream ids are "<seq>-0"; numeric order is delivery order.
        ids.sort_by_key(|id| {
            id.split('-')
                .next()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(u64::MAX)
        });
        for id in ids.into_iter().take(count) {
            if let Some(pending) = state.pending.get_mut(&id) {
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                pending.deliveries += 1;
                claimed.push(StreamEntry {
                    id: id.clone(),
                    payload: pending.payload.clone(),
                });
            }
        }
        Ok(claimed)
    }

    async fn stream_pending_count(&self, stream: &str, _group: &str) -> CacheResult<u64> {
        let slot = self.stream_slot(stream);
        let state = slot.state.lock().await;
        Ok(state.pending.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn counters_increment_atomically() {
        let cache = MemoryCache::new();
        assert_eq!(cache.incr_by("c", 1).await.unwrap(), 1);
        assert_eq!(cache.incr_by("c", 5).await.unwrap(), 6);
        assert_eq!(cache.counter("c").await.unwrap(), Some(6));
        assert_eq!(cache.counter("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_counters() {
        let cache = MemoryCache::new();
        cache
            .incr_by_with_ttl("hourly", 3, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(cache.counter("hourly").await.unwrap(), Some(3));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.counter("hourly").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_a_dedup_gate() {
        let cache = MemoryCache::new();
        assert!(cache.set_if_absent("fp", "1", None).await.unwrap());
        assert!(!cache.set_if_absent("fp", "1", None).await.unwrap());
        cache.delete("fp").await.unwrap();
        assert!(cache.set_if_absent("fp", "1", None).await.unwrap());
    }

    #[tokio::test]
    async fn zpop_min_orders_by_score_then_member() {
        let cache = MemoryCache::new();
        cache.zadd("q", "b", 2.0).await.unwrap();
        cache.zadd("q", "a", 1.0).await.unwrap();
        cache.zadd("q", "c", 1.0).await.unwrap();
        assert_eq!(cache.zpop_min("q").await.unwrap().unwrap().0, "a");
        assert_eq!(cache.zpop_min("q").await.unwrap().unwrap().0, "c");
        assert_eq!(cache.zpop_min("q").await.unwrap().unwrap().0, "b");
        assert_eq!(cache.zpop_min("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zrange_supports_negative_indices() {
        let cache = MemoryCache::new();
        for (member, score) in [("a", 1.0), ("b", 2.0), ("c", 3.0)] {
            cache.zadd("s", member, score).await.unwrap();
        }
        assert_eq!(cache.zrange("s", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(cache.zrange("s", 1, 1).await.unwrap(), vec!["b"]);
        assert_eq!(cache.zcard("s").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn stream_delivers_once_then_pends_until_ack() {
        let cache = MemoryCache::new();
        cache.ensure_group("st", "g").await.unwrap();
        cache.stream_append("st", "m1").await.unwrap();

        let read = cache
            .stream_read_group("st", "g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(cache.stream_pending_count("st", "g").await.unwrap(), 1);

        // Not redelivered to a normal read.
        let again = cache
            .stream_read_group("st", "g", "c1", 10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(again.is_empty());

        cache.stream_ack("st", "g", &read[0].id).await.unwrap();
        assert_eq!(cache.stream_pending_count("st", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn idle_pending_entries_are_claimable() {
        let cache = MemoryCache::new();
        cache.stream_append("st", "m1").await.unwrap();
        let read = cache
            .stream_read_group("st", "g", "dead", 10, Duration::from_millis(5))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        // Too fresh to claim.
        let none = cache
            .stream_claim_idle("st", "g", "alive", Duration::from_secs(60), 10)
            .await
            .unwrap();
        assert!(none.is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let claimed = cache
            .stream_claim_idle("st", "g", "alive", Duration::from_millis(20), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].payload, "m1");
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_append() {
        let cache = MemoryCache::new();
        let reader = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .stream_read_group("st", "g", "c", 1, Duration::from_secs(2))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cache.stream_append("st", "late").await.unwrap();
        let read = reader.await.unwrap();
        assert_eq!(read.len(), 1);
        assert_eq!(read[0].payload, "late");
    }
}
