//! Shared fixtures for the end-to-end scenarios.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map};
use uuid::Uuid;

use afftok_persist::MemoryClickStore;
use afftok_runtime::{CoreConfig, StoreBackend};
use afftok_types::RawEvent;

/// Core config tuned for fast test cadences: 20 ms consumer reads,
/// sub-second reclaim, quick batch flushes.
pub fn quick_core_config(wal_dir: &Path, store: Arc<MemoryClickStore>) -> CoreConfig {
    let mut config = CoreConfig::new(wal_dir);
    config.store = StoreBackend::Memory;
    config.store_override = Some(store);
    config.consumer.block_timeout = Duration::from_millis(20);
    config.consumer.reclaim_idle = Duration::from_millis(300);
    config.consumer.reclaim_interval = Duration::from_millis(100);
    config.tracker.flush_interval = Duration::from_millis(50);
    config.dispatch.l2_poll_interval = Duration::from_millis(30);
    config.dispatch.primary_workers = 2;
    config.dispatch.failover_workers = 1;
    config.dispatch.dlq_workers = 1;
    config.drain_timeout = Duration::from_secs(3);
    config
}

/// A click event as the edge submits it, with a distinct IP so each click
/// carries its own dedup fingerprint.
pub fn edge_click(code: &str, n: usize) -> RawEvent {
    let mut data = Map::new();
    data.insert("ip".into(), json!(format!("10.0.{}.{}", n / 256, n % 256)));
    data.insert("user_agent".into(), json!("scenario-test/1.0"));
    data.insert("device".into(), json!("desktop"));
    data.insert("country".into(), json!("DE"));
    RawEvent {
        kind: "click".to_string(),
        tenant_id: Some("tenant-a".to_string()),
        tracking_code: Some(code.to_string()),
        data,
    }
}

/// Poll until `check` returns true or the timeout passes. Returns whether
/// the condition was met.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// One tracking-code table entry.
pub fn codes(entries: &[(&str, Uuid)]) -> HashMap<String, Uuid> {
    entries
        .iter()
        .map(|(code, offer)| (code.to_string(), *offer))
        .collect()
}
