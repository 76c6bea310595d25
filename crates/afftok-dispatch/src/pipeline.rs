//! Pipeline configuration registry.
//!
//! Pipelines are configuration, read-only to the core: the registry is
//! loaded at startup (and refreshed by the owning admin plane). Step order
//! is immutable for the duration of one execution because executions
//! capture the pipeline by id and the registry only ever swaps whole
//! pipelines.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use afftok_types::Pipeline;

/// Holds the configured pipelines by id.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<Uuid, Pipeline>>,
}

impl PipelineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a pipeline.
    pub async fn upsert(&self, pipeline: Pipeline) {
        self.pipelines.write().await.insert(pipeline.id, pipeline);
    }

    /// Look up a pipeline.
    pub async fn get(&self, id: Uuid) -> Option<Pipeline> {
        self.pipelines.read().await.get(&id).cloned()
    }

    /// Pipelines bound to the given advertiser. `None` selects the
    /// pipelines configured without an advertiser binding.
    pub async fn for_advertiser(&self, advertiser_id: Option<Uuid>) -> Vec<Pipeline> {
        self.pipelines
            .read()
            .await
            .values()
            .filter(|p| p.advertiser_id == advertiser_id)
            .cloned()
            .collect()
    }

    /// Remove a pipeline.
    pub async fn remove(&self, id: Uuid) -> Option<Pipeline> {
        self.pipelines.write().await.remove(&id)
    }

    /// Number of configured pipelines.
    pub async fn len(&self) -> usize {
        self.pipelines.read().await.len()
    }

    /// Whether no pipelines are configured.
    pub async fn is_empty(&self) -> bool {
        self.pipelines.read().await.is_empty()
    }
}
