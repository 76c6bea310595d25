//! Step-result persistence.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use afftok_types::StepResult;

/// Where per-step results land. One record per attempt.
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Persist one attempt's result.
    async fn record(&self, result: StepResult);

    /// All recorded results for one execution, in recording order.
    async fn for_execution(&self, execution_id: Uuid) -> Vec<StepResult>;
}

/// In-memory result sink for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryResultSink {
    results: RwLock<Vec<StepResult>>,
}

impl MemoryResultSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every recorded result.
    pub async fn all(&self) -> Vec<StepResult> {
        self.results.read().await.clone()
    }
}

#[async_trait]
impl ResultSink for MemoryResultSink {
    async fn record(&self, result: StepResult) {
        info!(
            execution_id = %result.execution_id,
            step = result.step_index,
            attempt = result.attempt,
            outcome = ?result.outcome,
            status = ?result.status_code,
            duration_ms = result.duration_ms,
            "step result"
        );
        self.results.write().await.push(result);
    }

    async fn for_execution(&self, execution_id: Uuid) -> Vec<StepResult> {
        self.results
            .read()
            .await
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect()
    }
}
