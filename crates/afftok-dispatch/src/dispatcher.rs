//! The dispatcher: submission, worker pools, step execution and the task
//! lifecycle across the three tiers.
//!
//! Lifecycle: `queued(primary) → running → succeeded | queued(primary,
//! retry) | queued(failover) | queued(dlq)`. A run starts only once
//! `next_retry_at` has passed; a step's success creates the next step's
//! task, so no step N attempt can begin before step N−1 succeeded. DLQ
//! items are parked in the shared cache with full context and re-enter the
//! primary tier only through [`Dispatcher::replay_dlq`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use afftok_cache::CacheStore;
use afftok_signing::{RequestSigner, SigningMeta};
use afftok_types::{
    Pipeline, PipelineStep, PostbackTask, QueueTier, StepOutcome, StepResult, TaskContext,
};

use crate::backoff::retry_delay;
use crate::pipeline::PipelineRegistry;
use crate::queue::{TieredQueue, QUEUE_DLQ};
use crate::results::ResultSink;
use crate::template::render;
use crate::{DispatchConfig, DispatchError, DispatchResult};

/// Header carrying the stable idempotency key, identical across retries.
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Counters exposed by the dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    /// Executions accepted by `submit`.
    pub executions_submitted: AtomicU64,
    /// Step attempts that returned 2xx.
    pub steps_succeeded: AtomicU64,
    /// Step attempts that failed (non-2xx, network error, timeout).
    pub attempts_failed: AtomicU64,
    /// Retries scheduled into the primary tier.
    pub retries_scheduled: AtomicU64,
    /// Tasks demoted to the failover tier.
    pub failed_over: AtomicU64,
    /// Tasks parked in the DLQ.
    pub dead_lettered: AtomicU64,
    /// Executions whose final step succeeded.
    pub executions_completed: AtomicU64,
    /// DLQ tasks re-admitted to primary.
    pub dlq_replayed: AtomicU64,
}

/// The outbound postback dispatcher.
pub struct Dispatcher {
    config: DispatchConfig,
    registry: Arc<PipelineRegistry>,
    signer: Arc<RequestSigner>,
    results: Arc<dyn ResultSink>,
    cache: Arc<dyn CacheStore>,
    http: reqwest::Client,
    primary: TieredQueue,
    failover: TieredQueue,
    dlq: TieredQueue,
    metrics: Arc<DispatcherMetrics>,
}

impl Dispatcher {
    /// Build the dispatcher and its queues.
    pub fn new(
        config: DispatchConfig,
        registry: Arc<PipelineRegistry>,
        signer: Arc<RequestSigner>,
        results: Arc<dyn ResultSink>,
        cache: Arc<dyn CacheStore>,
    ) -> DispatchResult<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| DispatchError::HttpClient(e.to_string()))?;
        Ok(Self {
            primary: TieredQueue::new(QueueTier::Primary, config.primary_capacity, cache.clone()),
            failover: TieredQueue::new(
                QueueTier::Failover,
                config.failover_capacity,
                cache.clone(),
            ),
            dlq: TieredQueue::new(QueueTier::Dlq, config.dlq_capacity, cache.clone()),
            config,
            registry,
            signer,
            results,
            cache,
            http,
            metrics: Arc::new(DispatcherMetrics::default()),
        })
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        self.metrics.clone()
    }

    /// `(L1, L2)` depths per tier, primary/failover/dlq order.
    pub async fn queue_depths(&self) -> DispatchResult<[(usize, u64); 3]> {
        Ok([
            self.primary.depth().await?,
            self.failover.depth().await?,
            self.dlq.depth().await?,
        ])
    }

    /// Start a new execution of a pipeline: the step-0 task enters the
    /// primary tier. Returns the execution id.
    pub async fn submit(
        &self,
        pipeline_id: Uuid,
        context: TaskContext,
        priority: i64,
    ) -> DispatchResult<Uuid> {
        let pipeline = self
            .registry
            .get(pipeline_id)
            .await
            .ok_or(DispatchError::UnknownPipeline(pipeline_id))?;
        if pipeline.steps.is_empty() {
            return Err(DispatchError::EmptyPipeline(pipeline_id));
        }
        let task = PostbackTask::first_step(&pipeline, context, priority);
        let execution_id = task.execution_id;
        self.primary.push(task).await?;
        self.metrics
            .executions_submitted
            .fetch_add(1, Ordering::Relaxed);
        debug!(pipeline_id = %pipeline_id, execution_id = %execution_id, "execution submitted");
        Ok(execution_id)
    }

    /// Spawn the three worker pools. Each worker loops until `shutdown`
    /// flips true, finishing its in-flight task first.
    pub fn spawn_workers(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for _ in 0..self.config.primary_workers {
            handles.push(self.clone().spawn_delivery_worker(QueueTier::Primary, shutdown.clone()));
        }
        for _ in 0..self.config.failover_workers {
            handles.push(self.clone().spawn_delivery_worker(QueueTier::Failover, shutdown.clone()));
        }
        for _ in 0..self.config.dlq_workers {
            handles.push(self.clone().spawn_dlq_worker(shutdown.clone()));
        }
        info!(
            primary = self.config.primary_workers,
            failover = self.config.failover_workers,
            dlq = self.config.dlq_workers,
            "dispatcher workers started"
        );
        handles
    }

    fn spawn_delivery_worker(
        self: Arc<Self>,
        tier: QueueTier,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let queue = self.queue_for(tier);
            loop {
                if *shutdown.borrow() {
                    return;
                }
                tokio::select! {
                    _ = shutdown.changed() => {}
                    popped = queue.pop(self.config.l2_poll_interval) => {
                        match popped {
                            Ok(Some(task)) => {
                                if task.ready(Utc::now()) {
                                    self.run_task(task).await;
                                } else if let Err(e) = queue.push_l2(&task).await {
                                    error!(task_id = %task.task_id, error = %e, "failed to park future-dated task");
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(tier = %tier, error = %e, "queue pop failed");
                                tokio::time::sleep(Duration::from_millis(250)).await;
                            }
                        }
                    }
                }
            }
        })
    }

    /// The DLQ pool only parks: it drains the tier's L1 into the durable
    /// sorted set. Parked tasks are never executed until replayed.
    fn spawn_dlq_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }
                tokio::select! {
                    _ = shutdown.changed() => {}
                    popped = self.dlq.pop_l1(self.config.l2_poll_interval) => {
                        if let Some(task) = popped {
                            if let Err(e) = self.dlq.push_l2(&task).await {
                                error!(task_id = %task.task_id, error = %e, "failed to park DLQ task");
                            }
                        }
                    }
                }
            }
        })
    }

    fn queue_for(&self, tier: QueueTier) -> &TieredQueue {
        match tier {
            QueueTier::Primary => &self.primary,
            QueueTier::Failover => &self.failover,
            QueueTier::Dlq => &self.dlq,
        }
    }

    /// Execute one due task and route the outcome.
    async fn run_task(&self, mut task: PostbackTask) {
        let Some(pipeline) = self.registry.get(task.pipeline_id).await else {
            self.dead_letter(task, None, "unknown pipeline".to_string())
                .await;
            return;
        };
        let Some(step) = pipeline.steps.get(task.step_index as usize).cloned() else {
            self.dead_letter(task, Some(&pipeline), "step index out of range".to_string())
                .await;
            return;
        };

        let attempt = task.attempts + 1;
        let result = self.execute_step(&pipeline, &step, &task, attempt).await;
        let succeeded = result.outcome == StepOutcome::Succeeded;
        let error_text = result
            .error
            .clone()
            .or_else(|| result.status_code.map(|c| format!("http status {c}")));
        self.results.record(result).await;

        if succeeded {
            self.metrics.steps_succeeded.fetch_add(1, Ordering::Relaxed);
            self.advance_or_complete(&pipeline, &task).await;
            return;
        }

        self.metrics.attempts_failed.fetch_add(1, Ordering::Relaxed);
        task.attempts = attempt;
        task.last_error = error_text;

        match task.tier {
            QueueTier::Primary => {
                if pipeline.retry.may_retry(task.attempts) {
                    let delay = retry_delay(&pipeline.retry, task.attempts);
                    task.next_retry_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));
                    self.metrics.retries_scheduled.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        task_id = %task.task_id,
                        attempt = task.attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retry scheduled"
                    );
                    if let Err(e) = self.primary.push_l2(&task).await {
                        error!(task_id = %task.task_id, error = %e, "failed to schedule retry");
                    }
                } else if pipeline.failover_url.is_some() {
                    task.tier = QueueTier::Failover;
                    task.next_retry_at = Utc::now();
                    self.metrics.failed_over.fetch_add(1, Ordering::Relaxed);
                    info!(task_id = %task.task_id, "primary attempts exhausted; trying failover");
                    if let Err(e) = self.failover.push(task).await {
                        error!(error = %e, "failed to enqueue failover task");
                    }
                } else {
                    let reason = task
                        .last_error
                        .clone()
                        .unwrap_or_else(|| "primary attempts exhausted".to_string());
                    self.dead_letter(task, Some(&pipeline), reason).await;
                }
            }
            QueueTier::Failover => {
                let reason = task
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "failover attempt failed".to_string());
                self.dead_letter(task, Some(&pipeline), reason).await;
            }
            QueueTier::Dlq => {
                // Parked tasks are not executed; nothing routes here.
                warn!(task_id = %task.task_id, "DLQ task reached the delivery path");
            }
        }
    }

    /// On step success: enqueue the next step, or complete the execution.
    async fn advance_or_complete(&self, pipeline: &Pipeline, task: &PostbackTask) {
        if ((task.step_index + 1) as usize) < pipeline.steps.len() {
            if let Err(e) = self.primary.push(task.advance()).await {
                error!(execution_id = %task.execution_id, error = %e, "failed to enqueue next step");
            }
        } else {
            self.metrics
                .executions_completed
                .fetch_add(1, Ordering::Relaxed);
            info!(execution_id = %task.execution_id, "execution completed");
        }
    }

    /// Park a task in the DLQ with its full context. When the failed step
    /// does not stop the execution, the next step still runs.
    async fn dead_letter(
        &self,
        mut task: PostbackTask,
        pipeline: Option<&Pipeline>,
        reason: String,
    ) {
        warn!(
            task_id = %task.task_id,
            execution_id = %task.execution_id,
            step = task.step_index,
            reason = %reason,
            "task dead-lettered"
        );
        task.tier = QueueTier::Dlq;
        task.last_error = Some(reason);
        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);

        let continue_past = pipeline
            .and_then(|p| p.steps.get(task.step_index as usize))
            .is_some_and(|step| !step.stop_on_failure);

        if let Err(e) = self.dlq.push(task.clone()).await {
            error!(task_id = %task.task_id, error = %e, "failed to enqueue DLQ task");
        }

        if continue_past {
            if let Some(pipeline) = pipeline {
                if ((task.step_index + 1) as usize) < pipeline.steps.len() {
                    if let Err(e) = self.primary.push(task.advance()).await {
                        error!(execution_id = %task.execution_id, error = %e, "failed to continue execution");
                    }
                }
            }
        }
    }

    /// One step attempt: render, sign, send, measure.
    async fn execute_step(
        &self,
        pipeline: &Pipeline,
        step: &PipelineStep,
        task: &PostbackTask,
        attempt: u32,
    ) -> StepResult {
        let url_template = if task.tier == QueueTier::Failover {
            pipeline.failover_url.as_deref().unwrap_or(&step.url)
        } else {
            &step.url
        };
        let url = render(url_template, &task.context);
        let body = step
            .body
            .as_deref()
            .map(|template| render(template, &task.context))
            .unwrap_or_default();

        let started_at = Utc::now();
        let clock = Instant::now();
        let mut result = StepResult {
            task_id: task.task_id,
            execution_id: task.execution_id,
            pipeline_id: task.pipeline_id,
            step_index: task.step_index,
            attempt,
            url: url.clone(),
            status_code: None,
            response_excerpt: None,
            error: None,
            duration_ms: 0,
            started_at,
            finished_at: started_at,
            outcome: StepOutcome::Failed,
        };

        let meta = SigningMeta {
            task_id: task.task_id,
            pipeline_id: task.pipeline_id,
            execution_id: task.execution_id,
            step_index: task.step_index,
            attempt,
        };
        let signed_headers = match self.signer.sign(
            step.signing,
            body.as_bytes(),
            step.signing_key.as_deref(),
            &meta,
        ) {
            Ok(headers) => headers,
            Err(e) => {
                result.error = Some(format!("signing failed: {e}"));
                result.finished_at = Utc::now();
                result.duration_ms = clock.elapsed().as_millis() as u64;
                return result;
            }
        };

        let method = match reqwest::Method::from_bytes(step.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                result.error = Some(format!("invalid HTTP method: {}", step.method));
                result.finished_at = Utc::now();
                result.duration_ms = clock.elapsed().as_millis() as u64;
                return result;
            }
        };

        let mut request = self.http.request(method, url.as_str()).timeout(step.timeout);
        for (name, value) in &step.headers {
            request = request.header(name.as_str(), render(value, &task.context));
        }
        for (name, value) in signed_headers {
            request = request.header(name.as_str(), value);
        }
        request = request.header(HEADER_IDEMPOTENCY_KEY, task.idempotency_key());
        if !body.is_empty() {
            request = request.body(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                result.status_code = Some(status.as_u16());
                result.response_excerpt = Some(
                    text.chars()
                        .take(self.config.response_excerpt_limit)
                        .collect(),
                );
                if status.is_success() {
                    result.outcome = StepOutcome::Succeeded;
                } else {
                    result.error = Some(format!("http status {status}"));
                }
            }
            Err(e) => {
                result.error = Some(e.to_string());
            }
        }
        result.finished_at = Utc::now();
        result.duration_ms = clock.elapsed().as_millis() as u64;
        result
    }

    //─────────────────────────────
    //  DLQ inspection and replay
    //─────────────────────────────

    /// Parked DLQ tasks, oldest first, up to `limit`.
    pub async fn dlq_tasks(&self, limit: usize) -> DispatchResult<Vec<PostbackTask>> {
        let members = self
            .cache
            .zrange(QUEUE_DLQ, 0, limit.saturating_sub(1) as isize)
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| serde_json::from_str(m).ok())
            .collect())
    }

    /// Re-admit one DLQ task to the primary tier with a fresh attempt
    /// counter. Nothing leaves the DLQ without this call.
    pub async fn replay_dlq(&self, task_id: Uuid) -> DispatchResult<()> {
        let members = self.cache.zrange(QUEUE_DLQ, 0, -1).await?;
        for member in members {
            let Ok(mut task) = serde_json::from_str::<PostbackTask>(&member) else {
                continue;
            };
            if task.task_id != task_id {
                continue;
            }
            self.cache.zrem(QUEUE_DLQ, &member).await?;
            task.tier = QueueTier::Primary;
            task.attempts = 0;
            task.next_retry_at = Utc::now();
            self.primary.push(task).await?;
            self.metrics.dlq_replayed.fetch_add(1, Ordering::Relaxed);
            info!(task_id = %task_id, "DLQ task re-admitted to primary");
            return Ok(());
        }
        Err(DispatchError::TaskNotFound(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use afftok_cache::MemoryCache;
    use afftok_signing::{KeyRing, HEADER_SIGNATURE};
    use afftok_types::{BackoffMode, RetryPolicy, SigningMode};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::any;
    use axum::Router;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicU16;
    use std::sync::Mutex;

    use crate::results::MemoryResultSink;

    #[derive(Debug, Clone)]
    struct Hit {
        at: Instant,
        path: String,
        idempotency_key: Option<String>,
        signature: Option<String>,
        body: String,
    }

    #[derive(Clone)]
    struct TestState {
        hits: Arc<Mutex<Vec<Hit>>>,
        status: Arc<AtomicU16>,
    }

    async fn capture(
        State(state): State<TestState>,
        uri: Uri,
        headers: HeaderMap,
        body: String,
    ) -> StatusCode {
        state.hits.lock().unwrap().push(Hit {
            at: Instant::now(),
            path: uri.path().to_string(),
            idempotency_key: headers
                .get(HEADER_IDEMPOTENCY_KEY)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            signature: headers
                .get(HEADER_SIGNATURE)
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            body,
        });
        StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap_or(StatusCode::OK)
    }

    async fn test_server(initial_status: u16) -> (SocketAddr, TestState) {
        let state = TestState {
            hits: Arc::new(Mutex::new(Vec::new())),
            status: Arc::new(AtomicU16::new(initial_status)),
        };
        let app = Router::new()
            .route("/", any(capture))
            .route("/*path", any(capture))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (addr, state)
    }

    fn quick_config() -> DispatchConfig {
        DispatchConfig {
            primary_workers: 2,
            failover_workers: 1,
            dlq_workers: 1,
            l2_poll_interval: Duration::from_millis(30),
            ..DispatchConfig::default()
        }
    }

    fn fixture(config: DispatchConfig) -> (Arc<Dispatcher>, Arc<PipelineRegistry>, Arc<MemoryResultSink>) {
        let registry = Arc::new(PipelineRegistry::new());
        let mut ring = KeyRing::new();
        ring.insert("adv-key", b"hunter2".to_vec());
        let signer = Arc::new(RequestSigner::new(ring));
        let results = Arc::new(MemoryResultSink::new());
        let cache: Arc<dyn CacheStore> = Arc::new(MemoryCache::new());
        let dispatcher = Arc::new(
            Dispatcher::new(config, registry.clone(), signer, results.clone(), cache).unwrap(),
        );
        (dispatcher, registry, results)
    }

    fn two_step_pipeline(base: &str) -> Pipeline {
        Pipeline {
            id: Uuid::new_v4(),
            name: "conversion-notify".into(),
            advertiser_id: None,
            steps: vec![
                PipelineStep {
                    body: Some(r#"{"click_id": "{click.id}"}"#.to_string()),
                    method: "POST".into(),
                    signing: SigningMode::HmacSha256,
                    signing_key: Some("adv-key".into()),
                    ..PipelineStep::get(format!("{base}/step0"))
                },
                PipelineStep::get(format!("{base}/step1")),
            ],
            retry: RetryPolicy {
                base: Duration::from_millis(30),
                cap: Duration::from_millis(200),
                max_attempts: 3,
                jitter: 0.2,
                mode: BackoffMode::Exponential,
            },
            failover_url: None,
        }
    }

    fn context() -> TaskContext {
        let mut ctx = TaskContext::default();
        ctx.click
            .insert("id".into(), serde_json::json!("click-1"));
        ctx
    }

    #[tokio::test]
    async fn steps_run_in_order_signed_and_idempotent() {
        let (addr, server) = test_server(200).await;
        let (dispatcher, registry, results) = fixture(quick_config());
        let pipeline = two_step_pipeline(&format!("http://{addr}"));
        registry.upsert(pipeline.clone()).await;

        let (tx, rx) = watch::channel(false);
        let workers = dispatcher.spawn_workers(rx);

        let execution_id = dispatcher
            .submit(pipeline.id, context(), 0)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;
        tx.send(true).unwrap();
        for w in workers {
            let _ = w.await;
        }

        let hits = server.hits.lock().unwrap().clone();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].path, "/step0");
        assert_eq!(hits[1].path, "/step1");
        assert!(hits[0].at <= hits[1].at);

        // The signed step verifies against its body.
        let signature = hits[0].signature.as_deref().unwrap();
        assert!(afftok_signing::verify_signature(
            hits[0].body.as_bytes(),
            signature,
            b"hunter2"
        ));
        assert_eq!(hits[0].body, r#"{"click_id": "click-1"}"#);
        assert_eq!(
            hits[0].idempotency_key.as_deref(),
            Some(format!("{execution_id}:0").as_str())
        );

        let recorded = results.for_execution(execution_id).await;
        assert_eq!(recorded.len(), 2);
        assert!(recorded.iter().all(|r| r.outcome == StepOutcome::Succeeded));
        assert_eq!(
            dispatcher.metrics().executions_completed.load(Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn exhausted_primary_fails_over_then_dead_letters() {
        let (addr, server) = test_server(500).await;
        let (failover_addr, failover_server) = test_server(500).await;
        let (dispatcher, registry, _results) = fixture(quick_config());

        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            name: "flaky".into(),
            advertiser_id: None,
            steps: vec![PipelineStep::get(format!("http://{addr}/hook"))],
            retry: RetryPolicy {
                base: Duration::from_millis(40),
                cap: Duration::from_millis(300),
                max_attempts: 3,
                jitter: 0.2,
                mode: BackoffMode::Exponential,
            },
            failover_url: Some(format!("http://{failover_addr}/backup")),
        };
        registry.upsert(pipeline.clone()).await;

        let (tx, rx) = watch::channel(false);
        let workers = dispatcher.spawn_workers(rx);
        dispatcher.submit(pipeline.id, context(), 0).await.unwrap();

        // Three jittered primary attempts plus one failover attempt.
        tokio::time::sleep(Duration::from_secs(2)).await;
        tx.send(true).unwrap();
        for w in workers {
            let _ = w.await;
        }

        let primary_hits = server.hits.lock().unwrap().clone();
        assert_eq!(primary_hits.len(), 3);
        // Exponential spacing: each gap respects its jittered lower bound
        // (40ms·0.8, then 80ms·0.8); scheduling latency only adds to them.
        let gap1 = primary_hits[1].at.duration_since(primary_hits[0].at);
        let gap2 = primary_hits[2].at.duration_since(primary_hits[1].at);
        assert!(gap1 >= Duration::from_millis(30), "gap1 {gap1:?}");
        assert!(gap2 >= Duration::from_millis(60), "gap2 {gap2:?}");

        assert_eq!(failover_server.hits.lock().unwrap().len(), 1);

        let metrics = dispatcher.metrics();
        assert_eq!(metrics.failed_over.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.dead_lettered.load(Ordering::Relaxed), 1);

        let parked = dispatcher.dlq_tasks(10).await.unwrap();
        assert_eq!(parked.len(), 1);
        assert_eq!(parked[0].tier, QueueTier::Dlq);
        assert!(parked[0].last_error.is_some());
    }

    #[tokio::test]
    async fn dlq_replay_re_enters_primary_and_succeeds() {
        let (addr, server) = test_server(500).await;
        let (dispatcher, registry, _results) = fixture(quick_config());

        let pipeline = Pipeline {
            id: Uuid::new_v4(),
            name: "recovering".into(),
            advertiser_id: None,
            steps: vec![PipelineStep::get(format!("http://{addr}/hook"))],
            retry: RetryPolicy {
                base: Duration::from_millis(20),
                cap: Duration::from_millis(50),
                max_attempts: 1,
                jitter: 0.0,
                mode: BackoffMode::Fixed,
            },
            failover_url: None,
        };
        registry.upsert(pipeline.clone()).await;

        let (tx, rx) = watch::channel(false);
        let workers = dispatcher.spawn_workers(rx);
        dispatcher.submit(pipeline.id, context(), 0).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        let parked = dispatcher.dlq_tasks(10).await.unwrap();
        assert_eq!(parked.len(), 1);

        // Advertiser fixed their endpoint; replay the parked task.
        server.status.store(200, Ordering::SeqCst);
        dispatcher.replay_dlq(parked[0].task_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        tx.send(true).unwrap();
        for w in workers {
            let _ = w.await;
        }

        assert!(dispatcher.dlq_tasks(10).await.unwrap().is_empty());
        assert_eq!(
            dispatcher.metrics().executions_completed.load(Ordering::Relaxed),
            1
        );
        assert_eq!(dispatcher.metrics().dlq_replayed.load(Ordering::Relaxed), 1);

        let err = dispatcher.replay_dlq(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotFound(_)));
    }

    #[tokio::test]
    async fn unknown_pipeline_is_rejected_at_submit() {
        let (dispatcher, _registry, _results) = fixture(quick_config());
        let err = dispatcher
            .submit(Uuid::new_v4(), TaskContext::default(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownPipeline(_)));
    }
}
