//! Outbound postback task, pipeline configuration and step results.
//!
//! A *pipeline* is an ordered template of HTTP steps configured per
//! advertiser; an *execution* is one traversal of a pipeline; a *task* is
//! one step attempt sitting in a queue tier. Step order is immutable for
//! the duration of one execution.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

//─────────────────────────────
//  Queue tiers
//─────────────────────────────

/// The three outbound queue tiers, tried in order.
///
/// A task moves primary → failover → dlq monotonically within a single
/// execution; DLQ items re-enter primary only by explicit replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueTier {
    /// First delivery lane.
    Primary,
    /// Single-shot fallback against the pipeline's failover URL.
    Failover,
    /// Dead letters, held with full context for replay.
    Dlq,
}

impl QueueTier {
    /// The tier's wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueTier::Primary => "primary",
            QueueTier::Failover => "failover",
            QueueTier::Dlq => "dlq",
        }
    }

    /// The tier a failed task demotes to, if any.
    pub fn next(&self) -> Option<QueueTier> {
        match self {
            QueueTier::Primary => Some(QueueTier::Failover),
            QueueTier::Failover => Some(QueueTier::Dlq),
            QueueTier::Dlq => None,
        }
    }
}

impl fmt::Display for QueueTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

//─────────────────────────────
//  Retry policy
//─────────────────────────────

/// Backoff curve selection, per pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    /// `min(cap, base · 2^(attempt−1))`, the default.
    Exponential,
    /// Constant `base` delay between attempts.
    Fixed,
}

/// Retry behaviour for one pipeline's primary-tier attempts.
///
/// `max_attempts = 0` means unlimited primary retries: the task never
/// demotes to the failover tier and the cap bounds the retry cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff curve.
    pub mode: BackoffMode,
    /// Base delay before the first retry.
    pub base: Duration,
    /// Upper bound on any computed delay.
    pub cap: Duration,
    /// Attempts allowed in the primary tier; 0 = unlimited.
    pub max_attempts: u32,
    /// Jitter fraction applied as `· (1 + uniform(−jitter, +jitter))`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            mode: BackoffMode::Exponential,
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            max_attempts: 5,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// The undithered delay for the given 1-based attempt number.
    ///
    /// Jitter is applied by the dispatcher, which owns the RNG.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.mode {
            BackoffMode::Fixed => self.base.min(self.cap),
            BackoffMode::Exponential => {
                let factor = 2u32.saturating_pow((attempt - 1).min(31));
                self.base.saturating_mul(factor).min(self.cap)
            }
        }
    }

    /// Whether a task with `attempts` failures so far may retry in primary.
    pub fn may_retry(&self, attempts: u32) -> bool {
        self.max_attempts == 0 || attempts < self.max_attempts
    }
}

//─────────────────────────────
//  Pipeline configuration
//─────────────────────────────

/// How a step's outbound request is signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SigningMode {
    /// No signature headers attached.
    None,
    /// HMAC-SHA256 over the canonicalized body, in `X-Signature`.
    HmacSha256,
}

/// One HTTP step inside a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    /// URL template with `{section.key}` placeholders.
    pub url: String,
    /// HTTP method, e.g. `GET` or `POST`.
    pub method: String,
    /// Header map; values may contain template placeholders.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Body template; `None` sends an empty body.
    #[serde(default)]
    pub body: Option<String>,
    /// Per-step request timeout.
    pub timeout: Duration,
    /// Signing mode for this step.
    pub signing: SigningMode,
    /// Handle of the signing key in the key ring.
    #[serde(default)]
    pub signing_key: Option<String>,
    /// When true, a failed step aborts the remaining steps of the execution.
    pub stop_on_failure: bool,
}

impl PipelineStep {
    /// A plain unsigned GET step with the default 10 s timeout.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            body: None,
            timeout: Duration::from_secs(10),
            signing: SigningMode::None,
            signing_key: None,
            stop_on_failure: false,
        }
    }
}

/// An ordered list of steps plus delivery policy, configured per advertiser.
/// Read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline identifier.
    pub id: Uuid,
    /// Operator-facing name.
    pub name: String,
    /// Advertiser this pipeline delivers to, when known.
    #[serde(default)]
    pub advertiser_id: Option<Uuid>,
    /// The steps, in execution order.
    pub steps: Vec<PipelineStep>,
    /// Retry policy for primary-tier attempts.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Failover URL tried once after primary attempts are exhausted.
    #[serde(default)]
    pub failover_url: Option<String>,
}

//─────────────────────────────
//  Task context
//─────────────────────────────

/// Per-task template context, split into the sub-maps templates address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    /// Click fields.
    #[serde(default)]
    pub click: Map<String, Value>,
    /// Conversion fields.
    #[serde(default)]
    pub conversion: Map<String, Value>,
    /// User-offer link fields.
    #[serde(default)]
    pub user_offer: Map<String, Value>,
    /// Offer fields.
    #[serde(default)]
    pub offer: Map<String, Value>,
    /// Promoter (user) fields.
    #[serde(default)]
    pub user: Map<String, Value>,
    /// Inbound postback fields.
    #[serde(default)]
    pub postback: Map<String, Value>,
    /// Free-form additions.
    #[serde(default)]
    pub custom: Map<String, Value>,
}

impl TaskContext {
    /// Look up a `section.key` path, e.g. `click.id` or `custom.source`.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        let (section, key) = path.split_once('.')?;
        let map = match section {
            "click" => &self.click,
            "conversion" => &self.conversion,
            "user_offer" => &self.user_offer,
            "offer" => &self.offer,
            "user" => &self.user,
            "postback" => &self.postback,
            "custom" => &self.custom,
            _ => return None,
        };
        map.get(key)
    }
}

//─────────────────────────────
//  Postback task
//─────────────────────────────

/// One step attempt of one pipeline execution, as carried by the queues.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostbackTask {
    /// Unique task identifier.
    pub task_id: Uuid,
    /// Groups all steps of one pipeline traversal.
    pub execution_id: Uuid,
    /// The pipeline being executed.
    pub pipeline_id: Uuid,
    /// Advertiser the pipeline delivers to, when known.
    #[serde(default)]
    pub advertiser_id: Option<Uuid>,
    /// Zero-based index of the step this task executes.
    pub step_index: u32,
    /// Template context for rendering and signing.
    pub context: TaskContext,
    /// Failed attempts so far in the current tier.
    pub attempts: u32,
    /// Primary-tier attempt budget copied from the pipeline; 0 = unlimited.
    pub max_attempts: u32,
    /// Current queue tier.
    pub tier: QueueTier,
    /// Scheduling priority class; lower values run first within a tier.
    pub priority: i64,
    /// Task creation time.
    pub created_at: DateTime<Utc>,
    /// Earliest time the task may next run.
    pub next_retry_at: DateTime<Utc>,
    /// Error message of the most recent failed attempt.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Correlation id threaded through logs and step results.
    pub correlation_id: Uuid,
}

impl PostbackTask {
    /// Create the step-0 task of a fresh execution.
    pub fn first_step(pipeline: &Pipeline, context: TaskContext, priority: i64) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            pipeline_id: pipeline.id,
            advertiser_id: pipeline.advertiser_id,
            step_index: 0,
            context,
            attempts: 0,
            max_attempts: pipeline.retry.max_attempts,
            tier: QueueTier::Primary,
            priority,
            created_at: now,
            next_retry_at: now,
            last_error: None,
            correlation_id: Uuid::new_v4(),
        }
    }

    /// The task for the next step of the same execution, reset to primary
    /// with a fresh attempt counter.
    pub fn advance(&self) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            execution_id: self.execution_id,
            pipeline_id: self.pipeline_id,
            advertiser_id: self.advertiser_id,
            step_index: self.step_index + 1,
            context: self.context.clone(),
            attempts: 0,
            max_attempts: self.max_attempts,
            tier: QueueTier::Primary,
            priority: self.priority,
            created_at: now,
            next_retry_at: now,
            last_error: None,
            correlation_id: self.correlation_id,
        }
    }

    /// Whether the task is due to run.
    pub fn ready(&self, now: DateTime<Utc>) -> bool {
        now >= self.next_retry_at
    }

    /// Sort-set score: `priority · 10^12 + created_unix_nanos`.
    pub fn score(&self) -> f64 {
        let nanos = self
            .created_at
            .timestamp_nanos_opt()
            .unwrap_or_default() as f64;
        self.priority as f64 * 1e12 + nanos
    }

    /// Stable idempotency key, identical across retries of the same step.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.execution_id, self.step_index)
    }
}

//─────────────────────────────
//  Step results
//─────────────────────────────

/// Terminal outcome of one step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// 2xx response received.
    Succeeded,
    /// Non-2xx response, network error or timeout.
    Failed,
}

/// Persisted record of one step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The task that ran.
    pub task_id: Uuid,
    /// The execution it belongs to.
    pub execution_id: Uuid,
    /// The pipeline executed.
    pub pipeline_id: Uuid,
    /// Step index within the pipeline.
    pub step_index: u32,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Fully rendered request URL.
    pub url: String,
    /// HTTP response status, when a response arrived.
    pub status_code: Option<u16>,
    /// Response body, trimmed to a bounded excerpt.
    pub response_excerpt: Option<String>,
    /// Error description for network failures and timeouts.
    pub error: Option<String>,
    /// Wall time of the attempt in milliseconds.
    pub duration_ms: u64,
    /// Attempt start.
    pub started_at: DateTime<Utc>,
    /// Attempt end.
    pub finished_at: DateTime<Utc>,
    /// Terminal outcome.
    pub outcome: StepOutcome,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline() -> Pipeline {
        Pipeline {
            id: Uuid::new_v4(),
            name: "test".to_string(),
            advertiser_id: None,
            steps: vec![PipelineStep::get("https://example.com/{click.id}")],
            retry: RetryPolicy::default(),
            failover_url: None,
        }
    }

    #[test]
    fn exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(300),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_secs(5));
        assert_eq!(policy.base_delay(2), Duration::from_secs(10));
        assert_eq!(policy.base_delay(3), Duration::from_secs(20));
        // Past the cap the delay stays flat.
        assert_eq!(policy.base_delay(10), Duration::from_secs(300));
        assert_eq!(policy.base_delay(60), Duration::from_secs(300));
    }

    #[test]
    fn fixed_delay_is_constant() {
        let policy = RetryPolicy {
            mode: BackoffMode::Fixed,
            base: Duration::from_secs(7),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_delay(1), Duration::from_secs(7));
        assert_eq!(policy.base_delay(5), Duration::from_secs(7));
    }

    #[test]
    fn zero_max_attempts_means_unlimited() {
        let policy = RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        };
        assert!(policy.may_retry(0));
        assert!(policy.may_retry(1_000_000));
    }

    #[test]
    fn advance_keeps_execution_and_resets_attempts() {
        let mut task = PostbackTask::first_step(&pipeline(), TaskContext::default(), 0);
        task.attempts = 4;
        task.tier = QueueTier::Primary;
        let next = task.advance();
        assert_eq!(next.execution_id, task.execution_id);
        assert_eq!(next.correlation_id, task.correlation_id);
        assert_eq!(next.step_index, 1);
        assert_eq!(next.attempts, 0);
        assert_eq!(next.tier, QueueTier::Primary);
        assert_ne!(next.task_id, task.task_id);
    }

    #[test]
    fn idempotency_key_is_stable_across_retries() {
        let mut task = PostbackTask::first_step(&pipeline(), TaskContext::default(), 0);
        let key = task.idempotency_key();
        task.attempts += 1;
        task.next_retry_at = Utc::now();
        assert_eq!(task.idempotency_key(), key);
    }

    #[test]
    fn tier_demotion_is_monotone() {
        assert_eq!(QueueTier::Primary.next(), Some(QueueTier::Failover));
        assert_eq!(QueueTier::Failover.next(), Some(QueueTier::Dlq));
        assert_eq!(QueueTier::Dlq.next(), None);
    }

    #[test]
    fn context_lookup_resolves_sections() {
        let mut ctx = TaskContext::default();
        ctx.click
            .insert("id".to_string(), Value::String("abc".to_string()));
        assert_eq!(ctx.lookup("click.id"), Some(&Value::String("abc".into())));
        assert_eq!(ctx.lookup("conversion.id"), None);
        assert_eq!(ctx.lookup("nonsense"), None);
    }
}
