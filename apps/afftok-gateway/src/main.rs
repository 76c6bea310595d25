#![forbid(unsafe_code)]

//! **afftok-gateway** – HTTP edge for the Afftok core.
//!
//! Exposes the ingest endpoints (single click, batch, JSONL, gzip, edge
//! envelope), the inbound postback endpoint, the DLQ admin hooks and the
//! health probe. All heavy lifting happens in the core; this binary wires
//! configuration, logging and graceful shutdown around it.
//!
//! ## Usage
//!
//! ```bash
//! # Development: in-memory cache and store
//! afftok-gateway --wal-dir data/wal
//!
//! # Production shape
//! afftok-gateway --wal-dir /var/lib/afftok/wal \
//!     --cache redis --store postgres \
//!     --pipelines config/pipelines.json
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use afftok_dispatch::DispatchError;
use afftok_ingest::{DropReason, IngestOutcome};
use afftok_runtime::{CacheBackend, Core, CoreConfig, StoreBackend};
use afftok_signing::HEADER_SIGNATURE;
use afftok_types::{BatchEnvelope, Pipeline, RawEvent};

/// Key-ring handle used for inbound postback verification.
const INBOUND_KEY_HANDLE: &str = "inbound";

//─────────────────────────────
//  CLI structure
//─────────────────────────────

#[derive(Parser)]
#[command(name = "afftok-gateway")]
#[command(about = "Afftok core gateway - event ingestion and postback delivery")]
#[command(version)]
struct Cli {
    /// WAL segment directory
    #[arg(long, default_value = "data/wal")]
    wal_dir: String,

    /// Cache driver (memory, redis)
    #[arg(long, default_value = "memory")]
    cache: String,

    /// Redis connection URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1/")]
    redis_url: String,

    /// Relational store driver (memory, postgres)
    #[arg(long, default_value = "memory")]
    store: String,

    /// Postgres connection URL
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Connection pool size for the store
    #[arg(long, default_value = "16")]
    db_pool: u32,

    /// HTTP listen port
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Pipelines configuration file (JSON array)
    #[arg(long)]
    pipelines: Option<String>,

    /// Signing secret required on inbound postbacks; unset leaves the
    /// endpoint open
    #[arg(long, env = "POSTBACK_SIGNING_KEY")]
    postback_signing_key: Option<String>,

    /// Outbound signing secrets as handle=secret pairs, comma separated
    #[arg(long, env = "SIGNING_KEYS")]
    signing_keys: Option<String>,
}

//─────────────────────────────
//  Service state
//─────────────────────────────

#[derive(Clone)]
struct GatewayState {
    core: Arc<Core>,
    draining: Arc<AtomicBool>,
    verify_postbacks: bool,
}

//─────────────────────────────
//  Main application
//─────────────────────────────

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli.log_level) {
        eprintln!("logging init failed: {e}");
        std::process::exit(1);
    }

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal initialization failure");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    info!("starting afftok-gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = build_core_config(&cli)?;
    let verify_postbacks = cli.postback_signing_key.is_some();
    let core = Core::start(config).await?;
    info!("core initialized");

    let state = GatewayState {
        core: core.clone(),
        draining: Arc::new(AtomicBool::new(false)),
        verify_postbacks,
    };

    let app = create_app(state.clone());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cli.port))
        .await
        .with_context(|| format!("failed to bind port {}", cli.port))?;
    info!(port = cli.port, "gateway listening");

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "http server error");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    state.draining.store(true, Ordering::SeqCst);
    core.shutdown().await?;
    info!("afftok-gateway stopped");
    Ok(())
}

fn build_core_config(cli: &Cli) -> Result<CoreConfig> {
    let mut config = CoreConfig::new(&cli.wal_dir);

    config.cache = match cli.cache.as_str() {
        "memory" => CacheBackend::Memory,
        #[cfg(feature = "redis-cache")]
        "redis" => CacheBackend::Redis {
            url: cli.redis_url.clone(),
        },
        other => anyhow::bail!("unsupported cache driver: {other}"),
    };

    config.store = match cli.store.as_str() {
        "memory" => StoreBackend::Memory,
        #[cfg(feature = "postgres")]
        "postgres" => StoreBackend::Postgres {
            url: cli
                .database_url
                .clone()
                .context("--store postgres requires DATABASE_URL")?,
            max_connections: cli.db_pool,
        },
        other => anyhow::bail!("unsupported store driver: {other}"),
    };

    if let Some(path) = &cli.pipelines {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read pipelines file {path}"))?;
        let pipelines: Vec<Pipeline> =
            serde_json::from_str(&raw).context("pipelines file is not a JSON array")?;
        info!(count = pipelines.len(), "pipelines loaded");
        config.pipelines = pipelines;
    }

    let mut keys = HashMap::new();
    if let Some(pairs) = &cli.signing_keys {
        for pair in pairs.split(',').filter(|p| !p.trim().is_empty()) {
            let Some((handle, secret)) = pair.split_once('=') else {
                anyhow::bail!("signing key entry without '=': {pair}");
            };
            keys.insert(handle.trim().to_string(), secret.to_string());
        }
    }
    if let Some(secret) = &cli.postback_signing_key {
        keys.insert(INBOUND_KEY_HANDLE.to_string(), secret.clone());
    }
    config.signing_keys = keys;

    Ok(config)
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| anyhow::anyhow!("tracing init failed: {e}"))?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

//─────────────────────────────
//  HTTP application
//─────────────────────────────

fn create_app(state: GatewayState) -> Router {
    Router::new()
        .route("/ingest/click", post(ingest_click))
        .route("/ingest/click.batch", post(ingest_click_batch))
        .route("/ingest/click.jsonl", post(ingest_click_jsonl))
        .route("/ingest/click.gzip", post(ingest_click_gzip))
        .route("/ingest/edge", post(ingest_edge))
        .route("/postback", get(inbound_postback).post(inbound_postback))
        .route("/dlq", get(list_dlq))
        .route("/dlq/:task_id/replay", post(replay_dlq))
        .route("/health", get(health))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

fn drain_guard(state: &GatewayState) -> Option<(StatusCode, Json<Value>)> {
    if state.draining.load(Ordering::SeqCst) {
        Some((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "draining"})),
        ))
    } else {
        None
    }
}

fn outcome_response(outcome: IngestOutcome) -> (StatusCode, Json<Value>) {
    match outcome {
        IngestOutcome::Admitted { id, seq } => (
            StatusCode::ACCEPTED,
            Json(json!({"status": "accepted", "id": id, "seq": seq})),
        ),
        IngestOutcome::Dropped { reason } => match reason {
            DropReason::Backpressure => (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({"error": "backpressure"})),
            ),
            DropReason::UnknownKind(kind) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "unknown event kind", "kind": kind})),
            ),
            DropReason::UnresolvedTrackingCode(code) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "unresolved tracking code", "tracking_code": code})),
            ),
            DropReason::TenantTooLong => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "tenant id too long"})),
            ),
        },
    }
}

fn internal_error(e: impl std::fmt::Display) -> (StatusCode, Json<Value>) {
    let correlation_id = Uuid::new_v4();
    error!(correlation_id = %correlation_id, error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal", "correlation_id": correlation_id})),
    )
}

async fn ingest_click(
    State(state): State<GatewayState>,
    Json(mut body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    if let Some(resp) = drain_guard(&state) {
        return resp;
    }
    // Bare click payloads may omit the kind tag.
    if let Some(map) = body.as_object_mut() {
        map.entry("type").or_insert(json!("click"));
    }
    let raw: RawEvent = match serde_json::from_value(body) {
        Ok(raw) => raw,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": format!("malformed event: {e}")})),
            )
        }
    };
    match state.core.ingest().ingest_event(raw).await {
        Ok(outcome) => outcome_response(outcome),
        Err(e) => internal_error(e),
    }
}

async fn ingest_click_batch(
    State(state): State<GatewayState>,
    Json(envelope): Json<BatchEnvelope>,
) -> (StatusCode, Json<Value>) {
    if let Some(resp) = drain_guard(&state) {
        return resp;
    }
    match state.core.ingest().ingest_batch(envelope.events).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(json!({"processed": outcome.processed, "failed": outcome.failed})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn ingest_click_jsonl(
    State(state): State<GatewayState>,
    body: String,
) -> (StatusCode, Json<Value>) {
    if let Some(resp) = drain_guard(&state) {
        return resp;
    }
    match state.core.ingest().ingest_jsonl(&body).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(json!({"processed": outcome.processed, "failed": outcome.failed})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn ingest_click_gzip(
    State(state): State<GatewayState>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(resp) = drain_guard(&state) {
        return resp;
    }
    match state.core.ingest().ingest_gzip(&body).await {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(json!({"processed": outcome.processed, "failed": outcome.failed})),
        ),
        Err(afftok_ingest::IngestError::Decode(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("decode failed: {e}")})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn ingest_edge(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(resp) = drain_guard(&state) {
        return resp;
    }
    let gzipped = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"))
        || body.starts_with(&[0x1f, 0x8b]);

    let result = if gzipped {
        state.core.ingest().ingest_gzip(&body).await
    } else {
        match serde_json::from_slice::<BatchEnvelope>(&body) {
            Ok(envelope) => state.core.ingest().ingest_batch(envelope.events).await,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": format!("malformed envelope: {e}")})),
                )
            }
        }
    };
    match result {
        Ok(outcome) => (
            StatusCode::ACCEPTED,
            Json(json!({"processed": outcome.processed, "failed": outcome.failed})),
        ),
        Err(afftok_ingest::IngestError::Decode(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("decode failed: {e}")})),
        ),
        Err(e) => internal_error(e),
    }
}

//─────────────────────────────
//  Inbound postback
//─────────────────────────────

#[derive(Debug, Deserialize)]
struct PostbackParams {
    click_id: String,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Serialize)]
struct PostbackResponse {
    success: bool,
    conversion_id: Uuid,
}

async fn inbound_postback(
    State(state): State<GatewayState>,
    Query(params): Query<PostbackParams>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    if let Some(resp) = drain_guard(&state) {
        return resp;
    }

    if state.verify_postbacks {
        let Some(signature) = headers
            .get(HEADER_SIGNATURE)
            .and_then(|v| v.to_str().ok())
        else {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "missing signature"})),
            );
        };
        // POST bodies are signed as-is; GET postbacks sign the click id.
        let message: Vec<u8> = if body.is_empty() {
            params.click_id.as_bytes().to_vec()
        } else {
            body.to_vec()
        };
        if !state
            .core
            .signer()
            .verify(&message, signature, INBOUND_KEY_HANDLE)
        {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "invalid signature"})),
            );
        }
    }

    let Ok(click_id) = params.click_id.parse::<Uuid>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid click_id"})),
        );
    };
    let order_id = params.order_id.unwrap_or_else(|| click_id.to_string());
    let amount = params.amount.unwrap_or(0.0);
    let currency = params.currency.unwrap_or_else(|| "USD".to_string());
    let status = params.status.unwrap_or_else(|| "approved".to_string());

    match state
        .core
        .record_postback(click_id, &order_id, amount, &currency, &status)
        .await
    {
        Ok(Some(record)) => (
            StatusCode::OK,
            Json(
                serde_json::to_value(PostbackResponse {
                    success: true,
                    conversion_id: record.conversion_id,
                })
                .unwrap_or_else(|_| json!({"success": true})),
            ),
        ),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "unknown click id"})),
        ),
        Err(e) => internal_error(e),
    }
}

//─────────────────────────────
//  DLQ admin hooks
//─────────────────────────────

async fn list_dlq(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
    match state.core.dispatcher().dlq_tasks(100).await {
        Ok(tasks) => (
            StatusCode::OK,
            Json(json!({"count": tasks.len(), "tasks": tasks})),
        ),
        Err(e) => internal_error(e),
    }
}

async fn replay_dlq(
    State(state): State<GatewayState>,
    Path(task_id): Path<Uuid>,
) -> (StatusCode, Json<Value>) {
    match state.core.dispatcher().replay_dlq(task_id).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "requeued"}))),
        Err(DispatchError::TaskNotFound(_)) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "task not found"})),
        ),
        Err(e) => internal_error(e),
    }
}

//─────────────────────────────
//  Health
//─────────────────────────────

async fn health(State(state): State<GatewayState>) -> (StatusCode, Json<Value>) {
    let snapshot = state.core.health().await;
    let code = StatusCode::OK;
    match serde_json::to_value(&snapshot) {
        Ok(value) => (code, Json(value)),
        Err(e) => internal_error(e),
    }
}
