//! Local HTTP surface: pull-based reads of the published cycle, the threat
//! feed and the log bus, plus process action requests and settings.

use crate::bus::{LogBus, LogCategory, LogEntry, LogFilter};
use crate::classifier::{ThreatEvent, Tier, TierThresholds};
use crate::config::{RuntimeConfig, SettingsStore};
use crate::error::{ActionError, ConfigError};
use crate::executor::ActionExecutor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::pipeline::CycleResult;
use crate::scoring::Reason;
use crate::threats::ThreatFeed;
use crate::types::{Pid, ProcessSnapshot};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

const DEFAULT_LOG_LIMIT: usize = 500;
const RECENT_THREATS: usize = 3;

#[derive(Clone)]
pub struct AppState {
    pub cycles: watch::Receiver<Arc<CycleResult>>,
    pub bus: Arc<LogBus>,
    pub threats: Arc<ThreatFeed>,
    pub executor: Arc<ActionExecutor>,
    pub metrics: Arc<Metrics>,
    pub settings: SettingsStore,
    pub thresholds: TierThresholds,
    pub started: Instant,
}

impl AppState {
    fn current(&self) -> Arc<CycleResult> {
        Arc::clone(&self.cycles.borrow())
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/status", get(status))
        .route("/cycle", get(cycle))
        .route("/export", get(export))
        .route("/health", get(health))
        .route("/processes", get(processes))
        .route("/processes/{pid}/kill", post(kill))
        .route("/processes/{pid}/kill-tree", post(kill_tree))
        .route("/processes/{pid}/location", get(location))
        .route("/threats", get(threats))
        .route("/logs", get(logs))
        .route("/settings", get(settings_get).put(settings_put))
        .with_state(state)
}

pub async fn serve<F>(listen: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = listen.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("[api] listening on http://{addr}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Action(ActionError),
    Config(ConfigError),
}

impl From<ActionError> for ApiError {
    fn from(err: ActionError) -> Self {
        ApiError::Action(err)
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        ApiError::Config(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failed: Vec<FailedPid>,
}

#[derive(Serialize)]
struct FailedPid {
    pid: Pid,
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message, failed) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, "bad_request", message, Vec::new()),
            ApiError::Config(err) => (
                StatusCode::BAD_REQUEST,
                "invalid_configuration",
                err.to_string(),
                Vec::new(),
            ),
            ApiError::Action(err) => {
                let status = match &err {
                    ActionError::NotFound(_) => StatusCode::NOT_FOUND,
                    ActionError::PermissionDenied(_) => StatusCode::FORBIDDEN,
                    ActionError::Refused { .. } => StatusCode::CONFLICT,
                    ActionError::PathUnavailable(_) => StatusCode::UNPROCESSABLE_ENTITY,
                    ActionError::EscalationExhausted(_)
                    | ActionError::PartialFailure { .. }
                    | ActionError::Os { .. } => StatusCode::INTERNAL_SERVER_ERROR,
                };
                let failed = match &err {
                    ActionError::PartialFailure { failed, .. } => failed
                        .iter()
                        .map(|(pid, error)| FailedPid {
                            pid: *pid,
                            error: error.clone(),
                        })
                        .collect(),
                    _ => Vec::new(),
                };
                (status, err.code(), err.to_string(), failed)
            }
        };
        if status.is_server_error() {
            warn!("[api] {code}: {message}");
        }
        (
            status,
            Json(ErrorBody {
                error: code,
                message,
                failed,
            }),
        )
            .into_response()
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    uptime_secs: u64,
    cycle: u64,
    last_cycle_at: Option<DateTime<Utc>>,
    processes: usize,
    health_score: f64,
    health_status: crate::health::HealthStatus,
    last_log_seq: u64,
    threat_events: usize,
    recent_threats: Vec<ThreatEvent>,
    settings: RuntimeConfig,
    metrics: MetricsSnapshot,
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let cycle = state.current();
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started.elapsed().as_secs(),
        cycle: cycle.cycle,
        last_cycle_at: (cycle.cycle > 0).then_some(cycle.timestamp),
        processes: cycle.process_table.len(),
        health_score: cycle.health.score,
        health_status: cycle.health.status,
        last_log_seq: state.bus.last_seq(),
        threat_events: state.threats.len(),
        recent_threats: state.threats.recent(RECENT_THREATS),
        settings: state.settings.snapshot(),
        metrics: state.metrics.snapshot(),
    })
}

async fn cycle(State(state): State<AppState>) -> Response {
    let cycle = state.current();
    Json(&*cycle).into_response()
}

#[derive(Serialize)]
struct Export<'a> {
    exported_at: DateTime<Utc>,
    thresholds: TierThresholds,
    cycle: &'a CycleResult,
    threats: Vec<ThreatEvent>,
}

async fn export(State(state): State<AppState>) -> Response {
    let cycle = state.current();
    let body = Export {
        exported_at: Utc::now(),
        thresholds: state.thresholds,
        cycle: &cycle,
        threats: state.threats.query(Tier::Low),
    };
    let disposition = format!(
        "attachment; filename=\"taskflux-snapshot-{}.json\"",
        cycle.cycle
    );
    ([(header::CONTENT_DISPOSITION, disposition)], Json(body)).into_response()
}

async fn health(State(state): State<AppState>) -> Response {
    let cycle = state.current();
    Json(&cycle.health).into_response()
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProcessQuery {
    suspicious: bool,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct ProcessRow<'a> {
    #[serde(flatten)]
    process: &'a ProcessSnapshot,
    score: Option<f64>,
    tier: Tier,
    reasons: &'a [Reason],
}

async fn processes(State(state): State<AppState>, Query(query): Query<ProcessQuery>) -> Response {
    let cycle = state.current();
    let rows: Vec<ProcessRow<'_>> = cycle
        .processes
        .iter()
        .map(|process| {
            let record = cycle.score(process.pid);
            let score = record.map(|r| r.score);
            ProcessRow {
                process,
                score,
                tier: score.map(|s| state.thresholds.classify(s)).unwrap_or_default(),
                reasons: record.map(|r| r.reasons.as_slice()).unwrap_or_default(),
            }
        })
        .filter(|row| !query.suspicious || row.tier.is_elevated())
        .take(query.limit.unwrap_or(usize::MAX))
        .collect();
    Json(rows).into_response()
}

async fn kill(State(state): State<AppState>, Path(pid): Path<Pid>) -> Result<Response, ApiError> {
    let report = state.executor.kill(pid).await?;
    Ok(Json(report).into_response())
}

async fn kill_tree(
    State(state): State<AppState>,
    Path(pid): Path<Pid>,
) -> Result<Response, ApiError> {
    let report = state.executor.kill_tree(pid).await?;
    Ok(Json(report).into_response())
}

async fn location(
    State(state): State<AppState>,
    Path(pid): Path<Pid>,
) -> Result<Response, ApiError> {
    let location = state.executor.locate(pid)?;
    Ok(Json(location).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ThreatQuery {
    min_tier: Option<String>,
    limit: Option<usize>,
}

async fn threats(
    State(state): State<AppState>,
    Query(query): Query<ThreatQuery>,
) -> Result<Json<Vec<ThreatEvent>>, ApiError> {
    let min_tier = match query.min_tier.as_deref() {
        Some(raw) => raw.parse::<Tier>().map_err(ApiError::BadRequest)?,
        None => Tier::Low,
    };
    let mut events = state.threats.query(min_tier);
    if let Some(limit) = query.limit {
        let skip = events.len().saturating_sub(limit);
        events.drain(..skip);
    }
    Ok(Json(events))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LogQueryParams {
    category: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    text: Option<String>,
    after: Option<u64>,
    limit: Option<usize>,
    /// Return the newest `tail` matches instead of the oldest.
    tail: Option<usize>,
}

#[derive(Serialize)]
struct LogsResponse {
    /// Cursor for the next tail request.
    last_seq: u64,
    entries: Vec<LogEntry>,
}

async fn logs(
    State(state): State<AppState>,
    Query(params): Query<LogQueryParams>,
) -> Result<Json<LogsResponse>, ApiError> {
    let category = params
        .category
        .as_deref()
        .map(str::parse::<LogCategory>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let filter = LogFilter {
        category,
        since: params.since,
        until: params.until,
        text: params.text,
        after: params.after,
        limit: Some(params.limit.unwrap_or(DEFAULT_LOG_LIMIT)),
    };
    let query = state.bus.query(filter);
    let entries: Vec<LogEntry> = match params.tail {
        Some(n) => query.newest(n).iter().map(|e| (**e).clone()).collect(),
        None => query.map(|entry| (*entry).clone()).collect(),
    };
    // An empty tail page still hands back a cursor at the live end.
    let last_seq = entries
        .last()
        .map(|e| e.seq)
        .or_else(|| params.tail.map(|_| state.bus.last_seq()))
        .unwrap_or_else(|| params.after.unwrap_or(0));
    Ok(Json(LogsResponse { last_seq, entries }))
}

async fn settings_get(State(state): State<AppState>) -> Json<RuntimeConfig> {
    Json(state.settings.snapshot())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SettingsPatch {
    refresh_interval_ms: Option<u64>,
    show_system_processes: Option<bool>,
    auto_sort: Option<bool>,
    splash_enabled: Option<bool>,
    max_consecutive_failures: Option<u32>,
}

async fn settings_put(
    State(state): State<AppState>,
    Json(patch): Json<SettingsPatch>,
) -> Result<Json<RuntimeConfig>, ApiError> {
    let mut next = state.settings.snapshot();
    if let Some(ms) = patch.refresh_interval_ms {
        next.refresh_interval_ms = ms;
    }
    if let Some(show) = patch.show_system_processes {
        next.show_system_processes = show;
    }
    if let Some(sort) = patch.auto_sort {
        next.auto_sort = sort;
    }
    if let Some(splash) = patch.splash_enabled {
        next.splash_enabled = splash;
    }
    if let Some(limit) = patch.max_consecutive_failures {
        next.max_consecutive_failures = limit;
    }
    state.settings.apply(next)?;
    Ok(Json(state.settings.snapshot()))
}
