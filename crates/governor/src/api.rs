//! HTTP API for the governance surface, health checks and metrics

use governor_lib::{
    health::{ComponentStatus, HealthRegistry},
    models::{
        BudgetPeriod, BudgetRule, BudgetScope, InheritanceMode, MetricKind, RateLimitRule,
        UsageEvent,
    },
    policy::SyncReport,
    Governor, GovernorError, PolicyScope,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<Governor>,
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(governor: Arc<Governor>, health_registry: HealthRegistry) -> Self {
        Self {
            governor,
            health_registry,
        }
    }
}

/// JSON error body returned for failed requests
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(err: GovernorError) -> Response {
    let status = match err {
        GovernorError::Validation(_) => StatusCode::BAD_REQUEST,
        GovernorError::NotFound { .. } => StatusCode::NOT_FOUND,
        GovernorError::PolicyConflict { .. } => StatusCode::CONFLICT,
        GovernorError::InsufficientData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        GovernorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody {
            error: err.to_string(),
        }),
    )
        .into_response()
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn record_usage(
    State(state): State<Arc<AppState>>,
    Json(event): Json<UsageEvent>,
) -> Response {
    match state.governor.record_usage(event) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreateBudgetRequest {
    /// Agent id, or omitted for a global budget
    agent_id: Option<String>,
    metric: MetricKind,
    limit: f64,
    period: BudgetPeriod,
    alert_threshold: f64,
    enforce_limit: bool,
}

async fn create_budget(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBudgetRequest>,
) -> Response {
    let scope = match req.agent_id {
        Some(id) => BudgetScope::Agent(id),
        None => BudgetScope::Global,
    };
    match state.governor.budgets().create_budget(
        scope,
        req.metric,
        req.limit,
        req.period,
        req.alert_threshold,
        req.enforce_limit,
    ) {
        Ok(budget) => (StatusCode::CREATED, Json(budget)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CheckBudgetRequest {
    agent_id: String,
    metric: MetricKind,
    amount: f64,
}

async fn check_budget(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckBudgetRequest>,
) -> Response {
    match state
        .governor
        .check_budget(&req.agent_id, req.metric, req.amount)
        .await
    {
        Ok(decision) => Json(decision).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct BudgetStatusQuery {
    agent_id: String,
    metric: MetricKind,
}

async fn budget_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BudgetStatusQuery>,
) -> Response {
    Json(state.governor.budget_status(&query.agent_id, query.metric)).into_response()
}

#[derive(Debug, Deserialize)]
struct CheckRateLimitRequest {
    agent_id: String,
}

async fn check_rate_limit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRateLimitRequest>,
) -> Response {
    Json(state.governor.check_rate_limit(&req.agent_id)).into_response()
}

#[derive(Debug, Deserialize)]
struct AnomaliesQuery {
    /// Aggregation window in seconds; the scan default when omitted
    window_secs: Option<u64>,
}

async fn detect_anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomaliesQuery>,
) -> Response {
    let anomalies = match query.window_secs {
        Some(secs) => {
            state
                .governor
                .detect_anomalies(Duration::from_secs(secs))
                .await
        }
        None => state.governor.scan().await,
    };
    Json(anomalies).into_response()
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn anomaly_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    Json(state.governor.anomaly_history(query.limit.unwrap_or(100))).into_response()
}

#[derive(Debug, Deserialize)]
struct SpikesQuery {
    agent_id: String,
    metric: MetricKind,
    from: i64,
    to: i64,
}

async fn analyze_spikes(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SpikesQuery>,
) -> Response {
    match state
        .governor
        .analyze_spikes(&query.agent_id, query.metric, query.from, query.to)
    {
        Ok(report) => Json(report).into_response(),
        Err(e) => error_response(e),
    }
}

async fn effective_policy(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Response {
    match state.governor.effective_policy(&agent_id) {
        Ok(policy) => Json(policy).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct CreatePolicyRequest {
    scope: PolicyScope,
    scope_id: String,
    priority: Option<u32>,
    mode: InheritanceMode,
    #[serde(default)]
    budgets: Vec<BudgetRule>,
    rate_limit: Option<RateLimitRule>,
    #[serde(default)]
    alert_channels: BTreeSet<String>,
}

async fn create_policy(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreatePolicyRequest>,
) -> Response {
    let priority = req.priority.unwrap_or_else(|| req.scope.default_priority());
    match state.governor.resolver().create_policy(
        req.scope,
        &req.scope_id,
        priority,
        req.mode,
        req.budgets,
        req.rate_limit,
        req.alert_channels,
    ) {
        Ok(policy) => (StatusCode::CREATED, Json(policy)).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct SyncPoliciesRequest {
    #[serde(default)]
    dry_run: bool,
    scope: Option<PolicyScope>,
    scope_id: Option<String>,
}

async fn sync_policies(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SyncPoliciesRequest>,
) -> Json<SyncReport> {
    let scope = match (req.scope, req.scope_id) {
        (Some(scope), Some(scope_id)) => Some((scope, scope_id)),
        _ => None,
    };
    Json(state.governor.sync_policies(req.dry_run, scope))
}

#[derive(Debug, Deserialize)]
struct RegisterAgentRequest {
    agent_id: String,
    project_id: String,
    org_id: String,
}

async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterAgentRequest>,
) -> StatusCode {
    state
        .governor
        .register_agent(&req.agent_id, &req.project_id, &req.org_id);
    StatusCode::NO_CONTENT
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/usage", post(record_usage))
        .route("/v1/agents", post(register_agent))
        .route("/v1/budgets", post(create_budget))
        .route("/v1/budgets/check", post(check_budget))
        .route("/v1/budgets/status", get(budget_status))
        .route("/v1/ratelimit/check", post(check_rate_limit))
        .route("/v1/anomalies", get(detect_anomalies))
        .route("/v1/anomalies/history", get(anomaly_history))
        .route("/v1/anomalies/spikes", get(analyze_spikes))
        .route("/v1/policies", post(create_policy))
        .route("/v1/policies/effective/:agent_id", get(effective_policy))
        .route("/v1/policies/sync", post(sync_policies))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
