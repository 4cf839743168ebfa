//! HTTP API.
//!
//! Entry point for the POS and for operators. Error responses share one
//! envelope `{error_code, message, retryable}` with a closed code set the
//! POS uses for control flow.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    middleware as axum_mw,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::breaker::CircuitBreaker;
use crate::buffer::BufferDb;
use crate::error::{AdapterError, ErrorCode};
use crate::fiscal::{FiscalizationService, SubmitRequest};
use crate::hlc::HybridLogicalClock;
use crate::metrics::AdapterMetrics;
use crate::models::{now_secs, BufferEvent, DlqEntry, Receipt, ReceiptStatus, ReceiptType};
use crate::sync::SyncHandle;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub fiscal: Arc<FiscalizationService>,
    pub buffer: Arc<BufferDb>,
    pub breaker: Arc<CircuitBreaker>,
    pub hlc: Arc<HybridLogicalClock>,
    pub metrics: Arc<AdapterMetrics>,
    /// None when no OFD is configured and the worker doesn't run.
    pub sync_handle: Option<SyncHandle>,
    pub started_at: i64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/kkt/receipt", post(post_receipt))
        .route("/v1/kkt/receipt/:id", get(get_receipt))
        .route("/v1/kkt/buffer/status", get(get_buffer_status))
        .route("/v1/kkt/buffer/sync", post(post_buffer_sync))
        .route("/v1/kkt/buffer/events", get(get_buffer_events))
        .route("/v1/kkt/dlq", get(get_dlq))
        .route("/v1/kkt/dlq/:id/resolve", post(post_dlq_resolve))
        .route("/v1/pos/refund", post(post_refund_check))
        .route("/v1/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(crate::middleware::logging::request_logging))
        .with_state(state)
}

/// Uniform error envelope.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error_code: &'static str,
    pub message: String,
    pub retryable: bool,
}

impl ErrorEnvelope {
    fn new(code: ErrorCode, message: String) -> Self {
        ErrorEnvelope {
            error_code: code.as_str(),
            message,
            retryable: code.retryable(),
        }
    }
}

#[derive(Debug)]
pub struct ApiError(AdapterError);

impl From<AdapterError> for ApiError {
    fn from(e: AdapterError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            AdapterError::BufferFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AdapterError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AdapterError::RefundBlocked { .. } => StatusCode::CONFLICT,
            AdapterError::LockContention => StatusCode::CONFLICT,
            AdapterError::Internal(e) => {
                error!(error = %e, "Request failed internally");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let envelope = ErrorEnvelope::new(self.0.code(), self.0.to_string());
        (status, Json(envelope)).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct ReceiptRequest {
    pub pos_id: String,
    #[serde(rename = "type")]
    pub receipt_type: String,
    #[serde(default)]
    pub original_id: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct ReceiptResponse {
    pub id: String,
    pub status: String,
}

/// `POST /v1/kkt/receipt`: Phase 1 entry point.
pub async fn post_receipt(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ReceiptRequest>,
) -> Result<Json<ReceiptResponse>, ApiError> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            AdapterError::InvalidRequest("Idempotency-Key header is required".into())
        })?;

    let receipt_type = ReceiptType::from_str(&body.receipt_type).ok_or_else(|| {
        AdapterError::InvalidRequest(format!("unknown receipt type: {}", body.receipt_type))
    })?;

    let outcome = state
        .fiscal
        .submit(SubmitRequest {
            pos_id: body.pos_id,
            receipt_type,
            original_id: body.original_id,
            payload: body.payload,
            idempotency_key,
        })
        .await?;

    Ok(Json(ReceiptResponse {
        id: outcome.id,
        status: outcome.status,
    }))
}

/// `GET /v1/kkt/receipt/:id`: lookup for support tooling.
pub async fn get_receipt(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Receipt>, StatusCode> {
    state
        .buffer
        .get(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Serialize)]
pub struct BufferStatusResponse {
    #[serde(flatten)]
    pub buffer: crate::models::BufferStatus,
    pub circuit_breaker_state: &'static str,
}

pub async fn get_buffer_status(
    State(state): State<AppState>,
) -> Result<Json<BufferStatusResponse>, ApiError> {
    let buffer = state
        .buffer
        .status()
        .map_err(|e| AdapterError::Internal(e.into()))?;
    Ok(Json(BufferStatusResponse {
        buffer,
        circuit_breaker_state: state.breaker.state().as_str(),
    }))
}

#[derive(Debug, Serialize)]
pub struct SyncAccepted {
    pub accepted: bool,
}

/// `POST /v1/kkt/buffer/sync`: forced sync. 202 when the trigger lands,
/// 409 while a cycle already holds the lock.
pub async fn post_buffer_sync(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    let Some(handle) = &state.sync_handle else {
        return Err(ApiError(AdapterError::Internal(anyhow::anyhow!(
            "sync worker is not running (no OFD configured)"
        ))));
    };
    handle.request_sync()?;
    Ok((StatusCode::ACCEPTED, Json(SyncAccepted { accepted: true })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub limit: Option<usize>,
}

pub async fn get_buffer_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<Vec<BufferEvent>>, StatusCode> {
    let limit = query.limit.unwrap_or(100).min(1_000);
    state
        .buffer
        .recent_events(limit)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
pub struct DlqQuery {
    pub limit: Option<usize>,
    pub include_resolved: Option<bool>,
}

pub async fn get_dlq(
    State(state): State<AppState>,
    Query(query): Query<DlqQuery>,
) -> Result<Json<Vec<DlqEntry>>, StatusCode> {
    let limit = query.limit.unwrap_or(100).min(1_000);
    let unresolved_only = !query.include_resolved.unwrap_or(false);
    state
        .buffer
        .list_dlq(unresolved_only, limit)
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

#[derive(Debug, Deserialize)]
pub struct DlqResolveRequest {
    pub resolved_by: String,
}

pub async fn post_dlq_resolve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<DlqResolveRequest>,
) -> Result<StatusCode, StatusCode> {
    match state.buffer.resolve_dlq(&id, &body.resolved_by) {
        Ok(true) => Ok(StatusCode::OK),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

#[derive(Debug, Deserialize)]
pub struct RefundCheckRequest {
    pub original_fiscal_doc_id: String,
}

#[derive(Debug, Serialize)]
pub struct RefundCheckResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<ReceiptStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

/// `POST /v1/pos/refund`: advisory check for the POS. 409 iff the
/// antecedent is present in the live buffer and not yet synced.
pub async fn post_refund_check(
    State(state): State<AppState>,
    Json(body): Json<RefundCheckRequest>,
) -> Result<Response, ApiError> {
    let check = state.fiscal.check_refund(&body.original_fiscal_doc_id)?;
    let response = RefundCheckResponse {
        allowed: check.allowed,
        sync_status: check.sync_status,
        reason: (!check.allowed).then_some("antecedent not synced"),
    };
    let status = if check.allowed {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((status, Json(response)).into_response())
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_s: i64,
    pub buffer: &'static str,
    pub circuit_breaker: &'static str,
    pub sync_worker: &'static str,
    pub hlc_drift_s: i64,
}

/// `GET /v1/health`: readiness probe. Cheap: one read, no writes.
pub async fn get_health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let buffer_ok = state.buffer.ping();
    let sync_worker = match &state.sync_handle {
        Some(h) if h.is_running() => "running",
        Some(_) => "idle",
        None => "disabled",
    };

    let response = HealthResponse {
        status: if buffer_ok { "ok" } else { "degraded" },
        uptime_s: now_secs() - state.started_at,
        buffer: if buffer_ok { "ok" } else { "unavailable" },
        circuit_breaker: state.breaker.state().as_str(),
        sync_worker,
        hlc_drift_s: state.hlc.drift_secs(),
    };
    let code = if buffer_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}

/// `GET /metrics`: Prometheus text exposition.
pub async fn get_metrics(State(state): State<AppState>) -> Response {
    if let Ok(status) = state.buffer.status() {
        state
            .metrics
            .set_buffer_levels(status.in_flight(), status.fullness, status.dlq_size);
    }
    state.metrics.set_hlc_drift(state.hlc.drift_secs());

    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::kkt::{KktDriver, PrintOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct AlwaysPrints;

    #[async_trait]
    impl KktDriver for AlwaysPrints {
        async fn print(&self, _payload: &Value) -> PrintOutcome {
            PrintOutcome::Printed
        }
    }

    fn state() -> (AppState, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let buffer = Arc::new(BufferDb::open(temp.path().to_str().unwrap(), 10).unwrap());
        let metrics = Arc::new(AdapterMetrics::new());
        let breaker = Arc::new(CircuitBreaker::new(
            BreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
                success_threshold: 2,
            },
            metrics.clone(),
        ));
        let hlc = Arc::new(HybridLogicalClock::new());
        let fiscal = Arc::new(FiscalizationService::new(
            buffer.clone(),
            hlc.clone(),
            Arc::new(AlwaysPrints),
            None,
            metrics.clone(),
            80,
            100,
        ));
        (
            AppState {
                fiscal,
                buffer,
                breaker,
                hlc,
                metrics,
                sync_handle: None,
                started_at: now_secs(),
            },
            temp,
        )
    }

    fn receipt_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Idempotency-Key", "k-A1".parse().unwrap());
        headers
    }

    fn sale_body() -> ReceiptRequest {
        ReceiptRequest {
            pos_id: "POS-001".into(),
            receipt_type: "sale".into(),
            original_id: None,
            payload: json!({ "total": 1000 }),
        }
    }

    #[tokio::test]
    async fn test_receipt_accepted() {
        let (state, _t) = state();
        let response = post_receipt(State(state), receipt_headers(), Json(sale_body()))
            .await
            .unwrap();
        assert_eq!(response.0.status, "printed");
        assert!(!response.0.id.is_empty());
    }

    #[tokio::test]
    async fn test_missing_idempotency_key_is_400() {
        let (state, _t) = state();
        let err = post_receipt(State(state), HeaderMap::new(), Json(sale_body()))
            .await
            .unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_type_is_400() {
        let (state, _t) = state();
        let mut body = sale_body();
        body.receipt_type = "loan".into();
        let err = post_receipt(State(state), receipt_headers(), Json(body))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_buffer_full_is_503() {
        let (state, _t) = state();
        for i in 0..10 {
            let mut headers = HeaderMap::new();
            headers.insert("Idempotency-Key", format!("k-{i}").parse().unwrap());
            post_receipt(State(state.clone()), headers, Json(sale_body()))
                .await
                .unwrap();
        }

        let mut headers = HeaderMap::new();
        headers.insert("Idempotency-Key", "k-overflow".parse().unwrap());
        let err = post_receipt(State(state), headers, Json(sale_body()))
            .await
            .unwrap_err();
        assert_eq!(
            err.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_refund_check_conflict_then_ok() {
        // Refund gate over the HTTP surface.
        let (state, _t) = state();
        let accepted = post_receipt(State(state.clone()), receipt_headers(), Json(sale_body()))
            .await
            .unwrap();
        let id = accepted.0.id.clone();

        let response = post_refund_check(
            State(state.clone()),
            Json(RefundCheckRequest {
                original_fiscal_doc_id: id.clone(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        state.buffer.claim_one(&id).unwrap();
        state.buffer.mark_synced(&id, 5).unwrap();

        let response = post_refund_check(
            State(state),
            Json(RefundCheckRequest {
                original_fiscal_doc_id: id,
            }),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_reports_subsystems() {
        let (state, _t) = state();
        let (code, Json(health)) = get_health(State(state)).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(health.status, "ok");
        assert_eq!(health.circuit_breaker, "closed");
        assert_eq!(health.sync_worker, "disabled");
    }

    #[tokio::test]
    async fn test_status_joins_breaker_state() {
        let (state, _t) = state();
        let Json(status) = get_buffer_status(State(state)).await.unwrap();
        assert_eq!(status.circuit_breaker_state, "closed");
        assert_eq!(status.buffer.capacity, 10);
    }
}
