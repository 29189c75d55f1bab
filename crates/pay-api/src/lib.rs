//! Payment Gateway API
//!
//! HTTP endpoints for:
//! - Payment ingress (`POST /payments`)
//! - Aggregated summary (`GET /payments-summary`)
//! - Test-only state purge (`DELETE /payments`)
//! - Health and Kubernetes probes

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use pay_common::{amount_to_cents, Payment, ProcessorKind};
use pay_router::PaymentRouter;
use pay_store::{AuditStore, JobQueue, PurgeStore, StoreError, SummaryStore};
use thiserror::Error;
use tracing::{debug, error, warn};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub mod model;
use model::{
    BreakerStatesResponse, HealthResponse, PaymentAcceptedResponse, PaymentRequest,
    PaymentsSummaryResponse, ProbeResponse, ProcessorSummaryResponse, PurgeResponse, SummaryQuery,
};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,
    pub summary: Arc<dyn SummaryStore>,
    pub purge: Arc<dyn PurgeStore>,
    pub audit: Arc<dyn AuditStore>,
    pub router: Arc<PaymentRouter>,
    /// Queue depth at which ingress starts answering 503; zero disables.
    pub max_queue_depth: u64,
    pub worker_count: usize,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("queue is at capacity")]
    Overloaded,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Validation(_) | ApiError::InvalidDate(_) => StatusCode::BAD_REQUEST,
            ApiError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Store(e) => {
                error!(error = %e, "storage failure");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Payment Gateway API",
        version = "0.1.0",
        description = "Asynchronous payment routing with processor failover",
        license(name = "MIT"),
    ),
    paths(
        create_payment,
        payments_summary,
        purge_payments,
        health_handler,
        liveness_probe,
        readiness_probe,
    ),
    components(schemas(
        PaymentRequest,
        PaymentAcceptedResponse,
        PaymentsSummaryResponse,
        ProcessorSummaryResponse,
        BreakerStatesResponse,
        HealthResponse,
        ProbeResponse,
        PurgeResponse,
    )),
    tags(
        (name = "payments", description = "Payment ingress and summary"),
        (name = "health", description = "Health check endpoints"),
    )
)]
pub struct ApiDoc;

/// Create the full router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/payments", post(create_payment).delete(purge_payments))
        .route("/payments-summary", get(payments_summary))
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .with_state(state)
}

// ============================================================================
// Payment Ingress
// ============================================================================

#[utoipa::path(
    post,
    path = "/payments",
    tag = "payments",
    request_body = PaymentRequest,
    responses(
        (status = 202, description = "Payment accepted for asynchronous processing", body = PaymentAcceptedResponse),
        (status = 400, description = "Malformed body or invalid amount"),
        (status = 503, description = "Queue at capacity"),
        (status = 500, description = "Enqueue failed"),
    )
)]
async fn create_payment(
    State(state): State<AppState>,
    payload: Result<Json<PaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<PaymentAcceptedResponse>), ApiError> {
    let Json(request) =
        payload.map_err(|e| ApiError::Validation(format!("invalid request body: {e}")))?;

    let amount_cents = amount_to_cents(request.amount).ok_or_else(|| {
        ApiError::Validation(
            "amount must be positive with at most two fractional digits".to_string(),
        )
    })?;

    if state.max_queue_depth > 0 && state.queue.depth().await? >= state.max_queue_depth {
        return Err(ApiError::Overloaded);
    }

    if !state.summary.try_accept(request.correlation_id).await? {
        // Resubmission of a known correlation id: same response, no second
        // enqueue, no second aggregate increment.
        debug!(correlation_id = %request.correlation_id, "correlation id already accepted");
        return Ok((StatusCode::ACCEPTED, Json(PaymentAcceptedResponse::default())));
    }

    let payment = Payment::accepted(request.correlation_id, amount_cents, Utc::now());

    // The queue is the durability boundary: the enqueue must succeed before
    // the 202. On failure the accepted flag is released so the client can
    // retry the same correlation id after the 500. The audit insert is
    // recovery-only and runs off the hot path.
    if let Err(e) = state.queue.publish(&payment.job()).await {
        if let Err(release_err) = state.summary.release_accept(request.correlation_id).await {
            warn!(
                correlation_id = %request.correlation_id,
                error = %release_err,
                "failed to release accepted flag after enqueue failure"
            );
        }
        return Err(e.into());
    }

    let audit = state.audit.clone();
    tokio::spawn(async move {
        if let Err(e) = audit.record_accepted(&payment).await {
            warn!(payment_id = %payment.id, error = %e, "audit insert failed");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(PaymentAcceptedResponse::default())))
}

// ============================================================================
// Summary
// ============================================================================

fn parse_bound(value: Option<&str>, name: &str) -> Result<Option<DateTime<Utc>>, ApiError> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|_| ApiError::InvalidDate(format!("{name} must be RFC 3339"))),
    }
}

#[utoipa::path(
    get,
    path = "/payments-summary",
    tag = "payments",
    params(SummaryQuery),
    responses(
        (status = 200, description = "Aggregated totals per processor", body = PaymentsSummaryResponse),
        (status = 400, description = "Invalid date bound"),
    )
)]
async fn payments_summary(
    State(state): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Result<Json<PaymentsSummaryResponse>, ApiError> {
    let from = parse_bound(query.from.as_deref(), "from")?;
    let to = parse_bound(query.to.as_deref(), "to")?;

    let totals = state.summary.summary(from, to).await?;
    Ok(Json(totals.into()))
}

// ============================================================================
// Purge (test-only)
// ============================================================================

#[utoipa::path(
    delete,
    path = "/payments",
    tag = "payments",
    responses(
        (status = 200, description = "All payment state cleared", body = PurgeResponse),
        (status = 500, description = "Purge failed"),
    )
)]
async fn purge_payments(
    State(state): State<AppState>,
) -> Result<Json<PurgeResponse>, ApiError> {
    state.purge.purge().await?;
    state.audit.clear().await?;
    state.router.reset_breakers();

    Ok(Json(PurgeResponse {
        message: "all payment state cleared".to_string(),
    }))
}

// ============================================================================
// Health Endpoints
// ============================================================================

#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Readiness info", body = HealthResponse)
    )
)]
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let queue_depth = match state.queue.depth().await {
        Ok(depth) => Some(depth),
        Err(e) => {
            warn!(error = %e, "queue unreachable during health check");
            None
        }
    };

    let breakers = state.router.breakers();
    Json(HealthResponse {
        status: if queue_depth.is_some() { "UP" } else { "DEGRADED" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_depth,
        workers: state.worker_count,
        breakers: BreakerStatesResponse {
            default: breakers
                .for_kind(ProcessorKind::Default)
                .state()
                .as_str()
                .to_string(),
            fallback: breakers
                .for_kind(ProcessorKind::Fallback)
                .state()
                .as_str()
                .to_string(),
        },
    })
}

/// Kubernetes liveness probe - returns 200 if the application is running
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is live", body = ProbeResponse)
    )
)]
async fn liveness_probe() -> impl IntoResponse {
    (StatusCode::OK, Json(ProbeResponse { status: "LIVE".to_string() }))
}

/// Kubernetes readiness probe - returns 200 if ready to accept traffic
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready", body = ProbeResponse),
        (status = 503, description = "Application is not ready", body = ProbeResponse)
    )
)]
async fn readiness_probe(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.depth().await {
        Ok(_) => (StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() })),
        Err(e) => {
            warn!(error = %e, "readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ProbeResponse { status: "NOT_READY".to_string() }),
            )
        }
    }
}
