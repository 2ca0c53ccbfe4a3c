//! HTTP front door.
//!
//! ## Endpoints
//!
//! - `POST /` - Execute the request body on a warm sandbox, respond with its output
//! - `GET /status` - Liveness marker
//! - `GET /stats` - Pool counts and counters as JSON

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use sandpool_core::{CoreError, Executor, SandboxPool, SandboxService};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Header carrying the correlation id of a successful execution.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Seconds a client should wait after a 503.
const RETRY_AFTER_SECS: &str = "1";

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    executor: Executor,
    pool: Arc<SandboxPool>,
}

impl AppState {
    pub fn new(executor: Executor, pool: Arc<SandboxPool>) -> Self {
        Self { executor, pool }
    }

    pub fn from_service(service: &SandboxService) -> Self {
        Self::new(service.executor().clone(), Arc::clone(service.pool()))
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState, max_payload_bytes: usize) -> Router {
    tracing::debug!(max_payload_bytes, "Building HTTP router");

    Router::new()
        .route("/", post(execute_handler))
        .route("/status", get(status_handler))
        .route("/stats", get(stats_handler))
        .layer(DefaultBodyLimit::max(max_payload_bytes))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Execute the raw request body.
async fn execute_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let result = state.executor.execute(body).await?;

    let mut response = result.output.into_response();
    if let Ok(value) = HeaderValue::from_str(&result.correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    Ok(response)
}

async fn status_handler() -> &'static str {
    tracing::trace!("Status request");
    "OK"
}

async fn stats_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "counts": state.pool.counts(),
        "stats": state.pool.stats().snapshot(),
        "hit_rate": state.pool.stats().hit_rate(),
        "slots": state.pool.snapshot(),
    }))
}

/// Execution failure rendered as an HTTP response.
#[derive(Debug)]
pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            CoreError::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            e if e.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Protocol(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            tracing::warn!(status = %status, error = %self.0, "Execution request failed");
        }

        let mut response = (status, self.0.to_string()).into_response();
        if self.0.is_retryable() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from_static(RETRY_AFTER_SECS),
            );
        }
        response
    }
}

/// Start the HTTP server.
///
/// Runs until `shutdown` resolves.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    max_payload_bytes: usize,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state, max_payload_bytes);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
