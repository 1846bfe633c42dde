pub mod dto;
pub mod errors;
pub mod handlers;

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Request, State},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use utoipa::OpenApi;

use crate::{
    insights::InsightsEngine,
    limiter::{self, RequestLimiter},
    ops::OpsMonitor,
    store::{OpsEventStore, ReadingStore},
    stream_hub::StreamHub,
};

use errors::ApiError;
use handlers::ApiDoc;

/// Body cap for a single-reading ingest.
pub const MAX_INGEST_BODY_BYTES: usize = 1 << 20;
/// Body cap for a batch ingest.
pub const MAX_BATCH_BODY_BYTES: usize = 4 << 20;

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ReadingStore>,
    /// `None` when the store lacks the ops event capability.
    pub ops_store: Option<Arc<dyn OpsEventStore>>,
    pub hub: StreamHub,
    /// `None` when no analyzer is configured.
    pub engine: Option<InsightsEngine>,
    pub monitor: Option<OpsMonitor>,
    /// `None` disables read-endpoint rate limiting.
    pub read_limiter: Option<Arc<RequestLimiter>>,
    pub ingest_api_key: Arc<str>,
    pub trust_proxy_headers: bool,
}

pub fn router(state: AppState) -> Router {
    let ingest = Router::new()
        .route(
            "/api/ingest",
            post(handlers::ingest_reading).layer(DefaultBodyLimit::max(MAX_INGEST_BODY_BYTES)),
        )
        .route(
            "/api/ingest/batch",
            post(handlers::ingest_batch).layer(DefaultBodyLimit::max(MAX_BATCH_BODY_BYTES)),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_ingest_key,
        ));

    let limited_reads = Router::new()
        .route("/api/readings", get(handlers::get_readings))
        .route("/api/insights", get(handlers::get_insights))
        .route("/api/ops/events", get(handlers::get_ops_events))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            limiter::enforce_read_limit,
        ));

    let api_spec = ApiDoc::openapi();

    Router::new()
        .merge(ingest)
        .merge(limited_reads)
        .route("/api/stream", get(handlers::stream_readings))
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route(
            "/api-docs/openapi.json",
            get(move || async move { Json(api_spec) }),
        )
        .with_state(state)
}

/// Ingest authentication: `X-API-Key` must equal the configured ingest
/// key, compared in constant time.
async fn require_ingest_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    if !constant_time_eq(provided.as_bytes(), state.ingest_api_key.as_bytes()) {
        return Err(ApiError::Unauthorized);
    }

    Ok(next.run(request).await)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for i in 0..a.len() {
        diff |= a[i] ^ b[i];
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_matches_equal_slices() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn constant_time_eq_rejects_differences() {
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secret1"));
        assert!(!constant_time_eq(b"secret", b""));
    }
}
