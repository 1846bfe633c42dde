use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderName, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
    Json,
};
use chrono::Utc;
use futures::StreamExt;
use serde_json::json;
use utoipa::OpenApi;

use crate::{
    codec,
    insights::MAX_INSIGHTS,
    store::{DEFAULT_OPS_EVENTS_LIMIT, MAX_OPS_EVENTS_LIMIT},
};

use super::{
    dto::{
        parse_limit, parse_range_timestamp, InsightsResponse, LimitQuery, OpsEventsResponse,
        ReadingsQuery, ReadingsResponse,
    },
    errors::ApiError,
    AppState,
};

pub const MAX_BATCH_SIZE: usize = 1000;
pub const MAX_READINGS_LIMIT: i64 = 100_000;
const DEFAULT_READINGS_LIMIT: i64 = 100;
const DEFAULT_MAX_POINTS: i64 = 1000;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Accept one reading: decode leniently, persist, then fan out to the
/// liveness monitor, the live stream, and the insights engine. Everything
/// past the store write is non-blocking.
pub async fn ingest_reading(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let reading =
        codec::decode_reading(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .store
        .add(&reading)
        .await
        .map_err(|e| ApiError::internal("failed to persist reading", e))?;

    if let Some(monitor) = &state.monitor {
        monitor.on_ingest(Utc::now());
    }
    state.hub.publish(reading);
    if let Some(engine) = &state.engine {
        engine.on_reading(&reading);
    }

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

/// Accept a batch of up to [`MAX_BATCH_SIZE`] readings. Persistence is
/// atomic; publishes follow the array order supplied by the client.
pub async fn ingest_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let readings = codec::decode_batch(&body, MAX_BATCH_SIZE)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    state
        .store
        .add_batch(&readings)
        .await
        .map_err(|e| ApiError::internal("failed to persist readings", e))?;

    if let Some(monitor) = &state.monitor {
        monitor.on_ingest(Utc::now());
    }
    for reading in &readings {
        state.hub.publish(*reading);
    }
    if let Some(engine) = &state.engine {
        engine.on_batch(&readings);
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "ingested": readings.len() })),
    ))
}

// ---------------------------------------------------------------------------
// Readings
// ---------------------------------------------------------------------------

/// Historical readings. With `from` and `to` this is a range query against
/// stores that support it (501 otherwise); without them it returns the
/// latest `limit` readings oldest-first.
#[utoipa::path(
    get,
    path = "/api/readings",
    params(
        ("from" = Option<String>, Query, description = "Range start (unix seconds or milliseconds)"),
        ("to" = Option<String>, Query, description = "Range end, exclusive"),
        ("limit" = Option<String>, Query, description = "Latest-readings count, 1..=100000"),
        ("max_points" = Option<String>, Query, description = "Range cap, 1..=100000"),
    ),
    responses(
        (status = 200, description = "Readings, oldest first", body = ReadingsResponse),
        (status = 400, description = "Invalid parameters"),
        (status = 501, description = "Range queries unsupported by this store"),
    ),
    tag = "readings"
)]
pub async fn get_readings(
    State(state): State<AppState>,
    Query(params): Query<ReadingsQuery>,
) -> Result<Json<ReadingsResponse>, ApiError> {
    if params.from.is_some() || params.to.is_some() {
        let (Some(raw_from), Some(raw_to)) = (&params.from, &params.to) else {
            return Err(ApiError::BadRequest(
                "from and to must be provided together".to_owned(),
            ));
        };

        let range_store = state
            .store
            .range_support()
            .ok_or(ApiError::NotImplemented("readings range query is not supported"))?;

        let from = parse_range_timestamp(raw_from, "from")?;
        let to = parse_range_timestamp(raw_to, "to")?;
        if from >= to {
            return Err(ApiError::BadRequest("from must be less than to".to_owned()));
        }

        let max_points = parse_limit(
            params.max_points.as_deref(),
            DEFAULT_MAX_POINTS,
            MAX_READINGS_LIMIT,
            "max_points",
        )?;

        let readings = range_store
            .range(from, to, max_points)
            .await
            .map_err(|e| ApiError::internal("failed to read data", e))?;
        return Ok(Json(ReadingsResponse { readings }));
    }

    let limit = parse_limit(
        params.limit.as_deref(),
        DEFAULT_READINGS_LIMIT,
        MAX_READINGS_LIMIT,
        "limit",
    )?;

    let readings = state
        .store
        .latest(limit)
        .await
        .map_err(|e| ApiError::internal("failed to read data", e))?;
    Ok(Json(ReadingsResponse { readings }))
}

// ---------------------------------------------------------------------------
// Live stream
// ---------------------------------------------------------------------------

/// Long-lived SSE stream of readings as they are ingested. Slow consumers
/// lose readings rather than stalling ingest; an idle stream still gets a
/// `: ping` heartbeat every 25 seconds.
pub async fn stream_readings(State(state): State<AppState>) -> impl IntoResponse {
    let (mut receiver, guard) = state.hub.subscribe();

    let stream = futures::stream::poll_fn(move |cx| {
        // The guard lives inside the stream: client disconnect drops the
        // stream, which unsubscribes.
        let _keep_subscribed = &guard;
        receiver.poll_recv(cx)
    })
    .map(|reading| Event::default().event("reading").json_data(&reading));

    let sse = Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("ping"),
    );

    (
        [
            (header::CONNECTION, "keep-alive"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        sse,
    )
}

// ---------------------------------------------------------------------------
// Insights
// ---------------------------------------------------------------------------

/// The current insights snapshot, truncated to `limit` (1..=3).
#[utoipa::path(
    get,
    path = "/api/insights",
    params(
        ("limit" = Option<String>, Query, description = "Max insights returned, 1..=3"),
    ),
    responses(
        (status = 200, description = "Latest insights snapshot", body = InsightsResponse),
        (status = 400, description = "Invalid limit"),
        (status = 503, description = "Engine not configured or still warming up"),
    ),
    tag = "insights"
)]
pub async fn get_insights(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<InsightsResponse>, ApiError> {
    let Some(engine) = &state.engine else {
        return Err(ApiError::Unavailable("insights engine is not configured"));
    };

    let limit = parse_limit(
        params.limit.as_deref(),
        MAX_INSIGHTS as i64,
        MAX_INSIGHTS as i64,
        "limit",
    )?;

    let snapshot = engine
        .snapshot(limit as usize)
        .ok_or(ApiError::Unavailable("insights are warming up"))?;
    Ok(Json(snapshot.into()))
}

// ---------------------------------------------------------------------------
// Ops events
// ---------------------------------------------------------------------------

/// Latest operations events, most recent first. Serves an empty list when
/// the store has no ops capability.
#[utoipa::path(
    get,
    path = "/api/ops/events",
    params(
        ("limit" = Option<String>, Query, description = "Max events returned, 1..=200"),
    ),
    responses(
        (status = 200, description = "Operations events, newest first", body = OpsEventsResponse),
        (status = 400, description = "Invalid limit"),
    ),
    tag = "ops"
)]
pub async fn get_ops_events(
    State(state): State<AppState>,
    Query(params): Query<LimitQuery>,
) -> Result<Json<OpsEventsResponse>, ApiError> {
    let Some(ops_store) = &state.ops_store else {
        return Ok(Json(OpsEventsResponse { events: Vec::new() }));
    };

    let limit = parse_limit(
        params.limit.as_deref(),
        DEFAULT_OPS_EVENTS_LIMIT,
        MAX_OPS_EVENTS_LIMIT,
        "limit",
    )?;

    let events = ops_store
        .latest_ops_events(limit)
        .await
        .map_err(|e| ApiError::internal("failed to load ops events", e))?;
    Ok(Json(OpsEventsResponse { events }))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy")),
    tag = "system"
)]
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Readiness probe backed by a bounded store ping.
#[utoipa::path(
    get,
    path = "/ready",
    responses(
        (status = 200, description = "Store reachable"),
        (status = 503, description = "Store unreachable"),
    ),
    tag = "system"
)]
pub async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.ping().await.map_err(|e| {
        tracing::warn!(error = %e, "readiness ping failed");
        ApiError::Unavailable("not ready")
    })?;
    Ok(Json(json!({ "status": "ready" })))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(get_readings, get_insights, get_ops_events, health, ready),
    components(schemas(
        ReadingsResponse,
        InsightsResponse,
        OpsEventsResponse,
        crate::model::SensorReading,
        crate::model::Alert,
        crate::model::OpsEvent,
        crate::model::RecomputeTrigger,
    )),
    tags(
        (name = "readings", description = "Historical sensor readings"),
        (name = "insights", description = "AI-generated air quality insights"),
        (name = "ops", description = "Operations event log"),
        (name = "system", description = "System endpoints"),
    ),
    info(
        title = "Air Quality Backend API",
        version = "0.1.0",
        description = "REST and SSE API for the air-quality telemetry platform"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use axum_test::TestServer;
    use serde_json::Value;

    use crate::{
        api::{router, AppState, MAX_INGEST_BODY_BYTES},
        insights::{AlertAnalyzer, InsightsConfig, InsightsEngine},
        limiter::RequestLimiter,
        model::{Alert, AlertKind, AlertSeverity, OpsEvent, SensorReading},
        ops::{OpsConfig, OpsMonitor},
        store::{memory::MemoryStore, OpsEventStore as _},
        stream_hub::StreamHub,
    };

    use super::*;

    const API_KEY: &str = "secret";

    fn test_state(store: MemoryStore) -> AppState {
        AppState {
            store: Arc::new(store.clone()),
            ops_store: Some(Arc::new(store)),
            hub: StreamHub::new(),
            engine: None,
            monitor: None,
            read_limiter: None,
            ingest_api_key: Arc::from(API_KEY),
            trust_proxy_headers: false,
        }
    }

    fn test_server(state: AppState) -> TestServer {
        TestServer::new(router(state)).unwrap()
    }

    fn reading_payload(timestamp: i64) -> Value {
        json!({
            "timestamp": timestamp,
            "temperature": 22.4,
            "pressure": 101_305.2,
            "humidity": 40.1,
            "oxidised": 1.2,
            "reduced": 1.1,
            "nh3": 0.7,
            "pm1": 2.0,
            "pm2": 3.0,
            "pm10": 4.0,
        })
    }

    struct StaticAnalyzer {
        alerts: Vec<Alert>,
    }

    #[async_trait]
    impl AlertAnalyzer for StaticAnalyzer {
        async fn analyze(&self, _readings: &[SensorReading]) -> Result<Vec<Alert>> {
            Ok(self.alerts.clone())
        }

        fn source(&self) -> &str {
            "openai"
        }
    }

    fn static_alerts(count: usize) -> Vec<Alert> {
        (0..count)
            .map(|i| Alert {
                kind: AlertKind::Insight,
                severity: AlertSeverity::Info,
                title: format!("insight {i}"),
                message: "details".to_owned(),
            })
            .collect()
    }

    async fn started_engine(store: MemoryStore, alerts: Vec<Alert>) -> InsightsEngine {
        let engine = InsightsEngine::new(
            Arc::new(store.clone()),
            Some(Arc::new(store)),
            Arc::new(StaticAnalyzer { alerts }),
            InsightsConfig::default(),
        );
        engine.start().await;
        for _ in 0..500 {
            if engine.snapshot(MAX_INSIGHTS).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        engine
    }

    // -----------------------------------------------------------------------
    // POST /api/ingest
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn ingest_with_valid_key_persists_and_accepts() {
        let store = MemoryStore::new();
        let server = test_server(test_state(store.clone()));

        let payload = json!({
            "timestamp": "1738886400",
            "temperature": "22.4",
            "pressure": 101_305.2,
            "humidity": "40.1",
            "oxidised": "1.2",
            "reduced": "1.1",
            "nh3": "0.7",
            "pm1": "2",
            "pm2": 3,
            "pm10": "4",
        });
        let resp = server
            .post("/api/ingest")
            .add_header("x-api-key", API_KEY)
            .json(&payload)
            .await;

        resp.assert_status(StatusCode::ACCEPTED);
        resp.assert_json(&json!({ "status": "accepted" }));
        assert_eq!(store.reading_count(), 1);
    }

    #[tokio::test]
    async fn ingest_without_key_is_unauthorized() {
        let store = MemoryStore::new();
        let server = test_server(test_state(store.clone()));

        let resp = server.post("/api/ingest").json(&reading_payload(1)).await;

        resp.assert_status(StatusCode::UNAUTHORIZED);
        resp.assert_json(&json!({ "error": "unauthorized" }));
        assert_eq!(store.reading_count(), 0);
    }

    #[tokio::test]
    async fn ingest_with_wrong_key_is_unauthorized() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server
            .post("/api/ingest")
            .add_header("x-api-key", "secret2")
            .json(&reading_payload(1))
            .await;
        resp.assert_status(StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn ingest_rejects_unknown_fields() {
        let server = test_server(test_state(MemoryStore::new()));

        let mut payload = reading_payload(1_738_886_400);
        payload["co2"] = json!(400);
        let resp = server
            .post("/api/ingest")
            .add_header("x-api-key", API_KEY)
            .json(&payload)
            .await;

        resp.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = resp.json();
        assert!(body["error"].as_str().unwrap().contains("unknown field"));
    }

    #[tokio::test]
    async fn ingest_rejects_malformed_json() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server
            .post("/api/ingest")
            .add_header("x-api-key", API_KEY)
            .bytes("not json".into())
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ingest_publishes_to_subscribers() {
        let store = MemoryStore::new();
        let state = test_state(store);
        let hub = state.hub.clone();
        let server = test_server(state);

        let (mut rx, _guard) = hub.subscribe();
        server
            .post("/api/ingest")
            .add_header("x-api-key", API_KEY)
            .json(&reading_payload(1_738_886_400))
            .await
            .assert_status(StatusCode::ACCEPTED);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.timestamp, 1_738_886_400);
    }

    #[tokio::test]
    async fn oversized_ingest_body_is_rejected() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server
            .post("/api/ingest")
            .add_header("x-api-key", API_KEY)
            .bytes(vec![b'x'; MAX_INGEST_BODY_BYTES + 1].into())
            .await;
        resp.assert_status(StatusCode::PAYLOAD_TOO_LARGE);
    }

    // -----------------------------------------------------------------------
    // POST /api/ingest/batch
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn batch_ingest_persists_all_and_reports_count() {
        let store = MemoryStore::new();
        let state = test_state(store.clone());
        let hub = state.hub.clone();
        let server = test_server(state);

        let (mut rx, _guard) = hub.subscribe();
        let batch = json!([reading_payload(1), reading_payload(2), reading_payload(3)]);
        let resp = server
            .post("/api/ingest/batch")
            .add_header("x-api-key", API_KEY)
            .json(&batch)
            .await;

        resp.assert_status(StatusCode::ACCEPTED);
        resp.assert_json(&json!({ "status": "accepted", "ingested": 3 }));
        assert_eq!(store.reading_count(), 3);

        // Publish order equals input order.
        for expected in 1..=3 {
            assert_eq!(rx.recv().await.unwrap().timestamp, expected);
        }
    }

    #[tokio::test]
    async fn batch_over_limit_is_rejected_with_exact_message() {
        let server = test_server(test_state(MemoryStore::new()));
        let items: Vec<Value> = (1..=(MAX_BATCH_SIZE as i64 + 1)).map(reading_payload).collect();
        let resp = server
            .post("/api/ingest/batch")
            .add_header("x-api-key", API_KEY)
            .json(&json!(items))
            .await;

        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(&json!({ "error": "batch exceeds max size of 1000" }));
    }

    #[tokio::test]
    async fn empty_batch_is_rejected() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server
            .post("/api/ingest/batch")
            .add_header("x-api-key", API_KEY)
            .json(&json!([]))
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(&json!({ "error": "batch must not be empty" }));
    }

    // -----------------------------------------------------------------------
    // GET /api/readings
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn readings_returns_latest_oldest_first() {
        let store = MemoryStore::new();
        let server = test_server(test_state(store));

        for timestamp in [1_738_886_400_i64, 1_738_886_401] {
            server
                .post("/api/ingest")
                .add_header("x-api-key", API_KEY)
                .json(&reading_payload(timestamp))
                .await
                .assert_status(StatusCode::ACCEPTED);
        }

        let resp = server.get("/api/readings").add_query_param("limit", "2").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        let readings = body["readings"].as_array().unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0]["timestamp"], 1_738_886_400_i64);
        assert_eq!(readings[1]["timestamp"], 1_738_886_401_i64);
    }

    #[tokio::test]
    async fn readings_rejects_out_of_range_limit() {
        let server = test_server(test_state(MemoryStore::new()));
        for bad in ["0", "100001", "many"] {
            let resp = server.get("/api/readings").add_query_param("limit", bad).await;
            resp.assert_status(StatusCode::BAD_REQUEST);
            resp.assert_json(&json!({ "error": "limit must be between 1 and 100000" }));
        }
    }

    #[tokio::test]
    async fn readings_range_is_half_open_and_normalizes_milliseconds() {
        let store = MemoryStore::new();
        let server = test_server(test_state(store));

        for timestamp in [1_738_886_400_i64, 1_738_886_500, 1_738_886_600] {
            server
                .post("/api/ingest")
                .add_header("x-api-key", API_KEY)
                .json(&reading_payload(timestamp))
                .await
                .assert_status(StatusCode::ACCEPTED);
        }

        let resp = server
            .get("/api/readings")
            .add_query_param("from", "1738886400")
            .add_query_param("to", "1738886600")
            .await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        let timestamps: Vec<i64> = body["readings"]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["timestamp"].as_i64().unwrap())
            .collect();
        assert_eq!(timestamps, vec![1_738_886_400, 1_738_886_500]);

        // Millisecond bounds are scaled down to seconds and behave the same.
        let resp = server
            .get("/api/readings")
            .add_query_param("from", "1738886400000")
            .add_query_param("to", "1738886600000")
            .await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["readings"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn readings_range_requires_both_bounds() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server.get("/api/readings").add_query_param("from", "100").await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(&json!({ "error": "from and to must be provided together" }));
    }

    #[tokio::test]
    async fn readings_range_rejects_inverted_bounds() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server
            .get("/api/readings")
            .add_query_param("from", "300")
            .add_query_param("to", "100")
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(&json!({ "error": "from must be less than to" }));
    }

    #[tokio::test]
    async fn readings_range_without_capability_is_not_implemented() {
        let server = test_server(test_state(MemoryStore::without_range()));
        let resp = server
            .get("/api/readings")
            .add_query_param("from", "100")
            .add_query_param("to", "300")
            .await;
        resp.assert_status(StatusCode::NOT_IMPLEMENTED);
        resp.assert_json(&json!({ "error": "readings range query is not supported" }));
    }

    // -----------------------------------------------------------------------
    // GET /api/insights
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn insights_without_engine_is_unavailable() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server.get("/api/insights").await;
        resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        resp.assert_json(&json!({ "error": "insights engine is not configured" }));
    }

    #[tokio::test]
    async fn insights_while_warming_up_is_unavailable() {
        struct NeverAnalyzer;

        #[async_trait]
        impl AlertAnalyzer for NeverAnalyzer {
            async fn analyze(&self, _readings: &[SensorReading]) -> Result<Vec<Alert>> {
                futures::future::pending().await
            }

            fn source(&self) -> &str {
                "openai"
            }
        }

        let store = MemoryStore::new();
        let engine = InsightsEngine::new(
            Arc::new(store.clone()),
            None,
            Arc::new(NeverAnalyzer),
            InsightsConfig::default(),
        );
        let mut state = test_state(store);
        state.engine = Some(engine);

        let resp = test_server(state).get("/api/insights").await;
        resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        resp.assert_json(&json!({ "error": "insights are warming up" }));
    }

    #[tokio::test]
    async fn insights_returns_snapshot_with_source_and_cap() {
        let store = MemoryStore::new();
        let engine = started_engine(store.clone(), static_alerts(2)).await;
        let mut state = test_state(store);
        state.engine = Some(engine);
        let server = test_server(state);

        let resp = server.get("/api/insights").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["source"], "openai");
        assert_eq!(body["trigger"], "startup");
        assert!(body["insights"].as_array().unwrap().len() <= MAX_INSIGHTS);
        assert!(body["generated_at"].as_i64().unwrap() > 0);

        let resp = server.get("/api/insights").add_query_param("limit", "1").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["insights"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn insights_rejects_limit_above_cap() {
        let store = MemoryStore::new();
        let engine = started_engine(store.clone(), static_alerts(1)).await;
        let mut state = test_state(store);
        state.engine = Some(engine);

        let resp = test_server(state)
            .get("/api/insights")
            .add_query_param("limit", "5")
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(&json!({ "error": "limit must be between 1 and 3" }));
    }

    // -----------------------------------------------------------------------
    // GET /api/ops/events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn ops_events_without_store_returns_empty_list() {
        let mut state = test_state(MemoryStore::new());
        state.ops_store = None;
        let resp = test_server(state).get("/api/ops/events").await;
        resp.assert_status_ok();
        resp.assert_json(&json!({ "events": [] }));
    }

    #[tokio::test]
    async fn ops_events_are_newest_first_and_bounded() {
        let store = MemoryStore::new();
        for (i, kind) in ["backend_restarted", "device_connected"].iter().enumerate() {
            store
                .add_ops_event(&OpsEvent {
                    id: 0,
                    timestamp: 1_738_886_400_000 + i as i64,
                    kind: (*kind).to_owned(),
                    title: String::new(),
                    detail: String::new(),
                })
                .await
                .unwrap();
        }
        let server = test_server(test_state(store));

        let resp = server.get("/api/ops/events").add_query_param("limit", "1").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        let events = body["events"].as_array().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["kind"], "device_connected");

        let resp = server
            .get("/api/ops/events")
            .add_query_param("limit", "201")
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(&json!({ "error": "limit must be between 1 and 200" }));
    }

    #[tokio::test]
    async fn ingest_feeds_the_ops_monitor() {
        let store = MemoryStore::new();
        let monitor = OpsMonitor::start(
            Arc::new(store.clone()),
            OpsConfig {
                device_offline_timeout: Duration::from_millis(20),
                monitor_interval: Duration::from_millis(5),
            },
        )
        .await;
        let mut state = test_state(store.clone());
        state.monitor = Some(monitor);
        let server = test_server(state);

        server
            .post("/api/ingest")
            .add_header("x-api-key", API_KEY)
            .json(&reading_payload(1_738_886_400))
            .await
            .assert_status(StatusCode::ACCEPTED);

        // device_connected lands asynchronously.
        for _ in 0..200 {
            if store.ops_events().iter().any(|e| e.kind == "device_connected") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let resp = server.get("/api/ops/events").add_query_param("limit", "1").await;
        let body: Value = resp.json();
        assert_eq!(body["events"][0]["kind"], "device_connected");

        // Withholding ingest past the timeout yields a disconnect event.
        for _ in 0..200 {
            if store
                .ops_events()
                .iter()
                .any(|e| e.kind == "device_disconnected")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let resp = server.get("/api/ops/events").add_query_param("limit", "1").await;
        let body: Value = resp.json();
        assert_eq!(body["events"][0]["kind"], "device_disconnected");
    }

    // -----------------------------------------------------------------------
    // Rate limiting
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn read_endpoints_are_rate_limited() {
        let mut state = test_state(MemoryStore::new());
        state.read_limiter = Some(Arc::new(RequestLimiter::new(2, Duration::from_secs(60))));
        let server = test_server(state);

        server.get("/api/readings").await.assert_status_ok();
        server.get("/api/readings").await.assert_status_ok();
        let resp = server.get("/api/readings").await;
        resp.assert_status(StatusCode::TOO_MANY_REQUESTS);
        resp.assert_json(&json!({ "error": "rate limit exceeded" }));

        // Ingest and system endpoints are not limited.
        server.get("/health").await.assert_status_ok();
    }

    #[tokio::test]
    async fn trusted_proxy_headers_split_rate_limit_buckets() {
        let mut state = test_state(MemoryStore::new());
        state.read_limiter = Some(Arc::new(RequestLimiter::new(1, Duration::from_secs(60))));
        state.trust_proxy_headers = true;
        let server = test_server(state);

        server
            .get("/api/readings")
            .add_header("x-forwarded-for", "203.0.113.9")
            .await
            .assert_status_ok();
        server
            .get("/api/readings")
            .add_header("x-forwarded-for", "203.0.113.9")
            .await
            .assert_status(StatusCode::TOO_MANY_REQUESTS);
        server
            .get("/api/readings")
            .add_header("x-forwarded-for", "198.51.100.7")
            .await
            .assert_status_ok();
    }

    // -----------------------------------------------------------------------
    // System endpoints
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_is_always_ok() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server.get("/health").await;
        resp.assert_status_ok();
        resp.assert_json(&json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn ready_reflects_store_ping() {
        let server = test_server(test_state(MemoryStore::new()));
        server.get("/ready").await.assert_status_ok();

        let server = test_server(test_state(MemoryStore::new().with_failing_ping()));
        let resp = server.get("/ready").await;
        resp.assert_status(StatusCode::SERVICE_UNAVAILABLE);
        resp.assert_json(&json!({ "error": "not ready" }));
    }

    #[tokio::test]
    async fn openapi_spec_is_served() {
        let server = test_server(test_state(MemoryStore::new()));
        let resp = server.get("/api-docs/openapi.json").await;
        resp.assert_status_ok();
        let body: Value = resp.json();
        assert_eq!(body["info"]["title"], "Air Quality Backend API");
    }

    // -----------------------------------------------------------------------
    // GET /api/stream
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn stream_emits_reading_events_with_sse_framing() {
        let state = test_state(MemoryStore::new());
        let hub = state.hub.clone();
        let app = router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let response = reqwest::get(format!("http://{addr}/api/stream")).await.unwrap();
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");
        assert_eq!(response.headers().get("x-accel-buffering").unwrap(), "no");

        // The subscription exists once headers are out; publish and read
        // the first frame.
        hub.publish(SensorReading {
            timestamp: 1_738_886_400,
            temperature: 22.4,
            pressure: 101_305.2,
            humidity: 40.1,
            oxidised: 1.2,
            reduced: 1.1,
            nh3: 0.7,
            pm1: 2.0,
            pm2: 3.0,
            pm10: 4.0,
        });

        let mut body = response.bytes_stream();
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .expect("no SSE frame within 5s")
            .unwrap()
            .unwrap();
        let text = String::from_utf8_lossy(&chunk);
        assert!(text.starts_with("event: reading\ndata: "), "frame: {text:?}");
        assert!(text.ends_with("\n\n"));
        assert!(text.contains("\"timestamp\":1738886400"));
    }
}
