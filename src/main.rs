mod api;
mod codec;
mod config;
mod insights;
mod limiter;
mod model;
mod ops;
mod retention;
mod store;
mod stream_hub;

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::http::{header, HeaderName, HeaderValue, Method};
use tokio::{net::TcpListener, signal};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::{
    api::AppState,
    config::Config,
    insights::{openai::OpenAiAnalyzer, InsightsEngine},
    limiter::RequestLimiter,
    ops::OpsMonitor,
    retention::RetentionWorker,
    store::{postgres::PgStore, InsightsSnapshotStore, OpsEventStore},
    stream_hub::StreamHub,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env (ignore error if file absent — env vars may be set externally)
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    config.log_config();

    // Connect to Postgres and run migrations; a failed migration is fatal.
    let store = tokio::time::timeout(
        Duration::from_secs(10),
        PgStore::connect(&config.database_url, config.pg_max_conns),
    )
    .await
    .context("database setup timed out")??;
    let store = Arc::new(store);
    info!("database ready");

    if config.retention.enabled {
        let worker = RetentionWorker::new(store.clone(), config.retention.clone());
        tokio::spawn(worker.run());
    } else {
        info!("retention cleanup disabled");
    }

    let ops_store: Arc<dyn OpsEventStore> = store.clone();
    let monitor = OpsMonitor::start(ops_store.clone(), config.ops.clone()).await;

    let engine = if config.insights_enabled() {
        let analyzer = OpenAiAnalyzer::new(
            &config.openai_api_key,
            &config.openai_model,
            &config.openai_base_url,
            config.insights.max_alerts,
        );
        let engine = InsightsEngine::new(
            store.clone(),
            Some(store.clone() as Arc<dyn InsightsSnapshotStore>),
            Arc::new(analyzer),
            config.insights.clone(),
        );
        engine.start().await;
        info!(
            model = %config.openai_model,
            analysis_limit = config.insights.analysis_limit,
            "ai insights enabled"
        );
        Some(engine)
    } else {
        info!("ai insights disabled (set OPENAI_API_KEY to enable)");
        None
    };

    let read_limiter = (config.read_rate_limit_per_min > 0).then(|| {
        Arc::new(RequestLimiter::new(
            config.read_rate_limit_per_min,
            Duration::from_secs(60),
        ))
    });

    let state = AppState {
        store: store.clone(),
        ops_store: Some(ops_store),
        hub: StreamHub::new(),
        engine,
        monitor: Some(monitor),
        read_limiter,
        ingest_api_key: Arc::from(config.ingest_api_key.as_str()),
        trust_proxy_headers: config.trust_proxy_headers,
    };

    let app = api::router(state)
        .layer(cors_layer(&config))
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

fn cors_layer(config: &Config) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, HeaderName::from_static("x-api-key")]);

    match config.allowed_origins() {
        None => layer.allow_origin(Any),
        Some(origins) => {
            let origins: Vec<HeaderValue> = origins
                .iter()
                .filter_map(|origin| origin.parse().ok())
                .collect();
            layer.allow_origin(AllowOrigin::list(origins))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
