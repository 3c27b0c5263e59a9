//! Librarium API Gateway
//!
//! The HTTP entry point of the catalog service.
//! Handles:
//! - CSV uploads, queued as import jobs
//! - Import status polling
//! - Health and readiness probes
//! - Observability (logging, metrics, request IDs)
//!
//! Import jobs run in-process on the dispatcher worker; the stale job reaper
//! runs alongside it.

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use librarium_common::{
    config::{AppConfig, ObservabilityConfig},
    db, metrics, DbPool, Dispatcher, Repository, UploadStorage, VERSION,
};
use librarium_importer::{spawn_reaper, ImportOrchestrator, LocalDispatcher};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Room for multipart boundaries and part headers on top of the file itself
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub repository: Repository,
    pub storage: UploadStorage,
    pub dispatcher: Arc<dyn Dispatcher>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().context("Failed to load configuration")?;

    init_tracing(&config.observability);
    info!("Starting Librarium API Gateway v{}", VERSION);

    let config = Arc::new(config);

    // Initialize metrics
    let prometheus = if config.observability.metrics_enabled {
        Some(install_metrics()?)
    } else {
        None
    };

    // Initialize database connection
    info!("Connecting to database...");
    let pool = DbPool::new(&config.database).await?;
    if config.database.auto_migrate {
        db::ensure_schema(pool.write()).await?;
    }
    let repository = Repository::new(pool);

    let storage = UploadStorage::open(config.import.upload_dir.clone()).await?;

    // Background import pipeline
    let orchestrator = ImportOrchestrator::new(repository.clone())
        .with_chunk_size(config.import.chunk_size)
        .with_storage(storage.clone());
    let (dispatcher, worker) = LocalDispatcher::start(Arc::new(orchestrator), &config.import);
    let reaper = spawn_reaper(repository.clone(), &config.import);

    // Create app state
    let state = AppState {
        config: config.clone(),
        repository,
        storage,
        dispatcher: Arc::new(dispatcher),
    };

    // Build the router
    let mut app = create_router(state);
    if let Some(handle) = prometheus {
        app = app.merge(metrics_router(handle));
    }

    // Start the server
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.host, config.server.port))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The router held the last dispatcher handle; the worker now drains
    info!("HTTP server stopped, draining import queue...");
    match tokio::time::timeout(config.shutdown_timeout(), worker).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Import worker panicked"),
        Err(_) => warn!(
            timeout_secs = config.server.shutdown_timeout_secs,
            "Import worker still busy at shutdown timeout"
        ),
    }
    reaper.abort();

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(observability: &ObservabilityConfig) {
    let filter = EnvFilter::try_new(&observability.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    if observability.json_logging {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Install the Prometheus recorder, then describe every metric to it.
///
/// Descriptions sent before a recorder exists are dropped.
fn install_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = install_prometheus()?;
    metrics::register_metrics();
    Ok(handle)
}

fn install_prometheus() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_request_duration_seconds", metrics::METRICS_PREFIX)),
            metrics::LATENCY_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(format!("{}_import_duration_seconds", metrics::METRICS_PREFIX)),
            metrics::IMPORT_BUCKETS,
        )?
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(handle)
}

/// `/metrics` in the Prometheus text format
fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    )
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let body_limit = state.config.import.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD);
    let request_timeout = state.config.request_timeout();

    // API routes
    let api_routes = Router::new()
        .route("/status", get(handlers::health::api_status))
        .route("/import", post(handlers::imports::create_import))
        .route("/import/{id}", get(handlers::imports::get_import))
        .layer(DefaultBodyLimit::max(body_limit));

    // Compose the app
    Router::new()
        // Probes
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/api", api_routes)
        .route_layer(axum::middleware::from_fn(middleware::metrics::track_requests))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
