use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crawl_orchestrator::app_state::AppState;
use crawl_orchestrator::config::AppConfig;
use crawl_orchestrator::routes;
use crawl_orchestrator::services::clock::SystemClock;
use crawl_orchestrator::services::store::{RedisBackend, Store};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing crawl-orchestrator intake server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("crawl_searches_submitted_total", "Keyword searches accepted by the intake API");
    metrics::describe_counter!("crawl_jobs_enqueued_total", "Jobs enqueued, by kind");
    metrics::describe_counter!("crawl_jobs_redelivered_total", "Jobs redelivered after a lease expired");
    metrics::describe_counter!("crawl_jobs_dead_lettered_total", "Jobs moved to the dead-letter channel");
    metrics::describe_counter!("crawl_credentials_admitted_total", "Cookies admitted into the pool");
    metrics::describe_counter!("crawl_credential_releases_total", "Credential lease releases, by outcome");
    metrics::describe_counter!("crawl_credential_transitions_total", "Credential status transitions, by target status");
    metrics::describe_counter!("crawl_proxy_failures_total", "Failures reported against proxies");
    metrics::describe_counter!("crawl_results_accepted_total", "Result records appended");
    metrics::describe_counter!("crawl_results_duplicate_total", "Result records skipped as duplicates");
    metrics::describe_gauge!("crawl_queue_depth", "Jobs currently queued, by kind");

    tracing::info!("Connecting to Redis backing store");
    let backend = RedisBackend::connect(&config.redis_url, &config.redis_key_prefix)
        .await
        .expect("Failed to connect to Redis");
    let store = Store::new(Arc::new(backend));

    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(store, Arc::new(SystemClock), config);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/search", post(routes::search::submit_search))
        .route("/api/v1/search/batch", post(routes::search::submit_batch))
        .route("/api/v1/pool/fill", post(routes::search::fill_pool))
        .route("/api/v1/status", get(routes::search::status))
        .route("/api/v1/dead-letters", get(routes::search::dead_letters))
        .route("/api/v1/dedup/stale", get(routes::search::stale_fingerprints))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(RequestBodyLimitLayer::new(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Intake server listening on {}", bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
