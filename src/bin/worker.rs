use std::sync::Arc;
use std::time::Duration;

use crawl_orchestrator::{
    app_state::AppState,
    config::AppConfig,
    services::{
        browser::BrowserServiceClient,
        clock::SystemClock,
        fetcher::HttpPageFetcher,
        store::{RedisBackend, Store},
    },
    workers::{self, Collaborators},
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let selection = config.worker_role;
    tracing::info!(role = ?selection, "Starting crawl worker");

    tracing::info!("Connecting to Redis backing store");
    let backend = RedisBackend::connect(&config.redis_url, &config.redis_key_prefix)
        .await
        .expect("Failed to connect to Redis");
    let store = Store::new(Arc::new(backend));

    let cookie_source = BrowserServiceClient::new(
        &config.browser_service_url,
        Duration::from_secs(config.browser_timeout_secs),
    )
    .expect("Failed to initialize browser service client");
    let fetcher = HttpPageFetcher::new(
        &config.search_api_url,
        config.response_layout(),
        Duration::from_secs(config.fetch_timeout_secs),
    );
    let collaborators = Collaborators {
        cookie_source: Arc::new(cookie_source),
        fetcher: Arc::new(fetcher),
    };

    let worker_policy = config.worker_policy();
    let search_policy = config.search_policy();
    let proxies = config.proxies.clone();
    let state = AppState::new(store, Arc::new(SystemClock), config);

    let seeded = state
        .registry
        .seed(&proxies)
        .await
        .expect("Failed to seed proxy registry");
    tracing::info!(configured = proxies.len(), registered = seeded, "Proxy registry seeded");

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    tracing::info!("Worker ready, starting control loops");
    if let Err(e) = workers::run(selection, &state, &collaborators, &worker_policy, &search_policy, cancel).await {
        tracing::error!(error = %e, "Worker stopped on unrecoverable error");
        std::process::exit(1);
    }
    tracing::info!("Worker shut down cleanly");
}

/// Cancels `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received, draining workers");
    token.cancel();
}
