use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    clock::Clock,
    cookie_pool::CookiePool,
    dedup::{DedupLedger, ResultSink},
    proxy_registry::ProxyRegistry,
    queue::JobQueue,
    store::Store,
};

/// Orchestration components over one backing store, shared by the route
/// handlers and the worker loops.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub clock: Arc<dyn Clock>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<ProxyRegistry>,
    pub pool: Arc<CookiePool>,
    pub ledger: DedupLedger,
    pub sink: ResultSink,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(store: Store, clock: Arc<dyn Clock>, config: AppConfig) -> Self {
        let cas = config.cas_policy();
        let queue = Arc::new(JobQueue::new(
            store.clone(),
            clock.clone(),
            config.queue_policy(),
            cas.clone(),
        ));
        let registry = Arc::new(ProxyRegistry::new(
            store.clone(),
            clock.clone(),
            config.proxy_policy(),
            cas.clone(),
        ));
        let pool = Arc::new(CookiePool::new(
            store.clone(),
            registry.clone(),
            queue.clone(),
            clock.clone(),
            config.pool_policy(),
            cas,
        ));

        Self {
            ledger: DedupLedger::new(store.clone(), clock.clone()),
            sink: ResultSink::new(store.clone()),
            store,
            clock,
            queue,
            registry,
            pool,
            config: Arc::new(config),
        }
    }
}
