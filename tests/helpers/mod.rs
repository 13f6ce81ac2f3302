//! In-memory orchestration harness with scripted collaborators.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crawl_orchestrator::app_state::AppState;
use crawl_orchestrator::models::credential::{Credential, RawCredential};
use crawl_orchestrator::models::proxy::ProxyEndpoint;
use crawl_orchestrator::services::browser::{BrowserError, CookieSource};
use crawl_orchestrator::services::clock::ManualClock;
use crawl_orchestrator::services::fetcher::{FetchFailure, FetchedPage, PageFetcher};
use crawl_orchestrator::services::store::{MemoryBackend, Store};
use crawl_orchestrator::workers::{build_worker, Collaborators, Role, Worker};

use crate::fixtures;

/// Mints a distinct cookie per call. Minting and validation can be made to
/// fail on demand.
#[derive(Default)]
pub struct ScriptedCookieSource {
    minted: AtomicU32,
    pub fail_mints: AtomicU32,
    pub reject_validation: AtomicBool,
    pub validations: AtomicU32,
}

impl ScriptedCookieSource {
    pub fn minted(&self) -> u32 {
        self.minted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CookieSource for ScriptedCookieSource {
    async fn obtain_cookie(&self, _proxy: &ProxyEndpoint) -> Result<RawCredential, BrowserError> {
        let remaining = self.fail_mints.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_mints.store(remaining - 1, Ordering::SeqCst);
            return Err(BrowserError::EmptyCookieJar);
        }
        let n = self.minted.fetch_add(1, Ordering::SeqCst);
        Ok(fixtures::raw_cookie(n))
    }

    async fn validate(&self, _credential: &Credential, _proxy: &ProxyEndpoint) -> Result<bool, BrowserError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        Ok(!self.reject_validation.load(Ordering::SeqCst))
    }
}

/// One fetch call as observed by [`ScriptedFetcher`].
#[derive(Debug, Clone)]
pub struct FetchCall {
    pub keyword: String,
    pub page: u32,
    pub credential_id: Uuid,
    pub proxy_id: Uuid,
}

/// Replays queued responses in order; an empty script answers with an empty
/// last page.
#[derive(Default)]
pub struct ScriptedFetcher {
    script: Mutex<VecDeque<Result<FetchedPage, FetchFailure>>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl ScriptedFetcher {
    pub fn push(&self, response: Result<FetchedPage, FetchFailure>) {
        self.script.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    async fn fetch_page(
        &self,
        keyword: &str,
        page: u32,
        credential: &Credential,
        proxy: &ProxyEndpoint,
    ) -> Result<FetchedPage, FetchFailure> {
        self.calls.lock().unwrap().push(FetchCall {
            keyword: keyword.to_string(),
            page,
            credential_id: credential.id,
            proxy_id: proxy.id,
        });
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(FetchedPage::default()))
    }
}

pub struct Harness {
    pub state: AppState,
    pub clock: Arc<ManualClock>,
    pub source: Arc<ScriptedCookieSource>,
    pub fetcher: Arc<ScriptedFetcher>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_env(&[])
    }

    pub fn with_env(overrides: &[(&str, &str)]) -> Self {
        let clock = Arc::new(ManualClock::new(fixtures::epoch()));
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let state = AppState::new(store, clock.clone(), fixtures::config(overrides));
        Self {
            state,
            clock,
            source: Arc::new(ScriptedCookieSource::default()),
            fetcher: Arc::new(ScriptedFetcher::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            cookie_source: self.source.clone(),
            fetcher: self.fetcher.clone(),
        }
    }

    pub fn worker(&self, role: Role) -> Worker {
        build_worker(
            role,
            &self.state,
            &self.collaborators(),
            &self.state.config.worker_policy(),
            &self.state.config.search_policy(),
        )
    }

    pub async fn seed_proxies(&self, n: usize) -> Vec<ProxyEndpoint> {
        let addresses: Vec<String> = fixtures::PROXY_ADDRESSES
            .iter()
            .take(n)
            .map(|address| address.to_string())
            .collect();
        self.state.registry.seed(&addresses).await.unwrap();
        let mut proxies = self.state.registry.list().await.unwrap();
        proxies.sort_by(|a, b| a.address.cmp(&b.address));
        proxies
    }

    /// Admits a fresh cookie minted on `proxy_id`.
    pub async fn admit(&self, proxy_id: Uuid) -> Credential {
        let raw = self
            .source
            .obtain_cookie(&ProxyEndpoint::new("http://unused:1"))
            .await
            .unwrap();
        self.state.pool.admit(raw, proxy_id).await.unwrap()
    }

    /// Leases and processes one job for `worker`. Returns false if none was
    /// claimable.
    pub async fn run_next(&self, worker: &Worker) -> bool {
        match self.state.queue.lease(worker.kind(), Duration::ZERO).await.unwrap() {
            Some(job) => {
                worker.process(job).await.unwrap();
                true
            }
            None => false,
        }
    }

    /// Processes claimable jobs until none remain.
    pub async fn drain(&self, worker: &Worker) -> usize {
        let mut processed = 0;
        while processed < 100 && self.run_next(worker).await {
            processed += 1;
        }
        processed
    }
}
