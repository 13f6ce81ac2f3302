use std::sync::Arc;

use garde::Validate;
use tokio::time::{sleep, timeout};

use crate::config::{SearchPolicy, WorkerPolicy};
use crate::models::credential::ReleaseOutcome;
use crate::models::job::{Job, JobPayload};
use crate::models::result::ResultRecord;
use crate::services::clock::Clock;
use crate::services::cookie_pool::{CookiePool, Lease, PoolError};
use crate::services::dedup::ResultSink;
use crate::services::fetcher::{FetchFailure, FetchFailureKind, FetchedPage, PageFetcher};
use crate::services::proxy_registry::ProxyRegistry;
use crate::services::queue::JobQueue;
use crate::services::store::StoreError;

use super::{settle, JobError};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SearchReport {
    pub pages: u32,
    pub accepted: usize,
    pub duplicates: usize,
}

/// Works through search jobs page by page with a leased credential + proxy.
pub struct SearchWorker {
    pool: Arc<CookiePool>,
    registry: Arc<ProxyRegistry>,
    queue: Arc<JobQueue>,
    sink: ResultSink,
    fetcher: Arc<dyn PageFetcher>,
    clock: Arc<dyn Clock>,
    policy: WorkerPolicy,
    search: SearchPolicy,
}

impl SearchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<CookiePool>,
        registry: Arc<ProxyRegistry>,
        queue: Arc<JobQueue>,
        sink: ResultSink,
        fetcher: Arc<dyn PageFetcher>,
        clock: Arc<dyn Clock>,
        policy: WorkerPolicy,
        search: SearchPolicy,
    ) -> Self {
        Self {
            pool,
            registry,
            queue,
            sink,
            fetcher,
            clock,
            policy,
            search,
        }
    }

    pub async fn process(&self, mut job: Job) -> Result<(), StoreError> {
        let JobPayload::Search(payload) = &job.payload else {
            tracing::error!(job_id = %job.id, "Non-search job on the search channel");
            self.queue.fail(&job, false, "unexpected payload").await?;
            return Ok(());
        };
        if let Err(report) = payload.validate() {
            tracing::error!(job_id = %job.id, errors = %report, "Malformed search payload");
            self.queue.fail(&job, false, &format!("invalid payload: {report}")).await?;
            return Ok(());
        }

        let result = self.run_search(&mut job).await.map(|report| {
            tracing::info!(
                job_id = %job.id,
                pages = report.pages,
                accepted = report.accepted,
                duplicates = report.duplicates,
                "Search job completed"
            );
        });
        settle(&self.queue, &job, result, &self.policy).await
    }

    /// Fetches the job's remaining pages. The payload's `page_start` advances
    /// as pages complete so a retried job resumes where this one stopped.
    async fn run_search(&self, job: &mut Job) -> Result<SearchReport, JobError> {
        let lease = self.pool.lease(None).await?;
        tracing::debug!(
            job_id = %job.id,
            credential_id = %lease.credential.id,
            proxy_id = %lease.proxy.id,
            "Leased credential for search"
        );

        let mut report = SearchReport::default();
        loop {
            let JobPayload::Search(payload) = &mut job.payload else {
                break;
            };
            if payload.page_start > payload.page_end {
                break;
            }
            let page = payload.page_start;
            let keyword = payload.keyword.clone();

            let fetched = match self.fetch(&keyword, page, &lease).await {
                Ok(fetched) => fetched,
                Err(failure) => {
                    tracing::warn!(
                        job_id = %job.id,
                        credential_id = %lease.credential.id,
                        page,
                        kind = %failure.kind,
                        error = %failure.message,
                        "Page fetch failed"
                    );
                    self.registry.report_outcome(lease.proxy.id, failure.proxy_ok()).await?;
                    self.release(&lease, failure.credential_outcome()).await?;
                    return Err(failure.into());
                }
            };
            self.registry.report_outcome(lease.proxy.id, true).await?;

            let now = self.clock.now();
            for item in &fetched.items {
                let record = ResultRecord::new(&item.source_id, &keyword, page, item.payload.clone(), now);
                if self.sink.append(&record).await? {
                    report.accepted += 1;
                } else {
                    report.duplicates += 1;
                }
            }
            report.pages += 1;
            payload.page_start = page + 1;
            tracing::debug!(job_id = %job.id, page, items = fetched.items.len(), "Page stored");

            if fetched.items.is_empty() || fetched.next_page_token.is_none() {
                break;
            }
            if payload.page_start <= payload.page_end {
                sleep(self.search.page_delay).await;
            }
        }

        self.release(&lease, ReleaseOutcome::Success).await?;
        Ok(report)
    }

    async fn fetch(&self, keyword: &str, page: u32, lease: &Lease) -> Result<FetchedPage, FetchFailure> {
        timeout(
            self.policy.fetch_timeout,
            self.fetcher.fetch_page(keyword, page, &lease.credential, &lease.proxy),
        )
        .await
        .map_err(|_| FetchFailure::new(FetchFailureKind::Network, "fetch timed out"))?
    }

    async fn release(&self, lease: &Lease, outcome: ReleaseOutcome) -> Result<(), StoreError> {
        match self.pool.release(lease, outcome).await {
            Ok(_) => Ok(()),
            Err(PoolError::Store(e)) => Err(e),
            Err(e) => {
                tracing::warn!(credential_id = %lease.credential.id, error = %e, "Failed to release credential");
                Ok(())
            }
        }
    }
}
