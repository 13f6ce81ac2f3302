use std::sync::Arc;

use tokio::time::timeout;
use uuid::Uuid;

use crate::config::WorkerPolicy;
use crate::models::credential::{Credential, CredentialStatus, RawCredential};
use crate::models::job::{Job, JobPayload};
use crate::models::proxy::ProxyEndpoint;
use crate::services::browser::{BrowserError, CookieSource};
use crate::services::clock::Clock;
use crate::services::cookie_pool::CookiePool;
use crate::services::proxy_registry::ProxyRegistry;
use crate::services::queue::JobQueue;
use crate::services::store::StoreError;

use super::{settle, JobError};

/// Keeps the pool topped up: mints cookies for produce jobs, re-probes
/// degraded credentials, and ages the pool between jobs.
pub struct CookieWorker {
    pool: Arc<CookiePool>,
    registry: Arc<ProxyRegistry>,
    queue: Arc<JobQueue>,
    source: Arc<dyn CookieSource>,
    clock: Arc<dyn Clock>,
    policy: WorkerPolicy,
}

impl CookieWorker {
    pub fn new(
        pool: Arc<CookiePool>,
        registry: Arc<ProxyRegistry>,
        queue: Arc<JobQueue>,
        source: Arc<dyn CookieSource>,
        clock: Arc<dyn Clock>,
        policy: WorkerPolicy,
    ) -> Self {
        Self {
            pool,
            registry,
            queue,
            source,
            clock,
            policy,
        }
    }

    pub async fn housekeeping(&self) -> Result<(), StoreError> {
        let report = self.pool.sweep().await?;
        if report.degraded > 0 || report.expired > 0 {
            tracing::info!(degraded = report.degraded, expired = report.expired, "Pool sweep aged credentials");
        }
        self.pool.replenish().await?;
        Ok(())
    }

    pub async fn process(&self, job: Job) -> Result<(), StoreError> {
        let result = match &job.payload {
            JobPayload::ProduceCookie { revalidate: Some(id) } => self.revalidate(*id).await,
            JobPayload::ProduceCookie { revalidate: None } => self.produce().await,
            JobPayload::Search(_) => {
                tracing::error!(job_id = %job.id, "Search job on the produce-cookie channel");
                self.queue.fail(&job, false, "unexpected payload").await?;
                return Ok(());
            }
        };
        settle(&self.queue, &job, result, &self.policy).await
    }

    async fn produce(&self) -> Result<(), JobError> {
        let Some(proxy) = self.registry.acquire().await? else {
            return Err(JobError::ProxyExhausted);
        };

        let minted = self.mint(&proxy).await;
        self.registry.report_outcome(proxy.id, minted.is_ok()).await?;
        if let Some(binding) = &proxy.binding {
            self.registry.release(proxy.id, binding.token).await?;
        }

        let raw = minted?;
        let credential = self.pool.admit(raw, proxy.id).await?;
        tracing::info!(credential_id = %credential.id, proxy_id = %proxy.id, "Produced cookie");
        Ok(())
    }

    /// Obtains a cookie through `proxy` and checks it before admission.
    async fn mint(&self, proxy: &ProxyEndpoint) -> Result<RawCredential, BrowserError> {
        let raw = timeout(self.policy.browser_timeout, self.source.obtain_cookie(proxy))
            .await
            .map_err(|_| BrowserError::Timeout)??;

        let candidate = Credential::pending(raw.clone(), proxy.id, self.clock.now());
        let valid = timeout(self.policy.browser_timeout, self.source.validate(&candidate, proxy))
            .await
            .map_err(|_| BrowserError::Timeout)??;
        if !valid {
            return Err(BrowserError::ValidationFailed);
        }
        Ok(raw)
    }

    async fn revalidate(&self, id: Uuid) -> Result<(), JobError> {
        let Some(credential) = self.pool.get(id).await? else {
            tracing::warn!(credential_id = %id, "Revalidation requested for unknown credential");
            return Ok(());
        };
        if credential.status != CredentialStatus::Degraded {
            tracing::debug!(credential_id = %id, status = %credential.status, "Credential no longer degraded, skipping probe");
            return Ok(());
        }

        let Some(proxy) = self.registry.get(credential.proxy_id).await? else {
            tracing::warn!(credential_id = %id, proxy_id = %credential.proxy_id, "Credential's proxy is gone, expiring");
            self.pool.revalidate(id, false).await?;
            return Ok(());
        };

        let ok = timeout(self.policy.browser_timeout, self.source.validate(&credential, &proxy))
            .await
            .map_err(|_| BrowserError::Timeout)??;
        self.pool.revalidate(id, ok).await?;
        Ok(())
    }
}
