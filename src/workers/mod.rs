//! Worker roles and their control loop.
//!
//! A worker process runs one loop per selected [`Role`]. Each loop leases a
//! job of its kind, processes it, and acks, fails or defers it. Collaborator
//! failures are classified into [`JobError`] inside the role; only store
//! failures escape a loop, and they stop the whole process.

pub mod cookie;
pub mod search;

use std::sync::Arc;

use serde::Deserialize;
use strum::Display;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use crate::app_state::AppState;
use crate::config::{SearchPolicy, WorkerPolicy};
use crate::models::job::{Job, JobKind};
use crate::services::browser::{BrowserError, CookieSource};
use crate::services::cookie_pool::PoolError;
use crate::services::fetcher::{FetchFailure, FetchFailureKind, PageFetcher};
use crate::services::queue::JobQueue;
use crate::services::store::StoreError;

pub use self::cookie::CookieWorker;
pub use self::search::SearchWorker;

/// Roles requested for a worker process (`WORKER_ROLE`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleSelection {
    Cookie,
    Search,
    #[default]
    Both,
}

impl RoleSelection {
    pub fn roles(self) -> Vec<Role> {
        match self {
            RoleSelection::Cookie => vec![Role::CookieWorker],
            RoleSelection::Search => vec![Role::SearchWorker],
            RoleSelection::Both => vec![Role::CookieWorker, Role::SearchWorker],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    CookieWorker,
    SearchWorker,
}

/// Classified failure of one job attempt.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("cookie pool exhausted")]
    PoolExhausted,

    #[error("no usable proxy")]
    ProxyExhausted,

    #[error("credential rejected: {0}")]
    CredentialRejected(FetchFailure),

    #[error("transient fetch failure: {0}")]
    TransientFetchFailure(FetchFailure),

    #[error("cookie production failed: {0}")]
    CookieProductionFailed(#[from] BrowserError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<PoolError> for JobError {
    fn from(e: PoolError) -> Self {
        match e {
            // Contention means other workers are busy with the pool; retry later.
            PoolError::PoolExhausted | PoolError::Contended => JobError::PoolExhausted,
            PoolError::ProxyExhausted => JobError::ProxyExhausted,
            PoolError::Store(e) => JobError::Store(e),
        }
    }
}

impl From<FetchFailure> for JobError {
    fn from(failure: FetchFailure) -> Self {
        match failure.kind {
            FetchFailureKind::AuthRejected => JobError::CredentialRejected(failure),
            _ => JobError::TransientFetchFailure(failure),
        }
    }
}

/// What a worker does with a job after processing it.
pub(crate) async fn settle(
    queue: &JobQueue,
    job: &Job,
    result: Result<(), JobError>,
    policy: &WorkerPolicy,
) -> Result<(), StoreError> {
    match result {
        Ok(()) => {
            queue.ack(job).await?;
        }
        Err(JobError::PoolExhausted | JobError::ProxyExhausted) => {
            tracing::info!(
                job_id = %job.id,
                kind = %job.kind,
                retry_in_secs = policy.exhausted_retry.num_seconds(),
                "Resources exhausted, deferring job"
            );
            queue.defer(job, policy.exhausted_retry).await?;
        }
        Err(JobError::Store(e)) => return Err(e),
        Err(e) => {
            tracing::warn!(job_id = %job.id, kind = %job.kind, attempts = job.attempts, error = %e, "Job attempt failed");
            queue.fail(job, true, &e.to_string()).await?;
        }
    }
    Ok(())
}

/// One role's worker, as a closed set.
pub enum Worker {
    Cookie(CookieWorker),
    Search(SearchWorker),
}

impl Worker {
    pub fn role(&self) -> Role {
        match self {
            Worker::Cookie(_) => Role::CookieWorker,
            Worker::Search(_) => Role::SearchWorker,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Worker::Cookie(_) => JobKind::ProduceCookie,
            Worker::Search(_) => JobKind::Search,
        }
    }

    pub async fn housekeeping(&self) -> Result<(), StoreError> {
        match self {
            Worker::Cookie(worker) => worker.housekeeping().await,
            Worker::Search(_) => Ok(()),
        }
    }

    pub async fn process(&self, job: Job) -> Result<(), StoreError> {
        match self {
            Worker::Cookie(worker) => worker.process(job).await,
            Worker::Search(worker) => worker.process(job).await,
        }
    }
}

/// External collaborators the roles drive.
#[derive(Clone)]
pub struct Collaborators {
    pub cookie_source: Arc<dyn CookieSource>,
    pub fetcher: Arc<dyn PageFetcher>,
}

pub fn build_worker(
    role: Role,
    state: &AppState,
    collaborators: &Collaborators,
    policy: &WorkerPolicy,
    search: &SearchPolicy,
) -> Worker {
    match role {
        Role::CookieWorker => Worker::Cookie(CookieWorker::new(
            state.pool.clone(),
            state.registry.clone(),
            state.queue.clone(),
            collaborators.cookie_source.clone(),
            state.clock.clone(),
            policy.clone(),
        )),
        Role::SearchWorker => Worker::Search(SearchWorker::new(
            state.pool.clone(),
            state.registry.clone(),
            state.queue.clone(),
            state.sink.clone(),
            collaborators.fetcher.clone(),
            state.clock.clone(),
            policy.clone(),
            search.clone(),
        )),
    }
}

fn housekeeping_due(last: Option<Instant>, now: Instant, interval: std::time::Duration) -> bool {
    last.map_or(true, |at| now.duration_since(at) >= interval)
}

/// Runs one worker until `cancel` fires or the store fails.
///
/// On cancellation no new job is leased; a job already in progress gets
/// `shutdown_grace` to finish and is otherwise abandoned, leaving its lease
/// to expire so another worker picks it up.
pub async fn run_worker(
    worker: &Worker,
    queue: &JobQueue,
    cancel: &CancellationToken,
    policy: &WorkerPolicy,
) -> Result<(), StoreError> {
    let role = worker.role();
    tracing::info!(%role, "Worker loop started");

    let mut last_housekeeping = None;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if housekeeping_due(last_housekeeping, now, policy.housekeeping_interval) {
            worker.housekeeping().await?;
            last_housekeeping = Some(now);
        }

        let leased = tokio::select! {
            _ = cancel.cancelled() => break,
            leased = queue.lease(worker.kind(), policy.lease_wait) => leased?,
        };
        let Some(job) = leased else {
            tracing::trace!(%role, "No jobs available, sleeping");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(policy.idle_sleep) => {}
            }
            continue;
        };

        let job_id = job.id;
        tracing::info!(%role, job_id = %job_id, attempts = job.attempts, "Processing job");
        let work = worker.process(job);
        tokio::pin!(work);

        tokio::select! {
            result = &mut work => result?,
            _ = cancel.cancelled() => {
                tracing::info!(
                    %role,
                    job_id = %job_id,
                    grace_secs = policy.shutdown_grace.as_secs(),
                    "Shutdown requested, finishing current job"
                );
                match tokio::time::timeout(policy.shutdown_grace, &mut work).await {
                    Ok(result) => result?,
                    Err(_) => tracing::warn!(
                        %role,
                        job_id = %job_id,
                        "Grace period elapsed, abandoning job to lease expiry"
                    ),
                }
                break;
            }
        }
    }

    tracing::info!(%role, "Worker loop stopped");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("worker task aborted: {0}")]
    Aborted(String),
}

/// `run(role)`: one loop per selected role, all stopping together. The first
/// failure cancels the remaining loops and is returned.
pub async fn run(
    selection: RoleSelection,
    state: &AppState,
    collaborators: &Collaborators,
    policy: &WorkerPolicy,
    search: &SearchPolicy,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let mut tasks = JoinSet::new();
    for role in selection.roles() {
        let worker = build_worker(role, state, collaborators, policy, search);
        let queue = state.queue.clone();
        let cancel = cancel.clone();
        let policy = policy.clone();
        tasks.spawn(async move {
            let result = run_worker(&worker, &queue, &cancel, &policy).await;
            (role, result)
        });
    }

    let mut outcome = Ok(());
    while let Some(joined) = tasks.join_next().await {
        let failure = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((role, Err(e))) => {
                tracing::error!(%role, error = %e, "Worker loop failed, stopping all roles");
                WorkerError::Store(e)
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker task aborted, stopping all roles");
                WorkerError::Aborted(e.to_string())
            }
        };
        cancel.cancel();
        if outcome.is_ok() {
            outcome = Err(failure);
        }
    }
    outcome
}
