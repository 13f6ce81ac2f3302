use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use garde::Validate;
use serde::Deserialize;

use crate::app_state::AppState;
use crate::models::intake::{
    BatchSearchRequest, FillPoolRequest, FillPoolResponse, PageLimits, QueueDepths, SearchRequest,
    SearchSubmitted, StatusResponse, SubmitResponse,
};
use crate::models::job::{DeadLetter, JobKind};
use crate::services::intake;
use crate::services::store::StoreError;

const DEFAULT_DEAD_LETTER_LIMIT: usize = 50;
const MAX_DEAD_LETTER_LIMIT: usize = 500;

fn store_unavailable(e: StoreError) -> StatusCode {
    tracing::error!(error = %e, "Backing store request failed");
    StatusCode::SERVICE_UNAVAILABLE
}

fn page_limits(state: &AppState) -> PageLimits {
    PageLimits {
        max_pages: state.config.max_pages,
    }
}

fn invalid(report: garde::Report) -> StatusCode {
    tracing::debug!(errors = %report, "Rejected request body");
    StatusCode::UNPROCESSABLE_ENTITY
}

/// POST /api/v1/search: queue one keyword as paginated search jobs.
pub async fn submit_search(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SubmitResponse>, StatusCode> {
    request.validate_with(&page_limits(&state)).map_err(invalid)?;

    let job_ids = intake::submit_search(
        &state.queue,
        state.clock.as_ref(),
        &state.config.search_policy(),
        &request.keyword,
        request.page_start,
        request.page_end,
    )
    .await
    .map_err(store_unavailable)?;

    metrics::counter!("crawl_searches_submitted_total").increment(1);
    Ok(Json(SubmitResponse {
        jobs: job_ids.len(),
        submitted: vec![SearchSubmitted {
            keyword: request.keyword,
            category: None,
            job_ids,
        }],
    }))
}

/// POST /api/v1/search/batch: queue many keywords, highest priority first.
pub async fn submit_batch(
    State(state): State<AppState>,
    Json(request): Json<BatchSearchRequest>,
) -> Result<Json<SubmitResponse>, StatusCode> {
    request.validate_with(&page_limits(&state)).map_err(invalid)?;

    let submitted = intake::submit_batch(
        &state.queue,
        state.clock.as_ref(),
        &state.config.search_policy(),
        request.tasks,
    )
    .await
    .map_err(store_unavailable)?;

    metrics::counter!("crawl_searches_submitted_total").increment(submitted.len() as u64);
    let submitted: Vec<SearchSubmitted> = submitted
        .into_iter()
        .map(|(task, job_ids)| SearchSubmitted {
            keyword: task.keyword,
            category: task.category,
            job_ids,
        })
        .collect();
    let jobs = submitted.iter().map(|s| s.job_ids.len()).sum();

    tracing::info!(tasks = submitted.len(), jobs, "Batch search submitted");
    Ok(Json(SubmitResponse { submitted, jobs }))
}

/// POST /api/v1/pool/fill: enqueue produce-cookie jobs until live credentials
/// plus outstanding produce jobs reach `count`.
pub async fn fill_pool(
    State(state): State<AppState>,
    Json(request): Json<FillPoolRequest>,
) -> Result<Json<FillPoolResponse>, StatusCode> {
    request.validate().map_err(invalid)?;

    let enqueued = state
        .pool
        .replenish_threshold(request.count)
        .await
        .map_err(store_unavailable)?;
    let pool = state.pool.counts().await.map_err(store_unavailable)?;

    tracing::info!(target_size = request.count, enqueued, "Pool fill requested");
    Ok(Json(FillPoolResponse { enqueued, pool }))
}

/// GET /api/v1/status
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, StatusCode> {
    let pool = state.pool.counts().await.map_err(store_unavailable)?;
    let queues = QueueDepths {
        produce_cookie: state.queue.depth(JobKind::ProduceCookie).await.map_err(store_unavailable)?,
        search: state.queue.depth(JobKind::Search).await.map_err(store_unavailable)?,
        dead_letters: state.queue.dead_letter_count().await.map_err(store_unavailable)?,
    };
    let proxies = state.registry.list().await.map_err(store_unavailable)?.len();
    let results = state.sink.len().await.map_err(store_unavailable)?;

    Ok(Json(StatusResponse {
        pool,
        queues,
        proxies,
        results,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/dead-letters: newest first.
pub async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<DeadLetter>>, StatusCode> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_DEAD_LETTER_LIMIT)
        .min(MAX_DEAD_LETTER_LIMIT);
    let letters = state.queue.dead_letters(limit).await.map_err(store_unavailable)?;
    Ok(Json(letters))
}

/// GET /api/v1/dedup/stale: fingerprints past the retention window, for an
/// external compactor.
pub async fn stale_fingerprints(State(state): State<AppState>) -> Result<Json<Vec<String>>, StatusCode> {
    let stale = state
        .ledger
        .stale(state.config.dedup_retention())
        .await
        .map_err(store_unavailable)?;
    Ok(Json(stale))
}
