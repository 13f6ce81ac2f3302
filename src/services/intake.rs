//! Request intake: turns search requests into paginated search jobs.

use chrono::Duration;
use uuid::Uuid;

use crate::config::SearchPolicy;
use crate::models::intake::SearchTask;
use crate::models::job::{Job, SearchPayload};
use crate::services::clock::Clock;
use crate::services::queue::JobQueue;
use crate::services::store::StoreError;

/// Splits `first..=last` into chunks of at most `chunk` pages.
pub fn page_chunks(first: u32, last: u32, chunk: u32) -> Vec<(u32, u32)> {
    let chunk = chunk.max(1);
    let mut ranges = Vec::new();
    let mut start = first;
    while start <= last {
        let end = start.saturating_add(chunk - 1).min(last);
        ranges.push((start, end));
        if end == u32::MAX {
            break;
        }
        start = end + 1;
    }
    ranges
}

/// `submitSearch(keyword, pageRange)`: enqueues one job per chunk of pages and
/// returns their ids. `last_page` defaults to the configured page limit.
pub async fn submit_search(
    queue: &JobQueue,
    clock: &dyn Clock,
    policy: &SearchPolicy,
    keyword: &str,
    first_page: u32,
    last_page: Option<u32>,
) -> Result<Vec<Uuid>, StoreError> {
    let last_page = last_page.unwrap_or(policy.max_pages);
    let now = clock.now();

    let mut job_ids = Vec::new();
    for (page_start, page_end) in page_chunks(first_page, last_page, policy.pages_per_job) {
        let job = Job::search(
            SearchPayload {
                keyword: keyword.to_string(),
                page_start,
                page_end,
            },
            now,
        );
        job_ids.push(queue.enqueue(job, Duration::zero()).await?);
    }

    tracing::info!(keyword, first_page, last_page, jobs = job_ids.len(), "Search submitted");
    Ok(job_ids)
}

/// Submits `tasks` highest priority first. Returns each task with its job ids,
/// in submission order.
pub async fn submit_batch(
    queue: &JobQueue,
    clock: &dyn Clock,
    policy: &SearchPolicy,
    mut tasks: Vec<SearchTask>,
) -> Result<Vec<(SearchTask, Vec<Uuid>)>, StoreError> {
    tasks.sort_by_key(|task| task.priority);

    let mut submitted = Vec::with_capacity(tasks.len());
    for task in tasks {
        let ids = submit_search(queue, clock, policy, &task.keyword, task.page_start, task.page_end).await?;
        submitted.push((task, ids));
    }
    Ok(submitted)
}
