use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::services::cookie_pool::PoolCounts;

/// Page bounds a search request is checked against.
#[derive(Debug, Clone, Copy)]
pub struct PageLimits {
    /// Widest page range one request may cover; also the default last page.
    pub max_pages: u32,
}

/// Request body for a single keyword search.
#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(PageLimits))]
pub struct SearchRequest {
    #[garde(length(min = 1, max = 200))]
    pub keyword: String,

    #[serde(default = "default_page_start")]
    #[garde(range(min = 1))]
    pub page_start: u32,

    /// Defaults to the configured page limit.
    #[serde(default)]
    #[garde(custom(page_window(&self.page_start)))]
    pub page_end: Option<u32>,
}

/// One keyword task in a batch.
#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(PageLimits))]
pub struct SearchTask {
    #[garde(length(min = 1, max = 200))]
    pub keyword: String,

    #[serde(default)]
    #[garde(length(max = 100))]
    pub category: Option<String>,

    /// 1 is the highest priority.
    #[serde(default = "default_priority")]
    #[garde(range(min = 1, max = 10))]
    pub priority: u8,

    #[serde(default = "default_page_start")]
    #[garde(range(min = 1))]
    pub page_start: u32,

    #[serde(default)]
    #[garde(custom(page_window(&self.page_start)))]
    pub page_end: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[garde(context(PageLimits))]
pub struct BatchSearchRequest {
    #[garde(length(min = 1, max = 1000), dive)]
    pub tasks: Vec<SearchTask>,
}

fn default_page_start() -> u32 {
    1
}

fn default_priority() -> u8 {
    1
}

/// The range must be ordered and at most `max_pages` wide. Without an explicit
/// end the range runs to `max_pages`, so the start may not lie past it.
fn page_window(start: &u32) -> impl FnOnce(&Option<u32>, &PageLimits) -> garde::Result + '_ {
    move |end, limits| match *end {
        Some(end) if end < *start => Err(garde::Error::new("page_end must not precede page_start")),
        Some(end) if end - *start >= limits.max_pages => Err(garde::Error::new(format!(
            "page range may span at most {} pages",
            limits.max_pages
        ))),
        None if *start > limits.max_pages => Err(garde::Error::new(format!(
            "page_start beyond the default last page {} needs an explicit page_end",
            limits.max_pages
        ))),
        _ => Ok(()),
    }
}

#[derive(Debug, Serialize)]
pub struct SearchSubmitted {
    pub keyword: String,
    pub category: Option<String>,
    pub job_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub submitted: Vec<SearchSubmitted>,
    pub jobs: usize,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FillPoolRequest {
    #[garde(range(min = 1, max = 500))]
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct FillPoolResponse {
    pub enqueued: usize,
    pub pool: PoolCounts,
}

#[derive(Debug, Serialize)]
pub struct QueueDepths {
    pub produce_cookie: usize,
    pub search: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub pool: PoolCounts,
    pub queues: QueueDepths,
    pub proxies: usize,
    pub results: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: PageLimits = PageLimits { max_pages: 10 };

    #[test]
    fn test_search_request_defaults_and_range_check() {
        let request: SearchRequest = serde_json::from_str(r#"{"keyword": "rust"}"#).unwrap();
        assert_eq!(request.page_start, 1);
        assert!(request.page_end.is_none());
        assert!(request.validate_with(&LIMITS).is_ok());

        let reversed: SearchRequest =
            serde_json::from_str(r#"{"keyword": "rust", "page_start": 4, "page_end": 2}"#).unwrap();
        assert!(reversed.validate_with(&LIMITS).is_err());
    }

    #[test]
    fn test_page_range_is_bounded() {
        let widest: SearchRequest =
            serde_json::from_str(r#"{"keyword": "rust", "page_start": 5, "page_end": 14}"#).unwrap();
        assert!(widest.validate_with(&LIMITS).is_ok());

        let too_wide: SearchRequest =
            serde_json::from_str(r#"{"keyword": "rust", "page_start": 1, "page_end": 4000000000}"#).unwrap();
        assert!(too_wide.validate_with(&LIMITS).is_err());

        let past_default: SearchRequest =
            serde_json::from_str(r#"{"keyword": "rust", "page_start": 11}"#).unwrap();
        assert!(past_default.validate_with(&LIMITS).is_err());
    }

    #[test]
    fn test_batch_validates_each_task() {
        let batch: BatchSearchRequest =
            serde_json::from_str(r#"{"tasks": [{"keyword": "a"}, {"keyword": "", "priority": 2}]}"#).unwrap();
        assert_eq!(batch.tasks[0].priority, 1);
        assert!(batch.validate_with(&LIMITS).is_err());

        let unbounded: BatchSearchRequest =
            serde_json::from_str(r#"{"tasks": [{"keyword": "a", "page_end": 100000}]}"#).unwrap();
        assert!(unbounded.validate_with(&LIMITS).is_err());
    }
}
