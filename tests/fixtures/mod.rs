//! Canned inputs shared by the orchestration tests.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Value};

use crawl_orchestrator::config::AppConfig;
use crawl_orchestrator::models::credential::RawCredential;
use crawl_orchestrator::services::fetcher::{FetchedItem, FetchedPage};

pub const PROXY_ADDRESSES: &[&str] = &[
    "http://10.0.0.1:8080",
    "http://10.0.0.2:8080",
    "http://10.0.0.3:8080",
];

/// Fixed start time for the manual clock.
pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().unwrap_or_else(Utc::now)
}

/// Configuration as the binaries would load it, with test-friendly timings.
/// `overrides` are environment-style pairs applied on top.
pub fn config(overrides: &[(&str, &str)]) -> AppConfig {
    let mut vars: BTreeMap<String, String> = [
        ("REDIS_URL", "redis://127.0.0.1:6379/15"),
        ("MIN_POOL_SIZE", "0"),
        ("SEARCH_DELAY_MS", "0"),
        ("LEASE_WAIT_MS", "0"),
        ("POLL_INTERVAL_MS", "10"),
        ("CAS_JITTER_MS", "2"),
        ("PAGES_PER_JOB", "3"),
        ("MAX_PAGES", "6"),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), value.to_string()))
    .collect();
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }
    envy::from_iter(vars).expect("test configuration should deserialize")
}

pub fn raw_cookie(n: u32) -> RawCredential {
    RawCredential {
        cookies: BTreeMap::from([
            ("SUB".to_string(), format!("sub-{n}")),
            ("SUBP".to_string(), format!("subp-{n}")),
        ]),
        user_agent: "Mozilla/5.0 (X11; Linux x86_64) Gecko/20100101 Firefox/124.0".to_string(),
    }
}

/// A page of items with the given source ids.
pub fn page(ids: &[&str], has_next: bool) -> FetchedPage {
    FetchedPage {
        items: ids
            .iter()
            .map(|id| FetchedItem {
                source_id: id.to_string(),
                payload: json!({ "mid": id, "text": format!("post {id}") }),
            })
            .collect(),
        next_page_token: has_next.then(|| "next".to_string()),
    }
}

/// Search response body in the target's card layout.
pub fn search_response(page: u32) -> Value {
    json!({
        "ok": 1,
        "data": {
            "cardlistInfo": { "page": page + 1 },
            "cards": [
                { "card_type": 9, "mblog": { "mid": "4990000000000001", "text": "first" } },
                { "card_type": 11, "card_group": [
                    { "card_type": 9, "mblog": { "mid": 4990000000000002u64, "text": "second" } },
                    { "card_type": 4, "desc": "no id here" }
                ] }
            ]
        }
    })
}
