//! HTTP-fetch collaborator: one search results page through one proxy with
//! one credential.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use strum::Display;

use crate::models::credential::{Credential, ReleaseOutcome};
use crate::models::proxy::ProxyEndpoint;

/// Item arrays nested one level down under this field are flattened.
const GROUP_FIELD: &str = "card_group";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum FetchFailureKind {
    RateLimited,
    AuthRejected,
    Network,
    Parse,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} fetch failure: {message}")]
pub struct FetchFailure {
    pub kind: FetchFailureKind,
    pub message: String,
}

impl FetchFailure {
    pub fn new(kind: FetchFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// How the failure counts against the credential that was used.
    pub fn credential_outcome(&self) -> ReleaseOutcome {
        match self.kind {
            FetchFailureKind::AuthRejected => ReleaseOutcome::HardFailure,
            FetchFailureKind::RateLimited | FetchFailureKind::Network | FetchFailureKind::Parse => {
                ReleaseOutcome::SoftFailure
            }
        }
    }

    /// Whether the proxy itself delivered a response. Only transport
    /// failures count against proxy health.
    pub fn proxy_ok(&self) -> bool {
        self.kind != FetchFailureKind::Network
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedItem {
    pub source_id: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FetchedPage {
    pub items: Vec<FetchedItem>,
    /// Present when the target reports another page after this one.
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        keyword: &str,
        page: u32,
        credential: &Credential,
        proxy: &ProxyEndpoint,
    ) -> Result<FetchedPage, FetchFailure>;
}

/// Where to find things in a search response, as JSON pointers.
#[derive(Debug, Clone)]
pub struct ResponseLayout {
    pub items_pointer: String,
    /// Relative to each item.
    pub item_id_pointer: String,
    /// Empty means the target does not report one; every non-empty page is
    /// assumed to have a successor.
    pub next_page_pointer: String,
}

/// [`PageFetcher`] that queries the search endpoint with `reqwest`, routed
/// through the leased proxy and carrying the credential's cookies.
pub struct HttpPageFetcher {
    search_url: String,
    layout: ResponseLayout,
    timeout: Duration,
}

impl HttpPageFetcher {
    pub fn new(search_url: &str, layout: ResponseLayout, timeout: Duration) -> Self {
        Self {
            search_url: search_url.to_string(),
            layout,
            timeout,
        }
    }

    fn client_for(&self, credential: &Credential, proxy: &ProxyEndpoint) -> Result<reqwest::Client, FetchFailure> {
        let proxy = reqwest::Proxy::all(&proxy.address)
            .map_err(|e| FetchFailure::new(FetchFailureKind::Network, format!("invalid proxy address: {e}")))?;
        reqwest::Client::builder()
            .proxy(proxy)
            .user_agent(&credential.user_agent)
            .timeout(self.timeout)
            .build()
            .map_err(|e| FetchFailure::new(FetchFailureKind::Network, e.to_string()))
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch_page(
        &self,
        keyword: &str,
        page: u32,
        credential: &Credential,
        proxy: &ProxyEndpoint,
    ) -> Result<FetchedPage, FetchFailure> {
        let client = self.client_for(credential, proxy)?;
        let container_id = format!("100103type=1&q={keyword}");
        let page_param = page.to_string();

        let response = client
            .get(&self.search_url)
            .query(&[
                ("containerid", container_id.as_str()),
                ("page_type", "searchall"),
                ("page", page_param.as_str()),
            ])
            .header(reqwest::header::COOKIE, credential.cookie_header())
            .header(reqwest::header::ACCEPT, "application/json, text/plain, */*")
            .send()
            .await
            .map_err(|e| FetchFailure::new(FetchFailureKind::Network, e.to_string()))?;

        let status = response.status();
        match status.as_u16() {
            401 | 403 => {
                return Err(FetchFailure::new(FetchFailureKind::AuthRejected, format!("HTTP {status}")));
            }
            429 => {
                return Err(FetchFailure::new(FetchFailureKind::RateLimited, format!("HTTP {status}")));
            }
            _ if !status.is_success() => {
                return Err(FetchFailure::new(FetchFailureKind::Network, format!("HTTP {status}")));
            }
            _ => {}
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchFailure::new(FetchFailureKind::Network, e.to_string()))?;
        let json: Value = serde_json::from_str(&body)
            .map_err(|e| FetchFailure::new(FetchFailureKind::Parse, format!("invalid JSON: {e}")))?;

        parse_page(&json, page, &self.layout)
    }
}

/// Extracts items and the next-page marker from a decoded response.
pub fn parse_page(body: &Value, page: u32, layout: &ResponseLayout) -> Result<FetchedPage, FetchFailure> {
    if !body.is_object() {
        return Err(FetchFailure::new(FetchFailureKind::Parse, "response is not a JSON object"));
    }
    if body.get("ok").and_then(Value::as_i64) == Some(-100) {
        return Err(FetchFailure::new(FetchFailureKind::AuthRejected, "target reported ok:-100"));
    }

    let items = match body.pointer(&layout.items_pointer) {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(entries)) => entries
            .iter()
            .flat_map(|entry| match entry.get(GROUP_FIELD) {
                Some(Value::Array(group)) => group.iter().collect::<Vec<_>>(),
                _ => vec![entry],
            })
            .filter_map(|entry| {
                let source_id = match entry.pointer(&layout.item_id_pointer)? {
                    Value::String(s) if !s.is_empty() => s.clone(),
                    Value::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some(FetchedItem {
                    source_id,
                    payload: entry.clone(),
                })
            })
            .collect(),
        Some(other) => {
            return Err(FetchFailure::new(
                FetchFailureKind::Parse,
                format!("expected array at {}, found {other}", layout.items_pointer),
            ));
        }
    };

    let next_page_token = if layout.next_page_pointer.is_empty() {
        (!items.is_empty()).then(|| (page + 1).to_string())
    } else {
        match body.pointer(&layout.next_page_pointer) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        }
    };

    Ok(FetchedPage { items, next_page_token })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layout() -> ResponseLayout {
        ResponseLayout {
            items_pointer: "/data/cards".to_string(),
            item_id_pointer: "/mblog/mid".to_string(),
            next_page_pointer: "/data/cardlistInfo/page".to_string(),
        }
    }

    #[test]
    fn test_parse_flattens_groups_and_skips_items_without_id() {
        let body = json!({
            "ok": 1,
            "data": {
                "cardlistInfo": {"page": 3},
                "cards": [
                    {"card_type": 9, "mblog": {"mid": "100"}},
                    {"card_type": 11, "card_group": [
                        {"card_type": 9, "mblog": {"mid": 101}},
                        {"card_type": 42, "desc": "banner"}
                    ]},
                    {"card_type": 9, "mblog": {"mid": ""}}
                ]
            }
        });
        let page = parse_page(&body, 2, &layout()).unwrap();
        let ids: Vec<&str> = page.items.iter().map(|item| item.source_id.as_str()).collect();
        assert_eq!(ids, vec!["100", "101"]);
        assert_eq!(page.next_page_token.as_deref(), Some("3"));
    }

    #[test]
    fn test_last_page_has_no_token() {
        let body = json!({"ok": 1, "data": {"cardlistInfo": {"page": null}, "cards": []}});
        let page = parse_page(&body, 9, &layout()).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_rejected_cookie_is_auth_failure() {
        let failure = parse_page(&json!({"ok": -100, "url": "/login"}), 1, &layout()).unwrap_err();
        assert_eq!(failure.kind, FetchFailureKind::AuthRejected);
        assert_eq!(failure.credential_outcome(), ReleaseOutcome::HardFailure);
        assert!(failure.proxy_ok());
    }

    #[test]
    fn test_malformed_items_are_parse_failures() {
        let failure = parse_page(&json!({"data": {"cards": "nope"}}), 1, &layout()).unwrap_err();
        assert_eq!(failure.kind, FetchFailureKind::Parse);
        assert!(parse_page(&json!([1, 2]), 1, &layout()).is_err());
    }

    #[test]
    fn test_failure_mapping() {
        let network = FetchFailure::new(FetchFailureKind::Network, "reset");
        assert_eq!(network.credential_outcome(), ReleaseOutcome::SoftFailure);
        assert!(!network.proxy_ok());
        let limited = FetchFailure::new(FetchFailureKind::RateLimited, "429");
        assert_eq!(limited.credential_outcome(), ReleaseOutcome::SoftFailure);
        assert!(limited.proxy_ok());
    }

    #[test]
    fn test_without_next_pointer_non_empty_pages_continue() {
        let layout = ResponseLayout {
            next_page_pointer: String::new(),
            ..layout()
        };
        let body = json!({"data": {"cards": [{"mblog": {"mid": "1"}}]}});
        assert_eq!(parse_page(&body, 4, &layout).unwrap().next_page_token.as_deref(), Some("5"));
    }
}
