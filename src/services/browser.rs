//! Browser-automation collaborator.
//!
//! Cookies are minted by an external headless-browser service that renders the
//! target through a given proxy and hands back the resulting cookie jar. The
//! orchestrator only sees the [`CookieSource`] boundary.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::credential::{Credential, RawCredential};
use crate::models::proxy::ProxyEndpoint;

#[derive(Debug, thiserror::Error)]
pub enum BrowserError {
    #[error("HTTP request to browser service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Browser service returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("Browser service returned no cookies")]
    EmptyCookieJar,

    #[error("Minted cookie failed validation")]
    ValidationFailed,

    #[error("Browser service timed out")]
    Timeout,
}

#[async_trait]
pub trait CookieSource: Send + Sync {
    /// Mint a fresh cookie by driving a browser through `proxy`.
    async fn obtain_cookie(&self, proxy: &ProxyEndpoint) -> Result<RawCredential, BrowserError>;

    /// Probe whether `credential` is still accepted by the target.
    async fn validate(&self, credential: &Credential, proxy: &ProxyEndpoint) -> Result<bool, BrowserError>;
}

#[derive(Debug, Serialize)]
struct CookieRequest<'a> {
    proxy: &'a str,
}

#[derive(Debug, Deserialize)]
struct CookieResponse {
    cookies: BTreeMap<String, String>,
    user_agent: String,
}

#[derive(Debug, Serialize)]
struct ValidateRequest<'a> {
    proxy: &'a str,
    cookies: &'a BTreeMap<String, String>,
    user_agent: &'a str,
}

#[derive(Debug, Deserialize)]
struct ValidateResponse {
    valid: bool,
}

/// [`CookieSource`] backed by the browser service's HTTP API
/// (`POST /cookie`, `POST /validate`).
pub struct BrowserServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl BrowserServiceClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BrowserError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CookieSource for BrowserServiceClient {
    async fn obtain_cookie(&self, proxy: &ProxyEndpoint) -> Result<RawCredential, BrowserError> {
        let response = self
            .http
            .post(format!("{}/cookie", self.base_url))
            .json(&CookieRequest { proxy: &proxy.address })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BrowserError::Status(response.status()));
        }

        let body: CookieResponse = response.json().await?;
        if body.cookies.is_empty() {
            return Err(BrowserError::EmptyCookieJar);
        }
        tracing::debug!(proxy_id = %proxy.id, cookies = body.cookies.len(), "Browser service minted cookie");
        Ok(RawCredential {
            cookies: body.cookies,
            user_agent: body.user_agent,
        })
    }

    async fn validate(&self, credential: &Credential, proxy: &ProxyEndpoint) -> Result<bool, BrowserError> {
        let response = self
            .http
            .post(format!("{}/validate", self.base_url))
            .json(&ValidateRequest {
                proxy: &proxy.address,
                cookies: &credential.cookies,
                user_agent: &credential.user_agent,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(BrowserError::Status(response.status()));
        }
        let body: ValidateResponse = response.json().await?;
        Ok(body.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_response_decodes() {
        let body = r#"{"cookies": {"SUB": "abc", "SUBP": "def"}, "user_agent": "Mozilla/5.0"}"#;
        let decoded: CookieResponse = serde_json::from_str(body).unwrap();
        assert_eq!(decoded.cookies.len(), 2);
        assert_eq!(decoded.user_agent, "Mozilla/5.0");
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = BrowserServiceClient::new("http://browser:3001/", Duration::from_secs(5)).unwrap();
        assert_eq!(client.base_url, "http://browser:3001");
    }
}
