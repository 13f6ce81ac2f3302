//! Shared backing store.
//!
//! Every piece of cross-process state (credentials, proxies, jobs, the dedup
//! set and the result log) is a versioned record in one namespace of a
//! [`Backend`]. Components never hold authoritative state in memory: they read
//! records, decide, and write back with compare-and-swap on the version they
//! read.

pub mod memory;
pub mod redis;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::CasPolicy;
use crate::models::job::JobKind;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// Logical namespaces in the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Credentials,
    /// Cookie payload hash → credential id.
    CredentialIndex,
    Proxies,
    Jobs(JobKind),
    DeadLetters,
    Dedup,
    Results,
}

impl Namespace {
    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Credentials => "credentials",
            Namespace::CredentialIndex => "credential_index",
            Namespace::Proxies => "proxies",
            Namespace::Jobs(JobKind::ProduceCookie) => "jobs:produce_cookie",
            Namespace::Jobs(JobKind::Search) => "jobs:search",
            Namespace::DeadLetters => "dead_letters",
            Namespace::Dedup => "dedup",
            Namespace::Results => "results",
        }
    }
}

/// Raw record as held by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: String,
}

/// Primitive operations every backing store provides. Each call is atomic.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Versioned>, StoreError>;

    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Versioned)>, StoreError>;

    /// Writes `value` if the stored version equals `expected` (`None` = key
    /// must be absent). Returns the new version, or `None` on conflict.
    async fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<Option<u64>, StoreError>;

    async fn compare_and_delete(
        &self,
        ns: Namespace,
        key: &str,
        expected: u64,
    ) -> Result<bool, StoreError>;

    /// Inserts `claim_key` into `claim_ns` and appends `entry` to the log
    /// `log_ns` in one step, only if the key was absent.
    async fn claim_and_append(
        &self,
        claim_ns: Namespace,
        claim_key: &str,
        claim_value: &str,
        log_ns: Namespace,
        entry: &str,
    ) -> Result<bool, StoreError>;

    async fn read_log(
        &self,
        ns: Namespace,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    async fn log_len(&self, ns: Namespace) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// A decoded record with the version it was read at.
#[derive(Debug, Clone)]
pub struct Record<T> {
    pub key: String,
    pub version: u64,
    pub value: T,
}

/// Typed JSON view over a [`Backend`].
#[derive(Clone)]
pub struct Store {
    backend: Arc<dyn Backend>,
}

impl Store {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Reads one record. A record that no longer decodes is reported and
    /// treated as absent.
    pub async fn get<T: DeserializeOwned>(
        &self,
        ns: Namespace,
        key: &str,
    ) -> Result<Option<Record<T>>, StoreError> {
        let Some(raw) = self.backend.get(ns, key).await? else {
            return Ok(None);
        };
        Ok(decode(ns, key.to_string(), raw))
    }

    pub async fn scan<T: DeserializeOwned>(&self, ns: Namespace) -> Result<Vec<Record<T>>, StoreError> {
        let rows = self.backend.scan(ns).await?;
        Ok(rows
            .into_iter()
            .filter_map(|(key, raw)| decode(ns, key, raw))
            .collect())
    }

    /// Inserts if absent. Returns false when the key already exists.
    pub async fn insert<T: Serialize>(&self, ns: Namespace, key: &str, value: &T) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(value)?;
        Ok(self
            .backend
            .compare_and_swap(ns, key, None, &payload)
            .await?
            .is_some())
    }

    /// Replaces a record read at `expected`. Returns false on a concurrent write.
    pub async fn replace<T: Serialize>(
        &self,
        ns: Namespace,
        key: &str,
        expected: u64,
        value: &T,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(value)?;
        Ok(self
            .backend
            .compare_and_swap(ns, key, Some(expected), &payload)
            .await?
            .is_some())
    }

    pub async fn delete(&self, ns: Namespace, key: &str, expected: u64) -> Result<bool, StoreError> {
        self.backend.compare_and_delete(ns, key, expected).await
    }

    pub async fn claim_and_append<T: Serialize>(
        &self,
        claim_ns: Namespace,
        claim_key: &str,
        claim_value: &str,
        log_ns: Namespace,
        entry: &T,
    ) -> Result<bool, StoreError> {
        let payload = serde_json::to_string(entry)?;
        self.backend
            .claim_and_append(claim_ns, claim_key, claim_value, log_ns, &payload)
            .await
    }

    pub async fn read_log<T: DeserializeOwned>(
        &self,
        ns: Namespace,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<T>, StoreError> {
        let entries = self.backend.read_log(ns, offset, limit).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match serde_json::from_str(&entry) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(namespace = ns.as_str(), error = %e, "Skipping undecodable log entry");
                    None
                }
            })
            .collect())
    }

    pub async fn log_len(&self, ns: Namespace) -> Result<u64, StoreError> {
        self.backend.log_len(ns).await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }
}

fn decode<T: DeserializeOwned>(ns: Namespace, key: String, raw: Versioned) -> Option<Record<T>> {
    match serde_json::from_str(&raw.value) {
        Ok(value) => Some(Record {
            key,
            version: raw.version,
            value,
        }),
        Err(e) => {
            tracing::error!(namespace = ns.as_str(), key = %key, error = %e, "Failed to decode record");
            None
        }
    }
}

/// Result of one optimistic read-modify-write attempt.
#[derive(Debug)]
pub enum Cas<T> {
    Done(T),
    Conflict,
}

/// Runs `attempt` until it stops conflicting, at most `policy.max_retries + 1`
/// times, sleeping a random jitter that grows with each retry. Returns `None`
/// when every attempt conflicted.
pub async fn retry_on_conflict<T, F, Fut>(
    policy: &CasPolicy,
    operation: &'static str,
    mut attempt: F,
) -> Result<Option<T>, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Cas<T>, StoreError>>,
{
    for retry in 0..=policy.max_retries {
        if let Cas::Done(value) = attempt().await? {
            return Ok(Some(value));
        }
        if retry < policy.max_retries {
            let ceiling = policy.jitter_ms.saturating_mul(u64::from(retry) + 1);
            let delay = rand::thread_rng().gen_range(0..=ceiling);
            tracing::debug!(operation, retry, delay_ms = delay, "Store write conflicted, retrying");
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }
    tracing::warn!(operation, retries = policy.max_retries, "Gave up after repeated store conflicts");
    Ok(None)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Malformed store reply: {0}")]
    Protocol(String),
}
