use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Deterministic identity of a source item.
pub fn fingerprint(source_id: &str) -> String {
    hex::encode(Sha256::digest(source_id.as_bytes()))
}

/// An accepted search result. Appended once per fingerprint, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultRecord {
    pub fingerprint: String,
    pub source_id: String,
    pub keyword: String,
    pub page: u32,
    pub payload: serde_json::Value,
    pub ingested_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn new(
        source_id: &str,
        keyword: &str,
        page: u32,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            fingerprint: fingerprint(source_id),
            source_id: source_id.to_string(),
            keyword: keyword.to_string(),
            page,
            payload,
            ingested_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_depends_only_on_source_id() {
        let now = Utc::now();
        let a = ResultRecord::new("4890", "rust", 1, serde_json::json!({}), now);
        let b = ResultRecord::new("4890", "tokio", 3, serde_json::json!({"x": 1}), now);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(a.fingerprint.len(), 64);
        assert_ne!(fingerprint("4890"), fingerprint("4891"));
    }
}
