use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::result::ResultRecord;
use crate::services::clock::Clock;
use crate::services::store::{Namespace, Store, StoreError};

/// Value stored against each accepted fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LedgerEntry {
    pub accepted_at: DateTime<Utc>,
}

/// Set of fingerprints already accepted. Entries are never removed here.
#[derive(Clone)]
pub struct DedupLedger {
    store: Store,
    clock: Arc<dyn Clock>,
}

impl DedupLedger {
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Inserts `fingerprint` if absent. Only the inserting caller sees `true`.
    pub async fn try_accept(&self, fingerprint: &str) -> Result<bool, StoreError> {
        let entry = LedgerEntry {
            accepted_at: self.clock.now(),
        };
        self.store.insert(Namespace::Dedup, fingerprint, &entry).await
    }

    pub async fn contains(&self, fingerprint: &str) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get::<LedgerEntry>(Namespace::Dedup, fingerprint)
            .await?
            .is_some())
    }

    /// Fingerprints accepted longer than `retention` ago, for an external
    /// compactor to prune.
    pub async fn stale(&self, retention: Duration) -> Result<Vec<String>, StoreError> {
        let cutoff = self.clock.now() - retention;
        Ok(self
            .store
            .scan::<LedgerEntry>(Namespace::Dedup)
            .await?
            .into_iter()
            .filter(|record| record.value.accepted_at < cutoff)
            .map(|record| record.key)
            .collect())
    }
}

/// Append-only result log gated by the dedup ledger.
#[derive(Clone)]
pub struct ResultSink {
    store: Store,
}

impl ResultSink {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Claims the record's fingerprint and appends the record in one atomic
    /// step. Returns false, appending nothing, if the fingerprint was
    /// already accepted.
    pub async fn append(&self, record: &ResultRecord) -> Result<bool, StoreError> {
        let entry = serde_json::to_string(&LedgerEntry {
            accepted_at: record.ingested_at,
        })?;
        let accepted = self
            .store
            .claim_and_append(Namespace::Dedup, &record.fingerprint, &entry, Namespace::Results, record)
            .await?;

        if accepted {
            metrics::counter!("crawl_results_accepted_total").increment(1);
        } else {
            metrics::counter!("crawl_results_duplicate_total").increment(1);
            tracing::debug!(fingerprint = %record.fingerprint, "Duplicate result skipped");
        }
        Ok(accepted)
    }

    pub async fn len(&self) -> Result<u64, StoreError> {
        self.store.log_len(Namespace::Results).await
    }

    pub async fn read(&self, offset: usize, limit: usize) -> Result<Vec<ResultRecord>, StoreError> {
        self.store.read_log(Namespace::Results, offset, limit).await
    }
}
