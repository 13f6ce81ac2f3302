use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{Backend, Namespace, StoreError, Versioned};

#[derive(Debug, Default)]
struct State {
    records: HashMap<&'static str, HashMap<String, Versioned>>,
    logs: HashMap<&'static str, Vec<String>>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> u64 {
        self.next_version += 1;
        self.next_version
    }
}

/// In-process backend. One lock guards every namespace, so each call is
/// atomic with respect to all others. Versions come from a single counter and
/// are never reused, even across delete and re-insert.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get(&self, ns: Namespace, key: &str) -> Result<Option<Versioned>, StoreError> {
        let state = self.lock();
        Ok(state
            .records
            .get(ns.as_str())
            .and_then(|records| records.get(key))
            .cloned())
    }

    async fn scan(&self, ns: Namespace) -> Result<Vec<(String, Versioned)>, StoreError> {
        let state = self.lock();
        Ok(state
            .records
            .get(ns.as_str())
            .map(|records| {
                records
                    .iter()
                    .map(|(key, record)| (key.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn compare_and_swap(
        &self,
        ns: Namespace,
        key: &str,
        expected: Option<u64>,
        value: &str,
    ) -> Result<Option<u64>, StoreError> {
        let mut state = self.lock();
        let current = state
            .records
            .get(ns.as_str())
            .and_then(|records| records.get(key))
            .map(|record| record.version);
        if current != expected {
            return Ok(None);
        }
        let version = state.bump();
        state.records.entry(ns.as_str()).or_default().insert(
            key.to_string(),
            Versioned {
                version,
                value: value.to_string(),
            },
        );
        Ok(Some(version))
    }

    async fn compare_and_delete(
        &self,
        ns: Namespace,
        key: &str,
        expected: u64,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let Some(records) = state.records.get_mut(ns.as_str()) else {
            return Ok(false);
        };
        match records.get(key) {
            Some(record) if record.version == expected => {
                records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_and_append(
        &self,
        claim_ns: Namespace,
        claim_key: &str,
        claim_value: &str,
        log_ns: Namespace,
        entry: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.lock();
        let claimed = state
            .records
            .get(claim_ns.as_str())
            .is_some_and(|records| records.contains_key(claim_key));
        if claimed {
            return Ok(false);
        }
        let version = state.bump();
        state.records.entry(claim_ns.as_str()).or_default().insert(
            claim_key.to_string(),
            Versioned {
                version,
                value: claim_value.to_string(),
            },
        );
        state
            .logs
            .entry(log_ns.as_str())
            .or_default()
            .push(entry.to_string());
        Ok(true)
    }

    async fn read_log(
        &self,
        ns: Namespace,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let state = self.lock();
        Ok(state
            .logs
            .get(ns.as_str())
            .map(|log| log.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn log_len(&self, ns: Namespace) -> Result<u64, StoreError> {
        let state = self.lock();
        Ok(state.logs.get(ns.as_str()).map_or(0, |log| log.len() as u64))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
