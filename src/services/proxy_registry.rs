use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use uuid::Uuid;

use crate::config::{CasPolicy, ProxyPolicy};
use crate::models::proxy::{ProxyEndpoint, ProxyStatus};
use crate::services::clock::Clock;
use crate::services::store::{retry_on_conflict, Cas, Namespace, Record, Store, StoreError};

/// Tracks egress proxies, their health and their advisory bindings.
///
/// Health follows a circuit-breaker: `failure_threshold` consecutive failures
/// open the circuit (`unhealthy`) for `cooldown`; afterwards one holder may
/// probe the proxy (`cooling-down`), and the probe's outcome closes or
/// re-opens the circuit.
pub struct ProxyRegistry {
    store: Store,
    clock: Arc<dyn Clock>,
    policy: ProxyPolicy,
    cas: CasPolicy,
}

impl ProxyRegistry {
    pub fn new(store: Store, clock: Arc<dyn Clock>, policy: ProxyPolicy, cas: CasPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            cas,
        }
    }

    /// Registers `address` if unknown. Safe to call from every process.
    pub async fn register(&self, address: &str) -> Result<bool, StoreError> {
        let proxy = ProxyEndpoint::new(address);
        let inserted = self
            .store
            .insert(Namespace::Proxies, &proxy.id.to_string(), &proxy)
            .await?;
        if inserted {
            tracing::info!(proxy_id = %proxy.id, address, "Proxy registered");
        }
        Ok(inserted)
    }

    /// Registers every address, returning how many were new.
    pub async fn seed(&self, addresses: &[String]) -> Result<usize, StoreError> {
        let mut added = 0;
        for address in addresses.iter().map(|a| a.trim()).filter(|a| !a.is_empty()) {
            if self.register(address).await? {
                added += 1;
            }
        }
        Ok(added)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ProxyEndpoint>, StoreError> {
        Ok(self
            .store
            .get::<ProxyEndpoint>(Namespace::Proxies, &id.to_string())
            .await?
            .map(|record| record.value))
    }

    pub async fn list(&self) -> Result<Vec<ProxyEndpoint>, StoreError> {
        Ok(self
            .store
            .scan::<ProxyEndpoint>(Namespace::Proxies)
            .await?
            .into_iter()
            .map(|record| record.value)
            .collect())
    }

    /// Versioned view of every proxy, keyed by id.
    pub(crate) async fn snapshot(&self) -> Result<HashMap<Uuid, Record<ProxyEndpoint>>, StoreError> {
        Ok(self
            .store
            .scan::<ProxyEndpoint>(Namespace::Proxies)
            .await?
            .into_iter()
            .map(|record| (record.value.id, record))
            .collect())
    }

    /// Binds the proxy read as `record` to `credential_id` for `ttl`, failing
    /// with `None` if it changed since it was read. Returns the bound proxy and
    /// the binding token needed to release it.
    pub(crate) async fn try_bind(
        &self,
        record: &Record<ProxyEndpoint>,
        credential_id: Option<Uuid>,
        ttl: Duration,
    ) -> Result<Option<(ProxyEndpoint, Uuid)>, StoreError> {
        let now = self.clock.now();
        let mut proxy = record.value.clone();
        let was_unhealthy = proxy.status == ProxyStatus::Unhealthy;
        let token = proxy.bind(credential_id, now, now + ttl);

        if !self
            .store
            .replace(Namespace::Proxies, &record.key, record.version, &proxy)
            .await?
        {
            return Ok(None);
        }
        if was_unhealthy {
            tracing::info!(proxy_id = %proxy.id, "Cooldown elapsed, probing proxy");
        }
        Ok(Some((proxy, token)))
    }

    /// Picks an unbound selectable proxy, preferring the one idle longest, and
    /// binds it for minting a new cookie.
    pub async fn acquire(&self) -> Result<Option<ProxyEndpoint>, StoreError> {
        let acquired = retry_on_conflict(&self.cas, "proxy.acquire", move || self.acquire_once()).await?;
        Ok(acquired.flatten())
    }

    async fn acquire_once(&self) -> Result<Cas<Option<ProxyEndpoint>>, StoreError> {
        let now = self.clock.now();
        let mut candidates: Vec<Record<ProxyEndpoint>> = self
            .snapshot()
            .await?
            .into_values()
            .filter(|record| record.value.is_selectable(now) && record.value.is_free_for(None, now))
            .collect();
        if candidates.is_empty() {
            return Ok(Cas::Done(None));
        }
        // Never-used proxies sort first.
        candidates.sort_by_key(|record| record.value.last_used_at);

        for record in &candidates {
            if let Some((proxy, _)) = self.try_bind(record, None, self.policy.binding_ttl).await? {
                tracing::debug!(proxy_id = %proxy.id, address = %proxy.address, "Proxy acquired");
                return Ok(Cas::Done(Some(proxy)));
            }
        }
        Ok(Cas::Conflict)
    }

    /// Records the outcome of a request made through the proxy.
    pub async fn report_outcome(&self, proxy_id: Uuid, ok: bool) -> Result<Option<ProxyEndpoint>, StoreError> {
        let updated = retry_on_conflict(&self.cas, "proxy.report_outcome", move || {
            self.report_once(proxy_id, ok)
        })
        .await?;
        Ok(updated.flatten())
    }

    async fn report_once(&self, proxy_id: Uuid, ok: bool) -> Result<Cas<Option<ProxyEndpoint>>, StoreError> {
        let key = proxy_id.to_string();
        let Some(record) = self.store.get::<ProxyEndpoint>(Namespace::Proxies, &key).await? else {
            tracing::warn!(proxy_id = %proxy_id, "Outcome reported for unknown proxy");
            return Ok(Cas::Done(None));
        };
        let now = self.clock.now();
        let mut proxy = record.value;
        let previous = proxy.status;

        if ok {
            proxy.status = ProxyStatus::Healthy;
            proxy.consecutive_failures = 0;
            proxy.last_success_at = Some(now);
            proxy.cooldown_until = None;
        } else {
            proxy.consecutive_failures += 1;
            let probe_failed = previous == ProxyStatus::CoolingDown;
            if probe_failed || proxy.consecutive_failures >= self.policy.failure_threshold {
                proxy.status = ProxyStatus::Unhealthy;
                proxy.cooldown_until = Some(now + self.policy.cooldown);
            }
        }

        if !self.store.replace(Namespace::Proxies, &key, record.version, &proxy).await? {
            return Ok(Cas::Conflict);
        }

        if !ok {
            metrics::counter!("crawl_proxy_failures_total").increment(1);
        }
        if previous != proxy.status {
            tracing::info!(
                proxy_id = %proxy.id,
                from = %previous,
                to = %proxy.status,
                consecutive_failures = proxy.consecutive_failures,
                "Proxy health changed"
            );
        }
        Ok(Cas::Done(Some(proxy)))
    }

    /// Clears the binding identified by `token`. Health is untouched, and a
    /// binding that has since been replaced by another holder is left alone.
    pub async fn release(&self, proxy_id: Uuid, token: Uuid) -> Result<bool, StoreError> {
        let released = retry_on_conflict(&self.cas, "proxy.release", move || {
            self.release_once(proxy_id, token)
        })
        .await?;
        Ok(released.unwrap_or(false))
    }

    async fn release_once(&self, proxy_id: Uuid, token: Uuid) -> Result<Cas<bool>, StoreError> {
        let key = proxy_id.to_string();
        let Some(record) = self.store.get::<ProxyEndpoint>(Namespace::Proxies, &key).await? else {
            return Ok(Cas::Done(false));
        };
        let mut proxy = record.value;
        if proxy.binding.as_ref().map(|binding| binding.token) != Some(token) {
            return Ok(Cas::Done(false));
        }
        proxy.binding = None;
        if self.store.replace(Namespace::Proxies, &key, record.version, &proxy).await? {
            Ok(Cas::Done(true))
        } else {
            Ok(Cas::Conflict)
        }
    }
}
