//! Cookie Pool Manager.
//!
//! Owns every credential record. Workers never write credentials directly:
//! they lease one (together with the proxy it was minted on), use it, and
//! hand it back with an outcome that drives scoring and the status machine.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use uuid::Uuid;

use crate::config::{CasPolicy, PoolPolicy};
use crate::models::credential::{Credential, CredentialStatus, RawCredential, ReleaseOutcome};
use crate::models::job::{Job, JobKind, JobPayload};
use crate::models::proxy::ProxyEndpoint;
use crate::services::clock::Clock;
use crate::services::proxy_registry::ProxyRegistry;
use crate::services::queue::JobQueue;
use crate::services::store::{retry_on_conflict, Cas, Namespace, Record, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no eligible credential in the pool")]
    PoolExhausted,

    #[error("no usable proxy for any eligible credential")]
    ProxyExhausted,

    #[error("gave up after repeated conflicting updates")]
    Contended,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A credential on loan together with the proxy bound to it for the loan.
/// `token` identifies the loan on both records.
#[derive(Debug, Clone)]
pub struct Lease {
    pub credential: Credential,
    pub proxy: ProxyEndpoint,
    pub token: Uuid,
}

/// Credential count per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounts {
    pub pending: usize,
    pub valid: usize,
    pub degraded: usize,
    pub expired: usize,
    pub banned: usize,
}

impl PoolCounts {
    /// Credentials that still count towards the pool size.
    pub fn live(&self) -> usize {
        self.valid + self.degraded
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub degraded: usize,
    pub expired: usize,
}

pub struct CookiePool {
    store: Store,
    registry: Arc<ProxyRegistry>,
    queue: Arc<JobQueue>,
    clock: Arc<dyn Clock>,
    policy: PoolPolicy,
    cas: CasPolicy,
}

impl CookiePool {
    pub fn new(
        store: Store,
        registry: Arc<ProxyRegistry>,
        queue: Arc<JobQueue>,
        clock: Arc<dyn Clock>,
        policy: PoolPolicy,
        cas: CasPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            clock,
            policy,
            cas,
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Credential>, StoreError> {
        Ok(self
            .store
            .get::<Credential>(Namespace::Credentials, &id.to_string())
            .await?
            .map(|record| record.value))
    }

    /// Leases the best valid credential whose proxy is usable.
    ///
    /// Candidates are ordered by score (highest first), then use count
    /// (lowest first), then last validation (oldest first). When nothing is
    /// eligible the pool is topped up before the error is returned.
    pub async fn lease(&self, min_score: Option<i64>) -> Result<Lease, PoolError> {
        let min_score = min_score.unwrap_or(self.policy.min_lease_score);
        let leased = retry_on_conflict(&self.cas, "pool.lease", move || self.lease_once(min_score)).await?;

        match leased {
            Some(Ok(lease)) => {
                tracing::debug!(
                    credential_id = %lease.credential.id,
                    proxy_id = %lease.proxy.id,
                    score = lease.credential.score,
                    "Credential leased"
                );
                Ok(lease)
            }
            Some(Err(e)) => {
                if let Err(store_err) = self.replenish().await {
                    tracing::error!(error = %store_err, "Failed to replenish exhausted pool");
                }
                Err(e)
            }
            None => Err(PoolError::Contended),
        }
    }

    async fn lease_once(&self, min_score: i64) -> Result<Cas<Result<Lease, PoolError>>, StoreError> {
        let now = self.clock.now();
        let mut candidates: Vec<Record<Credential>> = self
            .store
            .scan::<Credential>(Namespace::Credentials)
            .await?
            .into_iter()
            .filter(|record| {
                let credential = &record.value;
                credential.status == CredentialStatus::Valid
                    && credential.score >= min_score
                    && !credential.is_leased(now)
            })
            .collect();
        if candidates.is_empty() {
            return Ok(Cas::Done(Err(PoolError::PoolExhausted)));
        }
        candidates.sort_by(|a, b| {
            b.value
                .score
                .cmp(&a.value.score)
                .then(a.value.use_count.cmp(&b.value.use_count))
                .then(a.value.last_validated_at.cmp(&b.value.last_validated_at))
        });

        let proxies = self.registry.snapshot().await?;
        let mut conflicted = false;

        for record in candidates {
            let Some(proxy_record) = proxies.get(&record.value.proxy_id) else {
                continue;
            };
            let usable = proxy_record.value.is_selectable(now)
                && proxy_record.value.is_free_for(Some(record.value.id), now);
            if !usable {
                continue;
            }

            let Some((proxy, token)) = self
                .registry
                .try_bind(proxy_record, Some(record.value.id), self.policy.lease_ttl)
                .await?
            else {
                conflicted = true;
                continue;
            };

            let mut credential = record.value;
            credential.use_count += 1;
            credential.last_used_at = Some(now);
            credential.leased_until = Some(now + self.policy.lease_ttl);
            credential.lease_token = Some(token);

            if self
                .store
                .replace(Namespace::Credentials, &record.key, record.version, &credential)
                .await?
            {
                return Ok(Cas::Done(Ok(Lease {
                    credential,
                    proxy,
                    token,
                })));
            }

            self.registry.release(proxy.id, token).await?;
            conflicted = true;
        }

        if conflicted {
            Ok(Cas::Conflict)
        } else {
            Ok(Cas::Done(Err(PoolError::ProxyExhausted)))
        }
    }

    /// Hands a leased credential back. Returns false when the lease had
    /// already expired and been taken over, in which case nothing changes.
    pub async fn release(&self, lease: &Lease, outcome: ReleaseOutcome) -> Result<bool, PoolError> {
        let released = retry_on_conflict(&self.cas, "pool.release", move || {
            self.release_once(lease, outcome)
        })
        .await?;
        let Some(released) = released else {
            return Err(PoolError::Contended);
        };

        let Some((credential, before)) = released else {
            tracing::warn!(credential_id = %lease.credential.id, "Release ignored, lease no longer held");
            return Ok(false);
        };

        self.registry.release(lease.proxy.id, lease.token).await?;
        metrics::counter!("crawl_credential_releases_total", "outcome" => outcome.to_string()).increment(1);

        match credential.status {
            CredentialStatus::Degraded if before != CredentialStatus::Degraded => {
                self.queue
                    .enqueue(Job::revalidate(credential.id, self.clock.now()), Duration::zero())
                    .await?;
            }
            CredentialStatus::Banned => {
                self.replenish().await?;
            }
            _ => {}
        }
        Ok(true)
    }

    async fn release_once(
        &self,
        lease: &Lease,
        outcome: ReleaseOutcome,
    ) -> Result<Cas<Option<(Credential, CredentialStatus)>>, StoreError> {
        let key = lease.credential.id.to_string();
        let Some(record) = self.store.get::<Credential>(Namespace::Credentials, &key).await? else {
            return Ok(Cas::Done(None));
        };
        let mut credential = record.value;
        if credential.lease_token != Some(lease.token) {
            return Ok(Cas::Done(None));
        }

        let now = self.clock.now();
        let before = credential.status;
        credential.leased_until = None;
        credential.lease_token = None;

        match outcome {
            ReleaseOutcome::Success => {
                credential.score = (credential.score + self.policy.success_step).min(self.policy.max_score);
            }
            ReleaseOutcome::SoftFailure => {
                credential.score -= self.policy.soft_failure_penalty;
                if credential.status == CredentialStatus::Valid && credential.score <= self.policy.low_water_score {
                    self.apply(&mut credential, CredentialStatus::Degraded);
                    credential.degraded_at = Some(now);
                }
            }
            ReleaseOutcome::HardFailure => {
                self.apply(&mut credential, CredentialStatus::Banned);
            }
        }

        if !self
            .store
            .replace(Namespace::Credentials, &key, record.version, &credential)
            .await?
        {
            return Ok(Cas::Conflict);
        }
        if before != credential.status {
            log_transition(&credential, before, &outcome.to_string());
        }
        Ok(Cas::Done(Some((credential, before))))
    }

    /// Applies a transition, leaving the record untouched if the edge is illegal.
    fn apply(&self, credential: &mut Credential, next: CredentialStatus) {
        if let Err(e) = credential.transition(next) {
            tracing::warn!(credential_id = %credential.id, error = %e, "Skipping illegal transition");
        }
    }

    /// Admits an externally validated cookie minted on `proxy_id`.
    ///
    /// Admission is keyed on the cookie payload hash, so admitting the same
    /// physical cookie twice returns the existing credential untouched.
    pub async fn admit(&self, raw: RawCredential, proxy_id: Uuid) -> Result<Credential, PoolError> {
        let raw = &raw;
        let admitted = retry_on_conflict(&self.cas, "pool.admit", move || self.admit_once(raw, proxy_id)).await?;
        admitted.ok_or(PoolError::Contended)
    }

    async fn admit_once(&self, raw: &RawCredential, proxy_id: Uuid) -> Result<Cas<Credential>, StoreError> {
        let now = self.clock.now();
        let hash = raw.payload_hash();

        let indexed = self
            .store
            .get::<Uuid>(Namespace::CredentialIndex, &hash)
            .await?
            .map(|record| record.value);

        let id = match indexed {
            Some(id) => {
                if let Some(existing) = self.get(id).await? {
                    tracing::debug!(credential_id = %id, "Cookie already admitted");
                    return Ok(Cas::Done(existing));
                }
                // Index written by an admitter that has not stored the credential yet.
                id
            }
            None => {
                let id = Uuid::new_v4();
                if !self.store.insert(Namespace::CredentialIndex, &hash, &id).await? {
                    return Ok(Cas::Conflict);
                }
                id
            }
        };

        let mut credential = Credential::pending(raw.clone(), proxy_id, now);
        credential.id = id;
        self.apply(&mut credential, CredentialStatus::Valid);
        credential.score = self.policy.baseline_score;
        credential.last_validated_at = now;

        if !self
            .store
            .insert(Namespace::Credentials, &id.to_string(), &credential)
            .await?
        {
            return Ok(Cas::Conflict);
        }

        metrics::counter!("crawl_credentials_admitted_total").increment(1);
        tracing::info!(credential_id = %id, proxy_id = %proxy_id, "Credential admitted");
        Ok(Cas::Done(credential))
    }

    /// Records the result of re-probing a degraded credential.
    pub async fn revalidate(&self, id: Uuid, ok: bool) -> Result<Option<Credential>, PoolError> {
        let revalidated = retry_on_conflict(&self.cas, "pool.revalidate", move || self.revalidate_once(id, ok)).await?;
        revalidated.ok_or(PoolError::Contended)
    }

    async fn revalidate_once(&self, id: Uuid, ok: bool) -> Result<Cas<Option<Credential>>, StoreError> {
        let key = id.to_string();
        let Some(record) = self.store.get::<Credential>(Namespace::Credentials, &key).await? else {
            return Ok(Cas::Done(None));
        };
        let mut credential = record.value;
        if credential.status != CredentialStatus::Degraded {
            return Ok(Cas::Done(Some(credential)));
        }

        let now = self.clock.now();
        if ok {
            self.apply(&mut credential, CredentialStatus::Valid);
            credential.score = self.policy.baseline_score;
            credential.last_validated_at = now;
            credential.degraded_at = None;
        } else {
            self.apply(&mut credential, CredentialStatus::Expired);
        }

        if !self
            .store
            .replace(Namespace::Credentials, &key, record.version, &credential)
            .await?
        {
            return Ok(Cas::Conflict);
        }
        log_transition(&credential, CredentialStatus::Degraded, "revalidation");
        Ok(Cas::Done(Some(credential)))
    }

    /// Ages the pool: valid credentials past the cookie TTL are degraded and
    /// queued for revalidation, degraded ones past the degraded TTL expire.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for record in self.store.scan::<Credential>(Namespace::Credentials).await? {
            let mut credential = record.value;
            let before = credential.status;
            match before {
                CredentialStatus::Valid if now - credential.last_validated_at >= self.policy.cookie_ttl => {
                    self.apply(&mut credential, CredentialStatus::Degraded);
                    credential.degraded_at = Some(now);
                }
                CredentialStatus::Degraded
                    if credential
                        .degraded_at
                        .map_or(true, |since| now - since >= self.policy.degraded_ttl) =>
                {
                    self.apply(&mut credential, CredentialStatus::Expired);
                }
                _ => continue,
            }

            // A conflicting writer saw the record more recently; next sweep retries.
            if !self
                .store
                .replace(Namespace::Credentials, &record.key, record.version, &credential)
                .await?
            {
                continue;
            }
            log_transition(&credential, before, "age");
            if credential.status == CredentialStatus::Degraded {
                report.degraded += 1;
                self.queue.enqueue(Job::revalidate(credential.id, now), Duration::zero()).await?;
            } else {
                report.expired += 1;
            }
        }
        Ok(report)
    }

    pub async fn counts(&self) -> Result<PoolCounts, StoreError> {
        let mut counts = PoolCounts::default();
        for record in self.store.scan::<Credential>(Namespace::Credentials).await? {
            match record.value.status {
                CredentialStatus::Pending => counts.pending += 1,
                CredentialStatus::Valid => counts.valid += 1,
                CredentialStatus::Degraded => counts.degraded += 1,
                CredentialStatus::Expired => counts.expired += 1,
                CredentialStatus::Banned => counts.banned += 1,
            }
        }
        Ok(counts)
    }

    /// Enqueues produce-cookie jobs until live credentials plus outstanding
    /// produce jobs reach `min_pool_size`. Returns how many were enqueued.
    ///
    /// Top-up jobs get ids derived from the minute and the pool slot they fill,
    /// so concurrent callers that read the same counts enqueue each slot once.
    pub async fn replenish_threshold(&self, min_pool_size: usize) -> Result<usize, StoreError> {
        let live = self.counts().await?.live();
        if live >= min_pool_size {
            return Ok(0);
        }
        let outstanding = self
            .queue
            .count_where(JobKind::ProduceCookie, |job| {
                job.payload == JobPayload::ProduceCookie { revalidate: None }
            })
            .await?;

        let now = self.clock.now();
        let bucket = now.timestamp().div_euclid(60);
        let mut enqueued = 0;
        for slot in (live + outstanding)..min_pool_size {
            let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("replenish:{bucket}:{slot}").as_bytes());
            if self
                .queue
                .enqueue_once(Job::produce_cookie(now).with_id(id), Duration::zero())
                .await?
            {
                enqueued += 1;
            }
        }
        if enqueued > 0 {
            tracing::info!(live, outstanding, enqueued, min_pool_size, "Replenishing cookie pool");
        }
        Ok(enqueued)
    }

    /// [`replenish_threshold`](Self::replenish_threshold) at the configured minimum.
    pub async fn replenish(&self) -> Result<usize, StoreError> {
        self.replenish_threshold(self.policy.min_pool_size).await
    }
}

fn log_transition(credential: &Credential, from: CredentialStatus, cause: &str) {
    metrics::counter!("crawl_credential_transitions_total", "to" => credential.status.to_string()).increment(1);
    tracing::info!(
        credential_id = %credential.id,
        from = %from,
        to = %credential.status,
        score = credential.score,
        cause,
        "Credential status changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyPolicy, QueuePolicy};
    use crate::models::proxy::ProxyStatus;
    use crate::services::clock::ManualClock;
    use crate::services::store::MemoryBackend;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::{BTreeMap, HashSet};

    struct Fixture {
        pool: CookiePool,
        registry: Arc<ProxyRegistry>,
        queue: Arc<JobQueue>,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Store::new(Arc::new(MemoryBackend::new()));
        let cas = CasPolicy { max_retries: 3, jitter_ms: 0 };
        let registry = Arc::new(ProxyRegistry::new(store.clone(), clock.clone(), ProxyPolicy::default(), cas.clone()));
        let queue = Arc::new(JobQueue::new(store.clone(), clock.clone(), QueuePolicy::default(), cas.clone()));
        let pool = CookiePool::new(
            store,
            registry.clone(),
            queue.clone(),
            clock.clone(),
            PoolPolicy::default(),
            cas,
        );
        Fixture {
            pool,
            registry,
            queue,
            clock,
        }
    }

    fn raw(value: &str) -> RawCredential {
        RawCredential {
            cookies: BTreeMap::from([("SUB".to_string(), value.to_string())]),
            user_agent: "Mozilla/5.0".to_string(),
        }
    }

    async fn admitted(f: &Fixture, address: &str, value: &str) -> Credential {
        f.registry.register(address).await.unwrap();
        f.pool.admit(raw(value), ProxyEndpoint::id_for(address)).await.unwrap()
    }

    #[tokio::test]
    async fn test_admit_is_idempotent_by_payload() {
        let f = fixture();
        let first = admitted(&f, "http://a:1", "cookie").await;
        let second = f.pool.admit(raw("cookie"), ProxyEndpoint::id_for("http://b:1")).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.proxy_id, ProxyEndpoint::id_for("http://a:1"));
        assert_eq!(f.pool.counts().await.unwrap().valid, 1);
        assert_eq!(first.score, f.pool.policy().baseline_score);
    }

    #[tokio::test]
    async fn test_lease_ordering_prefers_score_then_use_count() {
        let f = fixture();
        let a = admitted(&f, "http://a:1", "a").await;
        let b = admitted(&f, "http://b:1", "b").await;

        let first = f.pool.lease(None).await.unwrap();
        f.pool.release(&first, ReleaseOutcome::SoftFailure).await.unwrap();
        let second = f.pool.lease(None).await.unwrap();
        assert_ne!(second.credential.id, first.credential.id);
        assert!([a.id, b.id].contains(&second.credential.id));
        assert_eq!(second.credential.use_count, 1);
        assert_eq!(second.proxy.binding.as_ref().unwrap().credential_id, Some(second.credential.id));
    }

    #[tokio::test]
    async fn test_leased_credential_is_exclusive_until_ttl() {
        let f = fixture();
        admitted(&f, "http://a:1", "a").await;
        let lease = f.pool.lease(None).await.unwrap();
        assert!(matches!(f.pool.lease(None).await, Err(PoolError::PoolExhausted)));

        f.clock.advance(f.pool.policy().lease_ttl);
        let taken_over = f.pool.lease(None).await.unwrap();
        assert_ne!(taken_over.token, lease.token);
        assert!(!f.pool.release(&lease, ReleaseOutcome::HardFailure).await.unwrap());
        assert_eq!(
            f.pool.get(lease.credential.id).await.unwrap().unwrap().status,
            CredentialStatus::Valid
        );
    }

    #[tokio::test]
    async fn test_empty_pool_is_exhausted_and_replenished() {
        let f = fixture();
        assert!(matches!(f.pool.lease(None).await, Err(PoolError::PoolExhausted)));
        assert_eq!(f.queue.depth(JobKind::ProduceCookie).await.unwrap(), 3);

        // Outstanding jobs count towards the target.
        assert!(f.pool.lease(None).await.is_err());
        assert_eq!(f.queue.depth(JobKind::ProduceCookie).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unhealthy_proxy_blocks_lease() {
        let f = fixture();
        let credential = admitted(&f, "http://a:1", "a").await;
        for _ in 0..3 {
            f.registry.report_outcome(credential.proxy_id, false).await.unwrap();
        }
        assert!(matches!(f.pool.lease(None).await, Err(PoolError::ProxyExhausted)));

        f.clock.advance(ProxyPolicy::default().cooldown);
        let probe = f.pool.lease(None).await.unwrap();
        assert_eq!(probe.proxy.status, ProxyStatus::CoolingDown);
    }

    #[tokio::test]
    async fn test_three_soft_failures_degrade_and_queue_revalidation() {
        let f = fixture();
        let credential = admitted(&f, "http://a:1", "a").await;

        for round in 1..=3 {
            let lease = f.pool.lease(None).await.unwrap();
            assert_eq!(lease.credential.id, credential.id, "round {round}");
            assert!(f.pool.release(&lease, ReleaseOutcome::SoftFailure).await.unwrap());
        }

        let degraded = f.pool.get(credential.id).await.unwrap().unwrap();
        assert_eq!(degraded.status, CredentialStatus::Degraded);
        assert!(matches!(f.pool.lease(None).await, Err(PoolError::PoolExhausted)));
        let revalidations = f
            .queue
            .count_where(JobKind::ProduceCookie, |job| {
                job.payload == JobPayload::ProduceCookie { revalidate: Some(credential.id) }
            })
            .await
            .unwrap();
        assert_eq!(revalidations, 1);

        let restored = f.pool.revalidate(credential.id, true).await.unwrap().unwrap();
        assert_eq!(restored.status, CredentialStatus::Valid);
        assert_eq!(restored.score, f.pool.policy().baseline_score);
    }

    #[tokio::test]
    async fn test_hard_failure_bans_and_frees_proxy() {
        let f = fixture();
        let credential = admitted(&f, "http://a:1", "a").await;
        let lease = f.pool.lease(None).await.unwrap();
        assert!(f.pool.release(&lease, ReleaseOutcome::HardFailure).await.unwrap());

        let banned = f.pool.get(credential.id).await.unwrap().unwrap();
        assert_eq!(banned.status, CredentialStatus::Banned);
        assert!(f.registry.get(credential.proxy_id).await.unwrap().unwrap().binding.is_none());
        assert!(matches!(f.pool.lease(None).await, Err(PoolError::PoolExhausted)));
    }

    #[tokio::test]
    async fn test_success_score_is_bounded() {
        let f = fixture();
        admitted(&f, "http://a:1", "a").await;
        for _ in 0..5 {
            let lease = f.pool.lease(None).await.unwrap();
            f.pool.release(&lease, ReleaseOutcome::Success).await.unwrap();
        }
        let lease = f.pool.lease(None).await.unwrap();
        assert_eq!(lease.credential.score, f.pool.policy().max_score);
    }

    #[tokio::test]
    async fn test_sweep_ages_out_credentials() {
        let f = fixture();
        let credential = admitted(&f, "http://a:1", "a").await;
        let policy = f.pool.policy().clone();

        f.clock.advance(policy.cookie_ttl);
        assert_eq!(f.pool.sweep().await.unwrap(), SweepReport { degraded: 1, expired: 0 });

        f.clock.advance(policy.degraded_ttl);
        assert_eq!(f.pool.sweep().await.unwrap(), SweepReport { degraded: 0, expired: 1 });

        let expired = f.pool.get(credential.id).await.unwrap().unwrap();
        assert_eq!(expired.status, CredentialStatus::Expired);
        assert!(f.pool.revalidate(credential.id, true).await.unwrap().unwrap().status.is_terminal());
    }

    #[tokio::test]
    async fn test_concurrent_top_ups_do_not_overshoot() {
        let f = fixture();
        let enqueued = futures::future::join_all((0..4).map(|_| f.pool.replenish_threshold(3))).await;

        let total: usize = enqueued.into_iter().map(Result::unwrap).sum();
        assert_eq!(total, 3);
        assert_eq!(f.queue.depth(JobKind::ProduceCookie).await.unwrap(), 3);

        // Same slots later in the minute are already taken.
        f.clock.advance(Duration::seconds(1));
        assert_eq!(f.pool.replenish_threshold(3).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_random_pool_traffic_keeps_credential_invariants() {
        let f = fixture();
        let policy = f.pool.policy().clone();
        let proxies: Vec<String> = (0..4).map(|i| format!("http://p{i}:1")).collect();
        for address in &proxies {
            f.registry.register(address).await.unwrap();
        }

        let mut rng = StdRng::seed_from_u64(0xc00c1e);
        let mut ids = Vec::new();
        let mut leases: Vec<Lease> = Vec::new();
        let mut terminal = HashSet::new();
        let mut minted = 0;

        for step in 0..400 {
            match rng.gen_range(0..5) {
                0 => {
                    let now = f.clock.now();
                    match f.pool.lease(None).await {
                        Ok(lease) => {
                            assert_eq!(lease.credential.status, CredentialStatus::Valid, "step {step}");
                            assert!(lease.credential.score >= policy.min_lease_score);
                            assert!(!terminal.contains(&lease.credential.id));
                            assert!(
                                !leases
                                    .iter()
                                    .any(|held| held.credential.id == lease.credential.id && held.credential.is_leased(now)),
                                "step {step}: credential leased twice"
                            );
                            leases.push(lease);
                        }
                        Err(PoolError::Store(e)) => panic!("step {step}: {e}"),
                        Err(_) => {}
                    }
                }
                1 if !leases.is_empty() => {
                    let lease = leases.swap_remove(rng.gen_range(0..leases.len()));
                    let outcome = [ReleaseOutcome::Success, ReleaseOutcome::SoftFailure, ReleaseOutcome::HardFailure]
                        [rng.gen_range(0..3)];
                    f.pool.release(&lease, outcome).await.unwrap();
                }
                2 if !ids.is_empty() => {
                    let id = ids[rng.gen_range(0..ids.len())];
                    f.pool.revalidate(id, rng.gen_bool(0.5)).await.unwrap();
                }
                3 => {
                    let secs = rng.gen_range(0..=policy.cookie_ttl.num_seconds());
                    f.clock.advance(Duration::seconds(secs));
                    f.pool.sweep().await.unwrap();
                }
                _ => {
                    minted += 1;
                    let address = &proxies[rng.gen_range(0..proxies.len())];
                    let credential = f
                        .pool
                        .admit(raw(&format!("cookie-{minted}")), ProxyEndpoint::id_for(address))
                        .await
                        .unwrap();
                    ids.push(credential.id);
                }
            }

            for id in &ids {
                let status = f.pool.get(*id).await.unwrap().unwrap().status;
                if terminal.contains(id) {
                    assert!(status.is_terminal(), "step {step}: {id} revived as {status}");
                } else if status.is_terminal() {
                    terminal.insert(*id);
                }
            }
        }
        assert!(!terminal.is_empty());
    }
}
