use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::{CasPolicy, QueuePolicy};
use crate::models::job::{DeadLetter, Job, JobKind};
use crate::services::clock::Clock;
use crate::services::store::{retry_on_conflict, Cas, Namespace, Record, Store, StoreError};

/// What happened to a job handed back with [`JobQueue::fail`].
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Requeued { attempts: u32, retry_at: DateTime<Utc> },
    DeadLettered { attempts: u32 },
    /// The caller's lease had already expired; the job belongs to someone else.
    LeaseLost,
}

/// Exponential backoff `base × 2^attempts`, capped.
pub fn backoff_delay(policy: &QueuePolicy, attempts: u32) -> Duration {
    let base_ms = policy.backoff_base.num_milliseconds();
    let cap_ms = policy.backoff_cap.num_milliseconds();
    let delay_ms = 2i64
        .checked_pow(attempts)
        .and_then(|factor| base_ms.checked_mul(factor))
        .map_or(cap_ms, |ms| ms.min(cap_ms));
    Duration::milliseconds(delay_ms)
}

/// Store-backed multi-channel job queue with visibility timeouts.
///
/// Leasing a job stamps it with a visibility deadline and a receipt; until the
/// deadline passes no other leaser can claim it. A worker that crashes simply
/// lets the deadline pass and the job is redelivered with one more attempt.
/// Ordering within a channel is by visibility time only and is not FIFO.
pub struct JobQueue {
    store: Store,
    clock: Arc<dyn Clock>,
    policy: QueuePolicy,
    cas: CasPolicy,
}

impl JobQueue {
    pub fn new(store: Store, clock: Arc<dyn Clock>, policy: QueuePolicy, cas: CasPolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            cas,
        }
    }

    pub fn policy(&self) -> &QueuePolicy {
        &self.policy
    }

    /// Enqueue a job, visible after `delay`. Re-enqueueing an existing id is a no-op.
    pub async fn enqueue(&self, job: Job, delay: Duration) -> Result<Uuid, StoreError> {
        let id = job.id;
        self.enqueue_once(job, delay).await?;
        Ok(id)
    }

    /// Like [`enqueue`](Self::enqueue) but reports whether the job was new.
    /// `false` means a job with the same id was already queued.
    pub async fn enqueue_once(&self, mut job: Job, delay: Duration) -> Result<bool, StoreError> {
        job.visible_at = self.clock.now() + delay;
        job.lease_deadline = None;
        job.receipt = None;

        let inserted = self
            .store
            .insert(Namespace::Jobs(job.kind), &job.id.to_string(), &job)
            .await?;
        if inserted {
            metrics::counter!("crawl_jobs_enqueued_total", "kind" => job.kind.to_string()).increment(1);
            tracing::debug!(job_id = %job.id, kind = %job.kind, visible_at = %job.visible_at, "Job enqueued");
        }
        Ok(inserted)
    }

    /// Lease the next claimable job of `kind`, waiting up to `wait` for one to
    /// appear. Returns `None` on timeout.
    pub async fn lease(&self, kind: JobKind, wait: std::time::Duration) -> Result<Option<Job>, StoreError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(job) = self.try_lease(kind).await? {
                return Ok(Some(job));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.policy.poll_interval.min(deadline - now)).await;
        }
    }

    async fn try_lease(&self, kind: JobKind) -> Result<Option<Job>, StoreError> {
        let ns = Namespace::Jobs(kind);
        let now = self.clock.now();

        let mut candidates: Vec<Record<Job>> = self
            .store
            .scan::<Job>(ns)
            .await?
            .into_iter()
            .filter(|record| record.value.is_claimable(now))
            .collect();
        candidates.sort_by_key(|record| record.value.visible_at);

        for record in candidates {
            let mut job = record.value;

            if self.is_dead_lettered(job.id).await? {
                self.store.delete(ns, &record.key, record.version).await?;
                continue;
            }

            if job.lease_deadline.is_some() {
                // Previous holder never acked before its deadline.
                job.attempts += 1;
                metrics::counter!("crawl_jobs_redelivered_total", "kind" => kind.to_string()).increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    kind = %kind,
                    attempts = job.attempts,
                    "Job lease expired without ack, redelivering"
                );
                if job.attempts >= self.policy.max_attempts {
                    let reason = "lease expired on final attempt".to_string();
                    self.dead_letter(record.version, job, reason).await?;
                    continue;
                }
            }

            job.lease_deadline = Some(now + self.policy.visibility_timeout);
            job.receipt = Some(Uuid::new_v4());
            if self.store.replace(ns, &record.key, record.version, &job).await? {
                tracing::debug!(job_id = %job.id, kind = %kind, attempts = job.attempts, "Job leased");
                return Ok(Some(job));
            }
        }
        Ok(None)
    }

    /// Mark a leased job complete. Returns false if the lease was lost.
    pub async fn ack(&self, job: &Job) -> Result<bool, StoreError> {
        let acked = retry_on_conflict(&self.cas, "queue.ack", move || self.ack_once(job)).await?;
        let acked = acked.unwrap_or(false);
        if !acked {
            tracing::warn!(job_id = %job.id, "Ack ignored, lease no longer held");
        }
        Ok(acked)
    }

    async fn ack_once(&self, job: &Job) -> Result<Cas<bool>, StoreError> {
        let ns = Namespace::Jobs(job.kind);
        let key = job.id.to_string();
        let Some(record) = self.store.get::<Job>(ns, &key).await? else {
            return Ok(Cas::Done(false));
        };
        if record.value.receipt != job.receipt || job.receipt.is_none() {
            return Ok(Cas::Done(false));
        }
        if self.store.delete(ns, &key, record.version).await? {
            Ok(Cas::Done(true))
        } else {
            Ok(Cas::Conflict)
        }
    }

    /// Hand a leased job back after a failure. The job's payload as carried by
    /// the caller replaces the stored one, so progress made before the failure
    /// survives the retry. With `requeue = false`, or once `max_attempts` is
    /// reached, the job goes to the dead-letter channel instead.
    pub async fn fail(&self, job: &Job, requeue: bool, reason: &str) -> Result<FailOutcome, StoreError> {
        let outcome = retry_on_conflict(&self.cas, "queue.fail", move || {
            self.fail_once(job, requeue, reason)
        })
        .await?;
        Ok(outcome.unwrap_or(FailOutcome::LeaseLost))
    }

    async fn fail_once(&self, job: &Job, requeue: bool, reason: &str) -> Result<Cas<FailOutcome>, StoreError> {
        let ns = Namespace::Jobs(job.kind);
        let key = job.id.to_string();
        let Some(record) = self.store.get::<Job>(ns, &key).await? else {
            return Ok(Cas::Done(FailOutcome::LeaseLost));
        };
        if record.value.receipt != job.receipt || job.receipt.is_none() {
            return Ok(Cas::Done(FailOutcome::LeaseLost));
        }

        let now = self.clock.now();
        let mut stored = record.value;
        stored.payload = job.payload.clone();
        stored.attempts += 1;
        stored.last_error = Some(reason.to_string());

        if !requeue || stored.attempts >= self.policy.max_attempts {
            let attempts = stored.attempts;
            return Ok(match self.dead_letter(record.version, stored, reason.to_string()).await? {
                Cas::Done(()) => Cas::Done(FailOutcome::DeadLettered { attempts }),
                Cas::Conflict => Cas::Conflict,
            });
        }

        let retry_at = now + backoff_delay(&self.policy, stored.attempts);
        stored.visible_at = retry_at;
        stored.lease_deadline = None;
        stored.receipt = None;
        if !self.store.replace(ns, &key, record.version, &stored).await? {
            return Ok(Cas::Conflict);
        }
        tracing::info!(
            job_id = %stored.id,
            kind = %stored.kind,
            attempts = stored.attempts,
            retry_at = %retry_at,
            reason,
            "Job requeued with backoff"
        );
        Ok(Cas::Done(FailOutcome::Requeued {
            attempts: stored.attempts,
            retry_at,
        }))
    }

    /// Return a leased job without spending an attempt, visible again after
    /// `delay`. For failures that are not the job's fault (empty pool, no proxy).
    pub async fn defer(&self, job: &Job, delay: Duration) -> Result<bool, StoreError> {
        let deferred = retry_on_conflict(&self.cas, "queue.defer", move || self.defer_once(job, delay)).await?;
        Ok(deferred.unwrap_or(false))
    }

    async fn defer_once(&self, job: &Job, delay: Duration) -> Result<Cas<bool>, StoreError> {
        let ns = Namespace::Jobs(job.kind);
        let key = job.id.to_string();
        let Some(record) = self.store.get::<Job>(ns, &key).await? else {
            return Ok(Cas::Done(false));
        };
        if record.value.receipt != job.receipt || job.receipt.is_none() {
            return Ok(Cas::Done(false));
        }
        let mut stored = record.value;
        stored.payload = job.payload.clone();
        stored.visible_at = self.clock.now() + delay;
        stored.lease_deadline = None;
        stored.receipt = None;
        if self.store.replace(ns, &key, record.version, &stored).await? {
            Ok(Cas::Done(true))
        } else {
            Ok(Cas::Conflict)
        }
    }

    /// Records the job in the dead-letter channel, then removes it from its
    /// queue. The dead-letter insert is idempotent, so a job is reported once
    /// even if removal has to be retried.
    async fn dead_letter(&self, version: u64, job: Job, reason: String) -> Result<Cas<()>, StoreError> {
        let key = job.id.to_string();
        let ns = Namespace::Jobs(job.kind);
        let letter = DeadLetter {
            dead_at: self.clock.now(),
            reason,
            job,
        };

        if self.store.insert(Namespace::DeadLetters, &key, &letter).await? {
            metrics::counter!("crawl_jobs_dead_lettered_total", "kind" => letter.job.kind.to_string())
                .increment(1);
            tracing::error!(
                job_id = %letter.job.id,
                kind = %letter.job.kind,
                attempts = letter.job.attempts,
                reason = %letter.reason,
                "Job exhausted its attempts and was moved to the dead-letter channel"
            );
        }

        if self.store.delete(ns, &key, version).await? {
            Ok(Cas::Done(()))
        } else {
            Ok(Cas::Conflict)
        }
    }

    async fn is_dead_lettered(&self, job_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .store
            .get::<DeadLetter>(Namespace::DeadLetters, &job_id.to_string())
            .await?
            .is_some())
    }

    /// Jobs currently queued on `kind`, leased or not.
    pub async fn depth(&self, kind: JobKind) -> Result<usize, StoreError> {
        let depth = self.store.scan::<Job>(Namespace::Jobs(kind)).await?.len();
        metrics::gauge!("crawl_queue_depth", "kind" => kind.to_string()).set(depth as f64);
        Ok(depth)
    }

    /// Jobs on `kind` matching `predicate`, e.g. outstanding produce-cookie work.
    pub async fn count_where<F>(&self, kind: JobKind, predicate: F) -> Result<usize, StoreError>
    where
        F: Fn(&Job) -> bool,
    {
        Ok(self
            .store
            .scan::<Job>(Namespace::Jobs(kind))
            .await?
            .iter()
            .filter(|record| predicate(&record.value))
            .count())
    }

    /// Most recent dead letters first.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>, StoreError> {
        let mut letters: Vec<DeadLetter> = self
            .store
            .scan::<DeadLetter>(Namespace::DeadLetters)
            .await?
            .into_iter()
            .map(|record| record.value)
            .collect();
        letters.sort_by(|a, b| b.dead_at.cmp(&a.dead_at));
        letters.truncate(limit);
        Ok(letters)
    }

    pub async fn dead_letter_count(&self) -> Result<usize, StoreError> {
        Ok(self.store.scan::<DeadLetter>(Namespace::DeadLetters).await?.len())
    }
}
