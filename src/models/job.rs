use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Channel a job is queued on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobKind {
    ProduceCookie,
    Search,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::ProduceCookie, JobKind::Search];
}

/// Keyword plus the inclusive page range still to fetch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
pub struct SearchPayload {
    #[garde(length(min = 1, max = 200))]
    pub keyword: String,

    #[garde(range(min = 1))]
    pub page_start: u32,

    #[garde(custom(not_before(&self.page_start)))]
    pub page_end: u32,
}

fn not_before(start: &u32) -> impl FnOnce(&u32, &()) -> garde::Result + '_ {
    move |end, _| {
        if end < start {
            return Err(garde::Error::new("page_end must not precede page_start"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    /// Mint a fresh cookie, or re-probe an existing degraded one.
    ProduceCookie { revalidate: Option<Uuid> },
    Search(SearchPayload),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::ProduceCookie { .. } => JobKind::ProduceCookie,
            JobPayload::Search(_) => JobKind::Search,
        }
    }
}

/// A unit of work on the queue. Retry state lives on the record so
/// redelivery is a pure function of the stored job and the clock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub payload: JobPayload,
    /// Failed or abandoned deliveries so far.
    pub attempts: u32,
    /// Earliest time the job may be leased (enqueue delay / backoff).
    pub visible_at: DateTime<Utc>,
    /// Visibility deadline of the current lease.
    pub lease_deadline: Option<DateTime<Utc>>,
    /// Identifies the current lease; ack/fail with a stale receipt are no-ops.
    pub receipt: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(payload: JobPayload, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: payload.kind(),
            payload,
            attempts: 0,
            visible_at: now,
            lease_deadline: None,
            receipt: None,
            created_at: now,
            last_error: None,
        }
    }

    /// Replaces the random id, for jobs whose identity is derived from content.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = id;
        self
    }

    pub fn produce_cookie(now: DateTime<Utc>) -> Self {
        Self::new(JobPayload::ProduceCookie { revalidate: None }, now)
    }

    pub fn revalidate(credential_id: Uuid, now: DateTime<Utc>) -> Self {
        Self::new(
            JobPayload::ProduceCookie {
                revalidate: Some(credential_id),
            },
            now,
        )
    }

    pub fn search(payload: SearchPayload, now: DateTime<Utc>) -> Self {
        Self::new(JobPayload::Search(payload), now)
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_deadline.is_some_and(|deadline| deadline > now)
    }

    /// Available to a new leaser: past its delay and not under a live lease.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now && !self.is_leased(now)
    }
}

/// A job that exhausted its attempts, kept for operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetter {
    pub job: Job,
    pub reason: String,
    pub dead_at: DateTime<Utc>,
}
