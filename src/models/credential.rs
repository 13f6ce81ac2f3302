use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle status of a pooled credential.
///
/// Transitions only move forward along
/// `pending → valid ⇄ degraded → expired` with `banned` reachable from
/// `valid` and `degraded`. `expired` and `banned` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CredentialStatus {
    Pending,
    Valid,
    Degraded,
    Expired,
    Banned,
}

impl CredentialStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Banned)
    }

    /// Whether `self → next` is an edge of the credential state machine.
    pub fn can_transition_to(self, next: CredentialStatus) -> bool {
        use CredentialStatus::*;
        matches!(
            (self, next),
            (Pending, Valid)
                | (Valid, Degraded)
                | (Degraded, Valid)
                | (Degraded, Expired)
                | (Valid, Banned)
                | (Degraded, Banned)
        )
    }
}

/// Outcome a search worker reports when handing a credential back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReleaseOutcome {
    Success,
    SoftFailure,
    HardFailure,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("illegal credential transition {from} -> {to}")]
pub struct TransitionError {
    pub from: CredentialStatus,
    pub to: CredentialStatus,
}

/// Cookie set and user agent as emitted by the browser collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawCredential {
    pub cookies: BTreeMap<String, String>,
    pub user_agent: String,
}

impl RawCredential {
    /// `name=value; name=value` rendering used for the Cookie header.
    pub fn cookie_header(&self) -> String {
        render_cookie_header(&self.cookies)
    }

    /// Stable hash of the cookie payload; two admissions of the same physical
    /// cookie hash identically regardless of insertion order.
    pub fn payload_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.cookies {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b";");
        }
        hex::encode(hasher.finalize())
    }
}

fn render_cookie_header(cookies: &BTreeMap<String, String>) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

/// A pooled authentication credential.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub id: Uuid,
    pub cookies: BTreeMap<String, String>,
    pub user_agent: String,
    pub payload_hash: String,
    pub status: CredentialStatus,
    pub score: i64,
    /// Proxy the cookie was minted on.
    pub proxy_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub last_validated_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub degraded_at: Option<DateTime<Utc>>,
    pub use_count: u64,
    pub leased_until: Option<DateTime<Utc>>,
    pub lease_token: Option<Uuid>,
}

impl Credential {
    pub fn pending(raw: RawCredential, proxy_id: Uuid, now: DateTime<Utc>) -> Self {
        let payload_hash = raw.payload_hash();
        Self {
            id: Uuid::new_v4(),
            cookies: raw.cookies,
            user_agent: raw.user_agent,
            payload_hash,
            status: CredentialStatus::Pending,
            score: 0,
            proxy_id,
            created_at: now,
            last_validated_at: now,
            last_used_at: None,
            degraded_at: None,
            use_count: 0,
            leased_until: None,
            lease_token: None,
        }
    }

    pub fn transition(&mut self, next: CredentialStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.leased_until.is_some_and(|until| until > now)
    }

    pub fn cookie_header(&self) -> String {
        render_cookie_header(&self.cookies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ALL: [CredentialStatus; 5] = [
        CredentialStatus::Pending,
        CredentialStatus::Valid,
        CredentialStatus::Degraded,
        CredentialStatus::Expired,
        CredentialStatus::Banned,
    ];

    fn raw(pairs: &[(&str, &str)]) -> RawCredential {
        RawCredential {
            cookies: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            user_agent: "Mozilla/5.0".to_string(),
        }
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for from in [CredentialStatus::Expired, CredentialStatus::Banned] {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_random_walk_never_revives_terminal_credentials() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..500 {
            let mut credential = Credential::pending(raw(&[("SUB", "x")]), Uuid::new_v4(), Utc::now());
            let mut was_terminal = false;
            for _ in 0..40 {
                let next = ALL[rng.gen_range(0..ALL.len())];
                let before = credential.status;
                match credential.transition(next) {
                    Ok(()) => assert!(before.can_transition_to(next)),
                    Err(e) => {
                        assert_eq!(e, TransitionError { from: before, to: next });
                        assert_eq!(credential.status, before);
                    }
                }
                if was_terminal {
                    assert!(credential.status.is_terminal());
                    assert_ne!(credential.status, CredentialStatus::Valid);
                }
                was_terminal |= credential.status.is_terminal();
            }
        }
    }

    #[test]
    fn test_payload_hash_ignores_insertion_order() {
        let a = raw(&[("SUB", "abc"), ("SUBP", "def")]);
        let b = raw(&[("SUBP", "def"), ("SUB", "abc")]);
        assert_eq!(a.payload_hash(), b.payload_hash());
        assert_ne!(a.payload_hash(), raw(&[("SUB", "abc")]).payload_hash());
    }

    #[test]
    fn test_cookie_header() {
        let credential = raw(&[("SUBP", "2"), ("SUB", "1")]);
        assert_eq!(credential.cookie_header(), "SUB=1; SUBP=2");
    }

    #[test]
    fn test_status_round_trips_through_strum() {
        assert_eq!(CredentialStatus::Degraded.to_string(), "degraded");
        assert_eq!("banned".parse::<CredentialStatus>().unwrap(), CredentialStatus::Banned);
    }
}
