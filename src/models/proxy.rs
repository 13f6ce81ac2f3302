use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

/// Health of an egress proxy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProxyStatus {
    Unknown,
    Healthy,
    Unhealthy,
    /// Half-open: cooldown elapsed and a probe is in flight.
    CoolingDown,
}

/// Advisory assignment of a proxy to one holder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyBinding {
    /// Credential using the proxy; `None` while a cookie is being minted on it.
    pub credential_id: Option<Uuid>,
    pub token: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProxyEndpoint {
    pub id: Uuid,
    pub address: String,
    pub status: ProxyStatus,
    pub consecutive_failures: u32,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub binding: Option<ProxyBinding>,
}

impl ProxyEndpoint {
    /// Ids are derived from the address so every process registers the same
    /// proxy under the same key.
    pub fn id_for(address: &str) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, address.as_bytes())
    }

    pub fn new(address: &str) -> Self {
        Self {
            id: Self::id_for(address),
            address: address.to_string(),
            status: ProxyStatus::Unknown,
            consecutive_failures: 0,
            last_success_at: None,
            last_used_at: None,
            cooldown_until: None,
            binding: None,
        }
    }

    /// Healthy or untested proxies are always selectable; unhealthy ones only
    /// once their cooldown has elapsed. A probing proxy is held by its probe's
    /// binding, so it becomes selectable again only if that probe is abandoned.
    pub fn is_selectable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            ProxyStatus::Healthy | ProxyStatus::Unknown | ProxyStatus::CoolingDown => true,
            ProxyStatus::Unhealthy => self.cooldown_until.map_or(true, |until| until <= now),
        }
    }

    /// A binding is free when absent, expired, or already held by `credential_id`.
    pub fn is_free_for(&self, credential_id: Option<Uuid>, now: DateTime<Utc>) -> bool {
        match &self.binding {
            None => true,
            Some(binding) if binding.expires_at <= now => true,
            Some(binding) => credential_id.is_some() && binding.credential_id == credential_id,
        }
    }

    /// Marks the proxy as taken by `credential_id` until `expires_at`.
    /// Selecting an unhealthy proxy after its cooldown starts a half-open probe.
    pub fn bind(&mut self, credential_id: Option<Uuid>, now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Uuid {
        let token = Uuid::new_v4();
        if self.status == ProxyStatus::Unhealthy {
            self.status = ProxyStatus::CoolingDown;
        }
        self.last_used_at = Some(now);
        self.binding = Some(ProxyBinding {
            credential_id,
            token,
            expires_at,
        });
        token
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_id_is_stable_per_address() {
        assert_eq!(
            ProxyEndpoint::id_for("http://10.0.0.1:8080"),
            ProxyEndpoint::new("http://10.0.0.1:8080").id
        );
        assert_ne!(
            ProxyEndpoint::id_for("http://10.0.0.1:8080"),
            ProxyEndpoint::id_for("http://10.0.0.2:8080")
        );
    }

    #[test]
    fn test_unhealthy_proxy_selectable_after_cooldown() {
        let now = Utc::now();
        let mut proxy = ProxyEndpoint::new("http://10.0.0.1:8080");
        proxy.status = ProxyStatus::Unhealthy;
        proxy.cooldown_until = Some(now + Duration::seconds(60));
        assert!(!proxy.is_selectable(now));
        assert!(proxy.is_selectable(now + Duration::seconds(60)));

        let probe_at = now + Duration::seconds(61);
        proxy.bind(None, probe_at, probe_at + Duration::seconds(30));
        assert_eq!(proxy.status, ProxyStatus::CoolingDown);
        assert!(!proxy.is_free_for(None, probe_at));
    }

    #[test]
    fn test_binding_expires() {
        let now = Utc::now();
        let holder = Uuid::new_v4();
        let mut proxy = ProxyEndpoint::new("http://10.0.0.1:8080");
        proxy.bind(Some(holder), now, now + Duration::seconds(30));

        assert!(proxy.is_free_for(Some(holder), now));
        assert!(!proxy.is_free_for(Some(Uuid::new_v4()), now));
        assert!(!proxy.is_free_for(None, now));
        assert!(proxy.is_free_for(None, now + Duration::seconds(30)));
    }
}
