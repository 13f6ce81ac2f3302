use chrono::Duration;
use serde::Deserialize;

use crate::services::fetcher::ResponseLayout;
use crate::workers::RoleSelection;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Intake server bind address (e.g., "0.0.0.0:3000"). Ignored by workers.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the shared backing store
    pub redis_url: String,

    /// Prefix for every key this deployment writes to Redis
    #[serde(default = "default_redis_key_prefix")]
    pub redis_key_prefix: String,

    /// Comma-separated proxy addresses seeded into the registry at worker start
    #[serde(default)]
    pub proxies: Vec<String>,

    /// Roles a worker process runs: cookie, search or both
    #[serde(default)]
    pub worker_role: RoleSelection,

    /// Base URL of the cookie minting browser service
    #[serde(default = "default_browser_service_url")]
    pub browser_service_url: String,

    #[serde(default = "default_browser_timeout_secs")]
    pub browser_timeout_secs: u64,

    /// Search endpoint queried by the page fetcher
    #[serde(default = "default_search_api_url")]
    pub search_api_url: String,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    /// JSON pointer to the item array in a search response
    #[serde(default = "default_items_pointer")]
    pub items_pointer: String,

    /// JSON pointer, relative to an item, to its source id
    #[serde(default = "default_item_id_pointer")]
    pub item_id_pointer: String,

    /// JSON pointer to the next-page marker; empty if the target has none
    #[serde(default = "default_next_page_pointer")]
    pub next_page_pointer: String,

    // Cookie pool
    #[serde(default = "default_min_pool_size")]
    pub min_pool_size: usize,
    #[serde(default = "default_baseline_score")]
    pub baseline_score: i64,
    #[serde(default = "default_max_score")]
    pub max_score: i64,
    #[serde(default = "default_success_step")]
    pub success_step: i64,
    #[serde(default = "default_soft_failure_penalty")]
    pub soft_failure_penalty: i64,
    #[serde(default = "default_low_water_score")]
    pub low_water_score: i64,
    #[serde(default)]
    pub min_lease_score: i64,
    #[serde(default = "default_credential_lease_secs")]
    pub credential_lease_secs: i64,
    #[serde(default = "default_cookie_ttl_secs")]
    pub cookie_ttl_secs: i64,
    #[serde(default = "default_degraded_ttl_secs")]
    pub degraded_ttl_secs: i64,

    // Proxies
    #[serde(default = "default_proxy_failure_threshold")]
    pub proxy_failure_threshold: u32,
    #[serde(default = "default_proxy_cooldown_secs")]
    pub proxy_cooldown_secs: i64,
    #[serde(default = "default_proxy_binding_secs")]
    pub proxy_binding_secs: i64,

    // Job queue
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: i64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: i64,
    #[serde(default = "default_lease_wait_ms")]
    pub lease_wait_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_exhausted_retry_secs")]
    pub exhausted_retry_secs: i64,

    // Store contention
    #[serde(default = "default_cas_max_retries")]
    pub cas_max_retries: u32,
    #[serde(default = "default_cas_jitter_ms")]
    pub cas_jitter_ms: u64,

    // Search
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default = "default_pages_per_job")]
    pub pages_per_job: u32,
    #[serde(default = "default_search_delay_ms")]
    pub search_delay_ms: u64,

    /// Dedup entries older than this are reported as stale to the compactor
    #[serde(default = "default_dedup_retention_secs")]
    pub dedup_retention_secs: i64,

    /// Time a worker gives its current job after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Minimum gap between pool sweeps/top-ups in a cookie worker loop
    #[serde(default = "default_housekeeping_interval_ms")]
    pub housekeeping_interval_ms: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_redis_key_prefix() -> String {
    "crawl".to_string()
}

fn default_browser_service_url() -> String {
    "http://localhost:3001".to_string()
}

fn default_browser_timeout_secs() -> u64 {
    30
}

fn default_search_api_url() -> String {
    "http://localhost:3002/search".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_items_pointer() -> String {
    "/data/cards".to_string()
}

fn default_item_id_pointer() -> String {
    "/mblog/mid".to_string()
}

fn default_next_page_pointer() -> String {
    "/data/cardlistInfo/page".to_string()
}

fn default_min_pool_size() -> usize {
    3
}

fn default_baseline_score() -> i64 {
    100
}

fn default_max_score() -> i64 {
    100
}

fn default_success_step() -> i64 {
    5
}

fn default_soft_failure_penalty() -> i64 {
    25
}

fn default_low_water_score() -> i64 {
    25
}

fn default_credential_lease_secs() -> i64 {
    300
}

fn default_cookie_ttl_secs() -> i64 {
    3600
}

fn default_degraded_ttl_secs() -> i64 {
    600
}

fn default_proxy_failure_threshold() -> u32 {
    3
}

fn default_proxy_cooldown_secs() -> i64 {
    120
}

fn default_proxy_binding_secs() -> i64 {
    300
}

fn default_visibility_timeout_secs() -> i64 {
    30
}

fn default_max_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> i64 {
    2
}

fn default_backoff_cap_secs() -> i64 {
    300
}

fn default_lease_wait_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_exhausted_retry_secs() -> i64 {
    15
}

fn default_cas_max_retries() -> u32 {
    5
}

fn default_cas_jitter_ms() -> u64 {
    25
}

fn default_max_pages() -> u32 {
    10
}

fn default_pages_per_job() -> u32 {
    5
}

fn default_search_delay_ms() -> u64 {
    1000
}

fn default_dedup_retention_secs() -> i64 {
    7 * 24 * 3600
}

fn default_shutdown_grace_secs() -> u64 {
    20
}

fn default_housekeeping_interval_ms() -> u64 {
    5000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn pool_policy(&self) -> PoolPolicy {
        PoolPolicy {
            min_pool_size: self.min_pool_size,
            baseline_score: self.baseline_score,
            max_score: self.max_score,
            success_step: self.success_step,
            soft_failure_penalty: self.soft_failure_penalty,
            low_water_score: self.low_water_score,
            min_lease_score: self.min_lease_score,
            lease_ttl: Duration::seconds(self.credential_lease_secs),
            cookie_ttl: Duration::seconds(self.cookie_ttl_secs),
            degraded_ttl: Duration::seconds(self.degraded_ttl_secs),
        }
    }

    pub fn proxy_policy(&self) -> ProxyPolicy {
        ProxyPolicy {
            failure_threshold: self.proxy_failure_threshold,
            cooldown: Duration::seconds(self.proxy_cooldown_secs),
            binding_ttl: Duration::seconds(self.proxy_binding_secs),
        }
    }

    pub fn queue_policy(&self) -> QueuePolicy {
        QueuePolicy {
            visibility_timeout: Duration::seconds(self.visibility_timeout_secs),
            max_attempts: self.max_attempts,
            backoff_base: Duration::seconds(self.backoff_base_secs),
            backoff_cap: Duration::seconds(self.backoff_cap_secs),
            poll_interval: std::time::Duration::from_millis(self.poll_interval_ms),
        }
    }

    pub fn cas_policy(&self) -> CasPolicy {
        CasPolicy {
            max_retries: self.cas_max_retries,
            jitter_ms: self.cas_jitter_ms,
        }
    }

    pub fn search_policy(&self) -> SearchPolicy {
        SearchPolicy {
            max_pages: self.max_pages,
            pages_per_job: self.pages_per_job,
            page_delay: std::time::Duration::from_millis(self.search_delay_ms),
        }
    }

    pub fn worker_policy(&self) -> WorkerPolicy {
        WorkerPolicy {
            lease_wait: std::time::Duration::from_millis(self.lease_wait_ms),
            idle_sleep: std::time::Duration::from_millis(self.poll_interval_ms),
            exhausted_retry: Duration::seconds(self.exhausted_retry_secs),
            browser_timeout: std::time::Duration::from_secs(self.browser_timeout_secs),
            fetch_timeout: std::time::Duration::from_secs(self.fetch_timeout_secs),
            shutdown_grace: std::time::Duration::from_secs(self.shutdown_grace_secs),
            housekeeping_interval: std::time::Duration::from_millis(self.housekeeping_interval_ms),
        }
    }

    pub fn response_layout(&self) -> ResponseLayout {
        ResponseLayout {
            items_pointer: self.items_pointer.clone(),
            item_id_pointer: self.item_id_pointer.clone(),
            next_page_pointer: self.next_page_pointer.clone(),
        }
    }

    pub fn dedup_retention(&self) -> Duration {
        Duration::seconds(self.dedup_retention_secs)
    }
}

/// Scoring and lifetime thresholds for pooled credentials.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    /// Valid + degraded credentials below this trigger replenishment.
    pub min_pool_size: usize,
    pub baseline_score: i64,
    pub max_score: i64,
    pub success_step: i64,
    pub soft_failure_penalty: i64,
    /// A valid credential whose score falls to this value becomes degraded.
    pub low_water_score: i64,
    pub min_lease_score: i64,
    pub lease_ttl: Duration,
    pub cookie_ttl: Duration,
    pub degraded_ttl: Duration,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_pool_size: default_min_pool_size(),
            baseline_score: default_baseline_score(),
            max_score: default_max_score(),
            success_step: default_success_step(),
            soft_failure_penalty: default_soft_failure_penalty(),
            low_water_score: default_low_water_score(),
            min_lease_score: 0,
            lease_ttl: Duration::seconds(default_credential_lease_secs()),
            cookie_ttl: Duration::seconds(default_cookie_ttl_secs()),
            degraded_ttl: Duration::seconds(default_degraded_ttl_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyPolicy {
    /// Consecutive failures before a proxy is marked unhealthy.
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub binding_ttl: Duration,
}

impl Default for ProxyPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_proxy_failure_threshold(),
            cooldown: Duration::seconds(default_proxy_cooldown_secs()),
            binding_ttl: Duration::seconds(default_proxy_binding_secs()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueuePolicy {
    pub visibility_timeout: Duration,
    /// Attempts after which a job is dead-lettered.
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub poll_interval: std::time::Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::seconds(default_visibility_timeout_secs()),
            max_attempts: default_max_attempts(),
            backoff_base: Duration::seconds(default_backoff_base_secs()),
            backoff_cap: Duration::seconds(default_backoff_cap_secs()),
            poll_interval: std::time::Duration::from_millis(default_poll_interval_ms()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CasPolicy {
    pub max_retries: u32,
    pub jitter_ms: u64,
}

impl Default for CasPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_cas_max_retries(),
            jitter_ms: default_cas_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchPolicy {
    pub max_pages: u32,
    pub pages_per_job: u32,
    pub page_delay: std::time::Duration,
}

impl Default for SearchPolicy {
    fn default() -> Self {
        Self {
            max_pages: default_max_pages(),
            pages_per_job: default_pages_per_job(),
            page_delay: std::time::Duration::from_millis(default_search_delay_ms()),
        }
    }
}

/// Pacing of the worker control loops.
#[derive(Debug, Clone)]
pub struct WorkerPolicy {
    pub lease_wait: std::time::Duration,
    pub idle_sleep: std::time::Duration,
    /// Delay before a job deferred on an empty pool or proxy set is retried.
    pub exhausted_retry: Duration,
    pub browser_timeout: std::time::Duration,
    pub fetch_timeout: std::time::Duration,
    pub shutdown_grace: std::time::Duration,
    pub housekeeping_interval: std::time::Duration,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            lease_wait: std::time::Duration::from_millis(default_lease_wait_ms()),
            idle_sleep: std::time::Duration::from_millis(default_poll_interval_ms()),
            exhausted_retry: Duration::seconds(default_exhausted_retry_secs()),
            browser_timeout: std::time::Duration::from_secs(default_browser_timeout_secs()),
            fetch_timeout: std::time::Duration::from_secs(default_fetch_timeout_secs()),
            shutdown_grace: std::time::Duration::from_secs(default_shutdown_grace_secs()),
            housekeeping_interval: std::time::Duration::from_millis(default_housekeeping_interval_ms()),
        }
    }
}
