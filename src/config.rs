//! Configuration for the sync layer.
//!
//! # Example
//!
//! ```
//! use opsync::SyncConfig;
//!
//! // Minimal config (uses defaults)
//! let config = SyncConfig::default();
//! assert_eq!(config.cache_version, 3);
//! assert_eq!(config.quota_threshold, 0.8);
//!
//! // Full config
//! let config = SyncConfig {
//!     api_origin: "https://ops.example.com".into(),
//!     database_path: Some("/var/lib/opsync/sync.db".into()),
//!     quota_budget_bytes: 128 * 1024 * 1024, // 128 MB
//!     attempt_cap: 3,
//!     ..Default::default()
//! };
//! ```

use serde::Deserialize;

use crate::classify::ClassifierRules;

/// Configuration for the sync layer.
///
/// All fields have defaults that mirror the dashboard's endpoint inventory.
/// At minimum you should configure `api_origin` and `database_path` for
/// production use. The engine receives this through a watch channel, so a
/// new value can be pushed to a running engine.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Deployment generation; bumping it invalidates all cache namespaces
    #[serde(default = "default_cache_version")]
    pub cache_version: u32,

    /// Origin the relative refresh/health paths resolve against
    #[serde(default = "default_api_origin")]
    pub api_origin: String,

    /// SQLite file for the durable store (None = in-memory only)
    #[serde(default)]
    pub database_path: Option<String>,

    /// Classification pattern sets
    #[serde(default)]
    pub classifier: ClassifierRules,

    /// Paths outside tenancy; `*` suffix matches as a prefix
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,

    /// Endpoints re-fetched for the active tenant after reconnect
    #[serde(default = "default_critical_refresh")]
    pub critical_refresh: Vec<String>,

    /// Health endpoint path used by the offline recovery probe
    #[serde(default = "default_health_path")]
    pub health_path: String,

    /// Storage budget in bytes
    #[serde(default = "default_quota_budget_bytes")]
    pub quota_budget_bytes: u64,

    /// Usage ratio that triggers cleanup
    #[serde(default = "default_quota_threshold")]
    pub quota_threshold: f64,
    #[serde(default = "default_quota_critical_threshold")]
    pub quota_critical_threshold: f64,

    /// Fraction of dynamic-content entries evicted per cleanup
    #[serde(default = "default_dynamic_evict_fraction")]
    pub dynamic_evict_fraction: f64,

    /// Age beyond which tenant API/critical entries are purged
    #[serde(default = "default_api_max_age_ms")]
    pub api_max_age_ms: i64,

    /// Replay attempts before a mutation is marked permanently failed
    #[serde(default = "default_attempt_cap")]
    pub attempt_cap: u32,

    /// Outbox size that starts triggering pressure warnings
    #[serde(default = "default_outbox_soft_limit")]
    pub outbox_soft_limit: u64,

    /// Recovery probe cadence while offline
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,

    /// Quota check cadence in the run loop
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,

    /// Upstream request timeout
    #[serde(default = "default_transport_timeout_secs")]
    pub transport_timeout_secs: u64,

    /// `retryAfter` hint in offline responses
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,

    /// Broadcast capacity for foreground events
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Command channel capacity into the run loop
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

fn default_cache_version() -> u32 { 3 }
fn default_api_origin() -> String { "http://localhost:8000".to_string() }
fn default_health_path() -> String { "/api/health".to_string() }
fn default_quota_budget_bytes() -> u64 { 64 * 1024 * 1024 } // 64 MB
fn default_quota_threshold() -> f64 { 0.8 }
fn default_quota_critical_threshold() -> f64 { 0.95 }
fn default_dynamic_evict_fraction() -> f64 { 0.25 }
fn default_api_max_age_ms() -> i64 { 24 * 60 * 60 * 1000 } // 24 hours
fn default_attempt_cap() -> u32 { 3 }
fn default_outbox_soft_limit() -> u64 { 10_000 }
fn default_probe_interval_secs() -> u64 { 30 }
fn default_maintenance_interval_secs() -> u64 { 300 }
fn default_transport_timeout_secs() -> u64 { 30 }
fn default_retry_after_secs() -> u64 { 30 }
fn default_event_capacity() -> usize { 64 }
fn default_command_capacity() -> usize { 64 }

pub fn default_public_paths() -> Vec<String> {
    vec![
        "/api/health".to_string(),
        "/api/status".to_string(),
        "/api/version".to_string(),
        "/api/auth/*".to_string(),
        "/api/tenants".to_string(),
    ]
}

fn default_critical_refresh() -> Vec<String> {
    vec![
        "/api/workitems?priority=high".to_string(),
        "/api/incidents?status=active".to_string(),
        "/api/config/current".to_string(),
        "/api/user/profile".to_string(),
        "/api/teams/oncall".to_string(),
    ]
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cache_version: default_cache_version(),
            api_origin: default_api_origin(),
            database_path: None,
            classifier: ClassifierRules::default(),
            public_paths: default_public_paths(),
            critical_refresh: default_critical_refresh(),
            health_path: default_health_path(),
            quota_budget_bytes: default_quota_budget_bytes(),
            quota_threshold: default_quota_threshold(),
            quota_critical_threshold: default_quota_critical_threshold(),
            dynamic_evict_fraction: default_dynamic_evict_fraction(),
            api_max_age_ms: default_api_max_age_ms(),
            attempt_cap: default_attempt_cap(),
            outbox_soft_limit: default_outbox_soft_limit(),
            probe_interval_secs: default_probe_interval_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            transport_timeout_secs: default_transport_timeout_secs(),
            retry_after_secs: default_retry_after_secs(),
            event_capacity: default_event_capacity(),
            command_capacity: default_command_capacity(),
        }
    }
}

impl SyncConfig {
    /// Absolute URL for a configured relative path.
    pub fn absolute_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.api_origin.trim_end_matches('/'), path_and_query)
    }

    /// Absolute URL of the health endpoint.
    pub fn health_url(&self) -> String {
        self.absolute_url(&self.health_path)
    }
}
