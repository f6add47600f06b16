// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage quota management.
//!
//! Cached data is disposable; the storage budget is not. The quota manager
//! grades usage into pressure levels and, under pressure, reclaims space in
//! a fixed order: whole namespaces from stale deployment generations first,
//! then the oldest slice of dynamic content, then tenant API entries past
//! their maximum age. Checks run at startup, on the maintenance timer, and
//! opportunistically when a large response body lands in the cache. Cleanup
//! is best-effort and runs in a spawned task; request handling never waits
//! for it.
//!
//! # Example
//!
//! ```
//! use opsync::QuotaPressure;
//!
//! // Comfortable usage
//! let level = QuotaPressure::from_ratio(0.5, 0.8, 0.95);
//! assert_eq!(level, QuotaPressure::Normal);
//! assert!(!level.should_clean());
//!
//! // Over the cleanup threshold
//! let level = QuotaPressure::from_ratio(0.85, 0.8, 0.95);
//! assert_eq!(level, QuotaPressure::Elevated);
//! assert!(level.should_clean());
//!
//! // Near the budget - eviction doubles down
//! let level = QuotaPressure::from_ratio(0.97, 0.8, 0.95);
//! assert_eq!(level, QuotaPressure::Critical);
//! assert_eq!(level.eviction_multiplier(), 2.0);
//! ```

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::metrics;
use crate::namespace::{Namespace, Purpose};
use crate::request::now_millis;
use crate::storage::traits::{CacheStore, StorageError, StorageUsage};

/// Cache writes at or above this size trigger an immediate pressure check
/// instead of waiting for the maintenance timer.
pub(crate) const LARGE_WRITE_BYTES: usize = 512 * 1024;

/// Graded storage pressure.
///
/// - **Normal** (below the cleanup threshold): no action
/// - **Elevated** (>= threshold, default 0.8): all cleanup phases run
/// - **Critical** (>= critical threshold, default 0.95): cleanup runs with
///   doubled dynamic eviction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QuotaPressure {
    Normal = 0,
    Elevated = 1,
    Critical = 2,
}

impl QuotaPressure {
    /// Grade a usage ratio (0.0 → 1.0+) against the configured thresholds.
    #[must_use]
    pub fn from_ratio(ratio: f64, elevated_at: f64, critical_at: f64) -> Self {
        if ratio >= critical_at {
            Self::Critical
        } else if ratio >= elevated_at {
            Self::Elevated
        } else {
            Self::Normal
        }
    }

    #[must_use]
    pub fn should_clean(&self) -> bool {
        !matches!(self, Self::Normal)
    }

    /// How aggressively the dynamic phase evicts at this level.
    #[must_use]
    pub fn eviction_multiplier(&self) -> f64 {
        match self {
            Self::Normal | Self::Elevated => 1.0,
            Self::Critical => 2.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Elevated => "elevated",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for QuotaPressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one cleanup pass removed, per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Namespaces from stale generations dropped wholesale
    pub stale_namespaces: usize,
    /// Entries removed with those namespaces
    pub stale_entries: usize,
    /// Oldest dynamic entries evicted
    pub dynamic_evicted: usize,
    /// API/critical entries past their maximum age
    pub aged_out: usize,
}

impl CleanupReport {
    pub fn total_entries_removed(&self) -> usize {
        self.stale_entries + self.dynamic_evicted + self.aged_out
    }
}

pub struct QuotaManager {
    store: Arc<dyn CacheStore>,
}

impl QuotaManager {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store }
    }

    /// Current usage and its pressure grade. Updates the storage gauges.
    pub async fn pressure(
        &self,
        config: &SyncConfig,
    ) -> Result<(QuotaPressure, StorageUsage), StorageError> {
        let usage = self.store.usage().await?;
        let ratio = usage.bytes as f64 / config.quota_budget_bytes.max(1) as f64;
        let level = QuotaPressure::from_ratio(
            ratio,
            config.quota_threshold,
            config.quota_critical_threshold,
        );

        metrics::set_storage_used_bytes(usage.bytes);
        metrics::set_storage_pressure(ratio);

        Ok((level, usage))
    }

    /// Run the ordered cleanup phases if usage is over the threshold.
    ///
    /// Failures inside a phase end the pass early; whatever was already
    /// reclaimed stays reclaimed. Callers log the error, nothing more.
    pub async fn check_and_cleanup(&self, config: &SyncConfig) -> Result<CleanupReport, StorageError> {
        let (level, usage) = self.pressure(config).await?;
        if !level.should_clean() {
            return Ok(CleanupReport::default());
        }

        warn!(
            pressure = %level,
            used_bytes = usage.bytes,
            budget_bytes = config.quota_budget_bytes,
            entries = usage.entries,
            "Storage pressure, running cleanup"
        );

        let mut report = CleanupReport::default();
        let namespaces: Vec<Namespace> = self
            .store
            .namespaces()
            .await?
            .iter()
            .filter_map(|s| Namespace::parse(s))
            .collect();

        // Phase 1: drop whole namespaces from other deployment generations
        for ns in namespaces.iter().filter(|ns| ns.is_stale_for(config.cache_version)) {
            let removed = self.store.purge_namespace(&ns.to_string()).await?;
            report.stale_namespaces += 1;
            report.stale_entries += removed;
            debug!(namespace = %ns, removed, "Purged stale-generation namespace");
        }
        metrics::record_cleanup("stale_version", report.stale_entries);

        // Phase 2: evict the oldest slice of each dynamic namespace
        let fraction =
            (config.dynamic_evict_fraction * level.eviction_multiplier()).min(1.0);
        for ns in namespaces
            .iter()
            .filter(|ns| !ns.is_stale_for(config.cache_version) && ns.purpose == Purpose::Dynamic)
        {
            let name = ns.to_string();
            let keys = self.store.keys(&name).await?;
            let evict_count = (keys.len() as f64 * fraction).ceil() as usize;
            for key in keys.iter().take(evict_count) {
                self.store.delete(&name, key).await?;
                report.dynamic_evicted += 1;
            }
        }
        metrics::record_cleanup("dynamic_oldest", report.dynamic_evicted);

        // Phase 3: age out tenant API data
        let cutoff = now_millis() - config.api_max_age_ms;
        for ns in namespaces.iter().filter(|ns| {
            !ns.is_stale_for(config.cache_version)
                && matches!(ns.purpose, Purpose::Api | Purpose::Critical)
        }) {
            report.aged_out += self.store.purge_older_than(&ns.to_string(), cutoff).await?;
        }
        metrics::record_cleanup("max_age", report.aged_out);

        info!(
            pressure = %level,
            stale_namespaces = report.stale_namespaces,
            stale_entries = report.stale_entries,
            dynamic_evicted = report.dynamic_evicted,
            aged_out = report.aged_out,
            "Cleanup pass complete"
        );

        Ok(report)
    }
}

/// Fire-and-forget cleanup; the caller carries on immediately.
pub fn spawn_cleanup(manager: Arc<QuotaManager>, config: SyncConfig) {
    tokio::spawn(async move {
        if let Err(e) = manager.check_and_cleanup(&config).await {
            warn!(error = %e, "Cleanup pass failed");
        }
    });
}
