//! Connectivity detection.
//!
//! Online/offline state is inferred from real traffic: every upstream
//! attempt reports its outcome here. Three consecutive transport failures
//! flip the state to offline; a single success flips it back. While
//! offline, the engine probes a health endpoint and feeds the results
//! through the same path, so recovery is detected even with no user
//! traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::metrics;
use crate::transport::HttpTransport;

/// Consecutive transport failures before the engine considers itself offline.
pub const OFFLINE_FAILURE_THRESHOLD: u64 = 3;

pub struct ConnectivityMonitor {
    /// Current state; receivers wake on every transition
    state_tx: watch::Sender<bool>,
    /// Consecutive failure count
    failures: AtomicU64,
    /// Threshold for the offline flip
    threshold: u64,
    /// Lock for active probes (prevent thundering herd)
    probing: Mutex<()>,
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self::with_threshold(OFFLINE_FAILURE_THRESHOLD)
    }

    pub fn with_threshold(threshold: u64) -> Self {
        // Assume online until proven otherwise
        let (state_tx, _) = watch::channel(true);
        metrics::set_connectivity_online(true);
        Self {
            state_tx,
            failures: AtomicU64::new(0),
            threshold: threshold.max(1),
            probing: Mutex::new(()),
        }
    }

    /// Record a successful upstream exchange. Any response counts, even an
    /// HTTP error status; reaching the server means the network works.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        let changed = self.state_tx.send_if_modified(|online| {
            if !*online {
                *online = true;
                true
            } else {
                false
            }
        });
        if changed {
            info!("Connectivity restored");
            metrics::record_connectivity_transition("online");
            metrics::set_connectivity_online(true);
        }
    }

    /// Record a transport-level failure (connect, timeout, DNS).
    pub fn record_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= self.threshold {
            let changed = self.state_tx.send_if_modified(|online| {
                if *online {
                    *online = false;
                    true
                } else {
                    false
                }
            });
            if changed {
                warn!(consecutive_failures = failures, "Connectivity lost, entering offline mode");
                metrics::record_connectivity_transition("offline");
                metrics::set_connectivity_online(false);
            }
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state_tx.borrow()
    }

    /// Consecutive failure count since the last success.
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Watch for transitions. The receiver sees the current state
    /// immediately and wakes on every flip.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    /// Active reachability probe against the health endpoint. The outcome
    /// feeds the same counters as live traffic.
    pub async fn probe_once(&self, transport: &dyn HttpTransport, health_url: &str) -> bool {
        // Prevent multiple simultaneous probes
        let _guard = self.probing.lock().await;

        match transport.probe(health_url).await {
            Ok(()) => {
                self.record_success();
                true
            }
            Err(e) => {
                self.record_failure();
                tracing::debug!(error = %e, "Health probe failed");
                false
            }
        }
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
