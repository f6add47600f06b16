// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for opsync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application is responsible for choosing the exporter
//! (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `opsync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//! - `_bytes` suffix for size gauges
//!
//! # Labels
//! - `class`: static, network_only, critical, api, dynamic
//! - `purpose`: static, critical, api, dynamic (cache namespace purpose)
//! - `operation`: get, put, delete, purge
//! - `status`: success, error, miss
//! - `outcome`: replayed, conflicted, failed, requeued

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a handled request by classification and outcome
pub fn record_request(class: &str, outcome: &str) {
    counter!(
        "opsync_requests_total",
        "class" => class.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a cache store operation
pub fn record_cache_operation(purpose: &str, operation: &str, status: &str) {
    counter!(
        "opsync_cache_operations_total",
        "purpose" => purpose.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record request handling latency
pub fn record_request_latency(class: &str, duration: Duration) {
    histogram!(
        "opsync_request_seconds",
        "class" => class.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// OUTBOX - Queued mutations and replay
// ═══════════════════════════════════════════════════════════════════════════

/// Record an outbox operation (enqueue, remove, discard, retry)
pub fn record_outbox_operation(operation: &str) {
    counter!(
        "opsync_outbox_operations_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set outbox pending depth
pub fn set_outbox_pending(count: usize) {
    gauge!("opsync_outbox_pending").set(count as f64);
}

/// Record a single replay outcome
pub fn record_replay(outcome: &str) {
    counter!(
        "opsync_replay_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a full drain pass duration
pub fn record_drain_duration(duration: Duration) {
    histogram!("opsync_drain_seconds").record(duration.as_secs_f64());
}

/// Record a detected conflict
pub fn record_conflict(tenant: &str) {
    counter!(
        "opsync_conflicts_total",
        "tenant" => tenant.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// STORAGE QUOTA - Usage and cleanup
// ═══════════════════════════════════════════════════════════════════════════

/// Set estimated storage usage in bytes
pub fn set_storage_used_bytes(bytes: u64) {
    gauge!("opsync_storage_used_bytes").set(bytes as f64);
}

/// Set storage usage ratio (0.0 - 1.0+)
pub fn set_storage_pressure(ratio: f64) {
    gauge!("opsync_storage_pressure").set(ratio);
}

/// Record a cleanup phase result
pub fn record_cleanup(phase: &str, removed: usize) {
    counter!(
        "opsync_cleanup_removed_total",
        "phase" => phase.to_string()
    )
    .increment(removed as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTIVITY - Online/offline detection
// ═══════════════════════════════════════════════════════════════════════════

/// Set connectivity status (1 = online, 0 = offline)
pub fn set_connectivity_online(online: bool) {
    gauge!("opsync_connectivity_online").set(if online { 1.0 } else { 0.0 });
}

/// Record an offline/online transition
pub fn record_connectivity_transition(to: &str) {
    counter!(
        "opsync_connectivity_transitions_total",
        "to" => to.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// BRIDGE - Foreground messaging
// ═══════════════════════════════════════════════════════════════════════════

/// Record a broadcast event sent to foreground instances
pub fn record_broadcast(event: &str) {
    counter!(
        "opsync_broadcasts_total",
        "event" => event.to_string()
    )
    .increment(1);
}

/// Record a client message received from a foreground instance
pub fn record_client_message(message: &str) {
    counter!(
        "opsync_client_messages_total",
        "message" => message.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// STARTUP - Timing for cold start monitoring
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "opsync_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "opsync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records request latency on drop
pub struct LatencyTimer {
    class: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(class: &'static str) -> Self {
        Self {
            class,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_request_latency(self.class, self.start.elapsed());
    }
}
