//! Offline mutation outbox.
//!
//! When a mutating request fails against the network, it is recorded here
//! and replayed once connectivity returns. The outbox is NOT a write buffer
//! for business state - every mutation is attempted against the server
//! first, and the server stays the single source of truth. Records exist
//! only for mutations the server has not yet confirmed.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::metrics;
use crate::request::{now_millis, HttpMethod, SyncRequest};
use crate::storage::traits::{OutboxStore, StorageError};

/// Replay lifecycle of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationState {
    /// Awaiting automatic replay
    Pending,
    /// Server reported a conflict; escalated, never auto-replayed
    Conflicted,
    /// Attempt cap reached; only manual retry can revive it
    Failed,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }
}

impl std::str::FromStr for MutationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "conflicted" => Ok(Self::Conflicted),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown mutation state: {}", other)),
        }
    }
}

/// A mutating request the server has not yet confirmed.
///
/// The id doubles as the correlation id returned to the caller in the 202
/// acknowledgment, so a UI can associate the eventual outcome with the
/// request it made.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMutation {
    pub id: String,
    pub tenant: String,
    pub method: HttpMethod,
    /// Original absolute URL, replayed verbatim
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub enqueued_at_ms: i64,
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub state: MutationState,
}

impl QueuedMutation {
    pub fn new(tenant: impl Into<String>, request: &SyncRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tenant: tenant.into(),
            method: request.method,
            url: request.url.to_string(),
            payload: request.body.clone(),
            enqueued_at_ms: now_millis(),
            attempt_count: 0,
            last_error: None,
            state: MutationState::Pending,
        }
    }

    /// Record a failed replay attempt. Returns true when the attempt cap is
    /// reached and the mutation has moved to [`MutationState::Failed`].
    pub fn record_failure(&mut self, error: &str, attempt_cap: u32) -> bool {
        self.attempt_count += 1;
        self.last_error = Some(error.to_string());
        if self.attempt_count >= attempt_cap {
            self.state = MutationState::Failed;
            true
        } else {
            false
        }
    }

    /// Mark as conflicted. Leaves attempt_count untouched - a conflict is a
    /// definitive server answer, not a failed attempt.
    pub fn mark_conflicted(&mut self) {
        self.state = MutationState::Conflicted;
    }

    /// Reset for a user-initiated retry: back to pending with a fresh
    /// attempt budget.
    pub fn reset_for_retry(&mut self) {
        self.state = MutationState::Pending;
        self.attempt_count = 0;
        self.last_error = None;
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == MutationState::Pending
    }

    /// Entity reference derived from the URL path, for conflict records.
    /// `/api/workitems/42/status` yields `("workitems", "42")`.
    pub fn entity_ref(&self) -> (String, String) {
        let path = url::Url::parse(&self.url)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| self.url.clone());
        let mut segments = path
            .split('/')
            .filter(|s| !s.is_empty() && *s != "api");
        let kind = segments.next().unwrap_or("unknown").to_string();
        let id = segments.next().unwrap_or("-").to_string();
        (kind, id)
    }
}

/// Read-only outbox telemetry.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SyncStats {
    /// Mutations currently awaiting replay
    pub pending: u64,
    /// Replay attempts since startup
    pub total_attempts: u64,
    /// Mutations confirmed by the server since startup
    pub successes: u64,
    /// Conflicts recorded since startup
    pub conflicts: u64,
    /// Mutations that hit the attempt cap since startup
    pub failures: u64,
    /// Epoch ms of the last confirmed replay, if any
    pub last_success_ms: Option<i64>,
    /// Whether a drain is currently in progress
    pub draining: bool,
}

/// Durable queue of unconfirmed mutations, backed by an [`OutboxStore`].
pub struct Outbox {
    store: Arc<dyn OutboxStore>,
    /// Records currently in pending state
    pending_count: AtomicU64,
    /// Replay attempts since startup
    total_attempts: AtomicU64,
    /// Confirmed replays since startup
    successes: AtomicU64,
    /// Conflicts recorded since startup
    conflicts: AtomicU64,
    /// Permanent failures since startup
    failures: AtomicU64,
    /// Epoch ms of last confirmed replay (0 = never)
    last_success_ms: AtomicI64,
    /// Whether a drain is in progress
    draining: AtomicBool,
    /// Soft ceiling used for pressure observability only
    soft_limit: u64,
}

impl Outbox {
    /// Open the outbox over a store, counting records left from a previous
    /// run so they are drained on the next reconnect. `soft_limit` is the
    /// ceiling that pressure logging works against; crossing 80% of it is
    /// logged, never rejected.
    pub async fn open(store: Arc<dyn OutboxStore>, soft_limit: u64) -> Result<Self, StorageError> {
        let pending = store.count_pending().await?;
        if pending > 0 {
            warn!(pending, "Outbox has mutations from previous run, will replay on reconnect");
        }
        metrics::set_outbox_pending(pending as usize);

        Ok(Self {
            store,
            pending_count: AtomicU64::new(pending),
            total_attempts: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            last_success_ms: AtomicI64::new(0),
            draining: AtomicBool::new(false),
            soft_limit: soft_limit.max(1),
        })
    }

    /// Queue a failed mutation for later replay. Returns the stored record,
    /// whose id is the caller's correlation id.
    pub async fn enqueue(
        &self,
        tenant: &str,
        request: &SyncRequest,
    ) -> Result<QueuedMutation, StorageError> {
        let mutation = QueuedMutation::new(tenant, request);
        self.store.insert(&mutation).await?;

        let pending = self.pending_count.fetch_add(1, Ordering::AcqRel) + 1;
        metrics::record_outbox_operation("enqueue");
        metrics::set_outbox_pending(pending as usize);

        if pending as f64 / self.soft_limit as f64 >= 0.8 {
            warn!(pending, soft_limit = self.soft_limit, "Outbox approaching soft limit");
        }

        debug!(
            id = %mutation.id,
            tenant = %mutation.tenant,
            method = %mutation.method,
            url = %mutation.url,
            pending,
            "Mutation queued for replay"
        );

        Ok(mutation)
    }

    /// Count one replay attempt (success or not) toward telemetry.
    pub fn note_attempt(&self) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
    }

    /// Server confirmed the mutation: remove it for good.
    pub async fn mark_replayed(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        self.store.remove(&mutation.id).await?;
        let pending = self.pending_count.fetch_sub(1, Ordering::AcqRel) - 1;
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms.store(now_millis(), Ordering::Release);
        metrics::record_outbox_operation("remove");
        metrics::set_outbox_pending(pending as usize);
        Ok(())
    }

    /// Server reported a conflict: persist the state change and take the
    /// record out of the automatic replay set.
    pub async fn mark_conflicted(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        debug_assert_eq!(mutation.state, MutationState::Conflicted);
        self.store.update(mutation).await?;
        let pending = self.pending_count.fetch_sub(1, Ordering::AcqRel) - 1;
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        metrics::set_outbox_pending(pending as usize);
        Ok(())
    }

    /// Persist a failed attempt. `now_permanent` says whether the record
    /// just crossed the attempt cap.
    pub async fn mark_attempt_failed(
        &self,
        mutation: &QueuedMutation,
        now_permanent: bool,
    ) -> Result<(), StorageError> {
        self.store.update(mutation).await?;
        if now_permanent {
            let pending = self.pending_count.fetch_sub(1, Ordering::AcqRel) - 1;
            self.failures.fetch_add(1, Ordering::Relaxed);
            metrics::set_outbox_pending(pending as usize);
            warn!(
                id = %mutation.id,
                tenant = %mutation.tenant,
                attempts = mutation.attempt_count,
                "Mutation permanently failed, excluded from automatic replay"
            );
        }
        Ok(())
    }

    /// User-initiated retry of a conflicted or failed mutation.
    /// Returns the refreshed record, pending again with a clean budget.
    pub async fn retry_manual(&self, id: &str) -> Result<QueuedMutation, StorageError> {
        let mut mutation = self.store.get(id).await?.ok_or(StorageError::NotFound)?;
        let was_pending = mutation.is_pending();
        mutation.reset_for_retry();
        self.store.update(&mutation).await?;
        if !was_pending {
            let pending = self.pending_count.fetch_add(1, Ordering::AcqRel) + 1;
            metrics::set_outbox_pending(pending as usize);
        }
        metrics::record_outbox_operation("retry");
        Ok(mutation)
    }

    /// Explicit manual discard; the only path that destroys an unconfirmed
    /// mutation without a server answer.
    pub async fn discard(&self, id: &str) -> Result<(), StorageError> {
        let mutation = self.store.get(id).await?.ok_or(StorageError::NotFound)?;
        self.store.remove(id).await?;
        if mutation.is_pending() {
            let pending = self.pending_count.fetch_sub(1, Ordering::AcqRel) - 1;
            metrics::set_outbox_pending(pending as usize);
        }
        metrics::record_outbox_operation("discard");
        Ok(())
    }

    pub async fn pending_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError> {
        self.store.pending_for_tenant(tenant).await
    }

    pub async fn all_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError> {
        self.store.all_for_tenant(tenant).await
    }

    pub async fn tenants_with_pending(&self) -> Result<Vec<String>, StorageError> {
        self.store.tenants_with_pending().await
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    /// Take the drain lock. Returns None when a drain is already running,
    /// in which case the caller skips this trigger.
    pub fn try_begin_drain(&self) -> Option<DrainGuard<'_>> {
        if self.draining.swap(true, Ordering::AcqRel) {
            return None;
        }
        Some(DrainGuard(&self.draining))
    }

    #[must_use]
    pub fn stats(&self) -> SyncStats {
        let last = self.last_success_ms.load(Ordering::Acquire);
        SyncStats {
            pending: self.pending_count.load(Ordering::Acquire),
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_success_ms: (last > 0).then_some(last),
            draining: self.draining.load(Ordering::Acquire),
        }
    }
}

/// RAII guard resetting the draining flag.
pub struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryOutboxStore;
    use serde_json::json;

    fn put_request(url: &str) -> SyncRequest {
        SyncRequest::new(HttpMethod::Put, url)
            .unwrap()
            .with_body(json!({"status": "done"}))
    }

    async fn open_outbox() -> Outbox {
        Outbox::open(Arc::new(MemoryOutboxStore::new()), 10_000).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_stats() {
        let outbox = open_outbox().await;
        assert!(!outbox.has_pending());

        let req = put_request("https://ops.example.com/api/workitems/42/status");
        let queued = outbox.enqueue("acme", &req).await.unwrap();

        assert_eq!(queued.tenant, "acme");
        assert_eq!(queued.attempt_count, 0);
        assert_eq!(queued.state, MutationState::Pending);
        assert!(outbox.has_pending());
        assert_eq!(outbox.stats().pending, 1);
    }

    #[tokio::test]
    async fn test_replayed_removes_record() {
        let outbox = open_outbox().await;
        let req = put_request("https://ops.example.com/api/workitems/42/status");
        let queued = outbox.enqueue("acme", &req).await.unwrap();

        outbox.note_attempt();
        outbox.mark_replayed(&queued).await.unwrap();

        assert!(!outbox.has_pending());
        let stats = outbox.stats();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.total_attempts, 1);
        assert!(stats.last_success_ms.is_some());
        assert!(outbox.pending_for_tenant("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_attempt_cap_marks_failed() {
        let outbox = open_outbox().await;
        let req = put_request("https://ops.example.com/api/workitems/42/status");
        let mut queued = outbox.enqueue("acme", &req).await.unwrap();

        for attempt in 1..=3u32 {
            let permanent = queued.record_failure("connection refused", 3);
            assert_eq!(permanent, attempt == 3);
            outbox.mark_attempt_failed(&queued, permanent).await.unwrap();
        }

        assert_eq!(queued.state, MutationState::Failed);
        assert!(!outbox.has_pending());
        // Still present for manual management
        let all = outbox.all_for_tenant("acme").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state, MutationState::Failed);
    }

    #[tokio::test]
    async fn test_conflict_does_not_touch_attempts() {
        let outbox = open_outbox().await;
        let req = put_request("https://ops.example.com/api/workitems/42/status");
        let mut queued = outbox.enqueue("acme", &req).await.unwrap();

        queued.mark_conflicted();
        outbox.mark_conflicted(&queued).await.unwrap();

        let all = outbox.all_for_tenant("acme").await.unwrap();
        assert_eq!(all[0].state, MutationState::Conflicted);
        assert_eq!(all[0].attempt_count, 0);
        assert!(!outbox.has_pending());
    }

    #[tokio::test]
    async fn test_manual_retry_revives_failed() {
        let outbox = open_outbox().await;
        let req = put_request("https://ops.example.com/api/workitems/42/status");
        let mut queued = outbox.enqueue("acme", &req).await.unwrap();

        for _ in 0..3 {
            let permanent = queued.record_failure("boom", 3);
            outbox.mark_attempt_failed(&queued, permanent).await.unwrap();
        }
        assert!(!outbox.has_pending());

        let revived = outbox.retry_manual(&queued.id).await.unwrap();
        assert_eq!(revived.state, MutationState::Pending);
        assert_eq!(revived.attempt_count, 0);
        assert!(revived.last_error.is_none());
        assert!(outbox.has_pending());
    }

    #[tokio::test]
    async fn test_discard_removes_without_replay() {
        let outbox = open_outbox().await;
        let req = put_request("https://ops.example.com/api/workitems/42/status");
        let queued = outbox.enqueue("acme", &req).await.unwrap();

        outbox.discard(&queued.id).await.unwrap();
        assert!(!outbox.has_pending());
        assert!(outbox.all_for_tenant("acme").await.unwrap().is_empty());

        // Discarding again reports NotFound
        let err = outbox.discard(&queued.id).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }

    #[tokio::test]
    async fn test_drain_guard_is_exclusive() {
        let outbox = open_outbox().await;

        let guard = outbox.try_begin_drain();
        assert!(guard.is_some());
        assert!(outbox.try_begin_drain().is_none());
        assert!(outbox.stats().draining);

        drop(guard);
        assert!(outbox.try_begin_drain().is_some());
    }

    #[test]
    fn test_entity_ref_from_url() {
        let req = put_request("https://ops.example.com/api/workitems/42/status");
        let m = QueuedMutation::new("acme", &req);
        assert_eq!(m.entity_ref(), ("workitems".to_string(), "42".to_string()));

        let create = SyncRequest::new(HttpMethod::Post, "https://ops.example.com/api/workitems").unwrap();
        let m2 = QueuedMutation::new("acme", &create);
        assert_eq!(m2.entity_ref(), ("workitems".to_string(), "-".to_string()));
    }

    #[test]
    fn test_state_parse_roundtrip() {
        for s in [MutationState::Pending, MutationState::Conflicted, MutationState::Failed] {
            let parsed: MutationState = s.as_str().parse().unwrap();
            assert_eq!(parsed, s);
        }
        assert!("unknown".parse::<MutationState>().is_err());
    }
}
