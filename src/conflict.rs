//! Conflict registry.
//!
//! A conflict is a definitive server answer, not a transient failure, so
//! records here are never retried and never expire on their own. The
//! registry only creates; resolution is a flag set by the foreground
//! application once a human (or automation it invokes) has decided.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::metrics;
use crate::outbox::QueuedMutation;
use crate::request::now_millis;
use crate::storage::traits::{ConflictStore, StorageError};

/// A server-reported mismatch between a submitted mutation and current
/// server state.
///
/// The id is the conflicting mutation's correlation id, which makes
/// creation naturally idempotent under at-least-once replay: replaying the
/// same mutation twice can never mint two records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: String,
    pub tenant: String,
    pub entity_kind: String,
    pub entity_id: String,
    /// What the client tried to write
    pub local_value: Value,
    /// What the server holds, taken from the conflict response body
    pub remote_value: Value,
    pub local_timestamp_ms: i64,
    pub remote_timestamp_ms: i64,
    /// Always false by default; reserved for future merge rules
    pub auto_resolvable: bool,
    /// Set by the foreground application, never by the engine
    pub resolved: bool,
}

impl ConflictRecord {
    /// Build a record from a conflicted replay and the server's response
    /// body (remote value `null` when the body was absent or not JSON).
    pub fn from_replay(mutation: &QueuedMutation, remote_value: Value) -> Self {
        let (entity_kind, entity_id) = mutation.entity_ref();
        Self {
            id: mutation.id.clone(),
            tenant: mutation.tenant.clone(),
            entity_kind,
            entity_id,
            local_value: mutation.payload.clone().unwrap_or(Value::Null),
            remote_value,
            local_timestamp_ms: mutation.enqueued_at_ms,
            remote_timestamp_ms: now_millis(),
            auto_resolvable: false,
            resolved: false,
        }
    }
}

/// Store-backed registry with create-once semantics.
pub struct ConflictRegistry {
    store: Arc<dyn ConflictStore>,
}

impl ConflictRegistry {
    pub fn new(store: Arc<dyn ConflictStore>) -> Self {
        Self { store }
    }

    /// Record a conflict. Returns true when the record was newly created;
    /// callers broadcast only in that case, which keeps duplicate replays
    /// silent.
    pub async fn record(&self, record: &ConflictRecord) -> Result<bool, StorageError> {
        let created = self.store.insert_if_absent(record).await?;
        if created {
            metrics::record_conflict(&record.tenant);
            info!(
                id = %record.id,
                tenant = %record.tenant,
                entity_kind = %record.entity_kind,
                entity_id = %record.entity_id,
                "Conflict recorded"
            );
        }
        Ok(created)
    }

    pub async fn get(&self, id: &str) -> Result<Option<ConflictRecord>, StorageError> {
        self.store.get(id).await
    }

    /// All conflicts, optionally narrowed to one tenant, newest first.
    pub async fn list(&self, tenant: Option<&str>) -> Result<Vec<ConflictRecord>, StorageError> {
        self.store.list(tenant).await
    }

    /// Foreground resolution flag. Returns false for an unknown id.
    pub async fn mark_resolved(&self, id: &str) -> Result<bool, StorageError> {
        self.store.mark_resolved(id).await
    }

    pub async fn unresolved_count(&self) -> Result<u64, StorageError> {
        self.store.count_unresolved().await
    }
}
