use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use thiserror::Error;

use crate::conflict::ConflictRecord;
use crate::outbox::QueuedMutation;
use crate::request::now_millis;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Entry not found")]
    NotFound,
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Data corruption detected for '{id}': expected hash {expected}, got {actual}")]
    Corruption {
        id: String,
        expected: String,
        actual: String,
    },
}

/// A cached snapshot of one successful response, scoped to a namespace.
///
/// Only 2xx responses ever become entries. The body is stored as raw bytes;
/// durable stores may compress it at rest (detected by magic, see
/// [`crate::compress`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    /// Request key within the namespace (method + path + query)
    pub key: String,
    /// Versioned namespace, `v{n}:{purpose}:{tenant}`
    pub namespace: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Epoch milliseconds at store time
    pub stored_at_ms: i64,
    #[serde(skip)]
    cached_size: OnceLock<usize>,
}

impl CachedEntry {
    pub fn new(
        namespace: impl Into<String>,
        key: impl Into<String>,
        status: u16,
        content_type: Option<String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            key: key.into(),
            namespace: namespace.into(),
            status,
            content_type,
            body,
            stored_at_ms: now_millis(),
            cached_size: OnceLock::new(),
        }
    }

    /// Approximate in-store footprint, computed once per entry.
    pub fn size_bytes(&self) -> usize {
        *self.cached_size.get_or_init(|| {
            self.key.len()
                + self.namespace.len()
                + self.content_type.as_ref().map_or(0, |c| c.len())
                + self.body.len()
                + 32
        })
    }

    /// Whether the entry was stored before the cutoff (for max-age purges)
    #[must_use]
    pub fn is_older_than(&self, cutoff_ms: i64) -> bool {
        self.stored_at_ms < cutoff_ms
    }
}

/// Aggregate usage reported by a cache store, fed to the quota manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageUsage {
    pub bytes: u64,
    pub entries: u64,
}

/// Tenant- and namespace-scoped response cache.
///
/// Keys are always qualified by namespace; nothing in the engine ever reads
/// an entry without naming the namespace first, which is what keeps tenants
/// isolated at the storage layer.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>, StorageError>;
    async fn put(&self, entry: &CachedEntry) -> Result<(), StorageError>;
    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError>;

    /// All namespaces currently holding at least one entry.
    async fn namespaces(&self) -> Result<Vec<String>, StorageError>;

    /// Keys of a namespace in enumeration order (oldest-first where the
    /// backend can provide it; arbitrary otherwise).
    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError>;

    /// Remove a whole namespace. Returns the number of entries removed.
    async fn purge_namespace(&self, namespace: &str) -> Result<usize, StorageError>;

    /// Remove entries of a namespace stored before the cutoff.
    /// Returns the number of entries removed.
    async fn purge_older_than(&self, namespace: &str, cutoff_ms: i64) -> Result<usize, StorageError>;

    /// Current aggregate usage.
    async fn usage(&self) -> Result<StorageUsage, StorageError>;
}

/// Durable queue of unconfirmed mutations awaiting replay.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn insert(&self, mutation: &QueuedMutation) -> Result<(), StorageError>;

    /// Persist state/attempt/last_error changes of an existing record.
    async fn update(&self, mutation: &QueuedMutation) -> Result<(), StorageError>;

    async fn remove(&self, id: &str) -> Result<(), StorageError>;
    async fn get(&self, id: &str) -> Result<Option<QueuedMutation>, StorageError>;

    /// Pending mutations of one tenant, oldest first (replay order).
    async fn pending_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError>;

    /// Every mutation of one tenant regardless of state, oldest first.
    async fn all_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError>;

    /// Tenants that currently have at least one pending mutation.
    async fn tenants_with_pending(&self) -> Result<Vec<String>, StorageError>;

    async fn count_pending(&self) -> Result<u64, StorageError>;
}

/// Registry of server-reported conflicts. Insertion is idempotent by id so
/// at-least-once replay can never produce duplicate records.
#[async_trait]
pub trait ConflictStore: Send + Sync {
    /// Insert unless a record with the same id exists.
    /// Returns true when the record was newly created.
    async fn insert_if_absent(&self, record: &ConflictRecord) -> Result<bool, StorageError>;

    async fn get(&self, id: &str) -> Result<Option<ConflictRecord>, StorageError>;

    /// All records, optionally narrowed to one tenant, newest first.
    async fn list(&self, tenant: Option<&str>) -> Result<Vec<ConflictRecord>, StorageError>;

    /// Set the resolution flag. Returns false when the id is unknown.
    async fn mark_resolved(&self, id: &str) -> Result<bool, StorageError>;

    async fn count_unresolved(&self) -> Result<u64, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_size_is_cached_and_plausible() {
        let entry = CachedEntry::new(
            "v3:api:acme",
            "GET /api/assets",
            200,
            Some("application/json".to_string()),
            vec![0u8; 256],
        );
        let first = entry.size_bytes();
        assert!(first >= 256);
        assert_eq!(first, entry.size_bytes());
    }

    #[test]
    fn test_entry_age_cutoff() {
        let entry = CachedEntry::new("v3:api:acme", "GET /api/assets", 200, None, vec![]);
        assert!(!entry.is_older_than(entry.stored_at_ms - 1_000));
        assert!(entry.is_older_than(entry.stored_at_ms + 1_000));
    }
}
