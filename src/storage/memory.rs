use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use super::traits::{
    CacheStore, CachedEntry, ConflictStore, OutboxStore, StorageError, StorageUsage,
};
use crate::conflict::ConflictRecord;
use crate::outbox::{MutationState, QueuedMutation};

/// In-memory cache store for tests and ephemeral deployments.
///
/// Byte usage is tracked with atomics on every insert/remove so `usage()`
/// never has to walk the map.
pub struct MemoryCacheStore {
    data: DashMap<(String, String), CachedEntry>,
    bytes: AtomicU64,
}

impl MemoryCacheStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: DashMap::new(),
            bytes: AtomicU64::new(0),
        }
    }

    /// Get current entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all entries
    pub fn clear(&self) {
        self.data.clear();
        self.bytes.store(0, Ordering::Release);
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>, StorageError> {
        let composite = (namespace.to_string(), key.to_string());
        Ok(self.data.get(&composite).map(|r| r.value().clone()))
    }

    async fn put(&self, entry: &CachedEntry) -> Result<(), StorageError> {
        let composite = (entry.namespace.clone(), entry.key.clone());
        let added = entry.size_bytes() as u64;
        if let Some(old) = self.data.insert(composite, entry.clone()) {
            self.bytes.fetch_sub(old.size_bytes() as u64, Ordering::AcqRel);
        }
        self.bytes.fetch_add(added, Ordering::AcqRel);
        Ok(())
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let composite = (namespace.to_string(), key.to_string());
        if let Some((_, old)) = self.data.remove(&composite) {
            self.bytes.fetch_sub(old.size_bytes() as u64, Ordering::AcqRel);
        }
        Ok(())
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self.data.iter().map(|e| e.key().0.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        // Oldest first, which is what quota eviction wants
        let mut entries: Vec<(String, i64)> = self
            .data
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| (e.key().1.clone(), e.value().stored_at_ms))
            .collect();
        entries.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(entries.into_iter().map(|(k, _)| k).collect())
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<usize, StorageError> {
        let victims: Vec<(String, String)> = self
            .data
            .iter()
            .filter(|e| e.key().0 == namespace)
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in victims {
            if let Some((_, old)) = self.data.remove(&key) {
                self.bytes.fetch_sub(old.size_bytes() as u64, Ordering::AcqRel);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn purge_older_than(&self, namespace: &str, cutoff_ms: i64) -> Result<usize, StorageError> {
        let victims: Vec<(String, String)> = self
            .data
            .iter()
            .filter(|e| e.key().0 == namespace && e.value().is_older_than(cutoff_ms))
            .map(|e| e.key().clone())
            .collect();
        let mut removed = 0;
        for key in victims {
            if let Some((_, old)) = self.data.remove(&key) {
                self.bytes.fetch_sub(old.size_bytes() as u64, Ordering::AcqRel);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        Ok(StorageUsage {
            bytes: self.bytes.load(Ordering::Acquire),
            entries: self.data.len() as u64,
        })
    }
}

/// In-memory outbox store.
pub struct MemoryOutboxStore {
    data: DashMap<String, QueuedMutation>,
}

impl MemoryOutboxStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }

    fn sorted_fifo(mut records: Vec<QueuedMutation>) -> Vec<QueuedMutation> {
        records.sort_by(|a, b| {
            a.enqueued_at_ms
                .cmp(&b.enqueued_at_ms)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn insert(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        self.data.insert(mutation.id.clone(), mutation.clone());
        Ok(())
    }

    async fn update(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        if !self.data.contains_key(&mutation.id) {
            return Err(StorageError::NotFound);
        }
        self.data.insert(mutation.id.clone(), mutation.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.data.remove(id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<QueuedMutation>, StorageError> {
        Ok(self.data.get(id).map(|r| r.value().clone()))
    }

    async fn pending_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError> {
        let records: Vec<QueuedMutation> = self
            .data
            .iter()
            .filter(|e| e.value().tenant == tenant && e.value().state == MutationState::Pending)
            .map(|e| e.value().clone())
            .collect();
        Ok(Self::sorted_fifo(records))
    }

    async fn all_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError> {
        let records: Vec<QueuedMutation> = self
            .data
            .iter()
            .filter(|e| e.value().tenant == tenant)
            .map(|e| e.value().clone())
            .collect();
        Ok(Self::sorted_fifo(records))
    }

    async fn tenants_with_pending(&self) -> Result<Vec<String>, StorageError> {
        let mut tenants: Vec<String> = self
            .data
            .iter()
            .filter(|e| e.value().state == MutationState::Pending)
            .map(|e| e.value().tenant.clone())
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }

    async fn count_pending(&self) -> Result<u64, StorageError> {
        Ok(self
            .data
            .iter()
            .filter(|e| e.value().state == MutationState::Pending)
            .count() as u64)
    }
}

/// In-memory conflict store.
pub struct MemoryConflictStore {
    data: DashMap<String, ConflictRecord>,
}

impl MemoryConflictStore {
    #[must_use]
    pub fn new() -> Self {
        Self { data: DashMap::new() }
    }
}

impl Default for MemoryConflictStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConflictStore for MemoryConflictStore {
    async fn insert_if_absent(&self, record: &ConflictRecord) -> Result<bool, StorageError> {
        match self.data.entry(record.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(true)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Option<ConflictRecord>, StorageError> {
        Ok(self.data.get(id).map(|r| r.value().clone()))
    }

    async fn list(&self, tenant: Option<&str>) -> Result<Vec<ConflictRecord>, StorageError> {
        let mut records: Vec<ConflictRecord> = self
            .data
            .iter()
            .filter(|e| tenant.map_or(true, |t| e.value().tenant == t))
            .map(|e| e.value().clone())
            .collect();
        // Newest first
        records.sort_by(|a, b| b.remote_timestamp_ms.cmp(&a.remote_timestamp_ms));
        Ok(records)
    }

    async fn mark_resolved(&self, id: &str) -> Result<bool, StorageError> {
        match self.data.get_mut(id) {
            Some(mut record) => {
                record.resolved = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count_unresolved(&self) -> Result<u64, StorageError> {
        Ok(self.data.iter().filter(|e| !e.value().resolved).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(namespace: &str, key: &str, body_len: usize) -> CachedEntry {
        CachedEntry::new(
            namespace,
            key,
            200,
            Some("application/json".to_string()),
            vec![b'x'; body_len],
        )
    }

    #[tokio::test]
    async fn test_new_store_is_empty() {
        let store = MemoryCacheStore::new();
        assert!(store.is_empty());
        assert_eq!(store.len(), 0);
        let usage = store.usage().await.unwrap();
        assert_eq!(usage.bytes, 0);
        assert_eq!(usage.entries, 0);
    }

    #[tokio::test]
    async fn test_put_get_namespaced() {
        let store = MemoryCacheStore::new();
        store.put(&entry("v3:api:acme", "GET /api/assets", 10)).await.unwrap();

        let hit = store.get("v3:api:acme", "GET /api/assets").await.unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().status, 200);

        // Same key under a different namespace is a distinct entry
        let miss = store.get("v3:api:globex", "GET /api/assets").await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn test_put_replaces_and_tracks_bytes() {
        let store = MemoryCacheStore::new();
        store.put(&entry("v3:api:acme", "GET /api/assets", 100)).await.unwrap();
        let before = store.usage().await.unwrap();

        store.put(&entry("v3:api:acme", "GET /api/assets", 10)).await.unwrap();
        let after = store.usage().await.unwrap();

        assert_eq!(after.entries, 1);
        assert!(after.bytes < before.bytes);

        store.delete("v3:api:acme", "GET /api/assets").await.unwrap();
        let emptied = store.usage().await.unwrap();
        assert_eq!(emptied.bytes, 0);
        assert_eq!(emptied.entries, 0);
    }

    #[tokio::test]
    async fn test_purge_namespace() {
        let store = MemoryCacheStore::new();
        store.put(&entry("v2:api:acme", "GET /api/assets", 10)).await.unwrap();
        store.put(&entry("v2:api:acme", "GET /api/services", 10)).await.unwrap();
        store.put(&entry("v3:api:acme", "GET /api/assets", 10)).await.unwrap();

        let removed = store.purge_namespace("v2:api:acme").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.namespaces().await.unwrap(), vec!["v3:api:acme"]);
    }

    #[tokio::test]
    async fn test_keys_oldest_first() {
        let store = MemoryCacheStore::new();
        let mut first = entry("v3:dynamic:acme", "GET /a", 1);
        first.stored_at_ms = 1000;
        let mut second = entry("v3:dynamic:acme", "GET /b", 1);
        second.stored_at_ms = 2000;
        let mut third = entry("v3:dynamic:acme", "GET /c", 1);
        third.stored_at_ms = 3000;

        // Insert out of order
        store.put(&second).await.unwrap();
        store.put(&third).await.unwrap();
        store.put(&first).await.unwrap();

        let keys = store.keys("v3:dynamic:acme").await.unwrap();
        assert_eq!(keys, vec!["GET /a", "GET /b", "GET /c"]);
    }

    #[tokio::test]
    async fn test_purge_older_than() {
        let store = MemoryCacheStore::new();
        let mut stale = entry("v3:api:acme", "GET /old", 1);
        stale.stored_at_ms = 1000;
        let fresh = entry("v3:api:acme", "GET /new", 1);

        store.put(&stale).await.unwrap();
        store.put(&fresh).await.unwrap();

        let removed = store.purge_older_than("v3:api:acme", 2000).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("v3:api:acme", "GET /old").await.unwrap().is_none());
        assert!(store.get("v3:api:acme", "GET /new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_outbox_store_fifo_and_filters() {
        use crate::request::{HttpMethod, SyncRequest};

        let store = MemoryOutboxStore::new();
        let req = SyncRequest::new(HttpMethod::Put, "https://ops.example.com/api/workitems/1").unwrap();

        let mut first = QueuedMutation::new("acme", &req);
        first.enqueued_at_ms = 1000;
        let mut second = QueuedMutation::new("acme", &req);
        second.enqueued_at_ms = 2000;
        let mut other = QueuedMutation::new("globex", &req);
        other.enqueued_at_ms = 1500;

        store.insert(&second).await.unwrap();
        store.insert(&first).await.unwrap();
        store.insert(&other).await.unwrap();

        let pending = store.pending_for_tenant("acme").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].id, first.id);
        assert_eq!(pending[1].id, second.id);

        let tenants = store.tenants_with_pending().await.unwrap();
        assert_eq!(tenants, vec!["acme", "globex"]);
        assert_eq!(store.count_pending().await.unwrap(), 3);

        // Conflicted records drop out of the pending view but not the full view
        let mut conflicted = first.clone();
        conflicted.mark_conflicted();
        store.update(&conflicted).await.unwrap();
        assert_eq!(store.pending_for_tenant("acme").await.unwrap().len(), 1);
        assert_eq!(store.all_for_tenant("acme").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_outbox_update_unknown_id() {
        use crate::request::{HttpMethod, SyncRequest};

        let store = MemoryOutboxStore::new();
        let req = SyncRequest::new(HttpMethod::Put, "https://ops.example.com/api/workitems/1").unwrap();
        let ghost = QueuedMutation::new("acme", &req);

        let err = store.update(&ghost).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound));
    }
}
