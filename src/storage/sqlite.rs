// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite storage backend for the durable host state.
//!
//! One database file holds all three kinds of durable state:
//!
//! ```sql
//! CREATE TABLE cache_entries (
//!   namespace TEXT NOT NULL,      -- v{n}:{purpose}:{tenant}
//!   key TEXT NOT NULL,            -- method + path + query
//!   status INTEGER NOT NULL,
//!   content_type TEXT,
//!   body BLOB,                    -- zstd-compressed when it pays off
//!   stored_at INTEGER NOT NULL,   -- epoch ms
//!   PRIMARY KEY (namespace, key)
//! )
//!
//! CREATE TABLE outbox_mutations (
//!   id TEXT PRIMARY KEY,          -- correlation id
//!   tenant TEXT NOT NULL,
//!   method TEXT NOT NULL,
//!   url TEXT NOT NULL,
//!   payload TEXT,                 -- JSON as text (sqlx Any driver limitation)
//!   payload_hash TEXT NOT NULL,   -- sha256 of payload, verified on read
//!   enqueued_at INTEGER NOT NULL,
//!   attempt_count INTEGER NOT NULL,
//!   last_error TEXT,
//!   state TEXT NOT NULL           -- pending | conflicted | failed
//! )
//!
//! CREATE TABLE conflict_records (
//!   id TEXT PRIMARY KEY,
//!   tenant TEXT NOT NULL,
//!   entity_kind TEXT NOT NULL,
//!   entity_id TEXT NOT NULL,
//!   local_value TEXT,
//!   remote_value TEXT,
//!   local_timestamp INTEGER NOT NULL,
//!   remote_timestamp INTEGER NOT NULL,
//!   auto_resolvable INTEGER NOT NULL,
//!   resolved INTEGER NOT NULL
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! JSON lives in TEXT columns because sqlx's `Any` driver has no JSON type
//! mapping, and TEXT columns sometimes come back as bytes, so every text
//! read falls back to a `Vec<u8>` + UTF-8 conversion.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::{any::AnyPoolOptions, AnyPool, Row};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use super::traits::{
    CacheStore, CachedEntry, ConflictStore, OutboxStore, StorageError, StorageUsage,
};
use crate::compress::{maybe_compress, maybe_decompress};
use crate::conflict::ConflictRecord;
use crate::outbox::QueuedMutation;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Integrity hash over a mutation's JSON payload ("" payload for none).
/// Mutations are user work that must survive restarts intact, so reads
/// verify this and surface corruption instead of replaying damaged data.
fn payload_hash(payload: &Option<serde_json::Value>) -> String {
    let text = payload.as_ref().map(|v| v.to_string()).unwrap_or_default();
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Read a TEXT column that the Any driver may hand back as bytes.
fn try_get_text(row: &sqlx::any::AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

pub struct SqliteStore {
    pool: AnyPool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let url = format!("sqlite://{}?mode=rwc", path.as_ref().to_string_lossy());
        Self::new(&url).await
    }

    /// Create a store from a sqlite connection string, with startup-mode
    /// retry (fails fast if the path is wrong).
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let pool = retry("sqlite_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(8)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool };
        store.enable_wal_mode().await?;
        store.init_schema().await?;
        Ok(store)
    }

    /// Get a clone of the connection pool for sharing.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Enable WAL journal mode: concurrent reads during writes and a single
    /// fsync per commit. NORMAL synchronous is safe under WAL.
    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS cache_entries (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                status INTEGER NOT NULL,
                content_type TEXT,
                body BLOB,
                stored_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_cache_stored_at ON cache_entries(namespace, stored_at)",
            r#"
            CREATE TABLE IF NOT EXISTS outbox_mutations (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                payload TEXT,
                payload_hash TEXT NOT NULL DEFAULT '',
                enqueued_at INTEGER NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                state TEXT NOT NULL DEFAULT 'pending'
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_outbox_tenant_state ON outbox_mutations(tenant, state, enqueued_at)",
            r#"
            CREATE TABLE IF NOT EXISTS conflict_records (
                id TEXT PRIMARY KEY,
                tenant TEXT NOT NULL,
                entity_kind TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                local_value TEXT,
                remote_value TEXT,
                local_timestamp INTEGER NOT NULL,
                remote_timestamp INTEGER NOT NULL,
                auto_resolvable INTEGER NOT NULL DEFAULT 0,
                resolved INTEGER NOT NULL DEFAULT 0
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_conflict_tenant ON conflict_records(tenant, resolved)",
        ];

        for sql in statements {
            retry("sqlite_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }

        Ok(())
    }

    fn row_to_entry(row: &sqlx::any::AnyRow) -> Result<CachedEntry, StorageError> {
        let namespace: String = try_get_text(row, "namespace")
            .ok_or_else(|| StorageError::Backend("cache row missing namespace".to_string()))?;
        let key: String = try_get_text(row, "key")
            .ok_or_else(|| StorageError::Backend("cache row missing key".to_string()))?;
        let status: i64 = row.try_get("status").unwrap_or(200);
        let content_type = try_get_text(row, "content_type");
        let stored_at: i64 = row.try_get("stored_at").unwrap_or(0);

        let raw_body: Vec<u8> = row.try_get("body").unwrap_or_default();
        let body = maybe_decompress(&raw_body)
            .map_err(|e| StorageError::Backend(format!("body decompression failed: {}", e)))?;

        let mut entry = CachedEntry::new(namespace, key, status as u16, content_type, body);
        entry.stored_at_ms = stored_at;
        Ok(entry)
    }

    fn row_to_mutation(row: &sqlx::any::AnyRow) -> Result<QueuedMutation, StorageError> {
        let id = try_get_text(row, "id")
            .ok_or_else(|| StorageError::Backend("outbox row missing id".to_string()))?;
        let tenant = try_get_text(row, "tenant")
            .ok_or_else(|| StorageError::Backend("outbox row missing tenant".to_string()))?;
        let method_str = try_get_text(row, "method")
            .ok_or_else(|| StorageError::Backend("outbox row missing method".to_string()))?;
        let method = method_str
            .parse()
            .map_err(|e| StorageError::Backend(format!("outbox row {}: {}", id, e)))?;
        let url = try_get_text(row, "url")
            .ok_or_else(|| StorageError::Backend("outbox row missing url".to_string()))?;
        let payload: Option<serde_json::Value> = try_get_text(row, "payload")
            .and_then(|s| serde_json::from_str(&s).ok());

        let expected = try_get_text(row, "payload_hash").unwrap_or_default();
        let actual = payload_hash(&payload);
        if !expected.is_empty() && expected != actual {
            return Err(StorageError::Corruption {
                id,
                expected,
                actual,
            });
        }

        let enqueued_at_ms: i64 = row.try_get("enqueued_at").unwrap_or(0);
        let attempt_count: i64 = row.try_get("attempt_count").unwrap_or(0);
        let last_error = try_get_text(row, "last_error");
        let state_str = try_get_text(row, "state").unwrap_or_else(|| "pending".to_string());
        let state = state_str
            .parse()
            .map_err(|e| StorageError::Backend(format!("outbox row {}: {}", id, e)))?;

        Ok(QueuedMutation {
            id,
            tenant,
            method,
            url,
            payload,
            enqueued_at_ms,
            attempt_count: attempt_count as u32,
            last_error,
            state,
        })
    }

    fn row_to_conflict(row: &sqlx::any::AnyRow) -> Result<ConflictRecord, StorageError> {
        let parse_value = |s: Option<String>| {
            s.and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null)
        };

        Ok(ConflictRecord {
            id: try_get_text(row, "id")
                .ok_or_else(|| StorageError::Backend("conflict row missing id".to_string()))?,
            tenant: try_get_text(row, "tenant")
                .ok_or_else(|| StorageError::Backend("conflict row missing tenant".to_string()))?,
            entity_kind: try_get_text(row, "entity_kind").unwrap_or_default(),
            entity_id: try_get_text(row, "entity_id").unwrap_or_default(),
            local_value: parse_value(try_get_text(row, "local_value")),
            remote_value: parse_value(try_get_text(row, "remote_value")),
            local_timestamp_ms: row.try_get("local_timestamp").unwrap_or(0),
            remote_timestamp_ms: row.try_get("remote_timestamp").unwrap_or(0),
            auto_resolvable: row.try_get::<i64, _>("auto_resolvable").unwrap_or(0) != 0,
            resolved: row.try_get::<i64, _>("resolved").unwrap_or(0) != 0,
        })
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>, StorageError> {
        let namespace = namespace.to_string();
        let key = key.to_string();

        retry("cache_get", &RetryConfig::query(), || async {
            let result = sqlx::query(
                "SELECT namespace, key, status, content_type, body, stored_at FROM cache_entries WHERE namespace = ? AND key = ?",
            )
            .bind(&namespace)
            .bind(&key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

            match result {
                Some(row) => Ok(Some(Self::row_to_entry(&row)?)),
                None => Ok(None),
            }
        })
        .await
    }

    async fn put(&self, entry: &CachedEntry) -> Result<(), StorageError> {
        let body = maybe_compress(&entry.body);

        retry("cache_put", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO cache_entries (namespace, key, status, content_type, body, stored_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(namespace, key) DO UPDATE SET
                    status = excluded.status,
                    content_type = excluded.content_type,
                    body = excluded.body,
                    stored_at = excluded.stored_at",
            )
            .bind(&entry.namespace)
            .bind(&entry.key)
            .bind(entry.status as i64)
            .bind(&entry.content_type)
            .bind(&body)
            .bind(entry.stored_at_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<(), StorageError> {
        let namespace = namespace.to_string();
        let key = key.to_string();

        retry("cache_delete", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM cache_entries WHERE namespace = ? AND key = ?")
                .bind(&namespace)
                .bind(&key)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn namespaces(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT DISTINCT namespace FROM cache_entries ORDER BY namespace")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut names = Vec::with_capacity(rows.len());
        for row in rows {
            names.push(
                try_get_text(&row, "namespace")
                    .ok_or_else(|| StorageError::Backend("namespace row unreadable".to_string()))?,
            );
        }
        Ok(names)
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT key FROM cache_entries WHERE namespace = ? ORDER BY stored_at ASC, key ASC",
        )
        .bind(namespace)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            keys.push(
                try_get_text(&row, "key")
                    .ok_or_else(|| StorageError::Backend("key row unreadable".to_string()))?,
            );
        }
        Ok(keys)
    }

    async fn purge_namespace(&self, namespace: &str) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE namespace = ?")
            .bind(namespace)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }

    async fn purge_older_than(&self, namespace: &str, cutoff_ms: i64) -> Result<usize, StorageError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE namespace = ? AND stored_at < ?")
            .bind(namespace)
            .bind(cutoff_ms)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() as usize)
    }

    async fn usage(&self) -> Result<StorageUsage, StorageError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as cnt,
                    COALESCE(SUM(LENGTH(body) + LENGTH(namespace) + LENGTH(key) + 32), 0) as bytes
             FROM cache_entries",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let entries: i64 = row
            .try_get("cnt")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let bytes: i64 = row
            .try_get("bytes")
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(StorageUsage {
            bytes: bytes as u64,
            entries: entries as u64,
        })
    }
}

#[async_trait]
impl OutboxStore for SqliteStore {
    async fn insert(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        let payload_json = mutation.payload.as_ref().map(|v| v.to_string());
        let hash = payload_hash(&mutation.payload);

        retry("outbox_insert", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT INTO outbox_mutations (id, tenant, method, url, payload, payload_hash, enqueued_at, attempt_count, last_error, state)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    attempt_count = excluded.attempt_count,
                    last_error = excluded.last_error,
                    state = excluded.state",
            )
            .bind(&mutation.id)
            .bind(&mutation.tenant)
            .bind(mutation.method.as_str())
            .bind(&mutation.url)
            .bind(&payload_json)
            .bind(&hash)
            .bind(mutation.enqueued_at_ms)
            .bind(mutation.attempt_count as i64)
            .bind(&mutation.last_error)
            .bind(mutation.state.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn update(&self, mutation: &QueuedMutation) -> Result<(), StorageError> {
        let result = retry("outbox_update", &RetryConfig::query(), || async {
            sqlx::query(
                "UPDATE outbox_mutations SET attempt_count = ?, last_error = ?, state = ? WHERE id = ?",
            )
            .bind(mutation.attempt_count as i64)
            .bind(&mutation.last_error)
            .bind(mutation.state.as_str())
            .bind(&mutation.id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), StorageError> {
        let id = id.to_string();
        retry("outbox_remove", &RetryConfig::query(), || async {
            sqlx::query("DELETE FROM outbox_mutations WHERE id = ?")
                .bind(&id)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<QueuedMutation>, StorageError> {
        let row = sqlx::query("SELECT * FROM outbox_mutations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_mutation(&row)?)),
            None => Ok(None),
        }
    }

    async fn pending_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM outbox_mutations WHERE tenant = ? AND state = 'pending' ORDER BY enqueued_at ASC, id ASC",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut mutations = Vec::with_capacity(rows.len());
        for row in rows {
            mutations.push(Self::row_to_mutation(&row)?);
        }
        Ok(mutations)
    }

    async fn all_for_tenant(&self, tenant: &str) -> Result<Vec<QueuedMutation>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM outbox_mutations WHERE tenant = ? ORDER BY enqueued_at ASC, id ASC",
        )
        .bind(tenant)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut mutations = Vec::with_capacity(rows.len());
        for row in rows {
            mutations.push(Self::row_to_mutation(&row)?);
        }
        Ok(mutations)
    }

    async fn tenants_with_pending(&self) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query(
            "SELECT DISTINCT tenant FROM outbox_mutations WHERE state = 'pending' ORDER BY tenant",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut tenants = Vec::with_capacity(rows.len());
        for row in rows {
            tenants.push(
                try_get_text(&row, "tenant")
                    .ok_or_else(|| StorageError::Backend("tenant row unreadable".to_string()))?,
            );
        }
        Ok(tenants)
    }

    async fn count_pending(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM outbox_mutations WHERE state = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl ConflictStore for SqliteStore {
    async fn insert_if_absent(&self, record: &ConflictRecord) -> Result<bool, StorageError> {
        let local_json = record.local_value.to_string();
        let remote_json = record.remote_value.to_string();

        let result = retry("conflict_insert", &RetryConfig::query(), || async {
            sqlx::query(
                "INSERT OR IGNORE INTO conflict_records
                 (id, tenant, entity_kind, entity_id, local_value, remote_value, local_timestamp, remote_timestamp, auto_resolvable, resolved)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&record.tenant)
            .bind(&record.entity_kind)
            .bind(&record.entity_id)
            .bind(&local_json)
            .bind(&remote_json)
            .bind(record.local_timestamp_ms)
            .bind(record.remote_timestamp_ms)
            .bind(record.auto_resolvable as i64)
            .bind(record.resolved as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<ConflictRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM conflict_records WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_conflict(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, tenant: Option<&str>) -> Result<Vec<ConflictRecord>, StorageError> {
        let rows = match tenant {
            Some(t) => {
                sqlx::query(
                    "SELECT * FROM conflict_records WHERE tenant = ? ORDER BY remote_timestamp DESC",
                )
                .bind(t)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM conflict_records ORDER BY remote_timestamp DESC")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| StorageError::Backend(e.to_string()))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(Self::row_to_conflict(&row)?);
        }
        Ok(records)
    }

    async fn mark_resolved(&self, id: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE conflict_records SET resolved = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_unresolved(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM conflict_records WHERE resolved = 0")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let count: i64 = row
            .try_get("cnt")
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(count as u64)
    }
}
