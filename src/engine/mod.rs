// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine.
//!
//! The [`SyncEngine`] is the orchestrator that ties together all components:
//! - request classification and tenant resolution
//! - the five cache strategies over the namespace-scoped store
//! - the offline mutation outbox and its replay
//! - the conflict registry and the foreground message bridge
//! - connectivity monitoring and quota maintenance
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use opsync::{SyncEngine, SyncConfig, EngineState};
//! use tokio::sync::watch;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = SyncConfig::default();
//! let (_tx, rx) = watch::channel(config.clone());
//! let mut engine = SyncEngine::new(config, rx).expect("HTTP client build failed");
//!
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! // engine.start().await.expect("Start failed");
//! // assert!(engine.is_ready());
//! # }
//! ```

mod types;
mod handler;
mod strategies;
mod replay;
mod lifecycle;

pub use types::{DrainResult, EngineState, RefreshOutcome};

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, watch, Mutex, Notify};
use tracing::warn;

use crate::bridge::{ClientMessage, MessageBridge, WorkerEvent};
use crate::config::SyncConfig;
use crate::conflict::{ConflictRecord, ConflictRegistry};
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::outbox::{Outbox, QueuedMutation, SyncStats};
use crate::quota::{QuotaManager, QuotaPressure};
use crate::storage::traits::{CacheStore, StorageUsage};
use crate::tenant::TenantResolver;
use crate::transport::{HttpTransport, ReqwestTransport};

/// Offline-first sync engine for the operations dashboard.
///
/// Intercepts requests, serves them per cache strategy, queues mutations
/// while the upstream is unreachable, and replays them on reconnect.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`. Every method after [`start()`](Self::start)
/// takes `&self`, so one engine can be shared behind an `Arc` between the
/// run loop and any number of request handlers.
pub struct SyncEngine {
    /// Configuration (can be updated at runtime via the watch channel)
    /// Uses RwLock for interior mutability so run() can take &self
    pub(super) config: RwLock<SyncConfig>,

    /// Runtime config updates (Mutex for interior mutability in run loop)
    pub(super) config_rx: Mutex<watch::Receiver<SyncConfig>>,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,

    /// Engine state receiver (for internal use)
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Namespace-scoped response cache (set by start())
    pub(super) cache: Option<Arc<dyn CacheStore>>,

    /// Durable mutation queue (set by start())
    pub(super) outbox: Option<Outbox>,

    /// Server-reported conflicts (set by start())
    pub(super) conflicts: Option<ConflictRegistry>,

    /// Quota manager over the cache store (set by start())
    pub(super) quota: Option<Arc<QuotaManager>>,

    /// Upstream network access
    pub(super) transport: Arc<dyn HttpTransport>,

    /// Offline detection from transport outcomes
    pub(super) connectivity: Arc<ConnectivityMonitor>,

    /// Tenant extraction, rebuilt when public paths change
    pub(super) resolver: RwLock<TenantResolver>,

    /// Event broadcast and command intake shared with the foreground
    pub(super) bridge: MessageBridge,

    /// Command inbox consumed by the run loop
    pub(super) commands_rx: Mutex<mpsc::Receiver<ClientMessage>>,

    /// Tenant of the most recent TENANT_CHANGED message
    pub(super) sticky_tenant: RwLock<Option<String>>,

    /// In-flight background refreshes keyed by `namespace|cache_key`.
    /// Latecomers wait on the Notify instead of fetching again.
    pub(super) refresh_inflight: Arc<DashMap<String, Arc<Notify>>>,

    /// Epoch ms of the last successful network-first fetch per tenant
    pub(super) last_sync_ms: DashMap<String, i64>,
}

impl SyncEngine {
    /// Create a new engine with the production reqwest transport.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to open the stores and transition to `Ready`.
    pub fn new(
        config: SyncConfig,
        config_rx: watch::Receiver<SyncConfig>,
    ) -> Result<Self, SyncError> {
        let timeout = Duration::from_secs(config.transport_timeout_secs);
        let transport = Arc::new(ReqwestTransport::new(timeout)?);
        Ok(Self::with_transport(config, config_rx, transport))
    }

    /// Create a new engine over a caller-provided transport.
    pub fn with_transport(
        config: SyncConfig,
        config_rx: watch::Receiver<SyncConfig>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (bridge, commands_rx) = MessageBridge::new(config.event_capacity, config.command_capacity);
        let resolver = TenantResolver::new(config.public_paths.clone());

        Self {
            config: RwLock::new(config),
            config_rx: Mutex::new(config_rx),
            state: state_tx,
            state_rx,
            cache: None,
            outbox: None,
            conflicts: None,
            quota: None,
            transport,
            connectivity: Arc::new(ConnectivityMonitor::new()),
            resolver: RwLock::new(resolver),
            bridge,
            commands_rx: Mutex::new(commands_rx),
            sticky_tenant: RwLock::new(None),
            refresh_inflight: Arc::new(DashMap::new()),
            last_sync_ms: DashMap::new(),
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if the engine has completed startup.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    /// Whether the upstream is currently considered reachable.
    #[must_use]
    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    /// Watch connectivity transitions.
    #[must_use]
    pub fn online_receiver(&self) -> watch::Receiver<bool> {
        self.connectivity.subscribe()
    }

    /// Subscribe a foreground instance to engine events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.bridge.subscribe()
    }

    /// The channel bridge shared with the foreground, for posting
    /// [`ClientMessage`]s into the run loop.
    #[must_use]
    pub fn bridge(&self) -> &MessageBridge {
        &self.bridge
    }

    /// Tenant of the most recent `TENANT_CHANGED` message, if any.
    #[must_use]
    pub fn current_tenant(&self) -> Option<String> {
        self.sticky_tenant.read().clone()
    }

    /// Outbox telemetry snapshot. None before [`start()`](Self::start).
    #[must_use]
    pub fn sync_stats(&self) -> Option<SyncStats> {
        self.outbox.as_ref().map(|o| o.stats())
    }

    /// Epoch ms of the last successful network-first fetch for a tenant.
    #[must_use]
    pub fn last_sync(&self, tenant: &str) -> Option<i64> {
        self.last_sync_ms.get(tenant).map(|e| *e.value())
    }

    /// Current storage pressure and usage. None before start or when the
    /// store cannot report usage.
    pub async fn quota_pressure(&self) -> Option<(QuotaPressure, StorageUsage)> {
        let quota = self.quota.as_ref()?;
        let config = self.config.read().clone();
        match quota.pressure(&config).await {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                warn!(error = %e, "Could not read storage usage");
                None
            }
        }
    }

    /// Every mutation of one tenant regardless of state, oldest first.
    pub async fn list_mutations(&self, tenant: &str) -> Result<Vec<QueuedMutation>, SyncError> {
        Ok(self.outbox_ref()?.all_for_tenant(tenant).await?)
    }

    /// All conflicts, optionally narrowed to one tenant, newest first.
    pub async fn list_conflicts(
        &self,
        tenant: Option<&str>,
    ) -> Result<Vec<ConflictRecord>, SyncError> {
        Ok(self.conflicts_ref()?.list(tenant).await?)
    }

    /// Set the foreground resolution flag on a conflict.
    /// Returns false for an unknown id.
    pub async fn resolve_conflict(&self, id: &str) -> Result<bool, SyncError> {
        Ok(self.conflicts_ref()?.mark_resolved(id).await?)
    }

    /// Conflicts still awaiting foreground resolution.
    pub async fn unresolved_conflicts(&self) -> Result<u64, SyncError> {
        Ok(self.conflicts_ref()?.unresolved_count().await?)
    }

    pub(super) fn outbox_ref(&self) -> Result<&Outbox, SyncError> {
        self.outbox
            .as_ref()
            .ok_or_else(|| SyncError::Internal("engine not started".to_string()))
    }

    pub(super) fn conflicts_ref(&self) -> Result<&ConflictRegistry, SyncError> {
        self.conflicts
            .as_ref()
            .ok_or_else(|| SyncError::Internal("engine not started".to_string()))
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::watch;

    use super::testutil::ScriptedTransport;
    use super::*;

    fn created_engine() -> SyncEngine {
        let config = SyncConfig::default();
        let (_tx, rx) = watch::channel(config.clone());
        SyncEngine::with_transport(config, rx, Arc::new(ScriptedTransport::new()))
    }

    #[tokio::test]
    async fn test_engine_starts_in_created_state() {
        let engine = created_engine();
        assert_eq!(engine.state(), EngineState::Created);
        assert!(!engine.is_ready());
        assert!(engine.sync_stats().is_none());
        assert!(engine.current_tenant().is_none());
    }

    #[tokio::test]
    async fn test_management_api_before_start_is_internal_error() {
        let engine = created_engine();
        let err = engine.list_mutations("acme").await.unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));

        let err = engine.list_conflicts(None).await.unwrap_err();
        assert!(matches!(err, SyncError::Internal(_)));
    }

    #[tokio::test]
    async fn test_engine_assumes_online_until_proven_otherwise() {
        let engine = created_engine();
        assert!(engine.is_online());
        assert!(*engine.online_receiver().borrow());
    }
}
