//! Engine lifecycle: phased startup, the run loop, and shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::bridge::{ClientMessage, WorkerEvent};
use crate::conflict::ConflictRegistry;
use crate::error::SyncError;
use crate::metrics;
use crate::namespace::Namespace;
use crate::outbox::Outbox;
use crate::quota::{spawn_cleanup, QuotaManager};
use crate::storage::memory::{MemoryCacheStore, MemoryConflictStore, MemoryOutboxStore};
use crate::storage::sqlite::SqliteStore;
use crate::storage::traits::{CacheStore, ConflictStore, OutboxStore};
use crate::tenant::{validate_tenant_id, TenantResolver};

use super::{EngineState, SyncEngine};

impl SyncEngine {
    /// Start the engine: open the stores, restore the outbox, and run the
    /// startup quota check. Transitions `Created → Starting → Ready`.
    ///
    /// With a configured `database_path` all three stores share one SQLite
    /// file, so queued mutations and conflicts survive restarts. Without
    /// one, everything lives in memory and the engine degrades to a
    /// session-scoped cache.
    #[tracing::instrument(skip(self), fields(durable = tracing::field::Empty))]
    pub async fn start(&mut self) -> Result<(), SyncError> {
        let total_start = Instant::now();
        info!("Sync engine starting");
        let _ = self.state.send(EngineState::Starting);
        metrics::set_engine_state("Starting");

        let config = self.config.read().clone();

        // ========== PHASE 1: Open stores ==========
        let phase_start = Instant::now();
        let (cache, outbox_store, conflict_store): (
            Arc<dyn CacheStore>,
            Arc<dyn OutboxStore>,
            Arc<dyn ConflictStore>,
        ) = match &config.database_path {
            Some(path) => {
                info!(path = %path, "Opening durable store");
                tracing::Span::current().record("durable", true);
                let store = Arc::new(SqliteStore::open(path).await?);
                (store.clone(), store.clone(), store)
            }
            None => {
                info!("No database path configured, using in-memory stores");
                tracing::Span::current().record("durable", false);
                (
                    Arc::new(MemoryCacheStore::new()),
                    Arc::new(MemoryOutboxStore::new()),
                    Arc::new(MemoryConflictStore::new()),
                )
            }
        };
        metrics::record_startup_phase("store_open", phase_start.elapsed());

        // ========== PHASE 2: Restore the outbox ==========
        let phase_start = Instant::now();
        let outbox = Outbox::open(outbox_store, config.outbox_soft_limit).await?;
        metrics::record_startup_phase("outbox_restore", phase_start.elapsed());

        // ========== PHASE 3: Conflict registry ==========
        let conflicts = ConflictRegistry::new(conflict_store);
        let unresolved = conflicts.unresolved_count().await?;
        if unresolved > 0 {
            info!(unresolved, "Unresolved conflicts awaiting foreground resolution");
        }

        // ========== PHASE 4: Startup quota check ==========
        let phase_start = Instant::now();
        let quota = Arc::new(QuotaManager::new(Arc::clone(&cache)));
        match quota.check_and_cleanup(&config).await {
            Ok(report) => {
                if report.total_entries_removed() > 0 {
                    info!(
                        removed = report.total_entries_removed(),
                        "Startup cleanup reclaimed space"
                    );
                }
            }
            Err(e) => warn!(error = %e, "Startup quota check failed, continuing"),
        }
        metrics::record_startup_phase("quota_check", phase_start.elapsed());

        self.cache = Some(cache);
        self.outbox = Some(outbox);
        self.conflicts = Some(conflicts);
        self.quota = Some(quota);

        let _ = self.state.send(EngineState::Ready);
        metrics::set_engine_state("Ready");
        metrics::record_startup_phase("total", total_start.elapsed());
        info!(
            elapsed_ms = total_start.elapsed().as_millis() as u64,
            "Sync engine ready"
        );
        Ok(())
    }

    /// Run the engine's event loop until the command channel closes.
    ///
    /// The loop multiplexes foreground commands, runtime config updates,
    /// connectivity transitions, the offline recovery probe, and periodic
    /// quota maintenance. Request handling does not go through here;
    /// [`handle_request`](Self::handle_request) is called concurrently from
    /// any number of tasks.
    pub async fn run(&self) {
        let _ = self.state.send(EngineState::Running);
        metrics::set_engine_state("Running");

        let (probe_secs, maintenance_secs) = {
            let config = self.config.read();
            (config.probe_interval_secs, config.maintenance_interval_secs)
        };
        let mut probe_tick = tokio::time::interval(Duration::from_secs(probe_secs.max(1)));
        let mut maintenance_tick =
            tokio::time::interval(Duration::from_secs(maintenance_secs.max(1)));

        let mut commands_rx = self.commands_rx.lock().await;
        let mut config_rx = self.config_rx.lock().await;
        let mut online_rx = self.connectivity.subscribe();

        info!("Sync engine run loop started");

        loop {
            tokio::select! {
                message = commands_rx.recv() => {
                    match message {
                        Some(message) => self.handle_command(message).await,
                        None => {
                            info!("Command channel closed, run loop exiting");
                            break;
                        }
                    }
                }

                Ok(()) = config_rx.changed() => {
                    let new_config = config_rx.borrow_and_update().clone();
                    let old_version = {
                        let mut config = self.config.write();
                        let old_version = config.cache_version;
                        *config = new_config.clone();
                        old_version
                    };
                    *self.resolver.write() =
                        TenantResolver::new(new_config.public_paths.clone());
                    info!(cache_version = new_config.cache_version, "Configuration updated");

                    if new_config.cache_version != old_version {
                        info!(
                            old_version,
                            new_version = new_config.cache_version,
                            "Cache version changed, update available"
                        );
                        self.bridge.broadcast(WorkerEvent::UpdateAvailable {
                            version: new_config.cache_version,
                        });
                    }
                }

                Ok(()) = online_rx.changed() => {
                    let online = *online_rx.borrow_and_update();
                    if online {
                        self.on_reconnect().await;
                    } else {
                        warn!("Connectivity lost, mutations will queue until reconnect");
                    }
                }

                _ = probe_tick.tick() => {
                    if !self.connectivity.is_online() {
                        let health_url = self.config.read().health_url();
                        self.connectivity
                            .probe_once(self.transport.as_ref(), &health_url)
                            .await;
                    }
                }

                _ = maintenance_tick.tick() => {
                    if let Some(quota) = &self.quota {
                        let config = self.config.read().clone();
                        spawn_cleanup(Arc::clone(quota), config);
                    }
                }
            }
        }
    }

    /// Handle one foreground command.
    pub(super) async fn handle_command(&self, message: ClientMessage) {
        match message {
            ClientMessage::SkipWaiting => {
                info!("Foreground requested immediate activation");
                self.activate_version().await;
            }
            ClientMessage::GetVersion => {
                let version = self.config.read().cache_version;
                self.bridge.broadcast(WorkerEvent::VersionInfo { version });
            }
            ClientMessage::TenantChanged { tenant_id } => {
                if let Err(e) = validate_tenant_id(&tenant_id) {
                    warn!(error = %e, "Ignoring tenant switch to malformed id");
                    return;
                }
                let previous = self.sticky_tenant.write().replace(tenant_id.clone());
                if previous.as_deref() == Some(tenant_id.as_str()) {
                    return;
                }
                info!(tenant = %tenant_id, "Active tenant switched");
                self.bridge.broadcast(WorkerEvent::TenantSwitched {
                    tenant_id: tenant_id.clone(),
                });
                if self.connectivity.is_online() {
                    self.refresh_critical(&tenant_id).await;
                }
            }
        }
    }

    /// Purge every cache namespace whose version is not current, then
    /// announce the active version to foreground instances.
    pub(super) async fn activate_version(&self) {
        let version = self.config.read().cache_version;

        if let Some(cache) = &self.cache {
            match cache.namespaces().await {
                Ok(namespaces) => {
                    let mut purged = 0usize;
                    for ns_str in namespaces {
                        let Some(ns) = Namespace::parse(&ns_str) else {
                            continue;
                        };
                        if !ns.is_stale_for(version) {
                            continue;
                        }
                        match cache.purge_namespace(&ns_str).await {
                            Ok(removed) => purged += removed,
                            Err(e) => {
                                warn!(namespace = %ns_str, error = %e, "Could not purge stale namespace");
                            }
                        }
                    }
                    if purged > 0 {
                        info!(version, purged, "Stale cache namespaces purged");
                        metrics::record_cleanup("stale_version", purged);
                    }
                }
                Err(e) => warn!(error = %e, "Could not enumerate namespaces for activation"),
            }
        }

        self.bridge.broadcast(WorkerEvent::VersionInfo { version });
    }

    /// Graceful shutdown: `ShuttingDown → Stopped`. Pending mutations stay
    /// in the durable store and replay on the next start.
    pub async fn shutdown(&self) {
        info!("Sync engine shutting down");
        let _ = self.state.send(EngineState::ShuttingDown);
        metrics::set_engine_state("ShuttingDown");

        if let Some(outbox) = &self.outbox {
            let stats = outbox.stats();
            info!(
                pending = stats.pending,
                successes = stats.successes,
                conflicts = stats.conflicts,
                "Final outbox stats"
            );
        }

        let _ = self.state.send(EngineState::Stopped);
        metrics::set_engine_state("Stopped");
        info!("Sync engine shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::watch;

    use crate::bridge::{ClientMessage, WorkerEvent};
    use crate::config::SyncConfig;
    use crate::engine::testutil::{started_engine, started_engine_with, ScriptedTransport};
    use crate::engine::{EngineState, SyncEngine};
    use crate::request::SyncRequest;
    use crate::storage::traits::CachedEntry;

    #[tokio::test]
    async fn test_start_reaches_ready_on_memory_stores() {
        let engine = started_engine(Arc::new(ScriptedTransport::new())).await;
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(engine.is_ready());
        assert_eq!(engine.sync_stats().expect("stats").pending, 0);
    }

    #[tokio::test]
    async fn test_start_with_sqlite_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sync.db");
        let config = SyncConfig {
            database_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let engine = started_engine_with(config, Arc::new(ScriptedTransport::new())).await;
        assert!(engine.is_ready());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_runs_the_full_state_machine() {
        let engine = started_engine(Arc::new(ScriptedTransport::new())).await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(!engine.is_ready());
    }

    #[tokio::test]
    async fn test_get_version_broadcasts_version_info() {
        let engine = started_engine(Arc::new(ScriptedTransport::new())).await;
        let mut events = engine.subscribe_events();

        engine.handle_command(ClientMessage::GetVersion).await;

        match events.try_recv().expect("event") {
            WorkerEvent::VersionInfo { version } => assert_eq!(version, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tenant_switch_sets_sticky_and_warms_cache() {
        let transport = Arc::new(ScriptedTransport::always_ok(200, "{}"));
        let engine = started_engine(transport.clone()).await;
        let mut events = engine.subscribe_events();

        engine
            .handle_command(ClientMessage::TenantChanged {
                tenant_id: "acme".to_string(),
            })
            .await;

        assert_eq!(engine.current_tenant().as_deref(), Some("acme"));
        match events.try_recv().expect("event") {
            WorkerEvent::TenantSwitched { tenant_id } => assert_eq!(tenant_id, "acme"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(transport.calls(), 5, "critical data warmed for the new tenant");

        // Switching to the same tenant again is a no-op
        engine
            .handle_command(ClientMessage::TenantChanged {
                tenant_id: "acme".to_string(),
            })
            .await;
        assert!(events.try_recv().is_err());
        assert_eq!(transport.calls(), 5);
    }

    #[tokio::test]
    async fn test_malformed_tenant_switch_is_ignored() {
        let transport = Arc::new(ScriptedTransport::always_ok(200, "{}"));
        let engine = started_engine(transport.clone()).await;
        let mut events = engine.subscribe_events();

        engine
            .handle_command(ClientMessage::TenantChanged {
                tenant_id: "bad tenant!".to_string(),
            })
            .await;

        assert!(engine.current_tenant().is_none());
        assert!(events.try_recv().is_err());
        assert_eq!(transport.calls(), 0);
    }

    #[tokio::test]
    async fn test_activation_purges_stale_versions_only() {
        let engine = started_engine(Arc::new(ScriptedTransport::new())).await;
        let cache = engine.cache.clone().expect("cache open");
        let mut events = engine.subscribe_events();

        for ns in ["v2:api:acme", "v2:dynamic:acme", "v3:api:acme"] {
            let entry = CachedEntry::new(ns, "GET /api/assets", 200, None, b"{}".to_vec());
            cache.put(&entry).await.expect("seed");
        }

        engine.activate_version().await;

        let namespaces = cache.namespaces().await.expect("namespaces");
        assert_eq!(namespaces, vec!["v3:api:acme".to_string()]);
        match events.try_recv().expect("event") {
            WorkerEvent::VersionInfo { version } => assert_eq!(version, 3),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_loop_serves_posted_commands() {
        let engine = Arc::new(started_engine(Arc::new(ScriptedTransport::new())).await);
        let mut events = engine.subscribe_events();

        let run_engine = Arc::clone(&engine);
        let run_task = tokio::spawn(async move { run_engine.run().await });

        engine
            .bridge()
            .post(ClientMessage::GetVersion)
            .await
            .expect("post");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        match event {
            WorkerEvent::VersionInfo { version } => assert_eq!(version, 3),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(engine.state(), EngineState::Running);

        run_task.abort();
    }

    #[tokio::test]
    async fn test_config_update_broadcasts_update_available() {
        let config = SyncConfig::default();
        let (tx, rx) = watch::channel(config.clone());
        let mut engine =
            SyncEngine::with_transport(config.clone(), rx, Arc::new(ScriptedTransport::new()));
        engine.start().await.expect("start");
        let engine = Arc::new(engine);
        let mut events = engine.subscribe_events();

        let run_engine = Arc::clone(&engine);
        let run_task = tokio::spawn(async move { run_engine.run().await });

        let bumped = SyncConfig {
            cache_version: 4,
            ..config
        };
        tx.send(bumped).expect("config send");

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        match event {
            WorkerEvent::UpdateAvailable { version } => assert_eq!(version, 4),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(engine.config.read().cache_version, 4);

        run_task.abort();
    }

    #[tokio::test]
    async fn test_restart_preserves_pending_mutations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sync.db");
        let config = SyncConfig {
            database_path: Some(path.to_string_lossy().into_owned()),
            ..Default::default()
        };

        {
            let transport = Arc::new(ScriptedTransport::always_fail());
            let engine = started_engine_with(config.clone(), transport).await;
            let request = SyncRequest::new(
                crate::request::HttpMethod::Post,
                "http://localhost:8000/api/workitems?tenant=acme",
            )
            .expect("url");
            let response = engine.handle_request(request).await;
            assert_eq!(response.status, 202);
            engine.shutdown().await;
        }

        let transport = Arc::new(ScriptedTransport::always_ok(200, "{}"));
        let engine = started_engine_with(config, transport).await;
        assert_eq!(engine.sync_stats().expect("stats").pending, 1);

        let result = engine.drain_tenant("acme").await.expect("drain");
        assert_eq!(result.replayed, 1);
    }
}
