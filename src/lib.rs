//! # Offline Sync Engine
//!
//! An offline-first synchronization and caching layer for enterprise
//! operations dashboards.
//!
//! ## Architecture
//!
//! Every dashboard request flows through a classify, resolve, dispatch
//! pipeline:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Request Classifier                      │
//! │  • Ordered rules: static, network-only, critical,          │
//! │    api, dynamic (first match wins)                         │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Tenant Resolver                        │
//! │  • Query param → header → path → sticky fallback           │
//! │  • Malformed tenant ids rejected before any work           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Caching Strategies                       │
//! │  • Cache-first for static assets                           │
//! │  • Network-first with cache fallback for API reads         │
//! │  • Stale-while-revalidate for dashboard widgets            │
//! │  • Background refresh for critical operational data        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                  (mutations that cannot reach the server)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Outbox + Conflict Registry                  │
//! │  • Queued mutations replay oldest-first on reconnect       │
//! │  • 409 replays escalate into conflict records              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │               Versioned, Tenant-Scoped Storage              │
//! │  • v{n}:{purpose}:{tenant} cache namespaces                │
//! │  • SQLite for durable installs, in-memory for tests        │
//! │  • Quota sweeps before the host storage fills              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use opsync::{SyncConfig, SyncEngine, SyncRequest};
//! use tokio::sync::watch;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig {
//!         api_origin: "https://ops.example.com".into(),
//!         database_path: Some("/var/lib/opsync/sync.db".into()),
//!         ..Default::default()
//!     };
//!
//!     let (_config_tx, config_rx) = watch::channel(config.clone());
//!     let mut engine = SyncEngine::new(config, config_rx).expect("invalid config");
//!
//!     // Open stores and restore any queued mutations
//!     engine.start().await.expect("Failed to start");
//!
//!     // Route every dashboard request through the engine
//!     let request = SyncRequest::get("https://ops.example.com/api/workitems?tenant=acme")
//!         .expect("invalid url");
//!     let response = engine.handle_request(request).await;
//!     println!("{} ({} bytes)", response.status, response.body.len());
//!
//!     engine.shutdown().await;
//! }
//! ```
//!
//! ## Features
//!
//! - **Offline Reads**: Cached responses keep dashboards usable with no connectivity
//! - **Write Queueing**: Mutations persist in a durable outbox and replay on reconnect
//! - **Conflict Capture**: Rejected replays become reviewable records instead of lost work
//! - **Tenant Isolation**: Every cache namespace and queue is scoped to a resolved tenant
//! - **Version Rollover**: Activating a new cache version purges stale namespaces
//! - **Connectivity Tracking**: Transport outcomes drive online/offline state and probes
//! - **Quota Management**: Staged cleanup sweeps under storage pressure
//! - **Retry Logic**: Configurable retry policies for transient storage failures
//!
//! ## Configuration
//!
//! See [`SyncConfig`] for all configuration options.
//!
//! ## Modules
//!
//! - [`engine`]: The main [`SyncEngine`] orchestrating all components
//! - [`classify`]: Ordered request classification rules
//! - [`tenant`]: Tenant id validation and resolution
//! - [`outbox`]: Durable queue for mutations made while offline
//! - [`conflict`]: Conflict records for rejected replays
//! - [`storage`]: Storage backends (SQLite, Memory)
//! - [`connectivity`]: Online/offline detection from transport outcomes
//! - [`quota`]: Storage budget tracking and staged cleanup
//! - [`bridge`]: Broadcast events and client commands
//! - [`resilience`]: Retry logic for transient failures

pub mod config;
pub mod request;
pub mod classify;
pub mod tenant;
pub mod namespace;
pub mod compress;
pub mod storage;
pub mod outbox;
pub mod conflict;
pub mod transport;
pub mod connectivity;
pub mod quota;
pub mod bridge;
pub mod resilience;
pub mod error;
pub mod engine;
pub mod metrics;

pub use config::SyncConfig;
pub use engine::{SyncEngine, EngineState, DrainResult, RefreshOutcome};
pub use error::SyncError;
pub use classify::{classify, ClassifierRules, CriticalPattern, RequestClass};
pub use request::{HttpMethod, SyncRequest, SyncResponse};
pub use tenant::{TenantResolver, TenantScope};
pub use namespace::{Namespace, Purpose};
pub use bridge::{MessageBridge, WorkerEvent, ClientMessage};
pub use outbox::{Outbox, QueuedMutation, MutationState, SyncStats};
pub use conflict::{ConflictRecord, ConflictRegistry};
pub use connectivity::ConnectivityMonitor;
pub use quota::{QuotaManager, QuotaPressure};
pub use transport::{HttpTransport, ReqwestTransport, TransportError};
pub use storage::traits::{CacheStore, OutboxStore, ConflictStore, CachedEntry, StorageError, StorageUsage};
pub use resilience::retry::RetryConfig;
pub use metrics::LatencyTimer;
