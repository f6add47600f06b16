//! The five cache strategies.
//!
//! Every classified read lands in exactly one of these. They all work over
//! the same namespace-scoped store; the differences are ordering (cache vs
//! network first) and whether a background refresh is spawned. Background
//! refreshes are coalesced per `namespace|cache_key` so a burst of reads on
//! one resource costs a single upstream fetch.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::classify::RequestClass;
use crate::connectivity::ConnectivityMonitor;
use crate::metrics;
use crate::namespace::{Namespace, Purpose};
use crate::request::{now_millis, SyncRequest, SyncResponse};
use crate::storage::traits::{CacheStore, CachedEntry};
use crate::transport::{HttpTransport, TransportError};

use super::SyncEngine;

/// Execute a request upstream, feeding the connectivity monitor, and cache
/// the response when it is a 2xx.
///
/// Non-2xx responses pass through uncached: an error page must never
/// overwrite a good snapshot. Free function so background tasks can call it
/// from component clones without holding the engine.
pub(super) async fn fetch_and_store(
    cache: &Arc<dyn CacheStore>,
    transport: &Arc<dyn HttpTransport>,
    connectivity: &ConnectivityMonitor,
    request: &SyncRequest,
    namespace: &str,
    purpose: Purpose,
) -> Result<SyncResponse, TransportError> {
    let response = match transport.execute(request).await {
        Ok(response) => {
            connectivity.record_success();
            response
        }
        Err(e) => {
            connectivity.record_failure();
            return Err(e);
        }
    };

    if response.is_success() {
        let entry = CachedEntry::new(
            namespace.to_string(),
            request.cache_key(),
            response.status,
            response.content_type.clone(),
            response.body.to_vec(),
        );
        match cache.put(&entry).await {
            Ok(()) => metrics::record_cache_operation(purpose.as_str(), "put", "ok"),
            Err(e) => {
                warn!(
                    namespace = %namespace,
                    key = %entry.key,
                    error = %e,
                    "Could not cache response, serving it uncached"
                );
                metrics::record_cache_operation(purpose.as_str(), "put", "error");
            }
        }
    }

    Ok(response)
}

fn entry_response(entry: &CachedEntry) -> SyncResponse {
    SyncResponse::new(
        entry.status,
        entry.content_type.clone(),
        Bytes::from(entry.body.clone()),
    )
    .mark_served_from_cache()
}

impl SyncEngine {
    /// Dispatch one classified read to its strategy.
    pub(super) async fn run_strategy(
        &self,
        class: RequestClass,
        cache: Arc<dyn CacheStore>,
        request: &SyncRequest,
        ns: &Namespace,
        retry_after: u64,
    ) -> SyncResponse {
        match class {
            RequestClass::Static => self.cache_first(cache, request, ns, retry_after).await,
            RequestClass::NetworkOnly => self.network_only(request, retry_after).await,
            RequestClass::Critical => {
                self.cache_first_with_refresh(cache, request, ns, retry_after)
                    .await
            }
            RequestClass::Api => self.network_first(cache, request, ns, retry_after).await,
            RequestClass::Dynamic => {
                self.stale_while_revalidate(cache, request, ns, retry_after)
                    .await
            }
        }
    }

    /// Cache-first: a hit never touches the network.
    async fn cache_first(
        &self,
        cache: Arc<dyn CacheStore>,
        request: &SyncRequest,
        ns: &Namespace,
        retry_after: u64,
    ) -> SyncResponse {
        let ns_str = ns.to_string();
        let key = request.cache_key();

        match cache.get(&ns_str, &key).await {
            Ok(Some(entry)) => {
                metrics::record_cache_operation(ns.purpose.as_str(), "get", "hit");
                return entry_response(&entry);
            }
            Ok(None) => metrics::record_cache_operation(ns.purpose.as_str(), "get", "miss"),
            Err(e) => {
                warn!(namespace = %ns_str, error = %e, "Cache read failed, going to network");
                metrics::record_cache_operation(ns.purpose.as_str(), "get", "error");
            }
        }

        match fetch_and_store(
            &cache,
            &self.transport,
            &self.connectivity,
            request,
            &ns_str,
            ns.purpose,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(path = %request.path(), error = %e, "Offline on a cold cache-first path");
                SyncResponse::offline(retry_after)
            }
        }
    }

    /// Network-first: fresh data wins, the cache is the offline fallback.
    ///
    /// A successful fetch also bumps the per-tenant last-sync timestamp,
    /// which the dashboard surfaces as data freshness.
    async fn network_first(
        &self,
        cache: Arc<dyn CacheStore>,
        request: &SyncRequest,
        ns: &Namespace,
        retry_after: u64,
    ) -> SyncResponse {
        let ns_str = ns.to_string();

        match fetch_and_store(
            &cache,
            &self.transport,
            &self.connectivity,
            request,
            &ns_str,
            ns.purpose,
        )
        .await
        {
            Ok(response) => {
                if response.is_success() {
                    self.last_sync_ms.insert(ns.tenant.clone(), now_millis());
                }
                response
            }
            Err(e) => match cache.get(&ns_str, &request.cache_key()).await {
                Ok(Some(entry)) => {
                    warn!(
                        namespace = %ns_str,
                        path = %request.path(),
                        error = %e,
                        "Network unreachable, serving cached fallback"
                    );
                    metrics::record_cache_operation(ns.purpose.as_str(), "get", "fallback");
                    entry_response(&entry)
                }
                Ok(None) => SyncResponse::offline(retry_after),
                Err(cache_err) => {
                    warn!(error = %cache_err, "Cache fallback read failed while offline");
                    SyncResponse::offline(retry_after)
                }
            },
        }
    }

    /// Cache-first with background update: a hit is served synchronously
    /// and a silent refresh re-fetches the resource behind it.
    async fn cache_first_with_refresh(
        &self,
        cache: Arc<dyn CacheStore>,
        request: &SyncRequest,
        ns: &Namespace,
        retry_after: u64,
    ) -> SyncResponse {
        let ns_str = ns.to_string();

        match cache.get(&ns_str, &request.cache_key()).await {
            Ok(Some(entry)) => {
                metrics::record_cache_operation(ns.purpose.as_str(), "get", "hit");
                self.spawn_background_refresh(cache, request.clone(), ns_str, ns.purpose);
                return entry_response(&entry);
            }
            Ok(None) => metrics::record_cache_operation(ns.purpose.as_str(), "get", "miss"),
            Err(e) => {
                warn!(namespace = %ns_str, error = %e, "Cache read failed, going to network");
                metrics::record_cache_operation(ns.purpose.as_str(), "get", "error");
            }
        }

        match fetch_and_store(
            &cache,
            &self.transport,
            &self.connectivity,
            request,
            &ns_str,
            ns.purpose,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(path = %request.path(), error = %e, "Offline on a cold critical path");
                SyncResponse::offline(retry_after)
            }
        }
    }

    /// Stale-while-revalidate: any cached copy is served immediately and
    /// revalidated in the background. A cold miss with a refresh already in
    /// flight waits for that refresh instead of fetching twice.
    async fn stale_while_revalidate(
        &self,
        cache: Arc<dyn CacheStore>,
        request: &SyncRequest,
        ns: &Namespace,
        retry_after: u64,
    ) -> SyncResponse {
        let ns_str = ns.to_string();
        let key = request.cache_key();

        match cache.get(&ns_str, &key).await {
            Ok(Some(entry)) => {
                metrics::record_cache_operation(ns.purpose.as_str(), "get", "hit");
                self.spawn_background_refresh(cache, request.clone(), ns_str, ns.purpose);
                return entry_response(&entry);
            }
            Ok(None) => metrics::record_cache_operation(ns.purpose.as_str(), "get", "miss"),
            Err(e) => {
                warn!(namespace = %ns_str, error = %e, "Cache read failed, going to network");
                metrics::record_cache_operation(ns.purpose.as_str(), "get", "error");
            }
        }

        if self.await_inflight_refresh(&ns_str, &key).await {
            if let Ok(Some(entry)) = cache.get(&ns_str, &key).await {
                metrics::record_cache_operation(ns.purpose.as_str(), "get", "coalesced");
                return entry_response(&entry);
            }
        }

        match fetch_and_store(
            &cache,
            &self.transport,
            &self.connectivity,
            request,
            &ns_str,
            ns.purpose,
        )
        .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!(path = %request.path(), error = %e, "Offline on a cold dynamic path");
                SyncResponse::offline(retry_after)
            }
        }
    }

    /// Network-only: straight passthrough, nothing cached, nothing queued.
    pub(super) async fn network_only(&self, request: &SyncRequest, retry_after: u64) -> SyncResponse {
        match self.transport.execute(request).await {
            Ok(response) => {
                self.connectivity.record_success();
                response
            }
            Err(e) => {
                self.connectivity.record_failure();
                debug!(path = %request.path(), error = %e, "Network-only request failed");
                SyncResponse::offline(retry_after)
            }
        }
    }

    /// Spawn a refresh task for one resource unless one is already running.
    ///
    /// The inflight entry is inserted before the task is spawned, so a
    /// second caller on the same key always observes it and coalesces.
    fn spawn_background_refresh(
        &self,
        cache: Arc<dyn CacheStore>,
        request: SyncRequest,
        namespace: String,
        purpose: Purpose,
    ) {
        let inflight_key = format!("{}|{}", namespace, request.cache_key());

        let notify = match self.refresh_inflight.entry(inflight_key.clone()) {
            Entry::Occupied(_) => {
                debug!(key = %inflight_key, "Refresh already in flight, coalescing");
                return;
            }
            Entry::Vacant(slot) => {
                let notify = Arc::new(Notify::new());
                slot.insert(notify.clone());
                notify
            }
        };

        let transport = Arc::clone(&self.transport);
        let connectivity = Arc::clone(&self.connectivity);
        let inflight = Arc::clone(&self.refresh_inflight);

        tokio::spawn(async move {
            match fetch_and_store(&cache, &transport, &connectivity, &request, &namespace, purpose)
                .await
            {
                Ok(response) if response.is_success() => {
                    metrics::record_cache_operation(purpose.as_str(), "refresh", "ok");
                }
                Ok(response) => {
                    debug!(
                        path = %request.path(),
                        status = response.status,
                        "Background refresh got a non-success status, keeping old entry"
                    );
                    metrics::record_cache_operation(purpose.as_str(), "refresh", "rejected");
                }
                Err(e) => {
                    debug!(path = %request.path(), error = %e, "Background refresh failed");
                    metrics::record_cache_operation(purpose.as_str(), "refresh", "error");
                }
            }

            // Remove before notifying: a waiter that wakes and re-checks
            // the map must see the refresh as finished.
            inflight.remove(&inflight_key);
            notify.notify_waiters();
        });
    }

    /// Wait for an in-flight refresh on `namespace|key` to finish.
    /// Returns false immediately when none is running.
    pub(super) async fn await_inflight_refresh(&self, namespace: &str, key: &str) -> bool {
        let inflight_key = format!("{}|{}", namespace, key);
        let mut saw_refresh = false;

        loop {
            let notify = match self.refresh_inflight.get(&inflight_key) {
                Some(entry) => Arc::clone(entry.value()),
                None => return saw_refresh,
            };
            saw_refresh = true;

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Interest is registered, but the owning refresh may have
            // finished and a successor claimed the key before enable() ran.
            // notify_waiters() stores no permit, so parking on that dead
            // generation would never wake. Park only while the map still
            // holds the exact notify we registered on.
            let current = self
                .refresh_inflight
                .get(&inflight_key)
                .map(|entry| Arc::clone(entry.value()));
            match current {
                Some(current) if Arc::ptr_eq(&current, &notify) => {
                    notified.await;
                    return true;
                }
                // A newer refresh owns the key; register on its notify.
                Some(_) => continue,
                None => return true,
            }
        }
    }
}
