//! Request entry point.
//!
//! [`SyncEngine::handle_request`] is the seam callers integrate against:
//! classify, resolve the tenant, then either run a cache strategy (reads)
//! or attempt-then-queue (mutations). It is infallible by design; every
//! outcome, including "you are offline", is expressed as a response.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::classify::{classify, RequestClass};
use crate::metrics;
use crate::namespace::{Namespace, Purpose};
use crate::quota::{spawn_cleanup, LARGE_WRITE_BYTES};
use crate::request::{SyncRequest, SyncResponse};
use crate::tenant::TenantScope;

use super::SyncEngine;

fn outcome_of(response: &SyncResponse) -> &'static str {
    if response.served_from_cache {
        "cache"
    } else if response.status == 503 {
        "offline"
    } else {
        "network"
    }
}

impl SyncEngine {
    /// Serve one intercepted request.
    ///
    /// Reads run the strategy their class maps to. Mutations go straight
    /// upstream and are queued into the outbox only when the transport
    /// itself fails; any HTTP response, including an error status, is the
    /// server's answer and passes through.
    #[tracing::instrument(
        skip(self, request),
        fields(
            method = %request.method,
            path = %request.path(),
            class = tracing::field::Empty,
            tenant = tracing::field::Empty,
        )
    )]
    pub async fn handle_request(&self, request: SyncRequest) -> SyncResponse {
        let (class, retry_after, version) = {
            let config = self.config.read();
            (
                classify(&config.classifier, &request),
                config.retry_after_secs,
                config.cache_version,
            )
        };
        tracing::Span::current().record("class", class.as_str());
        let _timer = metrics::LatencyTimer::new(class.as_str());

        // Network-only traffic bypasses tenancy and the cache entirely,
        // mutations included: auth and realtime calls are never queued.
        if class == RequestClass::NetworkOnly {
            let response = self.network_only(&request, retry_after).await;
            metrics::record_request(class.as_str(), outcome_of(&response));
            return response;
        }

        let sticky = self.sticky_tenant.read().clone();
        let scope = match self.resolver.read().resolve(&request, sticky.as_deref()) {
            Ok(scope) => scope,
            Err(e) => {
                warn!(error = %e, "Rejecting request with malformed tenant id");
                metrics::record_request(class.as_str(), "validation_error");
                return SyncResponse::validation_error(&e.to_string());
            }
        };
        tracing::Span::current().record("tenant", scope.cache_segment());

        if request.method.is_mutating() {
            return self.handle_mutation(request, &scope, class, retry_after).await;
        }

        let Some(cache) = self.cache.clone() else {
            warn!("Read before start(), nothing to serve from");
            metrics::record_request(class.as_str(), "offline");
            return SyncResponse::offline(retry_after);
        };

        let purpose = match class {
            RequestClass::Static => Purpose::Static,
            RequestClass::Critical => Purpose::Critical,
            RequestClass::Api => Purpose::Api,
            RequestClass::NetworkOnly | RequestClass::Dynamic => Purpose::Dynamic,
        };
        let ns = Namespace::new(version, purpose, scope.cache_segment());

        let response = self.run_strategy(class, cache, &request, &ns, retry_after).await;
        if !response.served_from_cache && response.is_success() {
            self.maybe_check_pressure(response.body.len());
        }
        let outcome = outcome_of(&response);
        metrics::record_request(class.as_str(), outcome);
        debug!(status = response.status, outcome, "Request served");
        response
    }

    /// A fresh body this large just landed in the cache; grade the usage
    /// ratio now instead of waiting for the maintenance timer.
    fn maybe_check_pressure(&self, body_len: usize) {
        if body_len < LARGE_WRITE_BYTES {
            return;
        }
        let Some(quota) = self.quota.as_ref() else {
            return;
        };
        debug!(body_len, "Large response cached, scheduling a pressure check");
        spawn_cleanup(Arc::clone(quota), self.config.read().clone());
    }

    async fn handle_mutation(
        &self,
        request: SyncRequest,
        scope: &TenantScope,
        class: RequestClass,
        retry_after: u64,
    ) -> SyncResponse {
        let transport_err = match self.transport.execute(&request).await {
            Ok(response) => {
                // The server answered. A 409 here is a live conflict the
                // caller resolves in the moment; only unreachable servers
                // put mutations into the outbox.
                self.connectivity.record_success();
                metrics::record_request(class.as_str(), "network");
                return response;
            }
            Err(e) => {
                self.connectivity.record_failure();
                e
            }
        };

        let Some(outbox) = self.outbox.as_ref() else {
            warn!("Mutation before start(), cannot queue");
            metrics::record_request(class.as_str(), "offline");
            return SyncResponse::offline(retry_after);
        };

        match outbox.enqueue(scope.cache_segment(), &request).await {
            Ok(mutation) => {
                info!(
                    id = %mutation.id,
                    tenant = %mutation.tenant,
                    "Mutation queued for replay"
                );
                metrics::record_request(class.as_str(), "queued");
                SyncResponse::queued(&mutation.id)
            }
            Err(enqueue_err) => {
                error!(
                    transport_error = %transport_err,
                    error = %enqueue_err,
                    "Could not queue mutation, reporting offline"
                );
                metrics::record_request(class.as_str(), "error");
                SyncResponse::offline(retry_after)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use crate::config::SyncConfig;
    use crate::engine::testutil::{started_engine, started_engine_with, ScriptedTransport};
    use crate::outbox::MutationState;
    use crate::request::{HttpMethod, SyncRequest};
    use crate::storage::traits::CachedEntry;

    #[tokio::test]
    async fn test_malformed_tenant_is_rejected_immediately() {
        let transport = Arc::new(ScriptedTransport::always_ok(200, "{}"));
        let engine = started_engine(transport.clone()).await;

        let request =
            SyncRequest::get("http://localhost:8000/api/workitems?tenant=bad%20tenant").expect("url");
        let response = engine.handle_request(request).await;

        assert_eq!(response.status, 400);
        let body = response.json().expect("json body");
        assert_eq!(body["error"], "ValidationError");
        assert_eq!(transport.calls(), 0, "rejected before any network work");
    }

    #[tokio::test]
    async fn test_mutation_queues_while_offline() {
        let transport = Arc::new(ScriptedTransport::always_fail());
        let engine = started_engine(transport).await;

        let request = SyncRequest::new(
            HttpMethod::Post,
            "http://localhost:8000/api/workitems?tenant=acme",
        )
        .expect("url")
        .with_body(serde_json::json!({"title": "restart pump 4"}));
        let response = engine.handle_request(request).await;

        assert_eq!(response.status, 202);
        let body = response.json().expect("json body");
        assert_eq!(body["queued"], true);
        let action_id = body["actionId"].as_str().expect("action id").to_string();

        let queued = engine.list_mutations("acme").await.expect("list");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, action_id);
        assert_eq!(queued[0].state, MutationState::Pending);
    }

    #[tokio::test]
    async fn test_mutation_passes_through_while_online() {
        let transport = Arc::new(ScriptedTransport::always_ok(201, r#"{"id":77}"#));
        let engine = started_engine(transport).await;

        let request = SyncRequest::new(
            HttpMethod::Post,
            "http://localhost:8000/api/workitems?tenant=acme",
        )
        .expect("url");
        let response = engine.handle_request(request).await;

        assert_eq!(response.status, 201);
        assert!(engine.list_mutations("acme").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_conflict_response_passes_through_at_submit_time() {
        let transport = Arc::new(ScriptedTransport::always_ok(409, r#"{"version":9}"#));
        let engine = started_engine(transport).await;

        let request = SyncRequest::new(
            HttpMethod::Put,
            "http://localhost:8000/api/workitems/12?tenant=acme",
        )
        .expect("url");
        let response = engine.handle_request(request).await;

        assert_eq!(response.status, 409, "a live conflict is the caller's to handle");
        assert!(engine.list_mutations("acme").await.expect("list").is_empty());
        assert_eq!(engine.unresolved_conflicts().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_network_only_mutation_is_never_queued() {
        let transport = Arc::new(ScriptedTransport::always_fail());
        let engine = started_engine(transport).await;

        let request = SyncRequest::new(
            HttpMethod::Post,
            "http://localhost:8000/api/auth/login?tenant=acme",
        )
        .expect("url");
        let response = engine.handle_request(request).await;

        assert_eq!(response.status, 503);
        assert!(engine.list_mutations("acme").await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_large_response_triggers_pressure_cleanup() {
        let body: &'static str = Box::leak("x".repeat(600 * 1024).into_boxed_str());
        let transport = Arc::new(ScriptedTransport::always_ok(200, body));
        let config = SyncConfig {
            quota_budget_bytes: 4_096,
            ..Default::default()
        };
        let engine = started_engine_with(config, transport).await;
        let cache = engine.cache.clone().expect("cache open");

        // Leftovers from the previous deployment generation
        cache
            .put(&CachedEntry::new(
                "v2:api:acme",
                "GET /api/assets",
                200,
                None,
                vec![0u8; 64],
            ))
            .await
            .expect("seed");

        let request = SyncRequest::get("http://localhost:8000/static/app.js").expect("url");
        let response = engine.handle_request(request).await;
        assert_eq!(response.status, 200);
        assert!(!response.served_from_cache);

        // The oversized write scheduled a cleanup pass off the request path
        let mut purged = false;
        for _ in 0..200 {
            let namespaces = cache.namespaces().await.expect("namespaces");
            if namespaces.iter().all(|ns| !ns.starts_with("v2:")) {
                purged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(purged, "stale generation survived the pressure check");
    }

    #[tokio::test]
    async fn test_reads_isolate_tenants() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(200, r#"{"tenant":"acme"}"#);
        transport.push_ok(200, r#"{"tenant":"globex"}"#);
        transport.push_fail();
        let engine = started_engine(transport).await;

        let acme = SyncRequest::get("http://localhost:8000/api/workitems?priority=high&tenant=acme")
            .expect("url");
        let globex =
            SyncRequest::get("http://localhost:8000/api/workitems?priority=high&tenant=globex")
                .expect("url");

        // Warm both tenants, then go offline and read back
        engine.handle_request(acme.clone()).await;
        engine.handle_request(globex.clone()).await;

        let acme_cached = engine.handle_request(acme).await;
        assert!(acme_cached.served_from_cache);
        assert_eq!(acme_cached.json().expect("json")["tenant"], "acme");

        let globex_cached = engine.handle_request(globex).await;
        assert!(globex_cached.served_from_cache);
        assert_eq!(globex_cached.json().expect("json")["tenant"], "globex");
    }

    #[tokio::test]
    async fn test_sticky_tenant_scopes_bare_requests() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_ok(200, r#"{"rows":[1]}"#);
        transport.push_fail();
        let engine = started_engine(transport).await;
        *engine.sticky_tenant.write() = Some("acme".to_string());

        let request = SyncRequest::get("http://localhost:8000/api/reports").expect("url");
        engine.handle_request(request.clone()).await;

        let cached = engine.handle_request(request).await;
        assert!(cached.served_from_cache, "sticky tenant produced a stable scope");
    }
}
