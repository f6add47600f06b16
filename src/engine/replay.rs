//! Outbox replay and post-reconnect refresh.
//!
//! A drain walks one tenant's pending mutations in enqueue order and gives
//! each a single attempt. Server answers are definitive: 2xx confirms, 409
//! escalates to the conflict registry, any other status burns an attempt.
//! A transport-level failure means we are offline again, so the drain stops
//! instead of burning an attempt on every remaining record.

use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::bridge::WorkerEvent;
use crate::conflict::ConflictRecord;
use crate::error::SyncError;
use crate::metrics;
use crate::namespace::{Namespace, Purpose, TENANT_PUBLIC};
use crate::outbox::QueuedMutation;
use crate::request::{SyncRequest, SyncResponse};

use super::strategies::fetch_and_store;
use super::{DrainResult, RefreshOutcome, SyncEngine};

/// Rebuild the replayable request from a stored mutation.
fn replay_request(mutation: &QueuedMutation) -> Result<SyncRequest, url::ParseError> {
    let mut request = SyncRequest::new(mutation.method, &mutation.url)?;
    if let Some(payload) = &mutation.payload {
        request = request.with_body(payload.clone());
    }
    Ok(request)
}

impl SyncEngine {
    /// Replay one tenant's pending mutations, oldest first.
    ///
    /// Holds the outbox drain lock for the duration; a concurrent trigger
    /// returns an empty result instead of double-replaying.
    #[tracing::instrument(skip(self))]
    pub async fn drain_tenant(&self, tenant: &str) -> Result<DrainResult, SyncError> {
        let outbox = self.outbox_ref()?;
        let Some(_guard) = outbox.try_begin_drain() else {
            debug!("Drain already in progress, skipping trigger");
            return Ok(DrainResult::default());
        };

        let started = Instant::now();
        let attempt_cap = self.config.read().attempt_cap;
        let pending = outbox.pending_for_tenant(tenant).await?;
        let mut result = DrainResult {
            total: pending.len(),
            ..DrainResult::default()
        };

        for mut mutation in pending {
            let request = match replay_request(&mutation) {
                Ok(request) => request,
                Err(e) => {
                    warn!(id = %mutation.id, error = %e, "Stored mutation URL no longer parses");
                    let permanent = mutation
                        .record_failure(&format!("unreplayable url: {}", e), attempt_cap);
                    outbox.mark_attempt_failed(&mutation, permanent).await?;
                    metrics::record_replay(if permanent { "failed" } else { "requeued" });
                    result.count_failure(permanent);
                    continue;
                }
            };

            outbox.note_attempt();
            match self.transport.execute(&request).await {
                Ok(response) if response.status == 409 => {
                    self.connectivity.record_success();
                    self.escalate_conflict(&mut mutation, &response).await?;
                    metrics::record_replay("conflict");
                    result.conflicted += 1;
                }
                Ok(response) if response.is_success() => {
                    self.connectivity.record_success();
                    outbox.mark_replayed(&mutation).await?;
                    metrics::record_replay("success");
                    result.replayed += 1;
                    debug!(id = %mutation.id, "Mutation confirmed by server");
                }
                Ok(response) => {
                    self.connectivity.record_success();
                    let permanent = mutation
                        .record_failure(&format!("HTTP {}", response.status), attempt_cap);
                    outbox.mark_attempt_failed(&mutation, permanent).await?;
                    metrics::record_replay(if permanent { "failed" } else { "requeued" });
                    result.count_failure(permanent);
                }
                Err(e) => {
                    self.connectivity.record_failure();
                    let permanent = mutation.record_failure(&e.to_string(), attempt_cap);
                    outbox.mark_attempt_failed(&mutation, permanent).await?;
                    metrics::record_replay(if permanent { "failed" } else { "requeued" });
                    result.count_failure(permanent);
                    warn!(
                        id = %mutation.id,
                        error = %e,
                        "Transport failure during drain, stopping early"
                    );
                    break;
                }
            }
        }

        metrics::record_drain_duration(started.elapsed());
        if result.total > 0 {
            info!(
                total = result.total,
                replayed = result.replayed,
                conflicted = result.conflicted,
                failed = result.failed,
                requeued = result.requeued,
                "Outbox drain finished"
            );
        }
        Ok(result)
    }

    /// Turn a 409 replay answer into a conflict record, taking the mutation
    /// out of the automatic replay set. Broadcasts only on first creation.
    async fn escalate_conflict(
        &self,
        mutation: &mut QueuedMutation,
        response: &SyncResponse,
    ) -> Result<(), SyncError> {
        let remote_value = response.json().unwrap_or(Value::Null);
        let record = ConflictRecord::from_replay(mutation, remote_value);
        let created = self.conflicts_ref()?.record(&record).await?;

        mutation.mark_conflicted();
        self.outbox_ref()?.mark_conflicted(mutation).await?;

        if created {
            self.bridge.broadcast(WorkerEvent::SyncConflict {
                tenant_id: mutation.tenant.clone(),
                conflict: record,
            });
        }
        Ok(())
    }

    /// User-initiated retry of a conflicted or failed mutation. The record
    /// gets a fresh attempt budget and one immediate replay.
    ///
    /// A 409 answer surfaces as [`SyncError::Conflict`]; any other HTTP
    /// response is returned as the server's answer.
    pub async fn retry_mutation(&self, id: &str) -> Result<SyncResponse, SyncError> {
        let outbox = self.outbox_ref()?;
        let attempt_cap = self.config.read().attempt_cap;

        let mut mutation = outbox.retry_manual(id).await?;
        let request = replay_request(&mutation)
            .map_err(|e| SyncError::Internal(format!("stored mutation URL not parseable: {}", e)))?;

        outbox.note_attempt();
        match self.transport.execute(&request).await {
            Ok(response) if response.status == 409 => {
                self.connectivity.record_success();
                self.escalate_conflict(&mut mutation, &response).await?;
                metrics::record_replay("conflict");
                Err(SyncError::Conflict {
                    id: mutation.id.clone(),
                })
            }
            Ok(response) if response.is_success() => {
                self.connectivity.record_success();
                outbox.mark_replayed(&mutation).await?;
                metrics::record_replay("success");
                info!(id = %mutation.id, "Manual retry confirmed by server");
                Ok(response)
            }
            Ok(response) => {
                self.connectivity.record_success();
                let permanent =
                    mutation.record_failure(&format!("HTTP {}", response.status), attempt_cap);
                outbox.mark_attempt_failed(&mutation, permanent).await?;
                metrics::record_replay(if permanent { "failed" } else { "requeued" });
                Ok(response)
            }
            Err(e) => {
                self.connectivity.record_failure();
                let permanent = mutation.record_failure(&e.to_string(), attempt_cap);
                outbox.mark_attempt_failed(&mutation, permanent).await?;
                metrics::record_replay(if permanent { "failed" } else { "requeued" });
                Err(SyncError::Network(e))
            }
        }
    }

    /// Drop an unconfirmed mutation without replaying it.
    pub async fn discard_mutation(&self, id: &str) -> Result<(), SyncError> {
        Ok(self.outbox_ref()?.discard(id).await?)
    }

    /// Re-fetch the configured critical endpoints for one tenant so its
    /// offline snapshot is fresh. Stops at the first transport failure.
    pub async fn refresh_critical(&self, tenant: &str) -> RefreshOutcome {
        let Some(cache) = self.cache.clone() else {
            return RefreshOutcome::default();
        };

        let (version, paths, origin_config) = {
            let config = self.config.read();
            (
                config.cache_version,
                config.critical_refresh.clone(),
                config.clone(),
            )
        };
        let ns = Namespace::new(version, Purpose::Critical, tenant).to_string();
        let mut outcome = RefreshOutcome::default();

        for path in &paths {
            let mut url = origin_config.absolute_url(path);
            if tenant != TENANT_PUBLIC {
                let sep = if path.contains('?') { '&' } else { '?' };
                url.push_str(&format!("{}tenant={}", sep, tenant));
            }
            let request = match SyncRequest::get(&url) {
                Ok(request) => request,
                Err(e) => {
                    warn!(url = %url, error = %e, "Configured refresh path is not a valid URL");
                    outcome.failed += 1;
                    continue;
                }
            };

            match fetch_and_store(
                &cache,
                &self.transport,
                &self.connectivity,
                &request,
                &ns,
                Purpose::Critical,
            )
            .await
            {
                Ok(response) if response.is_success() => outcome.fetched += 1,
                Ok(response) => {
                    debug!(path = %path, status = response.status, "Critical refresh rejected");
                    outcome.failed += 1;
                }
                Err(e) => {
                    debug!(path = %path, error = %e, "Critical refresh offline, stopping");
                    outcome.failed += 1;
                    break;
                }
            }
        }

        info!(
            tenant,
            fetched = outcome.fetched,
            failed = outcome.failed,
            "Critical data refresh finished"
        );
        outcome
    }

    /// Reconnect sequence: drain every tenant with pending mutations, then
    /// refresh critical data for the drained tenants and the sticky tenant.
    pub(super) async fn on_reconnect(&self) {
        info!("Connectivity restored, draining outbox");

        let tenants = match self.outbox_ref() {
            Ok(outbox) => match outbox.tenants_with_pending().await {
                Ok(tenants) => tenants,
                Err(e) => {
                    error!(error = %e, "Could not list tenants with pending mutations");
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        };

        let mut refresh_targets: Vec<String> = Vec::new();
        for tenant in tenants {
            if !self.connectivity.is_online() {
                warn!("Connectivity lost again mid-drain, deferring the rest");
                return;
            }
            match self.drain_tenant(&tenant).await {
                Ok(_) => refresh_targets.push(tenant),
                Err(e) => error!(tenant = %tenant, error = %e, "Drain failed"),
            }
        }

        if let Some(sticky) = self.sticky_tenant.read().clone() {
            if !refresh_targets.contains(&sticky) {
                refresh_targets.push(sticky);
            }
        }

        for tenant in refresh_targets {
            if !self.connectivity.is_online() {
                warn!("Connectivity lost again before refresh, deferring");
                return;
            }
            self.refresh_critical(&tenant).await;
        }
    }
}
