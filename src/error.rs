//! Crate-level error taxonomy.
//!
//! Per-boundary errors ([`StorageError`], [`TransportError`]) convert into
//! [`SyncError`] at the engine layer. The public `handle_request` surface
//! never returns these; it encodes every outcome as a response. They do
//! surface from the management APIs (manual retry, forced cleanup) where
//! the caller is the foreground application rather than a request.

use thiserror::Error;

use crate::storage::traits::StorageError;
use crate::tenant::InvalidTenant;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed tenant id; surfaced immediately, never queued
    #[error("Validation failed: {0}")]
    Validation(#[from] InvalidTenant),

    /// Transport-level network loss; retried via reconnect triggers
    #[error("Network unavailable: {0}")]
    Network(#[from] TransportError),

    /// Server-reported write conflict; never auto-retried
    #[error("Conflict recorded for mutation '{id}': manual resolution required")]
    Conflict { id: String },

    /// Storage budget exhausted and cleanup could not reclaim enough
    #[error("Storage quota pressure not relieved: {0}")]
    Quota(String),

    /// Durable store failure
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Anything unclassified; downgraded to an offline response at the
    /// request surface
    #[error("Internal error: {0}")]
    Internal(String),
}
