//! Tenant resolution.
//!
//! Every cacheable request is scoped to a tenant before any cache or
//! network work happens. Resolution walks a fixed priority chain: explicit
//! `tenant` query parameter, `X-Tenant-ID` header, `/tenant/{id}` path
//! segment, then the sticky tenant the foreground last announced. A value
//! found at any step must match `[A-Za-z0-9_-]{1,50}`; a malformed value
//! fails the request immediately instead of silently falling through to
//! the next source, so a typo can never leak one tenant's cache to
//! another.
//!
//! Public endpoints (health, status, version, auth, tenant listing) do not
//! participate in tenancy at all; they resolve to the shared `public`
//! scope unconditionally. Requests with no tenant anywhere resolve to
//! `public` as well.

use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;

use crate::namespace::TENANT_PUBLIC;
use crate::request::SyncRequest;

/// Header carrying the tenant id.
pub const TENANT_HEADER: &str = "x-tenant-id";
/// Query parameter carrying the tenant id.
pub const TENANT_PARAM: &str = "tenant";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid tenant id '{value}': must match [A-Za-z0-9_-]{{1,50}}")]
pub struct InvalidTenant {
    pub value: String,
}

/// The resolved scope of a request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TenantScope {
    Tenant(String),
    Public,
}

impl TenantScope {
    /// The namespace segment this scope caches under.
    pub fn cache_segment(&self) -> &str {
        match self {
            Self::Tenant(id) => id.as_str(),
            Self::Public => TENANT_PUBLIC,
        }
    }

    pub fn tenant_id(&self) -> Option<&str> {
        match self {
            Self::Tenant(id) => Some(id.as_str()),
            Self::Public => None,
        }
    }
}

fn tenant_format() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{1,50}$").expect("Invalid tenant id regex"))
}

/// Validate a candidate tenant id against the format contract.
pub fn validate_tenant_id(value: &str) -> Result<(), InvalidTenant> {
    if tenant_format().is_match(value) {
        Ok(())
    } else {
        Err(InvalidTenant {
            value: value.to_string(),
        })
    }
}

pub struct TenantResolver {
    /// Paths outside tenancy; entries ending in `*` match as prefixes.
    public_paths: Vec<String>,
}

impl TenantResolver {
    pub fn new(public_paths: Vec<String>) -> Self {
        Self { public_paths }
    }

    fn is_public(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == p,
        })
    }

    /// Resolve the scope for a request. `sticky` is the tenant the
    /// foreground last switched to, consulted after the request itself.
    pub fn resolve(
        &self,
        request: &SyncRequest,
        sticky: Option<&str>,
    ) -> Result<TenantScope, InvalidTenant> {
        if self.is_public(request.path()) {
            return Ok(TenantScope::Public);
        }

        let candidate = request
            .query_param(TENANT_PARAM)
            .or_else(|| request.header(TENANT_HEADER).map(|s| s.to_string()))
            .or_else(|| tenant_from_path(request))
            .or_else(|| sticky.map(|s| s.to_string()));

        match candidate {
            Some(value) => {
                validate_tenant_id(&value)?;
                Ok(TenantScope::Tenant(value))
            }
            None => Ok(TenantScope::Public),
        }
    }
}

/// Extract the id following a `/tenant/` path segment.
fn tenant_from_path(request: &SyncRequest) -> Option<String> {
    let mut segments = request.url.path_segments()?;
    while let Some(segment) = segments.next() {
        if segment == "tenant" {
            return segments.next().map(|s| s.to_string());
        }
    }
    None
}
