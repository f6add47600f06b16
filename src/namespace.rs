// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Versioned, tenant-scoped cache namespaces.
//!
//! Every cache entry lives under a namespace of the form
//! `v{version}:{purpose}:{tenant}`, e.g. `v3:api:acme`. The version
//! segment ties entries to a deployment generation so activation can drop
//! stale generations wholesale; the purpose segment groups entries by
//! eviction policy; the tenant segment keeps tenants apart. Requests with
//! no tenant scope use the literal tenant `public`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Tenant segment used for requests outside any tenant scope.
pub const TENANT_PUBLIC: &str = "public";

/// What a namespace holds, which decides how its entries age out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    /// Application shell assets, practically immutable within a version
    Static,
    /// Responses the dashboard needs to function offline
    Critical,
    /// Generic API responses
    Api,
    /// Fallback-cached navigations and leftovers
    Dynamic,
}

impl Purpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::Critical => "critical",
            Self::Api => "api",
            Self::Dynamic => "dynamic",
        }
    }
}

impl std::str::FromStr for Purpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(Self::Static),
            "critical" => Ok(Self::Critical),
            "api" => Ok(Self::Api),
            "dynamic" => Ok(Self::Dynamic),
            other => Err(format!("unknown namespace purpose: {}", other)),
        }
    }
}

impl fmt::Display for Purpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub version: u32,
    pub purpose: Purpose,
    pub tenant: String,
}

impl Namespace {
    pub fn new(version: u32, purpose: Purpose, tenant: impl Into<String>) -> Self {
        Self {
            version,
            purpose,
            tenant: tenant.into(),
        }
    }

    /// Parse `v{version}:{purpose}:{tenant}`. Returns `None` for anything
    /// that does not match, so enumeration-time callers can skip foreign
    /// keys instead of failing.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, ':');
        let version_part = parts.next()?;
        let purpose_part = parts.next()?;
        let tenant = parts.next()?;

        let version: u32 = version_part.strip_prefix('v')?.parse().ok()?;
        let purpose: Purpose = purpose_part.parse().ok()?;
        if tenant.is_empty() {
            return None;
        }

        Some(Self::new(version, purpose, tenant))
    }

    /// Whether this namespace belongs to a generation other than the one
    /// currently active. Stale generations are purged on activation and by
    /// quota cleanup.
    #[must_use]
    pub fn is_stale_for(&self, current_version: u32) -> bool {
        self.version != current_version
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}:{}:{}", self.version, self.purpose, self.tenant)
    }
}
