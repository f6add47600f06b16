// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request classification.
//!
//! A single pure function decides which caching strategy a request gets.
//! Evaluation order matters and is fixed: static asset, then network-only,
//! then critical data, then generic API, then dynamic fallback. The first
//! match wins, so `/api/auth/login` is network-only even though it also
//! carries the generic `/api/` prefix.
//!
//! The pattern sets are configuration, not code; the defaults mirror the
//! dashboard's real endpoint inventory.

use serde::{Deserialize, Serialize};

use crate::request::SyncRequest;

/// Strategy tag produced by classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestClass {
    /// Application shell assets: cache-first
    Static,
    /// Realtime, auth, websocket, bulk: passthrough, never cached
    NetworkOnly,
    /// Data the dashboard needs offline: cache-first with background update
    Critical,
    /// Generic API reads: network-first with tenant-scoped fallback
    Api,
    /// Navigations and everything else: stale-while-revalidate
    Dynamic,
}

impl RequestClass {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Static => "static",
            Self::NetworkOnly => "network_only",
            Self::Critical => "critical",
            Self::Api => "api",
            Self::Dynamic => "dynamic",
        }
    }
}

impl std::fmt::Display for RequestClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A critical-data pattern: an exact path plus the query pairs that must be
/// present. Extra query parameters (like `tenant`) do not affect the match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalPattern {
    pub path: String,
    #[serde(default)]
    pub query: Vec<(String, String)>,
}

impl CriticalPattern {
    pub fn path_only(path: &str) -> Self {
        Self {
            path: path.to_string(),
            query: Vec::new(),
        }
    }

    pub fn with_query(path: &str, key: &str, value: &str) -> Self {
        Self {
            path: path.to_string(),
            query: vec![(key.to_string(), value.to_string())],
        }
    }

    fn matches(&self, request: &SyncRequest) -> bool {
        request.path() == self.path
            && self
                .query
                .iter()
                .all(|(k, v)| request.query_param(k).as_deref() == Some(v.as_str()))
    }
}

/// The injected pattern sets the classifier evaluates, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierRules {
    pub static_suffixes: Vec<String>,
    pub static_prefixes: Vec<String>,
    pub network_only_prefixes: Vec<String>,
    pub network_only_suffixes: Vec<String>,
    pub critical_patterns: Vec<CriticalPattern>,
    pub api_prefix: String,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            static_suffixes: [".js", ".css", ".woff2", ".png", ".svg", ".ico", ".map"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            static_prefixes: vec!["/static/".to_string()],
            network_only_prefixes: vec![
                "/api/realtime".to_string(),
                "/ws".to_string(),
                "/api/auth".to_string(),
                "/api/sync/conflicts".to_string(),
            ],
            network_only_suffixes: vec!["/bulk".to_string()],
            critical_patterns: vec![
                CriticalPattern::with_query("/api/workitems", "priority", "high"),
                CriticalPattern::with_query("/api/incidents", "status", "active"),
                CriticalPattern::path_only("/api/config/current"),
                CriticalPattern::path_only("/api/user/profile"),
                CriticalPattern::path_only("/api/teams/oncall"),
                CriticalPattern::with_query("/api/schedules", "status", "active"),
            ],
            api_prefix: "/api/".to_string(),
        }
    }
}

/// Map a request to its strategy tag. Pure: no I/O, no side effects, total
/// over all inputs.
pub fn classify(rules: &ClassifierRules, request: &SyncRequest) -> RequestClass {
    let path = request.path();

    if rules.static_suffixes.iter().any(|s| path.ends_with(s.as_str()))
        || rules.static_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    {
        return RequestClass::Static;
    }

    if rules
        .network_only_prefixes
        .iter()
        .any(|p| path.starts_with(p.as_str()))
        || rules
            .network_only_suffixes
            .iter()
            .any(|s| path.ends_with(s.as_str()))
    {
        return RequestClass::NetworkOnly;
    }

    if rules.critical_patterns.iter().any(|p| p.matches(request)) {
        return RequestClass::Critical;
    }

    if path.starts_with(rules.api_prefix.as_str()) {
        return RequestClass::Api;
    }

    RequestClass::Dynamic
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify_url(url: &str) -> RequestClass {
        let rules = ClassifierRules::default();
        let request = SyncRequest::get(url).unwrap();
        classify(&rules, &request)
    }

    #[test]
    fn test_static_assets() {
        assert_eq!(classify_url("https://ops.example.com/assets/app.js"), RequestClass::Static);
        assert_eq!(classify_url("https://ops.example.com/assets/app.css"), RequestClass::Static);
        assert_eq!(classify_url("https://ops.example.com/fonts/inter.woff2"), RequestClass::Static);
        assert_eq!(classify_url("https://ops.example.com/static/logo.html"), RequestClass::Static);
        assert_eq!(classify_url("https://ops.example.com/favicon.ico"), RequestClass::Static);
    }

    #[test]
    fn test_network_only_beats_api_prefix() {
        assert_eq!(classify_url("https://ops.example.com/api/realtime/feed"), RequestClass::NetworkOnly);
        assert_eq!(classify_url("https://ops.example.com/api/auth/login"), RequestClass::NetworkOnly);
        assert_eq!(classify_url("https://ops.example.com/ws"), RequestClass::NetworkOnly);
        assert_eq!(classify_url("https://ops.example.com/api/sync/conflicts"), RequestClass::NetworkOnly);
        assert_eq!(classify_url("https://ops.example.com/api/workitems/bulk"), RequestClass::NetworkOnly);
    }

    #[test]
    fn test_critical_requires_query_pairs() {
        assert_eq!(
            classify_url("https://ops.example.com/api/workitems?priority=high"),
            RequestClass::Critical
        );
        // Extra parameters do not break the match
        assert_eq!(
            classify_url("https://ops.example.com/api/workitems?tenant=acme&priority=high"),
            RequestClass::Critical
        );
        // Wrong or missing value falls through to generic API
        assert_eq!(
            classify_url("https://ops.example.com/api/workitems?priority=low"),
            RequestClass::Api
        );
        assert_eq!(classify_url("https://ops.example.com/api/workitems"), RequestClass::Api);
    }

    #[test]
    fn test_critical_path_only_patterns() {
        assert_eq!(classify_url("https://ops.example.com/api/config/current"), RequestClass::Critical);
        assert_eq!(classify_url("https://ops.example.com/api/user/profile"), RequestClass::Critical);
        assert_eq!(classify_url("https://ops.example.com/api/teams/oncall"), RequestClass::Critical);
        assert_eq!(
            classify_url("https://ops.example.com/api/schedules?status=active"),
            RequestClass::Critical
        );
    }

    #[test]
    fn test_generic_api_and_dynamic_fallback() {
        assert_eq!(classify_url("https://ops.example.com/api/reports/weekly"), RequestClass::Api);
        assert_eq!(classify_url("https://ops.example.com/dashboard"), RequestClass::Dynamic);
        assert_eq!(classify_url("https://ops.example.com/"), RequestClass::Dynamic);
    }

    #[test]
    fn test_order_static_beats_everything() {
        // A .js file under /api/ is still a static asset
        assert_eq!(classify_url("https://ops.example.com/api/widget.js"), RequestClass::Static);
    }

    #[test]
    fn test_empty_rules_classify_everything_dynamic_or_api() {
        let rules = ClassifierRules {
            static_suffixes: vec![],
            static_prefixes: vec![],
            network_only_prefixes: vec![],
            network_only_suffixes: vec![],
            critical_patterns: vec![],
            api_prefix: "/api/".to_string(),
        };
        let api = SyncRequest::get("https://ops.example.com/api/anything").unwrap();
        let page = SyncRequest::get("https://ops.example.com/page").unwrap();
        assert_eq!(classify(&rules, &api), RequestClass::Api);
        assert_eq!(classify(&rules, &page), RequestClass::Dynamic);
    }
}
