//! Request and response model for the interception layer.
//!
//! [`SyncRequest`] is the engine's view of a dashboard request: method, full
//! URL, the headers that matter to sync, and an optional JSON payload for
//! mutations. [`SyncResponse`] is what the engine always answers with -
//! either a real upstream response, a cached snapshot, or one of the
//! structured offline/queued/validation bodies.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use url::Url;

/// Current time as epoch milliseconds
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// HTTP method, restricted to what the dashboard actually issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
            Self::Options => "OPTIONS",
        }
    }

    /// Whether this method mutates server state and is therefore eligible
    /// for outbox queueing when the network is down.
    #[must_use]
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Get | Self::Head | Self::Options)
    }
}

impl std::str::FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "HEAD" => Ok(Self::Head),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            "OPTIONS" => Ok(Self::Options),
            other => Err(format!("unknown HTTP method: {}", other)),
        }
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intercepted dashboard request.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub method: HttpMethod,
    pub url: Url,
    /// Header names are normalized to lowercase on insert.
    headers: HashMap<String, String>,
    /// JSON payload for mutating requests.
    pub body: Option<Value>,
}

impl SyncRequest {
    /// Build a request from a method and an absolute URL.
    pub fn new(method: HttpMethod, url: &str) -> Result<Self, url::ParseError> {
        Ok(Self {
            method,
            url: Url::parse(url)?,
            headers: HashMap::new(),
            body: None,
        })
    }

    /// Convenience constructor for GET requests.
    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Self::new(HttpMethod::Get, url)
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.to_string());
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// All headers (names already lowercase), for forwarding upstream.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// First value of a query parameter, if present
    pub fn query_param(&self, name: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Path plus query, the portion that identifies a cacheable resource
    pub fn path_and_query(&self) -> String {
        match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        }
    }

    /// The per-namespace cache key for this request.
    ///
    /// The tenant lives in the namespace, not here, so identical requests
    /// from different tenants produce identical keys under different
    /// namespaces and can never collide in the flat store. The `tenant`
    /// query parameter is dropped for the same reason, and remaining pairs
    /// are sorted so a background refresh primes the key a foreground
    /// request will read regardless of parameter order.
    pub fn cache_key(&self) -> String {
        let mut pairs: Vec<(String, String)> = self
            .url
            .query_pairs()
            .filter(|(k, _)| k != crate::tenant::TENANT_PARAM)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        pairs.sort();
        if pairs.is_empty() {
            return format!("{} {}", self.method.as_str(), self.url.path());
        }
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        format!("{} {}?{}", self.method.as_str(), self.url.path(), query.join("&"))
    }
}

/// What the interception layer answers with.
///
/// `served_from_cache` distinguishes a cached snapshot from a live upstream
/// response; callers surface it so the UI can mark data as possibly stale.
#[derive(Debug, Clone)]
pub struct SyncResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub served_from_cache: bool,
}

impl SyncResponse {
    pub fn new(status: u16, content_type: Option<String>, body: Bytes) -> Self {
        Self {
            status,
            content_type,
            body,
            served_from_cache: false,
        }
    }

    fn json_body(status: u16, value: &Value) -> Self {
        Self {
            status,
            content_type: Some("application/json".to_string()),
            body: Bytes::from(value.to_string()),
            served_from_cache: false,
        }
    }

    /// 2xx check; only these responses are ever cached.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Parse the body as JSON, if it is JSON.
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// 202 acknowledgment for a mutation queued while offline.
    pub fn queued(action_id: &str) -> Self {
        Self::json_body(202, &json!({ "queued": true, "actionId": action_id }))
    }

    /// 503 answer when a read can be served neither from network nor cache.
    pub fn offline(retry_after_secs: u64) -> Self {
        Self::json_body(
            503,
            &json!({ "error": "NetworkError", "offline": true, "retryAfter": retry_after_secs }),
        )
    }

    /// 400 answer for a malformed tenant id; never queued, never cached.
    pub fn validation_error(message: &str) -> Self {
        Self::json_body(400, &json!({ "error": "ValidationError", "message": message }))
    }

    #[must_use]
    pub fn mark_served_from_cache(mut self) -> Self {
        self.served_from_cache = true;
        self
    }
}
