//! Upstream HTTP transport.
//!
//! The engine never talks to reqwest directly; it goes through the
//! [`HttpTransport`] trait so tests can script upstream behavior. The
//! error type only covers transport-level failures (connect, timeout):
//! an HTTP error status is still a response, and only transport failures
//! feed connectivity detection and outbox queueing.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::request::{HttpMethod, SyncRequest, SyncResponse};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Request timed out: {0}")]
    Timeout(String),
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Transport error: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Abstraction over the upstream network.
///
/// `Ok` means a response arrived, whatever its status. `Err` means the
/// upstream was not reached at all.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn execute(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError>;

    /// Cheap reachability check against a health endpoint. Any HTTP
    /// response counts as reachable.
    async fn probe(&self, url: &str) -> Result<(), TransportError>;
}

/// Production transport backed by a shared reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("opsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { client })
    }

    fn reqwest_method(method: HttpMethod) -> reqwest::Method {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: &SyncRequest) -> Result<SyncResponse, TransportError> {
        let mut builder = self
            .client
            .request(Self::reqwest_method(request.method), request.url.clone());

        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let body = response.bytes().await?;

        debug!(
            method = %request.method,
            path = request.path(),
            status,
            bytes = body.len(),
            "Upstream response"
        );

        Ok(SyncResponse::new(status, content_type, body))
    }

    async fn probe(&self, url: &str) -> Result<(), TransportError> {
        self.client.get(url).send().await?;
        Ok(())
    }
}
