// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Exponential-backoff retry for transient failures.
//!
//! The durable store is the main customer: opening the SQLite file at boot
//! and individual queries both go through [`retry`] with different presets.
//!
//! # Example
//!
//! ```
//! use opsync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on a bad store path
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Recovery: never give up waiting for connectivity
//! let recovery = RetryConfig::recovery();
//! assert_eq!(recovery.max_retries, None);
//!
//! // Query: quick retry, then fail
//! let query = RetryConfig::query();
//! assert_eq!(query.max_retries, Some(3));
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff schedule for one class of operation.
///
/// `max_retries` counts total attempts; `None` retries forever. The delay
/// starts at `initial_delay` and multiplies by `factor` up to `max_delay`.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::recovery()
    }
}

impl RetryConfig {
    /// Opening the durable store at boot. Five attempts inside roughly five
    /// seconds, so a bad path or a locked file surfaces as a startup error
    /// instead of a wedged engine.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Waiting out a dead network. Never gives up; the delay doubles to a
    /// one-minute ceiling.
    #[must_use]
    pub fn recovery() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            factor: 2.0,
        }
    }

    /// Individual store queries. Three quick attempts, then the error goes
    /// back to the caller.
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Millisecond delays so retry paths stay fast under test.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Run `operation` until it succeeds or the attempt budget is spent.
/// The final error is returned unchanged.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(op = operation_name, retries = attempts, "Operation recovered");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                match config.max_retries {
                    Some(max) if attempts >= max => return Err(err),
                    Some(max) => warn!(
                        op = operation_name,
                        attempt = attempts,
                        max,
                        error = %err,
                        next_try = ?delay,
                        "Operation failed, retrying"
                    ),
                    None => warn!(
                        op = operation_name,
                        attempt = attempts,
                        error = %err,
                        next_try = ?delay,
                        "Operation failed, retrying until it succeeds"
                    ),
                }
                sleep(delay).await;
                delay = delay.mul_f64(config.factor).min(config.max_delay);
            }
        }
    }
}
