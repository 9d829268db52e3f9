//! Explicit retry policy for provider calls.
//!
//! A `RetryPolicy` is a plain value (attempt cap, backoff schedule, retryable
//! predicate) that call sites wrap around each provider call. Transient errors
//! are retried with exponential backoff and jitter; everything else returns
//! immediately.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{send_with_timeout, ModelProvider, ModelRequest, ProviderError};

/// Why a retried call gave up.
#[derive(Debug, Error)]
pub enum RetryCause {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cancelled")]
    Cancelled,
}

/// Final failure of a retried call.
#[derive(Debug, Error)]
#[error("{cause} (after {attempts} attempt(s))")]
pub struct RetryError {
    pub attempts: u32,
    pub cause: RetryCause,
}

impl RetryError {
    /// The provider error that ended the retry loop, if it was not cancelled.
    pub fn provider_error(&self) -> Option<&ProviderError> {
        match &self.cause {
            RetryCause::Provider(err) => Some(err),
            RetryCause::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.cause, RetryCause::Cancelled)
    }
}

/// Retry parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first call
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Cap on any single delay in milliseconds
    pub max_delay_ms: u64,

    /// Symmetric jitter range as a fraction of the delay (0.0–1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether `err` should be retried under this policy.
    pub fn is_retryable(&self, err: &ProviderError) -> bool {
        err.is_transient()
    }

    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let delay = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Delay before retry number `retry` with jitter applied.
    ///
    /// A provider-supplied wait (`Retry-After`) is honoured when longer.
    pub fn backoff_delay(&self, retry: u32, requested: Option<Duration>) -> Duration {
        let base = self.base_backoff(retry).as_millis() as f64;
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        let factor = 1.0 - jitter + rand::random::<f64>() * 2.0 * jitter;
        let delay = Duration::from_millis((base * factor).round() as u64);
        match requested {
            Some(wait) if wait > delay => wait,
            _ => delay,
        }
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts, or
    /// `cancel` fires.
    ///
    /// Returns the value together with the number of attempts made.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError {
                    attempts,
                    cause: RetryCause::Cancelled,
                });
            }

            attempts += 1;
            let err = match op().await {
                Ok(value) => return Ok((value, attempts)),
                Err(err) => err,
            };

            if !self.is_retryable(&err) || attempts >= max_attempts {
                return Err(RetryError {
                    attempts,
                    cause: RetryCause::Provider(err),
                });
            }

            let delay = self.backoff_delay(attempts, err.retry_after());
            debug!(
                attempt = attempts,
                category = err.category(),
                delay_ms = delay.as_millis() as u64,
                "retrying provider call"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    warn!(attempt = attempts, "retry wait cancelled");
                    return Err(RetryError {
                        attempts,
                        cause: RetryCause::Cancelled,
                    });
                }
            }
        }
    }

    /// Send `request` through `provider` with a per-call deadline under this
    /// policy.
    pub async fn send(
        &self,
        provider: &dyn ModelProvider,
        request: &ModelRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(String, u32), RetryError> {
        self.run(cancel, || send_with_timeout(provider, request, timeout))
            .await
    }
}
