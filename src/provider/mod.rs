//! Language-model provider module.
//!
//! This module defines the single call contract every model backend shares,
//! `send(prompt, system_message, temperature, max_tokens) -> text`, the error
//! taxonomy that drives retry decisions, and the configuration-driven factory
//! that picks a concrete backend.
//!
//! The `ModelProvider` trait abstracts the vendor, allowing the extraction,
//! comparison and discussion code to work against OpenAI-compatible endpoints,
//! Gemini, or a test double without coupling to any of them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gemini;
pub mod openai;
pub mod retry;

pub use retry::{RetryCause, RetryError, RetryPolicy};

/// Errors that can occur when calling a model provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Credentials missing, invalid or lacking permission
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// API rate limit exceeded
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        message: String,
        /// Wait requested by the provider, if any
        retry_after: Option<Duration>,
    },

    /// The call did not complete within its deadline
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Provider-side failure (5xx)
    #[error("Server error: {0}")]
    Server(String),

    /// The provider rejected the request itself (bad parameters, prompt too long)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Connection-level failure before a response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// A successful response whose body could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

impl ProviderError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimit { .. }
                | ProviderError::Timeout(_)
                | ProviderError::Server(_)
                | ProviderError::Network(_)
        )
    }

    /// Whether the failure will repeat for every call with these credentials.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProviderError::Auth(_) | ProviderError::Config(_))
    }

    /// Provider-requested wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short category label used in logs.
    pub fn category(&self) -> &'static str {
        match self {
            ProviderError::Auth(_) => "auth",
            ProviderError::RateLimit { .. } => "rate_limit",
            ProviderError::Timeout(_) => "timeout",
            ProviderError::Server(_) => "server",
            ProviderError::InvalidRequest(_) => "invalid_request",
            ProviderError::Network(_) => "network",
            ProviderError::InvalidResponse(_) => "invalid_response",
            ProviderError::Config(_) => "config",
        }
    }

    /// Map an HTTP error status (and body) to a provider error.
    pub fn from_status(status: StatusCode, headers: &HeaderMap, body: &str) -> Self {
        let message = format!("{} {}", status, truncate(body, 300));
        match status.as_u16() {
            401 | 403 => ProviderError::Auth(message),
            429 => ProviderError::RateLimit {
                message,
                retry_after: parse_retry_after(headers),
            },
            408 | 504 => ProviderError::Timeout(message),
            500..=599 => ProviderError::Server(message),
            _ => ProviderError::InvalidRequest(message),
        }
    }

    /// Map a transport error from reqwest.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_decode() {
            ProviderError::InvalidResponse(err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// One model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    pub prompt: String,
    pub system_message: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ModelRequest {
    pub fn new(prompt: impl Into<String>, system_message: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            system_message: system_message.into(),
            temperature: 0.0,
            max_tokens: 4096,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Trait for language-model backends.
///
/// Implementations perform exactly one round-trip per `send` call; retries,
/// timeouts and concurrency limits are applied by the caller.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Send one prompt and return the model's text answer.
    ///
    /// # Errors
    /// Returns `ProviderError` classified so the caller can decide whether to
    /// retry (`is_transient`) or give up.
    async fn send(&self, request: &ModelRequest) -> ProviderResult<String>;

    /// Get a human-readable name of this provider and model.
    fn name(&self) -> &str;
}

/// Run one call with a deadline; an elapsed deadline is a `Timeout` error.
pub async fn send_with_timeout(
    provider: &dyn ModelProvider,
    request: &ModelRequest,
    timeout: Duration,
) -> ProviderResult<String> {
    match tokio::time::timeout(timeout, provider.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(format!(
            "{} did not answer within {:?}",
            provider.name(),
            timeout
        ))),
    }
}

/// Backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Gemini,
}

/// Per-call deadline when nothing is configured.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Deadline for an optional per-component override.
pub fn call_deadline(secs: Option<u64>) -> Duration {
    Duration::from_secs(secs.unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS).max(1))
}

/// Provider configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub kind: ProviderKind,

    /// Model identifier passed to the API
    pub model: String,

    /// API key; falls back to `OPENAI_API_KEY` / `GOOGLE_API_KEY`
    pub api_key: Option<String>,

    /// Override for OpenAI-compatible gateways or tests
    pub base_url: Option<String>,

    /// Per-call deadline in seconds; the default for every component that
    /// does not set its own
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAI,
            model: openai::DEFAULT_MODEL.to_string(),
            api_key: None,
            base_url: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl ProviderSettings {
    fn resolve_api_key(&self, env_var: &str) -> ProviderResult<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(env_var).ok().filter(|key| !key.trim().is_empty()))
            .ok_or_else(|| {
                ProviderError::Config(format!(
                    "no API key configured for {:?}; set {} or provider.api_key",
                    self.kind, env_var
                ))
            })
    }
}

/// Build the configured provider.
///
/// # Errors
/// Returns `ProviderError::Config` if no API key can be found.
pub fn from_settings(settings: &ProviderSettings) -> ProviderResult<Arc<dyn ModelProvider>> {
    match settings.kind {
        ProviderKind::OpenAI => {
            let api_key = settings.resolve_api_key("OPENAI_API_KEY")?;
            let mut provider = openai::OpenAIProvider::new(api_key, Some(settings.model.clone()));
            if let Some(url) = &settings.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Ok(Arc::new(provider))
        }
        ProviderKind::Gemini => {
            let api_key = settings.resolve_api_key("GOOGLE_API_KEY")?;
            let mut provider = gemini::GeminiProvider::new(api_key, Some(settings.model.clone()));
            if let Some(url) = &settings.base_url {
                provider = provider.with_base_url(url.clone());
            }
            Ok(Arc::new(provider))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    struct SlowProvider;

    #[async_trait]
    impl ModelProvider for SlowProvider {
        async fn send(&self, _request: &ModelRequest) -> ProviderResult<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[test]
    fn test_status_classification() {
        let headers = HeaderMap::new();
        assert!(matches!(
            ProviderError::from_status(StatusCode::UNAUTHORIZED, &headers, ""),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_GATEWAY, &headers, ""),
            ProviderError::Server(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::GATEWAY_TIMEOUT, &headers, ""),
            ProviderError::Timeout(_)
        ));
        assert!(matches!(
            ProviderError::from_status(StatusCode::BAD_REQUEST, &headers, "context too long"),
            ProviderError::InvalidRequest(_)
        ));
    }

    #[test]
    fn test_rate_limit_reads_retry_after() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        let err = ProviderError::from_status(StatusCode::TOO_MANY_REQUESTS, &headers, "slow down");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(3)));
        assert!(err.is_transient());
        assert_eq!(err.category(), "rate_limit");
    }

    #[test]
    fn test_transient_and_fatal_sets() {
        assert!(ProviderError::Timeout("t".into()).is_transient());
        assert!(ProviderError::Server("s".into()).is_transient());
        assert!(!ProviderError::Auth("a".into()).is_transient());
        assert!(!ProviderError::InvalidRequest("i".into()).is_transient());
        assert!(ProviderError::Auth("a".into()).is_fatal());
        assert!(!ProviderError::InvalidRequest("i".into()).is_fatal());
    }

    #[tokio::test]
    async fn test_send_with_timeout_maps_elapsed_to_timeout() {
        let request = ModelRequest::new("hi", "");
        let result = send_with_timeout(&SlowProvider, &request, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ProviderError::Timeout(_))));
    }

    #[test]
    fn test_from_settings_requires_key() {
        let settings = ProviderSettings {
            kind: ProviderKind::Gemini,
            api_key: Some("  ".to_string()),
            ..ProviderSettings::default()
        };
        // GOOGLE_API_KEY may be set in a developer shell; only assert when it is not.
        if std::env::var("GOOGLE_API_KEY").is_err() {
            assert!(matches!(from_settings(&settings), Err(ProviderError::Config(_))));
        }
    }

    #[test]
    fn test_from_settings_builds_configured_backend() {
        let settings = ProviderSettings {
            kind: ProviderKind::OpenAI,
            model: "gpt-4o-mini".to_string(),
            api_key: Some("sk-test".to_string()),
            ..ProviderSettings::default()
        };
        let provider = from_settings(&settings).unwrap();
        assert!(provider.name().contains("gpt-4o-mini"));
    }
}
