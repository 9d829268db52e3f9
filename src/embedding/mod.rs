//! Embedding provider abstraction and implementations.
//!
//! This module defines the interface for text embedding generation and provides
//! implementations for a local model (FastEmbed) and OpenAI's embeddings API.
//!
//! The abstraction allows the store to swap between different embedding models
//! without changing the core logic of summarization or search. The model in
//! use is recorded in the store, so ingestion and query always embed with the
//! same model.

pub mod fastembed;
pub mod openai;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::models::EmbeddingConfig;

use self::fastembed::FastEmbedProvider;
use self::openai::OpenAIEmbedding;

/// Errors that can occur during embedding operations.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// Network or API communication error
    #[error("API request failed: {0}")]
    ApiError(String),

    /// Invalid input text (e.g., empty, too long)
    #[error("Invalid input text: {0}")]
    InvalidInput(String),

    /// Configuration error (e.g., missing API key)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Other unexpected errors
    #[error("Unexpected error: {0}")]
    Other(String),
}

/// Result type for embedding operations.
pub type EmbeddingResult<T> = Result<T, EmbeddingError>;

/// Text embedding backend.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed pre-normalized text.
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>>;

    /// Embed several texts; output order matches input order.
    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>>;

    /// Get the dimension of embeddings produced by this provider.
    fn dimension(&self) -> usize;

    /// Get the model name/identifier for this provider.
    fn model_name(&self) -> &str;

    /// The configuration persisted alongside vectors produced by this provider.
    fn config(&self) -> EmbeddingConfig {
        EmbeddingConfig {
            model_name: self.model_name().to_string(),
            dimension: self.dimension(),
        }
    }
}

/// Normalizes text for consistent embedding generation.
///
/// This function applies the following transformations:
/// - Converts to lowercase
/// - Trims leading/trailing whitespace
/// - Collapses multiple consecutive spaces to a single space
///
/// # Example
/// ```ignore
/// let normalized = normalize_text("  Hello   World  ");
/// assert_eq!(normalized, "hello world");
/// ```
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Which embedding backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// Local ONNX model, no API required
    FastEmbed,
    /// OpenAI embeddings API (requires an API key)
    OpenAI,
}

/// Embedding configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,

    /// Backend-specific model name; `None` picks the backend default
    pub model: Option<String>,

    /// FastEmbed model cache directory
    pub cache_dir: Option<String>,

    /// OpenAI API key; falls back to `OPENAI_API_KEY`
    pub api_key: Option<String>,

    pub base_url: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::FastEmbed,
            model: None,
            cache_dir: None,
            api_key: None,
            base_url: None,
        }
    }
}

/// Wrapper enum for embedding providers to allow dynamic dispatch
pub enum DynamicEmbeddingProvider {
    FastEmbed(FastEmbedProvider),
    OpenAI(OpenAIEmbedding),
}

impl DynamicEmbeddingProvider {
    /// Build the provider described by `settings`.
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` when the model is unknown or no
    /// API key is available for the OpenAI backend.
    pub fn from_settings(settings: &EmbeddingSettings) -> EmbeddingResult<Self> {
        match settings.backend {
            EmbeddingBackend::FastEmbed => {
                let model = match &settings.model {
                    Some(name) => Some(fastembed::parse_model(name).ok_or_else(|| {
                        EmbeddingError::ConfigError(format!("unknown FastEmbed model '{}'", name))
                    })?),
                    None => None,
                };
                let cache_dir = settings.cache_dir.clone().or_else(|| {
                    dirs::cache_dir().map(|p| p.join("fastembed").to_string_lossy().to_string())
                });
                let provider = FastEmbedProvider::new(model, cache_dir)?;
                info!(
                    model = provider.model_name(),
                    dimension = provider.dimension(),
                    "FastEmbed provider initialized"
                );
                Ok(DynamicEmbeddingProvider::FastEmbed(provider))
            }
            EmbeddingBackend::OpenAI => {
                let api_key = settings
                    .api_key
                    .clone()
                    .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                    .filter(|key| !key.trim().is_empty())
                    .ok_or_else(|| {
                        EmbeddingError::ConfigError(
                            "OPENAI_API_KEY must be set when using OpenAI embeddings".to_string(),
                        )
                    })?;
                let mut provider = OpenAIEmbedding::new(api_key, settings.model.clone());
                if let Some(url) = &settings.base_url {
                    provider = provider.with_base_url(url.clone());
                }
                info!(
                    model = provider.model_name(),
                    dimension = provider.dimension(),
                    "OpenAI embedding provider initialized"
                );
                Ok(DynamicEmbeddingProvider::OpenAI(provider))
            }
        }
    }

    /// Build the provider matching a store's persisted configuration.
    ///
    /// OpenAI models are recognised by their `text-embedding` prefix; anything
    /// else is treated as a FastEmbed model.
    pub fn for_stored_config(
        stored: &EmbeddingConfig,
        settings: &EmbeddingSettings,
    ) -> EmbeddingResult<Self> {
        let backend = if stored.model_name.contains("text-embedding") {
            EmbeddingBackend::OpenAI
        } else {
            EmbeddingBackend::FastEmbed
        };
        let resolved = EmbeddingSettings {
            backend,
            model: Some(stored.model_name.clone()),
            ..settings.clone()
        };
        let provider = Self::from_settings(&resolved)?;
        if provider.dimension() != stored.dimension {
            return Err(EmbeddingError::ConfigError(format!(
                "dimension mismatch: store expects {}, provider returns {}",
                stored.dimension,
                provider.dimension()
            )));
        }
        Ok(provider)
    }
}

#[async_trait]
impl EmbeddingProvider for DynamicEmbeddingProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.embed(text).await,
            DynamicEmbeddingProvider::OpenAI(p) => p.embed(text).await,
        }
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.embed_batch(texts).await,
            DynamicEmbeddingProvider::OpenAI(p) => p.embed_batch(texts).await,
        }
    }

    fn dimension(&self) -> usize {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.dimension(),
            DynamicEmbeddingProvider::OpenAI(p) => p.dimension(),
        }
    }

    fn model_name(&self) -> &str {
        match self {
            DynamicEmbeddingProvider::FastEmbed(p) => p.model_name(),
            DynamicEmbeddingProvider::OpenAI(p) => p.model_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("Hello World"), "hello world");
        assert_eq!(normalize_text("  Multiple   Spaces  "), "multiple spaces");
        assert_eq!(normalize_text("UPPERCASE"), "uppercase");
        assert_eq!(normalize_text("   "), "");
    }

    #[test]
    fn test_from_settings_openai_with_explicit_key() {
        let settings = EmbeddingSettings {
            backend: EmbeddingBackend::OpenAI,
            model: Some("text-embedding-3-large".to_string()),
            api_key: Some("sk-test".to_string()),
            ..EmbeddingSettings::default()
        };
        let provider = DynamicEmbeddingProvider::from_settings(&settings).unwrap();
        assert_eq!(provider.dimension(), 3072);
        assert_eq!(
            provider.config(),
            EmbeddingConfig {
                model_name: "text-embedding-3-large".to_string(),
                dimension: 3072,
            }
        );
    }

    #[test]
    fn test_stored_config_dimension_mismatch_is_rejected() {
        let stored = EmbeddingConfig {
            model_name: "text-embedding-3-small".to_string(),
            dimension: 42,
        };
        let settings = EmbeddingSettings {
            api_key: Some("sk-test".to_string()),
            ..EmbeddingSettings::default()
        };
        let result = DynamicEmbeddingProvider::for_stored_config(&stored, &settings);
        assert!(matches!(result, Err(EmbeddingError::ConfigError(_))));
    }

    #[test]
    fn test_unknown_fastembed_model_is_config_error() {
        let settings = EmbeddingSettings {
            model: Some("definitely-not-a-model".to_string()),
            ..EmbeddingSettings::default()
        };
        let result = DynamicEmbeddingProvider::from_settings(&settings);
        assert!(matches!(result, Err(EmbeddingError::ConfigError(_))));
    }
}
