//! FastEmbed embedding provider implementation.
//!
//! Runs embedding models locally through the fastembed library, so papers can
//! be indexed and searched without an API key.

use super::{EmbeddingError, EmbeddingProvider, EmbeddingResult};
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Models this crate knows the dimension of, keyed by their `Debug` name.
const KNOWN_MODELS: [(EmbeddingModel, usize); 8] = [
    (EmbeddingModel::AllMiniLML6V2, 384),
    (EmbeddingModel::BGESmallENV15, 384),
    (EmbeddingModel::BGEBaseENV15, 768),
    (EmbeddingModel::BGELargeENV15, 1024),
    (EmbeddingModel::NomicEmbedTextV1, 768),
    (EmbeddingModel::NomicEmbedTextV15, 768),
    (EmbeddingModel::ParaphraseMLMiniLML12V2, 384),
    (EmbeddingModel::ParaphraseMLMpnetBaseV2, 768),
];

/// Resolve a model from its name, ignoring case, `-` and `_`.
///
/// Accepts both the enum spelling ("BGESmallENV15") and the persisted
/// `model_name` of an existing store.
pub fn parse_model(name: &str) -> Option<EmbeddingModel> {
    let wanted = squash(name);
    KNOWN_MODELS
        .iter()
        .map(|(model, _)| model.clone())
        .find(|model| squash(&format!("{:?}", model)) == wanted)
}

fn squash(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_lowercase()
}

fn dimension_of(model: &EmbeddingModel) -> usize {
    KNOWN_MODELS
        .iter()
        .find(|(known, _)| known == model)
        .map(|(_, dim)| *dim)
        .unwrap_or(384)
}

/// Local embedding provider.
#[derive(Clone)]
pub struct FastEmbedProvider {
    /// The embedding model instance (wrapped in Arc<Mutex> for thread-safety)
    model: Arc<Mutex<TextEmbedding>>,

    model_name: String,

    embedding_dimension: usize,
}

impl FastEmbedProvider {
    /// Create a new FastEmbed embedding provider.
    ///
    /// # Arguments
    /// * `model` - Optional model to use (defaults to AllMiniLML6V2)
    /// * `cache_dir` - Optional cache directory for model files
    ///
    /// # Errors
    /// Returns `EmbeddingError::ConfigError` if the model cannot be loaded or
    /// downloaded
    pub fn new(model: Option<EmbeddingModel>, cache_dir: Option<String>) -> EmbeddingResult<Self> {
        let model_type = model.unwrap_or(EmbeddingModel::AllMiniLML6V2);
        let model_name = format!("{:?}", model_type);
        let embedding_dimension = dimension_of(&model_type);

        let mut init_options = InitOptions::new(model_type);
        if let Some(dir) = cache_dir {
            init_options = init_options.with_cache_dir(PathBuf::from(dir));
        }

        let text_embedding = TextEmbedding::try_new(init_options).map_err(|e| {
            EmbeddingError::ConfigError(format!("Failed to initialize FastEmbed model: {}", e))
        })?;

        Ok(Self {
            model: Arc::new(Mutex::new(text_embedding)),
            model_name,
            embedding_dimension,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(EmbeddingError::InvalidInput("Text cannot be empty".to_string()));
        }

        let mut model = self.model.lock().await;
        let embeddings = model
            .embed(vec![text.to_string()], None)
            .map_err(|e| EmbeddingError::Other(format!("Embedding generation failed: {}", e)))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Other("No embedding generated".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        if texts.iter().any(|text| text.trim().is_empty()) {
            return Err(EmbeddingError::InvalidInput("All texts must be non-empty".to_string()));
        }

        let mut model = self.model.lock().await;
        let text_strings: Vec<String> = texts.iter().map(|&s| s.to_string()).collect();
        model.embed(text_strings, None).map_err(|e| {
            EmbeddingError::Other(format!("Batch embedding generation failed: {}", e))
        })
    }

    fn dimension(&self) -> usize {
        self.embedding_dimension
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

// TextEmbedding does not implement Debug
impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("model_name", &self.model_name)
            .field("embedding_dimension", &self.embedding_dimension)
            .finish()
    }
}
