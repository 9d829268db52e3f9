//! Paper Pal - structured knowledge extraction and retrieval for research papers.
//!
//! Given the text of a scientific paper, the library splits it into chunks that
//! fit a model's context window, asks a language model for each aspect of each
//! chunk, merges the partial answers into one [`PaperRecord`], and stores it
//! with embeddings for later search, comparison and discussion.
//!
//! # Architecture
//!
//! - **segmenter**: bounded, boundary-preserving chunking with layout hints
//! - **provider**: language-model clients and the retry policy around them
//! - **extraction**: per-chunk, per-aspect model calls with graceful degradation
//! - **merge**: folds partial extractions into one record
//! - **embedding**: text embedding generation and normalization
//! - **storage**: SQLite persistence of records and takeaway embeddings
//! - **store**: search, append and consistency rules over storage
//! - **query**: search query parsing and ranking helpers
//! - **compare**: cross-paper comparison over a working set
//! - **discuss**: question-driven context selection for follow-up questions
//! - **generate**: reference implementations and blog posts for a paper
//! - **ingestion**: the summarize pipeline from document to stored record
//! - **session**: the interactive operation surface
//! - **config**: layered configuration
//!
//! # Workflow
//!
//! ## Summarize
//!
//! 1. Read the document text and infer layout hints
//! 2. Segment into chunks under the model's budget
//! 3. Extract every aspect of every chunk, degrading failed slots
//! 4. Merge into one record and store it with its embeddings
//!
//! ## Explore
//!
//! 1. Search by meaning, title, domain or takeaway
//! 2. Open a paper, discuss it, annotate it
//! 3. Collect papers into a comparison set and compare them
//! 4. Generate a reference implementation or a blog post for the open paper
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use paper_pal::{
//!     config::AppConfig,
//!     embedding::DynamicEmbeddingProvider,
//!     ingestion::IngestionPipeline,
//!     storage::sqlite::SqliteStorage,
//!     store::PaperStore,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load(None)?;
//!     let embedder = DynamicEmbeddingProvider::from_settings(&config.embedding)?;
//!     let storage = SqliteStorage::open(config.database_path(), config.store.sqlite.clone())?;
//!     let store = Arc::new(PaperStore::open(embedder, storage, config.store.clone()).await?);
//!     let provider = paper_pal::provider::from_settings(&config.provider)?;
//!
//!     let pipeline = IngestionPipeline::new(store.clone(), provider, Default::default());
//!     let outcome = pipeline
//!         .summarize("paper.txt".as_ref(), false, &CancellationToken::new())
//!         .await?;
//!     println!("{}: {}", outcome.record.paper_id, outcome.record.title);
//!
//!     for result in store.search("attention mechanisms", 5).await? {
//!         println!("{:.3} {}", result.score, result.paper.title);
//!     }
//!     Ok(())
//! }
//! ```

pub mod compare;
pub mod config;
pub mod discuss;
pub mod embedding;
pub mod extraction;
pub mod generate;
pub mod ingestion;
pub mod merge;
pub mod models;
pub mod provider;
pub mod query;
pub mod segmenter;
pub mod session;
pub mod storage;
pub mod store;

// Re-export commonly used types at the crate root
pub use config::AppConfig;
pub use embedding::EmbeddingProvider;
pub use models::{Aspect, Chunk, EmbeddingConfig, PaperRecord, RelevanceLevel, SearchResult};
pub use provider::ModelProvider;
pub use query::SearchQuery;
pub use session::{Session, SessionContext};
pub use storage::PaperStorage;
pub use store::PaperStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
