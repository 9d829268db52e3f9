//! Storage layer abstraction and implementations.
//!
//! This module defines the interface for persisting and retrieving paper
//! records, their whole-paper embeddings and the per-takeaway embeddings used
//! for takeaway-level search. Ranking and matching live in the `store` service
//! on top of this trait; backends only move rows.

pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{EmbeddingConfig, PaperRecord};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    ConnectionError(String),

    /// Query execution error
    #[error("Query execution failed: {0}")]
    QueryError(String),

    /// Data serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Schema or migration error
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Record not found
    #[error("Paper not found: {0}")]
    NotFound(String),

    /// The database stayed locked by another writer after every retry
    #[error("Write conflict on paper {paper_id}: {message}")]
    WriteConflict { paper_id: String, message: String },

    /// The store was built with a different embedding model
    #[error("Embedding config mismatch: store uses {stored} ({stored_dim} dims), provider is {requested} ({requested_dim} dims)")]
    ConfigMismatch {
        stored: String,
        stored_dim: usize,
        requested: String,
        requested_dim: usize,
    },

    /// Other unexpected errors
    #[error("Unexpected storage error: {0}")]
    Other(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// One row of the takeaway index.
#[derive(Debug, Clone, PartialEq)]
pub struct TakeawayEntry {
    pub paper_id: String,
    pub takeaway_index: usize,
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Trait for paper storage backends.
///
/// Implementations must make [`PaperStorage::upsert_paper`] atomic: readers see
/// either the previous record with its takeaway rows or the new one, never a
/// mix of both.
#[async_trait]
pub trait PaperStorage: Send + Sync {
    /// Initialize the storage (create tables, indexes, etc.).
    ///
    /// This should be idempotent and safe to call multiple times.
    ///
    /// # Errors
    /// Returns `StorageError` if initialization fails
    async fn initialize(&self) -> StorageResult<()>;

    /// Store the embedding configuration.
    ///
    /// # Errors
    /// Returns `StorageError` if storage fails
    async fn store_config(&self, config: &EmbeddingConfig) -> StorageResult<()>;

    /// Retrieve the embedding configuration, or `None` for a fresh store.
    async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>>;

    /// Insert or replace a paper together with its takeaway embeddings.
    ///
    /// # Arguments
    /// * `record` - The record to write, keyed by `paper_id`
    /// * `takeaway_embeddings` - One embedding per entry of `record.takeaways`,
    ///   in the same order
    ///
    /// # Errors
    /// Returns `StorageError::WriteConflict` if the database stayed locked,
    /// or `StorageError::SerializationError` if the embeddings do not line up
    /// with the takeaways
    async fn upsert_paper(
        &self,
        record: &PaperRecord,
        takeaway_embeddings: &[Vec<f32>],
    ) -> StorageResult<()>;

    /// Get a paper by its id.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if the paper doesn't exist
    async fn get_paper(&self, paper_id: &str) -> StorageResult<PaperRecord>;

    /// Retrieve every stored paper, embeddings included.
    async fn get_all_papers(&self) -> StorageResult<Vec<PaperRecord>>;

    /// Retrieve the whole takeaway index.
    async fn get_all_takeaways(&self) -> StorageResult<Vec<TakeawayEntry>>;

    /// Takeaway rows of one paper, in takeaway order.
    async fn get_takeaways(&self, paper_id: &str) -> StorageResult<Vec<TakeawayEntry>>;

    async fn exists(&self, paper_id: &str) -> StorageResult<bool>;

    /// Get the total count of papers in storage.
    async fn count_papers(&self) -> StorageResult<usize>;
}
