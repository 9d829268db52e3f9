//! Search query parsing and ranking helpers.
//!
//! A query is either free text, ranked by embedding similarity, or a
//! structured filter written as `<kind>:<text>`:
//!
//! ```rust
//! use paper_pal::query::{SearchKind, SearchQuery};
//!
//! let query = SearchQuery::parse("Domain: Computer Vision", 3).unwrap();
//! assert_eq!(query.kind, SearchKind::Domain);
//! assert_eq!(query.text, "Computer Vision");
//! ```
//!
//! Prefixes are matched case-insensitively. Anything without a known prefix is
//! a semantic query, colons included.

use std::cmp::Ordering;
use std::fmt;

use thiserror::Error;

use crate::models::PaperRecord;

/// Default number of results.
pub const DEFAULT_LIMIT: usize = 5;

/// Errors that can occur during query processing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    /// Invalid query parameters
    #[error("Invalid query: {0}")]
    InvalidQuery(String),
}

/// Result type for query operations.
pub type QueryResult<T> = Result<T, QueryError>;

/// How a query is matched against stored papers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    /// Whole-paper embedding similarity
    Semantic,
    /// Domain substring, then fuzzy match
    Domain,
    /// Title substring, then fuzzy match
    Title,
    /// Per-takeaway embedding similarity
    Takeaway,
}

impl SearchKind {
    const PREFIXES: [(&'static str, SearchKind); 3] = [
        ("domain:", SearchKind::Domain),
        ("title:", SearchKind::Title),
        ("takeaway:", SearchKind::Takeaway),
    ];
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SearchKind::Semantic => "semantic",
            SearchKind::Domain => "domain",
            SearchKind::Title => "title",
            SearchKind::Takeaway => "takeaway",
        };
        f.write_str(name)
    }
}

/// Search query parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub kind: SearchKind,

    /// The query text with any prefix removed
    pub text: String,

    /// Maximum number of results to return
    pub limit: usize,
}

impl SearchQuery {
    /// Parse user input into a query.
    ///
    /// # Errors
    /// Returns `QueryError::InvalidQuery` when the text (after any prefix) is
    /// blank or `limit` is zero
    pub fn parse(input: &str, limit: usize) -> QueryResult<Self> {
        let trimmed = input.trim();
        let lowered = trimmed.to_lowercase();

        let (kind, text) = SearchKind::PREFIXES
            .iter()
            .find(|(prefix, _)| lowered.starts_with(prefix))
            .map(|(prefix, kind)| (*kind, &trimmed[prefix.len()..]))
            .unwrap_or((SearchKind::Semantic, trimmed));

        Self::new(kind, text, limit)
    }

    /// Build a query of a known kind.
    pub fn new(kind: SearchKind, text: &str, limit: usize) -> QueryResult<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Err(QueryError::InvalidQuery(format!("empty {} query", kind)));
        }
        if limit == 0 {
            return Err(QueryError::InvalidQuery(
                "result count must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            kind,
            text: text.to_string(),
            limit,
        })
    }
}

/// Compute cosine similarity between two vectors.
///
/// Returns 0.0 when the lengths differ or either vector has zero magnitude,
/// so a stale or corrupt embedding ranks last instead of failing the search.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot_product / (norm_a * norm_b)
}

/// Most recently updated first, then by id.
pub fn by_recency(a: &PaperRecord, b: &PaperRecord) -> Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| a.paper_id.cmp(&b.paper_id))
}

/// Higher score first, ties broken by [`by_recency`].
pub fn by_score(a: (f32, &PaperRecord), b: (f32, &PaperRecord)) -> Ordering {
    b.0.partial_cmp(&a.0)
        .unwrap_or(Ordering::Equal)
        .then_with(|| by_recency(a.1, b.1))
}
