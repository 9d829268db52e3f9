//! Core data models for the paper knowledge engine.
//!
//! This module contains the fundamental data structures shared by every stage
//! of the pipeline: the chunks produced by the segmenter, the per-aspect
//! partial extractions produced by the orchestrator, the merged and persisted
//! paper record, and the search results returned by the store.

use std::fmt;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One category of extracted knowledge.
///
/// Every chunk is asked about every aspect (math only where relevant), and the
/// merger folds the per-chunk answers of each aspect into one record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aspect {
    Summary,
    Takeaways,
    Math,
    Architecture,
    Domain,
    FutureDirections,
}

impl Aspect {
    /// All aspects in slot order.
    pub const ALL: [Aspect; 6] = [
        Aspect::Summary,
        Aspect::Takeaways,
        Aspect::Math,
        Aspect::Architecture,
        Aspect::Domain,
        Aspect::FutureDirections,
    ];

    /// Position of this aspect inside a chunk's slot row.
    pub fn slot(self) -> usize {
        match self {
            Aspect::Summary => 0,
            Aspect::Takeaways => 1,
            Aspect::Math => 2,
            Aspect::Architecture => 3,
            Aspect::Domain => 4,
            Aspect::FutureDirections => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Aspect::Summary => "summary",
            Aspect::Takeaways => "takeaways",
            Aspect::Math => "math",
            Aspect::Architecture => "architecture",
            Aspect::Domain => "domain",
            Aspect::FutureDirections => "future_directions",
        }
    }

    /// Whether the model answer for this aspect is parsed as a list.
    pub fn is_list(self) -> bool {
        matches!(
            self,
            Aspect::Takeaways | Aspect::Math | Aspect::FutureDirections
        )
    }
}

impl fmt::Display for Aspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bounded slice of document text processed as one model input.
///
/// `text` is always an exact slice of the source (`&source[span]`). The first
/// `overlap` bytes repeat the tail of the previous chunk so that the model sees
/// some context across the split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based sequence index
    pub index: usize,

    /// Byte range of this chunk in the source text
    pub span: Range<usize>,

    /// The chunk text
    pub text: String,

    /// Number of leading bytes shared with the previous chunk
    pub overlap: usize,

    /// Section heading in effect at the start of the chunk, if known
    pub section: Option<String>,

    /// Whether the chunk overlaps a detected equation region
    pub has_math: bool,
}

impl Chunk {
    /// The part of the chunk that does not repeat the previous chunk.
    pub fn fresh_text(&self) -> &str {
        &self.text[self.overlap..]
    }
}

/// Content extracted for one (chunk, aspect) slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExtractedContent {
    Text(String),
    List(Vec<String>),
    /// Placeholder for a slot that degraded, was skipped, or had nothing to say
    Empty,
}

impl ExtractedContent {
    pub fn is_empty(&self) -> bool {
        match self {
            ExtractedContent::Text(text) => text.trim().is_empty(),
            ExtractedContent::List(items) => items.iter().all(|i| i.trim().is_empty()),
            ExtractedContent::Empty => true,
        }
    }
}

/// Result of one extraction call, before merging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialExtraction {
    pub chunk_index: usize,
    pub aspect: Aspect,
    pub content: ExtractedContent,
}

impl PartialExtraction {
    pub fn new(chunk_index: usize, aspect: Aspect, content: ExtractedContent) -> Self {
        Self {
            chunk_index,
            aspect,
            content,
        }
    }
}

/// The merged, persisted knowledge record for one paper.
///
/// This is the only durable representation of a paper. The id is derived from
/// the source file name and title, so processing the same source twice lands
/// on the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperRecord {
    /// Stable identifier (see [`paper_id_for`])
    pub paper_id: String,

    pub title: String,

    /// Path of the source document as given at summarize time
    pub filepath: String,

    /// Final rolling summary
    pub summary: String,

    /// Ordered, deduplicated takeaways
    pub takeaways: Vec<String>,

    /// Architecture description, when the paper describes one
    pub architecture: Option<String>,

    /// Ordered, deduplicated mathematical formulations
    pub math_formulations: Vec<String>,

    /// Research domain resolved by majority vote
    pub domain: String,

    pub future_directions: Vec<String>,

    /// Free-form user annotations
    #[serde(default)]
    pub notes: Vec<String>,

    /// Aspects for which no content survived extraction
    #[serde(default)]
    pub missing_fields: Vec<Aspect>,

    /// Whole-paper embedding (title + summary + takeaways)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl PaperRecord {
    /// Text used for the whole-paper embedding.
    pub fn embedding_text(&self) -> String {
        let mut text = format!("{}\n{}", self.title, self.summary);
        for takeaway in &self.takeaways {
            text.push('\n');
            text.push_str(takeaway);
        }
        text
    }

    /// Whether any aspect came back empty.
    pub fn is_degraded(&self) -> bool {
        !self.missing_fields.is_empty()
    }
}

/// Derive the stable paper id from the source path and resolved title.
///
/// The file name and title are joined, stripped of punctuation, lowercased and
/// whitespace-collapsed before hashing, so cosmetic differences in either do
/// not produce a new id.
pub fn paper_id_for(filepath: &Path, title: &str) -> String {
    let file_name = filepath
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let combined = format!("{}_{}", file_name, title);

    let cleaned: String = combined
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect();
    let normalized = cleaned
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase();

    let digest = Sha256::digest(normalized.as_bytes());
    digest.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Relevance classification for search results.
///
/// Papers are categorized by their semantic similarity to the query,
/// allowing clients to understand the quality of matches.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RelevanceLevel {
    /// Extremely high similarity (score > 0.95)
    Identical,

    /// Very high similarity (score > 0.85)
    HighlySimilar,

    /// Moderate similarity (score > 0.70)
    Similar,

    /// Lower similarity but still returned
    Relevant,
}

impl RelevanceLevel {
    /// Determine relevance level from a similarity score.
    pub fn from_score(score: f32) -> Self {
        if score > 0.95 {
            RelevanceLevel::Identical
        } else if score > 0.85 {
            RelevanceLevel::HighlySimilar
        } else if score > 0.70 {
            RelevanceLevel::Similar
        } else {
            RelevanceLevel::Relevant
        }
    }
}

/// A single search result.
///
/// For semantic searches `score` is the cosine similarity; for title and
/// domain searches it is the textual match score (1.0 for a substring hit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub paper: PaperRecord,

    pub score: f32,

    pub relevance: RelevanceLevel,

    /// The takeaway that matched, for takeaway-granularity searches
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_takeaway: Option<String>,
}

impl SearchResult {
    /// Create a new search result from a paper and score.
    pub fn new(paper: PaperRecord, score: f32) -> Self {
        Self {
            paper,
            score,
            relevance: RelevanceLevel::from_score(score),
            matched_takeaway: None,
        }
    }

    pub fn with_takeaway(mut self, takeaway: impl Into<String>) -> Self {
        self.matched_takeaway = Some(takeaway.into());
        self
    }
}

/// A distinct research domain and the number of stored papers in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCount {
    pub domain: String,
    pub count: usize,
}

/// Configuration for the embedding model.
///
/// This configuration is stored alongside the database to ensure consistency
/// between ingestion and query-time embedding generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Name/identifier of the embedding model (e.g., "text-embedding-3-small")
    pub model_name: String,

    /// Dimension of the embedding vectors
    pub dimension: usize,
}

/// One slot that lost its content during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Degradation {
    pub chunk_index: usize,
    pub aspect: Aspect,
    /// Human-readable cause (last provider error or parse failure)
    pub reason: String,
    /// Number of provider calls made for the slot
    pub attempts: u32,
}

/// Which (chunk, aspect) slots degraded during a summarize run.
///
/// Callers use this to decide whether to retry a paper with `force`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationManifest {
    pub entries: Vec<Degradation>,

    /// Slots intentionally not attempted (math on chunks without equations)
    pub skipped: usize,
}

impl DegradationManifest {
    pub fn is_degraded(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn record(&mut self, degradation: Degradation) {
        self.entries.push(degradation);
    }

    /// Degraded entries for one aspect, in chunk order.
    pub fn for_aspect(&self, aspect: Aspect) -> impl Iterator<Item = &Degradation> {
        self.entries.iter().filter(move |d| d.aspect == aspect)
    }
}

/// Record fields that can be extended after summarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaperField {
    Takeaways,
    FutureDirections,
    Math,
    Notes,
    Domain,
}

impl PaperField {
    /// Field names accepted by [`FromStr`].
    pub const NAMES: [&'static str; 5] = ["takeaways", "future", "math", "notes", "domain"];
}

impl FromStr for PaperField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "takeaways" | "takeaway" => Ok(PaperField::Takeaways),
            "future" | "future_directions" | "future_ideas" => Ok(PaperField::FutureDirections),
            "math" | "math_formulations" => Ok(PaperField::Math),
            "notes" | "note" => Ok(PaperField::Notes),
            "domain" => Ok(PaperField::Domain),
            other => Err(format!(
                "unknown field '{}' (available: {})",
                other,
                PaperField::NAMES.join(", ")
            )),
        }
    }
}
