//! Result merger.
//!
//! Folds the chunk-ordered partial extractions of one run into a single
//! `PaperRecord`. Every selection rule here is deterministic: the same
//! partials always produce the same record.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use similar::TextDiff;
use thiserror::Error;
use tracing::debug;

use crate::models::{Aspect, Chunk, ExtractedContent, PaperRecord, PartialExtraction};
use crate::segmenter::{title_candidate, LayoutHints};

/// Domain used when no chunk produced a usable guess.
pub const UNKNOWN_DOMAIN: &str = "Unknown";

/// Errors raised when the partials violate run invariants.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MergeError {
    #[error("Nothing to merge: the run produced no chunks")]
    NoChunks,

    #[error("Partial for chunk {chunk_index} but the run has {chunk_count} chunks")]
    ChunkOutOfRange {
        chunk_index: usize,
        chunk_count: usize,
    },

    #[error("Two partials for chunk {chunk_index}, aspect {aspect}")]
    DuplicateSlot { chunk_index: usize, aspect: Aspect },
}

/// Result type for merging.
pub type MergeResult<T> = Result<T, MergeError>;

/// Merge heuristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Character-level similarity at or above which two list items are the
    /// same item; `None` disables fuzzy matching
    pub fuzzy_threshold: Option<f32>,

    /// Terms that mark architecture-describing text
    pub architecture_keywords: Vec<String>,

    /// Relative gap under which the best architecture fragment is not a
    /// clear winner
    pub ambiguity_margin: f64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        let keywords = [
            "layer", "encoder", "decoder", "attention", "transformer", "embedding",
            "convolution", "module", "block", "network", "head", "residual",
            "normalization", "feed-forward", "pooling", "hidden", "parameter",
            "architecture", "mlp", "lstm", "backbone", "input", "output",
        ];
        Self {
            fuzzy_threshold: Some(0.9),
            architecture_keywords: keywords.iter().map(|k| k.to_string()).collect(),
            ambiguity_margin: 0.15,
        }
    }
}

/// Identity of the record being merged.
#[derive(Debug, Clone)]
pub struct RecordHeader {
    pub paper_id: String,
    pub title: String,
    pub filepath: String,
}

/// Resolve the paper title once, before extraction.
///
/// Order: layout hint title, then the first plausible title line of the
/// first chunk, then the file stem.
pub fn resolve_title(hints: &LayoutHints, chunks: &[Chunk], filepath: &Path) -> String {
    hints
        .title
        .as_deref()
        .map(str::trim)
        .filter(|title| !title.is_empty())
        .map(str::to_string)
        .or_else(|| chunks.first().and_then(|chunk| title_candidate(&chunk.text)))
        .or_else(|| {
            filepath
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .filter(|stem| !stem.is_empty())
        })
        .unwrap_or_else(|| "Untitled".to_string())
}

/// Key used for exact duplicate detection.
///
/// Lowercased, whitespace-collapsed, with trailing punctuation removed.
pub fn dedup_key(item: &str) -> String {
    item.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

/// Character-level similarity in `[0, 1]`.
pub fn similarity(a: &str, b: &str) -> f32 {
    TextDiff::from_chars(a, b).ratio()
}

/// Drop duplicates, keeping the first occurrence of each item.
pub fn dedup_items<I>(items: I, fuzzy_threshold: Option<f32>) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut kept: Vec<(String, String)> = Vec::new();
    for item in items {
        let item = item.trim().to_string();
        let key = dedup_key(&item);
        if key.is_empty() {
            continue;
        }
        let duplicate = kept.iter().any(|(seen, _)| {
            *seen == key || fuzzy_threshold.is_some_and(|t| similarity(seen, &key) >= t)
        });
        if !duplicate {
            kept.push((key, item));
        }
    }
    kept.into_iter().map(|(_, item)| item).collect()
}

fn density(fragment: &str, keywords: &[String]) -> f64 {
    let words = fragment.split_whitespace().count();
    if words == 0 {
        return 0.0;
    }
    let lower = fragment.to_lowercase();
    let hits: usize = keywords
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| lower.matches(k.to_lowercase().as_str()).count())
        .sum();
    hits as f64 * 100.0 / words as f64
}

/// Merges partial extractions into a record.
#[derive(Debug, Clone, Default)]
pub struct Merger {
    config: MergeConfig,
}

impl Merger {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Merge the partials of one run.
    ///
    /// # Arguments
    /// * `header` - id, resolved title and source path
    /// * `chunk_count` - number of chunks in the run
    /// * `partials` - slot results, at most one per (chunk, aspect)
    /// * `now` - timestamp stamped on the record
    ///
    /// # Errors
    /// Returns `MergeError` if the run had no chunks, a partial references a
    /// chunk outside the run, or a slot appears twice.
    pub fn merge(
        &self,
        header: RecordHeader,
        chunk_count: usize,
        partials: &[PartialExtraction],
        now: DateTime<Utc>,
    ) -> MergeResult<PaperRecord> {
        if chunk_count == 0 {
            return Err(MergeError::NoChunks);
        }
        let mut seen = HashSet::new();
        for partial in partials {
            if partial.chunk_index >= chunk_count {
                return Err(MergeError::ChunkOutOfRange {
                    chunk_index: partial.chunk_index,
                    chunk_count,
                });
            }
            if !seen.insert((partial.chunk_index, partial.aspect)) {
                return Err(MergeError::DuplicateSlot {
                    chunk_index: partial.chunk_index,
                    aspect: partial.aspect,
                });
            }
        }

        let mut ordered: Vec<&PartialExtraction> = partials.iter().collect();
        ordered.sort_by_key(|p| (p.chunk_index, p.aspect.slot()));
        let ordered = &ordered;
        let of = move |aspect: Aspect| {
            ordered
                .iter()
                .filter(move |p| p.aspect == aspect)
                .map(|p| &p.content)
        };

        let summary = of(Aspect::Summary)
            .filter_map(|content| match content {
                ExtractedContent::Text(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
                _ => None,
            })
            .last()
            .unwrap_or_default();

        let takeaways = self.merge_list(of(Aspect::Takeaways));
        let math_formulations = self.merge_list(of(Aspect::Math));
        let future_directions = self.merge_list(of(Aspect::FutureDirections));
        let architecture = self.merge_architecture(of(Aspect::Architecture));
        let domain = merge_domain(of(Aspect::Domain));

        let mut missing_fields = Vec::new();
        if summary.is_empty() {
            missing_fields.push(Aspect::Summary);
        }
        if takeaways.is_empty() {
            missing_fields.push(Aspect::Takeaways);
        }
        if math_formulations.is_empty() {
            missing_fields.push(Aspect::Math);
        }
        if architecture.is_none() {
            missing_fields.push(Aspect::Architecture);
        }
        if domain.is_none() {
            missing_fields.push(Aspect::Domain);
        }
        if future_directions.is_empty() {
            missing_fields.push(Aspect::FutureDirections);
        }

        debug!(
            paper_id = %header.paper_id,
            takeaways = takeaways.len(),
            math = math_formulations.len(),
            missing = missing_fields.len(),
            "Merged partial extractions"
        );

        Ok(PaperRecord {
            paper_id: header.paper_id,
            title: header.title,
            filepath: header.filepath,
            summary,
            takeaways,
            architecture,
            math_formulations,
            domain: domain.unwrap_or_else(|| UNKNOWN_DOMAIN.to_string()),
            future_directions,
            notes: Vec::new(),
            missing_fields,
            embedding: None,
            created_at: now,
            updated_at: now,
        })
    }

    fn merge_list<'a>(&self, contents: impl Iterator<Item = &'a ExtractedContent>) -> Vec<String> {
        let items = contents.flat_map(|content| match content {
            ExtractedContent::List(items) => items.clone(),
            ExtractedContent::Text(text) => vec![text.clone()],
            ExtractedContent::Empty => Vec::new(),
        });
        dedup_items(items, self.config.fuzzy_threshold)
    }

    /// Pick the densest architecture fragment, or join all distinct
    /// fragments when the top two are too close to call.
    fn merge_architecture<'a>(
        &self,
        contents: impl Iterator<Item = &'a ExtractedContent>,
    ) -> Option<String> {
        let fragments: Vec<String> = dedup_items(
            contents.filter_map(|content| match content {
                ExtractedContent::Text(text) => Some(text.clone()),
                ExtractedContent::List(items) => Some(items.join("\n")),
                ExtractedContent::Empty => None,
            }),
            None,
        );
        match fragments.len() {
            0 => return None,
            1 => return fragments.into_iter().next(),
            _ => {}
        }

        let scores: Vec<f64> = fragments
            .iter()
            .map(|f| density(f, &self.config.architecture_keywords))
            .collect();
        let mut best = 0;
        for (i, score) in scores.iter().enumerate() {
            if *score > scores[best] {
                best = i;
            }
        }
        let runner_up = scores
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != best)
            .map(|(_, s)| *s)
            .fold(0.0_f64, f64::max);

        let top = scores[best];
        if top > 0.0 && runner_up < top * (1.0 - self.config.ambiguity_margin) {
            Some(fragments[best].clone())
        } else {
            Some(fragments.join("\n\n"))
        }
    }
}

/// Majority vote over chunk-level domain guesses.
///
/// Case-insensitive; "Unknown" guesses do not vote; ties go to the guess
/// that appeared first.
fn merge_domain<'a>(contents: impl Iterator<Item = &'a ExtractedContent>) -> Option<String> {
    let mut tally: Vec<(String, String, usize)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for content in contents {
        let guess = match content {
            ExtractedContent::Text(text) => text.trim(),
            _ => continue,
        };
        let key = guess.to_lowercase();
        if key.is_empty() || key == UNKNOWN_DOMAIN.to_lowercase() {
            continue;
        }
        match index.get(&key) {
            Some(&slot) => tally[slot].2 += 1,
            None => {
                index.insert(key.clone(), tally.len());
                tally.push((key, guess.to_string(), 1));
            }
        }
    }

    let mut winner: Option<&(String, String, usize)> = None;
    for entry in &tally {
        if winner.map_or(true, |w| entry.2 > w.2) {
            winner = Some(entry);
        }
    }
    winner.map(|(_, display, _)| display.clone())
}
