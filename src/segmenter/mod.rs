//! Document segmentation.
//!
//! Splits normalized document text into ordered chunks that each fit one
//! model call. Chunks break at paragraph and sentence boundaries, keep
//! sections together where they can, and repeat a couple of trailing
//! sentences when a section has to be split so the model keeps some context.
//!
//! Every chunk is an exact slice of the input: chunk 0 followed by each later
//! chunk minus its overlap prefix reproduces the input byte for byte.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::Chunk;

/// Errors that can occur while segmenting a document.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SegmentationError {
    #[error("Document text is empty")]
    Empty,

    #[error("Document text too short: {length} characters (minimum {minimum})")]
    TooShort { length: usize, minimum: usize },

    #[error("Invalid chunk budget: {0}")]
    InvalidBudget(String),
}

/// Result type for segmentation.
pub type SegmentationResult<T> = Result<T, SegmentationError>;

/// Chunk sizing parameters.
///
/// The character budget of a chunk is
/// `(context_window_tokens - reserved_output_tokens - prompt_overhead_tokens) * chars_per_token`.
/// The defaults give 8000-character chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    pub context_window_tokens: usize,
    pub reserved_output_tokens: usize,
    /// Tokens taken by instructions and the rolling summary
    pub prompt_overhead_tokens: usize,
    pub chars_per_token: f64,
    /// Trailing sentences repeated when a section is split
    pub overlap_sentences: usize,
    /// Minimum trimmed document length, in characters
    pub min_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            context_window_tokens: 8192,
            reserved_output_tokens: 4096,
            prompt_overhead_tokens: 2096,
            chars_per_token: 4.0,
            overlap_sentences: 2,
            min_chars: 200,
        }
    }
}

impl SegmenterConfig {
    /// Maximum chunk length in bytes.
    ///
    /// # Errors
    /// Returns `SegmentationError::InvalidBudget` when the window leaves no
    /// room for input or the chars-per-token estimate is not positive.
    pub fn budget(&self) -> SegmentationResult<usize> {
        let tokens = self.context_window_tokens as i64
            - self.reserved_output_tokens as i64
            - self.prompt_overhead_tokens as i64;
        if tokens <= 0 {
            return Err(SegmentationError::InvalidBudget(format!(
                "context window of {} tokens leaves no room after {} output and {} prompt tokens",
                self.context_window_tokens, self.reserved_output_tokens, self.prompt_overhead_tokens
            )));
        }
        if !self.chars_per_token.is_finite() || self.chars_per_token <= 0.0 {
            return Err(SegmentationError::InvalidBudget(format!(
                "chars_per_token must be positive, got {}",
                self.chars_per_token
            )));
        }

        let chars = (tokens as f64 * self.chars_per_token).floor() as usize;
        if chars == 0 {
            return Err(SegmentationError::InvalidBudget("budget rounds down to zero".into()));
        }
        Ok(chars)
    }
}

/// A section heading reported by the text extractor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHint {
    /// Byte offset of the heading in the document text
    pub offset: usize,
    pub title: String,
}

/// Layout information accompanying the extracted text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutHints {
    /// Title from document metadata, if any
    pub title: Option<String>,
    pub headings: Vec<SectionHint>,
    /// Byte ranges of equation regions
    pub equations: Vec<Range<usize>>,
}

static SENTENCE_END: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[.!?]["')\]]*\s+|\n[ \t]*\n\s*"#).unwrap());

static NUMBERED_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\d+(?:\.\d+)*\.?|[IVX]+\.)\s+[A-Z][A-Za-z0-9 ,:&()/-]{1,80}$").unwrap()
});

static LATEX_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\\(?:frac|sum|int|prod|sqrt|alpha|beta|gamma|delta|theta|lambda|mu|sigma|omega|mathbf|mathcal|mathrm|partial|nabla|cdot|times|leq|geq|log|exp|softmax)",
    )
    .unwrap()
});

const SECTION_NAMES: [&str; 24] = [
    "abstract",
    "introduction",
    "background",
    "related work",
    "method",
    "methods",
    "methodology",
    "approach",
    "model",
    "architecture",
    "experiments",
    "experimental setup",
    "evaluation",
    "results",
    "discussion",
    "limitations",
    "conclusion",
    "conclusions",
    "future work",
    "references",
    "bibliography",
    "acknowledgements",
    "acknowledgments",
    "appendix",
];

const MATH_SYMBOLS: [char; 24] = [
    '∑', '∏', '∫', '∂', '∇', '√', '≈', '≤', '≥', '∞', '∈', '∀', '∃', '⊙', '⊗', '×', 'α', 'β',
    'γ', 'θ', 'λ', 'μ', 'σ', 'Σ',
];

fn is_heading(line: &str) -> bool {
    if line.len() > 100 {
        return false;
    }
    let bare = line.trim_end_matches(':').trim().to_lowercase();
    SECTION_NAMES.contains(&bare.as_str())
        || (NUMBERED_HEADING.is_match(line) && line.split_whitespace().count() <= 10)
}

fn is_equation(line: &str) -> bool {
    if LATEX_COMMAND.is_match(line) || line.chars().any(|c| MATH_SYMBOLS.contains(&c)) {
        return true;
    }
    if !line.contains('=') || line.len() > 160 {
        return false;
    }
    let total = line.chars().filter(|c| !c.is_whitespace()).count();
    let symbolic = line
        .chars()
        .filter(|c| "=+-*/^_()[]{}|<>".contains(*c) || c.is_ascii_digit())
        .count();
    total > 0 && symbolic * 4 >= total
}

/// First plausible title line near the top of the document.
///
/// Looks at the first ten non-empty lines for one between 20 and 200
/// characters with at least three words that is not a section heading.
pub fn title_candidate(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .take(10)
        .find(|line| {
            let length = line.chars().count();
            length > 20 && length < 200 && line.split_whitespace().count() >= 3 && !is_heading(line)
        })
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
}

impl LayoutHints {
    /// Infer headings, equation lines and a title from plain text.
    ///
    /// Used when the extractor supplies no layout of its own.
    pub fn infer(text: &str) -> Self {
        let mut hints = LayoutHints {
            title: title_candidate(text),
            ..LayoutHints::default()
        };

        let mut offset = 0;
        for line in text.split_inclusive('\n') {
            let start = offset;
            offset += line.len();

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let lead = line.len() - line.trim_start().len();
            if is_heading(trimmed) {
                hints.headings.push(SectionHint {
                    offset: start + lead,
                    title: trimmed.trim_end_matches(':').to_string(),
                });
            } else if is_equation(trimmed) {
                hints.equations.push(start + lead..start + line.trim_end().len());
            }
        }
        hints
    }
}

/// A contiguous run of text that is never split further unless oversized.
struct Unit {
    range: Range<usize>,
    /// Whether a section heading starts at this unit
    opens_section: bool,
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    idx = idx.min(text.len());
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}

/// Heading offsets snapped to char boundaries, keyed by offset.
fn heading_map(text: &str, headings: &[SectionHint]) -> BTreeMap<usize, String> {
    headings
        .iter()
        .filter(|h| h.offset < text.len())
        .map(|h| (ceil_char_boundary(text, h.offset), h.title.clone()))
        .collect()
}

/// Split a unit longer than `budget` at the last whitespace before the
/// budget, or at a character boundary when there is none.
fn split_oversized(text: &str, range: Range<usize>, budget: usize) -> Vec<Range<usize>> {
    let mut pieces = Vec::new();
    let mut start = range.start;

    while range.end - start > budget {
        let mut limit = floor_char_boundary(text, start + budget);
        if limit == start {
            // budget smaller than one character
            limit = ceil_char_boundary(text, start + 1);
        }
        let window = &text[start..limit];
        let cut = window
            .char_indices()
            .filter(|(_, c)| c.is_whitespace())
            .last()
            .map(|(i, c)| start + i + c.len_utf8())
            .unwrap_or(limit);
        pieces.push(start..cut);
        start = cut;
    }
    if start < range.end {
        pieces.push(start..range.end);
    }
    pieces
}

fn split_units(text: &str, headings: &BTreeMap<usize, String>, budget: usize) -> Vec<Unit> {
    let mut cuts: BTreeSet<usize> = BTreeSet::from([0, text.len()]);
    cuts.extend(SENTENCE_END.find_iter(text).map(|m| m.end()));
    cuts.extend(headings.keys().copied());

    let bounds: Vec<usize> = cuts.into_iter().collect();
    let mut units = Vec::new();
    for pair in bounds.windows(2) {
        let range = pair[0]..pair[1];
        if range.is_empty() {
            continue;
        }
        let opens_section = headings.contains_key(&range.start);
        for (i, piece) in split_oversized(text, range, budget).into_iter().enumerate() {
            units.push(Unit {
                range: piece,
                opens_section: opens_section && i == 0,
            });
        }
    }
    units
}

/// Start of the overlap carried into the next chunk, if any.
///
/// Takes up to `sentences` trailing units whose total length stays within
/// `limit`.
fn overlap_start(members: &[Range<usize>], sentences: usize, limit: usize) -> Option<usize> {
    let mut start = None;
    let mut total = 0;
    for unit in members.iter().rev().take(sentences) {
        if total + unit.len() > limit {
            break;
        }
        total += unit.len();
        start = Some(unit.start);
    }
    start
}

/// Splits text into budget-bounded chunks.
#[derive(Debug, Clone, Default)]
pub struct Segmenter {
    config: SegmenterConfig,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    /// Segment `text` into ordered chunks.
    ///
    /// # Errors
    /// - `Empty` if the text is blank
    /// - `TooShort` if the trimmed text is below `min_chars`
    /// - `InvalidBudget` if the configuration leaves no room for input
    pub fn segment(&self, text: &str, hints: &LayoutHints) -> SegmentationResult<Vec<Chunk>> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(SegmentationError::Empty);
        }
        let length = trimmed.chars().count();
        if length < self.config.min_chars {
            return Err(SegmentationError::TooShort {
                length,
                minimum: self.config.min_chars,
            });
        }
        let budget = self.config.budget()?;

        let headings = heading_map(text, &hints.headings);
        let units = split_units(text, &headings, budget);
        let overlap_cap = budget / 4;

        let mut spans: Vec<(Range<usize>, usize)> = Vec::new();
        let mut start = 0;
        let mut end = 0;
        let mut members: Vec<Range<usize>> = Vec::new();

        for unit in &units {
            let len = unit.range.len();
            let current = end - start;
            let overflows = current + len > budget;
            let section_break = unit.opens_section && current * 2 >= budget;

            if !members.is_empty() && (overflows || section_break) {
                let fresh = members[0].start;
                spans.push((start..end, fresh - start));

                let carried = if unit.opens_section {
                    None
                } else {
                    let room = budget.saturating_sub(len);
                    overlap_start(&members, self.config.overlap_sentences, overlap_cap.min(room))
                };
                start = carried.unwrap_or(end);
                members.clear();
            }

            members.push(unit.range.clone());
            end = unit.range.end;
        }
        if !members.is_empty() {
            let fresh = members[0].start;
            spans.push((start..end, fresh - start));
        }

        let chunks: Vec<Chunk> = spans
            .into_iter()
            .enumerate()
            .map(|(index, (span, overlap))| {
                let fresh_start = span.start + overlap;
                let section = headings
                    .range(..=fresh_start)
                    .next_back()
                    .map(|(_, title)| title.clone());
                let has_math = hints
                    .equations
                    .iter()
                    .any(|eq| !eq.is_empty() && eq.start < span.end && span.start < eq.end);
                Chunk {
                    index,
                    text: text[span.clone()].to_string(),
                    span,
                    overlap,
                    section,
                    has_math,
                }
            })
            .collect();

        debug!(
            chunks = chunks.len(),
            budget,
            math_chunks = chunks.iter().filter(|c| c.has_math).count(),
            "Segmented document"
        );
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(budget: usize) -> SegmenterConfig {
        SegmenterConfig {
            context_window_tokens: budget,
            reserved_output_tokens: 0,
            prompt_overhead_tokens: 0,
            chars_per_token: 1.0,
            overlap_sentences: 2,
            min_chars: 50,
        }
    }

    fn facts(range: Range<usize>) -> String {
        range.map(|i| format!("Fact {:02} is stated. ", i)).collect()
    }

    fn rebuild(chunks: &[Chunk]) -> String {
        let mut out = String::new();
        for chunk in chunks {
            if chunk.index == 0 {
                out.push_str(&chunk.text);
            } else {
                out.push_str(chunk.fresh_text());
            }
        }
        out
    }

    #[test]
    fn test_default_budget_is_8000_chars() {
        assert_eq!(SegmenterConfig::default().budget().unwrap(), 8000);
    }

    #[test]
    fn test_invalid_budget() {
        let config = SegmenterConfig {
            context_window_tokens: 1000,
            reserved_output_tokens: 900,
            prompt_overhead_tokens: 100,
            ..SegmenterConfig::default()
        };
        assert!(matches!(config.budget(), Err(SegmentationError::InvalidBudget(_))));

        let text = facts(0..40);
        let result = Segmenter::new(config).segment(&text, &LayoutHints::default());
        assert!(matches!(result, Err(SegmentationError::InvalidBudget(_))));
    }

    #[test]
    fn test_empty_and_too_short() {
        let segmenter = Segmenter::default();
        assert_eq!(
            segmenter.segment("  \n\t ", &LayoutHints::default()),
            Err(SegmentationError::Empty)
        );
        assert!(matches!(
            segmenter.segment("A short note.", &LayoutHints::default()),
            Err(SegmentationError::TooShort { length: 13, minimum: 200 })
        ));
    }

    #[test]
    fn test_chunks_reconstruct_input_and_respect_budget() {
        let mut text = String::from("Attention Is All You Need\n\n1 Introduction\n");
        text.push_str(&facts(0..25));
        text.push_str("\n\n2 Model Architecture\n");
        text.push_str(&facts(25..60));
        text.push_str("\nL = \\sum_i y_i \\log p_i\n\n3 Results\n");
        text.push_str(&facts(60..80));

        let hints = LayoutHints::infer(&text);
        let chunks = Segmenter::new(small_config(200)).segment(&text, &hints).unwrap();

        assert!(chunks.len() > 3);
        assert_eq!(rebuild(&chunks), text);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert!(chunk.text.len() <= 200, "chunk {} is {} bytes", i, chunk.text.len());
            assert_eq!(chunk.text, &text[chunk.span.clone()]);
        }
    }

    #[test]
    fn test_split_sections_carry_sentence_overlap() {
        let text = facts(0..30);
        let chunks = Segmenter::new(small_config(200))
            .segment(&text, &LayoutHints::default())
            .unwrap();

        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].overlap, 0);
        for chunk in &chunks[1..] {
            // two 19-byte sentences fit in the 50-byte overlap cap
            assert_eq!(chunk.overlap, 38);
            assert!(chunk.text.starts_with("Fact "));
        }
        assert_eq!(rebuild(&chunks), text);
    }

    #[test]
    fn test_heading_starts_new_chunk_without_overlap() {
        let mut text = facts(0..6);
        let heading_at = text.len() + 1;
        text.push_str("\n2 Method\n");
        text.push_str(&facts(6..10));

        let hints = LayoutHints::infer(&text);
        assert_eq!(hints.headings.len(), 1);
        assert_eq!(hints.headings[0].offset, heading_at);

        let chunks = Segmenter::new(small_config(200)).segment(&text, &hints).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].span.start, heading_at);
        assert_eq!(chunks[1].overlap, 0);
        assert_eq!(chunks[1].section.as_deref(), Some("2 Method"));
        assert_eq!(chunks[0].section, None);
    }

    #[test]
    fn test_short_section_stays_with_previous_chunk() {
        let mut text = facts(0..2);
        text.push_str("\n2 Method\n");
        text.push_str(&facts(2..5));

        let hints = LayoutHints::infer(&text);
        let chunks = Segmenter::new(small_config(200)).segment(&text, &hints).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, text);
    }

    #[test]
    fn test_oversized_sentence_splits_at_whitespace() {
        let long_sentence = "word ".repeat(60);
        let chunks = Segmenter::new(small_config(52))
            .segment(&long_sentence, &LayoutHints::default())
            .unwrap();
        assert!(chunks.len() >= 5);
        for chunk in &chunks {
            assert!(chunk.text.len() <= 52);
            assert!(chunk.fresh_text().starts_with("word"));
        }
        assert_eq!(rebuild(&chunks), long_sentence);
    }

    #[test]
    fn test_math_chunks_are_tagged() {
        let mut text = facts(0..12);
        text.push_str("\nThe loss is\nL = \\sum_i y_i \\log p_i\n");
        text.push_str(&facts(12..30));

        let hints = LayoutHints::infer(&text);
        assert_eq!(hints.equations.len(), 1);

        let chunks = Segmenter::new(small_config(200)).segment(&text, &hints).unwrap();
        let tagged: Vec<usize> = chunks.iter().filter(|c| c.has_math).map(|c| c.index).collect();
        assert!(!tagged.is_empty());
        for index in &tagged {
            let chunk = &chunks[*index];
            assert!(chunk.text.contains("\\sum") || chunk.text.contains("\\log"));
        }
        assert!(tagged.len() < chunks.len());
    }

    #[test]
    fn test_infer_title_and_headings() {
        let text = "Attention Is All You Need\nAshish Vaswani\n\nAbstract\nWe propose a model.\n\n3.1 Scaled Dot-Product Attention\nDetails follow.\n";
        let hints = LayoutHints::infer(text);
        assert_eq!(hints.title.as_deref(), Some("Attention Is All You Need"));
        let titles: Vec<&str> = hints.headings.iter().map(|h| h.title.as_str()).collect();
        assert_eq!(titles, vec!["Abstract", "3.1 Scaled Dot-Product Attention"]);
    }

    #[test]
    fn test_equation_detection() {
        assert!(is_equation("h_t = \\tanh(W x_t) + \\frac{1}{2}"));
        assert!(is_equation("y = 2x + 3"));
        assert!(is_equation("softmax(QKᵀ/√d)"));
        assert!(!is_equation("We evaluate on three benchmarks."));
    }
}
