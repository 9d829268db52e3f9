//! Cross-paper comparison.
//!
//! A [`ComparisonSet`] is the session's working list of paper ids. The
//! [`ComparisonEngine`] turns the records behind it into one labeled prompt
//! and asks the model for a single synthesized answer. Records are only read.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::models::PaperRecord;
use crate::provider::retry::{RetryError, RetryPolicy};
use crate::provider::{call_deadline, ModelProvider, ModelRequest};

/// Errors that can occur while building or running a comparison.
#[derive(Debug, Error)]
pub enum CompareError {
    #[error("Comparison needs at least 2 papers, the set has {0}")]
    InsufficientPapers(usize),

    #[error("Comparison set is full ({0} papers); remove one first")]
    SetFull(usize),

    #[error("Paper {0} is not in the comparison set")]
    NotInSet(String),

    #[error("Comparison question cannot be empty")]
    EmptyQuestion,

    #[error("Comparison call failed: {0}")]
    Provider(#[from] RetryError),
}

/// Result type for comparison operations.
pub type CompareResult<T> = Result<T, CompareError>;

/// Ordered, bounded list of distinct paper ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComparisonSet {
    ids: Vec<String>,
    capacity: usize,
}

impl Default for ComparisonSet {
    fn default() -> Self {
        Self::new(ComparisonConfig::default().max_papers)
    }
}

impl ComparisonSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: Vec::new(),
            capacity: capacity.max(2),
        }
    }

    /// Add an id to the end of the set.
    ///
    /// # Returns
    /// `false` if the id was already present (the set is unchanged)
    ///
    /// # Errors
    /// Returns `CompareError::SetFull` when the set is at capacity
    pub fn add(&mut self, paper_id: &str) -> CompareResult<bool> {
        if self.contains(paper_id) {
            return Ok(false);
        }
        if self.ids.len() >= self.capacity {
            return Err(CompareError::SetFull(self.capacity));
        }
        self.ids.push(paper_id.to_string());
        Ok(true)
    }

    /// # Errors
    /// Returns `CompareError::NotInSet` if the id is absent
    pub fn remove(&mut self, paper_id: &str) -> CompareResult<()> {
        let position = self
            .ids
            .iter()
            .position(|id| id == paper_id)
            .ok_or_else(|| CompareError::NotInSet(paper_id.to_string()))?;
        self.ids.remove(position);
        Ok(())
    }

    pub fn list(&self) -> &[String] {
        &self.ids
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn contains(&self, paper_id: &str) -> bool {
        self.ids.iter().any(|id| id == paper_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// What to compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComparisonAspect {
    Methodology,
    Results,
    Architecture,
    /// Free-form question answered across all papers
    Question(String),
}

impl FromStr for ComparisonAspect {
    type Err = CompareError;

    /// Known aspect names map to their variant; any other text is a question.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "" => Err(CompareError::EmptyQuestion),
            "methodology" | "method" | "methods" => Ok(ComparisonAspect::Methodology),
            "results" | "result" => Ok(ComparisonAspect::Results),
            "architecture" | "architectures" => Ok(ComparisonAspect::Architecture),
            _ => Ok(ComparisonAspect::Question(trimmed.to_string())),
        }
    }
}

impl fmt::Display for ComparisonAspect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComparisonAspect::Methodology => f.write_str("methodology"),
            ComparisonAspect::Results => f.write_str("results"),
            ComparisonAspect::Architecture => f.write_str("architecture"),
            ComparisonAspect::Question(question) => write!(f, "question: {}", question),
        }
    }
}

/// Comparison settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ComparisonConfig {
    /// Capacity of the comparison set
    pub max_papers: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Inherits `provider.request_timeout_secs` when unset
    pub request_timeout_secs: Option<u64>,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            max_papers: 5,
            temperature: 0.3,
            max_tokens: 2048,
            request_timeout_secs: None,
        }
    }
}

const COMPARE_SYSTEM: &str = "You are an expert research assistant comparing scientific papers. \
Use only the information given for each paper, refer to papers by their label, and point out \
both common ground and differences. Say so when the information for a paper is missing.";

fn list_block(label: &str, items: &[String]) -> String {
    if items.is_empty() {
        format!("{}: (none recorded)\n", label)
    } else {
        let mut block = format!("{}:\n", label);
        for item in items {
            block.push_str(&format!("- {}\n", item));
        }
        block
    }
}

fn text_block(label: &str, text: Option<&str>) -> String {
    match text.map(str::trim).filter(|t| !t.is_empty()) {
        Some(text) => format!("{}: {}\n", label, text),
        None => format!("{}: (none recorded)\n", label),
    }
}

/// Fields of one paper relevant to `aspect`, labeled for the prompt.
fn paper_section(label: usize, paper: &PaperRecord, aspect: &ComparisonAspect) -> String {
    let mut section = format!(
        "### Paper {} [{}]: {}\nDomain: {}\n",
        label, paper.paper_id, paper.title, paper.domain
    );
    match aspect {
        ComparisonAspect::Methodology => {
            section.push_str(&text_block("Summary", Some(&paper.summary)));
            section.push_str(&text_block("Architecture", paper.architecture.as_deref()));
            section.push_str(&list_block("Mathematical formulations", &paper.math_formulations));
        }
        ComparisonAspect::Results => {
            section.push_str(&text_block("Summary", Some(&paper.summary)));
            section.push_str(&list_block("Key takeaways", &paper.takeaways));
        }
        ComparisonAspect::Architecture => {
            section.push_str(&text_block("Architecture", paper.architecture.as_deref()));
            section.push_str(&list_block("Mathematical formulations", &paper.math_formulations));
        }
        ComparisonAspect::Question(_) => {
            section.push_str(&text_block("Summary", Some(&paper.summary)));
            section.push_str(&list_block("Key takeaways", &paper.takeaways));
            section.push_str(&text_block("Architecture", paper.architecture.as_deref()));
            section.push_str(&list_block("Future directions", &paper.future_directions));
        }
    }
    section
}

/// Build the multi-paper prompt for `aspect`.
pub fn comparison_prompt(papers: &[PaperRecord], aspect: &ComparisonAspect) -> String {
    let task = match aspect {
        ComparisonAspect::Methodology => {
            "Compare the methodology of these papers: problem framing, approach and key techniques."
                .to_string()
        }
        ComparisonAspect::Results => {
            "Compare the results and findings of these papers, including any reported numbers."
                .to_string()
        }
        ComparisonAspect::Architecture => {
            "Compare the model architectures of these papers: components, data flow and design choices."
                .to_string()
        }
        ComparisonAspect::Question(question) => {
            format!("Answer this question for each paper and then across them: {}", question)
        }
    };

    let sections: Vec<String> = papers
        .iter()
        .enumerate()
        .map(|(i, paper)| paper_section(i + 1, paper, aspect))
        .collect();
    format!("{}\n\n{}\nEnd with a short synthesis.", task, sections.join("\n"))
}

/// Runs comparison calls.
pub struct ComparisonEngine {
    provider: Arc<dyn ModelProvider>,
    retry: RetryPolicy,
    config: ComparisonConfig,
}

impl ComparisonEngine {
    pub fn new(provider: Arc<dyn ModelProvider>, retry: RetryPolicy, config: ComparisonConfig) -> Self {
        Self {
            provider,
            retry,
            config,
        }
    }

    pub fn config(&self) -> &ComparisonConfig {
        &self.config
    }

    /// Compare `papers` on `aspect` with one model call.
    ///
    /// # Errors
    /// - `InsufficientPapers` for fewer than two papers (no call is made)
    /// - `Provider` once the retry policy gives up
    pub async fn compare(
        &self,
        papers: &[PaperRecord],
        aspect: &ComparisonAspect,
        cancel: &CancellationToken,
    ) -> CompareResult<String> {
        if papers.len() < 2 {
            return Err(CompareError::InsufficientPapers(papers.len()));
        }
        if let ComparisonAspect::Question(question) = aspect {
            if question.trim().is_empty() {
                return Err(CompareError::EmptyQuestion);
            }
        }

        info!(papers = papers.len(), aspect = %aspect, "Comparing papers");
        let request = ModelRequest::new(comparison_prompt(papers, aspect), COMPARE_SYSTEM)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        let timeout = call_deadline(self.config.request_timeout_secs);

        let (answer, _attempts) = self
            .retry
            .send(self.provider.as_ref(), &request, timeout, cancel)
            .await?;
        Ok(answer)
    }
}
