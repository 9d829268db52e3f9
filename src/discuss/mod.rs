//! Follow-up discussion about the current paper.
//!
//! A question is sorted into relevance buckets by keyword, and only the fields
//! those buckets need go into the context sent with it.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::models::PaperRecord;
use crate::provider::retry::{RetryError, RetryPolicy};
use crate::provider::{call_deadline, ModelProvider, ModelRequest};

#[derive(Debug, Error)]
pub enum DiscussError {
    #[error("Question cannot be empty")]
    EmptyQuestion,

    #[error("Discussion call failed: {0}")]
    Provider(#[from] RetryError),
}

pub type DiscussResult<T> = Result<T, DiscussError>;

/// Relevance bucket of a question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QuestionBucket {
    Architecture,
    Limitations,
    Comparison,
    General,
}

/// A record field that can appear in the discussion context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContextField {
    Summary,
    Takeaways,
    Architecture,
    Math,
    FutureDirections,
    Notes,
}

impl QuestionBucket {
    fn fields(self) -> &'static [ContextField] {
        match self {
            QuestionBucket::Architecture => &[ContextField::Architecture, ContextField::Math],
            QuestionBucket::Limitations => &[
                ContextField::Takeaways,
                ContextField::FutureDirections,
                ContextField::Notes,
            ],
            QuestionBucket::Comparison => &[ContextField::Summary, ContextField::Takeaways],
            QuestionBucket::General => &[
                ContextField::Summary,
                ContextField::Takeaways,
                ContextField::Notes,
            ],
        }
    }
}

/// Discussion settings, keyword sets included.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscussionConfig {
    pub architecture_keywords: Vec<String>,
    pub limitation_keywords: Vec<String>,
    pub comparison_keywords: Vec<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Inherits `provider.request_timeout_secs` when unset
    pub request_timeout_secs: Option<u64>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

impl Default for DiscussionConfig {
    fn default() -> Self {
        Self {
            architecture_keywords: words(&[
                "architecture",
                "implement",
                "implementation",
                "layer",
                "module",
                "component",
                "design",
                "model",
                "network",
                "encoder",
                "decoder",
                "equation",
                "formula",
                "algorithm",
                "code",
            ]),
            limitation_keywords: words(&[
                "limitation",
                "limitations",
                "weakness",
                "drawback",
                "shortcoming",
                "fail",
                "future",
                "open problem",
                "improve",
            ]),
            comparison_keywords: words(&[
                "compare",
                "comparison",
                "versus",
                "vs",
                "differ",
                "difference",
                "better than",
                "baseline",
                "prior work",
            ]),
            temperature: 0.3,
            max_tokens: 2048,
            request_timeout_secs: None,
        }
    }
}

/// Whether `keyword` occurs in `question` on word boundaries.
fn mentions(question: &str, keyword: &str) -> bool {
    let keyword = keyword.trim().to_lowercase();
    if keyword.is_empty() {
        return false;
    }
    question.match_indices(&keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before = question[..start].chars().next_back();
        let after = question[end..].chars().next();
        // longer keywords also match as word stems ("implement" in "implemented")
        let boundary_before = before.map_or(true, |c| !c.is_alphanumeric());
        let boundary_after = keyword.len() >= 4 || after.map_or(true, |c| !c.is_alphanumeric());
        boundary_before && boundary_after
    })
}

/// Sort a question into relevance buckets; `General` when nothing matches.
pub fn classify(question: &str, config: &DiscussionConfig) -> BTreeSet<QuestionBucket> {
    let question = question.to_lowercase();
    let table = [
        (QuestionBucket::Architecture, &config.architecture_keywords),
        (QuestionBucket::Limitations, &config.limitation_keywords),
        (QuestionBucket::Comparison, &config.comparison_keywords),
    ];

    let mut buckets: BTreeSet<QuestionBucket> = table
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|k| mentions(&question, k)))
        .map(|(bucket, _)| *bucket)
        .collect();
    if buckets.is_empty() {
        buckets.insert(QuestionBucket::General);
    }
    buckets
}

fn push_text(context: &mut String, label: &str, text: Option<&str>) {
    if let Some(text) = text.map(str::trim).filter(|t| !t.is_empty()) {
        context.push_str(&format!("{}: {}\n", label, text));
    }
}

fn push_list(context: &mut String, label: &str, items: &[String]) {
    if items.is_empty() {
        return;
    }
    context.push_str(&format!("{}:\n", label));
    for item in items {
        context.push_str(&format!("- {}\n", item));
    }
}

/// Build the context preamble for `buckets`.
///
/// Title and domain are always present; other fields only when a bucket asks
/// for them and the record has content for them.
pub fn build_context(paper: &PaperRecord, buckets: &BTreeSet<QuestionBucket>) -> String {
    let fields: BTreeSet<ContextField> = buckets
        .iter()
        .flat_map(|bucket| bucket.fields().iter().copied())
        .collect();

    let mut context = format!("Title: {}\nDomain: {}\n", paper.title, paper.domain);
    for field in fields {
        match field {
            ContextField::Summary => push_text(&mut context, "Summary", Some(&paper.summary)),
            ContextField::Takeaways => push_list(&mut context, "Key takeaways", &paper.takeaways),
            ContextField::Architecture => {
                push_text(&mut context, "Architecture", paper.architecture.as_deref())
            }
            ContextField::Math => {
                push_list(&mut context, "Mathematical formulations", &paper.math_formulations)
            }
            ContextField::FutureDirections => {
                push_list(&mut context, "Future directions", &paper.future_directions)
            }
            ContextField::Notes => push_list(&mut context, "Reader notes", &paper.notes),
        }
    }
    context
}

const DISCUSS_SYSTEM: &str = "You are an expert research assistant specializing in scientific \
literature analysis. You are discussing one research paper with the user. Answer from the \
provided context, be precise, and say so when the context does not cover the question.";

/// Answers questions about a paper.
pub struct Discussion {
    provider: Arc<dyn ModelProvider>,
    retry: RetryPolicy,
    config: DiscussionConfig,
}

impl Discussion {
    pub fn new(provider: Arc<dyn ModelProvider>, retry: RetryPolicy, config: DiscussionConfig) -> Self {
        Self {
            provider,
            retry,
            config,
        }
    }

    /// Answer `question` about `paper`.
    ///
    /// # Errors
    /// Returns `DiscussError::EmptyQuestion` for a blank question, or
    /// `DiscussError::Provider` once retries are exhausted
    pub async fn discuss(
        &self,
        paper: &PaperRecord,
        question: &str,
        cancel: &CancellationToken,
    ) -> DiscussResult<String> {
        let question = question.trim();
        if question.is_empty() {
            return Err(DiscussError::EmptyQuestion);
        }

        let buckets = classify(question, &self.config);
        debug!(paper_id = %paper.paper_id, ?buckets, "Classified question");
        let context = build_context(paper, &buckets);

        let prompt = format!(
            "Context about the paper:\n\n{}\nThe user asks:\n{}\n\nGive a thoughtful, accurate answer based on the paper's contents.",
            context, question
        );
        let request = ModelRequest::new(prompt, DISCUSS_SYSTEM)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        let timeout = call_deadline(self.config.request_timeout_secs);

        info!(paper_id = %paper.paper_id, "Discussing paper");
        let (answer, _) = self
            .retry
            .send(self.provider.as_ref(), &request, timeout, cancel)
            .await?;
        Ok(answer)
    }
}
