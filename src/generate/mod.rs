//! Derived artifacts for a stored paper: a reference implementation of its
//! architecture, or a blog post about it.
//!
//! Generation reads a [`PaperRecord`] and never modifies it. Output is
//! returned as text; [`Generator::save`] writes it under the configured
//! output directory as `<paper_id>_implementation.py` or `<paper_id>_blog.md`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::models::PaperRecord;
use crate::provider::retry::{RetryError, RetryPolicy};
use crate::provider::{call_deadline, ModelProvider, ModelRequest};

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("Unknown generation kind '{0}'; use 'code' or 'blog'")]
    UnknownKind(String),

    #[error("Model returned no {0}")]
    EmptyOutput(GenerationKind),

    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Generation call failed: {0}")]
    Provider(#[from] RetryError),
}

pub type GenerateResult<T> = Result<T, GenerateError>;

/// What to generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationKind {
    Code,
    Blog,
}

impl GenerationKind {
    /// File name suffix for saved output.
    pub fn file_suffix(self) -> &'static str {
        match self {
            GenerationKind::Code => "_implementation.py",
            GenerationKind::Blog => "_blog.md",
        }
    }
}

impl FromStr for GenerationKind {
    type Err = GenerateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "code" | "implementation" => Ok(GenerationKind::Code),
            "blog" | "post" => Ok(GenerationKind::Blog),
            other => Err(GenerateError::UnknownKind(other.to_string())),
        }
    }
}

impl fmt::Display for GenerationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationKind::Code => f.write_str("code implementation"),
            GenerationKind::Blog => f.write_str("blog post"),
        }
    }
}

/// Generation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub code_temperature: f32,
    pub code_max_tokens: u32,
    pub blog_temperature: f32,
    pub blog_max_tokens: u32,

    /// Longest writing sample passed along for a blog post, in characters
    pub max_style_chars: usize,

    /// Inherits `provider.request_timeout_secs` when unset
    pub request_timeout_secs: Option<u64>,

    /// Where saved output goes
    pub output_dir: PathBuf,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            code_temperature: 0.2,
            code_max_tokens: 8000,
            blog_temperature: 0.7,
            blog_max_tokens: 4096,
            max_style_chars: 4000,
            request_timeout_secs: None,
            output_dir: PathBuf::from("."),
        }
    }
}

const CODE_SYSTEM: &str = "You are an expert in implementing machine learning architectures \
from research papers. Write clean, working Python code, using PyTorch unless the paper calls \
for something else. Comment each part of the implementation, and when a detail is missing \
make a reasonable assumption and say so in a comment.";

const BLOG_SYSTEM: &str = "You are an expert in explaining research to a technical audience. \
Write a well-structured blog post about the paper with an engaging title and introduction, \
the paper's significance and context, section headings, analogies where they help, and a \
closing section on implications and takeaways. Use Markdown. If a writing sample is given, \
match its voice and style.";

static CODE_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:python|py)?[ \t]*\r?\n(.*?)```").unwrap());

/// The fenced code blocks of an answer joined together, or the whole answer
/// when it has none.
pub fn extract_code(answer: &str) -> String {
    let blocks: Vec<&str> = CODE_BLOCK
        .captures_iter(answer)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|block| !block.is_empty())
        .collect();
    if blocks.is_empty() {
        answer.trim().to_string()
    } else {
        blocks.join("\n\n")
    }
}

fn bullets(items: &[String]) -> String {
    items.iter().map(|item| format!("- {}\n", item)).collect()
}

/// Prompt for a reference implementation. Falls back to the summary when no
/// architecture was extracted.
pub fn code_prompt(paper: &PaperRecord) -> String {
    let description = match paper.architecture.as_deref().map(str::trim) {
        Some(architecture) if !architecture.is_empty() => architecture.to_string(),
        _ => format!("(no architecture was extracted; paper summary follows)\n{}", paper.summary),
    };
    let mut prompt = format!(
        "Implement the model architecture described in the paper \"{}\".\n\nArchitecture:\n```\n{}\n```\n",
        paper.title, description
    );
    if !paper.math_formulations.is_empty() {
        prompt.push_str("\nRelevant formulations:\n");
        prompt.push_str(&bullets(&paper.math_formulations));
    }
    prompt.push_str(
        "\nInclude all imports, the model classes, any helpers they need and a short usage \
example. The code should run with minimal changes.",
    );
    prompt
}

/// Prompt for a blog post, optionally carrying a writing sample.
pub fn blog_prompt(paper: &PaperRecord, style_sample: Option<&str>, max_style_chars: usize) -> String {
    let mut prompt = format!(
        "Write a blog post about the paper \"{}\" ({}).\n\nSummary:\n{}\n",
        paper.title, paper.domain, paper.summary
    );
    if !paper.takeaways.is_empty() {
        prompt.push_str("\nKey takeaways:\n");
        prompt.push_str(&bullets(&paper.takeaways));
    }
    if let Some(architecture) = paper.architecture.as_deref().filter(|a| !a.trim().is_empty()) {
        prompt.push_str(&format!("\nArchitecture:\n{}\n", architecture));
    }
    if !paper.future_directions.is_empty() {
        prompt.push_str("\nFuture directions:\n");
        prompt.push_str(&bullets(&paper.future_directions));
    }
    if let Some(sample) = style_sample.map(str::trim).filter(|s| !s.is_empty()) {
        let sample: String = sample.chars().take(max_style_chars).collect();
        prompt.push_str(&format!("\nWriting sample to imitate:\n---\n{}\n---\n", sample));
    }
    prompt
}

/// Runs generation calls.
pub struct Generator {
    provider: Arc<dyn ModelProvider>,
    retry: RetryPolicy,
    config: GenerationConfig,
}

impl Generator {
    pub fn new(provider: Arc<dyn ModelProvider>, retry: RetryPolicy, config: GenerationConfig) -> Self {
        Self {
            provider,
            retry,
            config,
        }
    }

    /// Generate `kind` for `paper`. `style_sample` only applies to blog posts.
    ///
    /// # Errors
    /// - `EmptyOutput` when the model answers with nothing
    /// - `Provider` once the retry policy gives up
    pub async fn generate(
        &self,
        paper: &PaperRecord,
        kind: GenerationKind,
        style_sample: Option<&str>,
        cancel: &CancellationToken,
    ) -> GenerateResult<String> {
        let request = match kind {
            GenerationKind::Code => {
                if paper.architecture.is_none() {
                    warn!(paper_id = %paper.paper_id, "No architecture extracted, generating from the summary");
                }
                ModelRequest::new(code_prompt(paper), CODE_SYSTEM)
                    .with_temperature(self.config.code_temperature)
                    .with_max_tokens(self.config.code_max_tokens)
            }
            GenerationKind::Blog => {
                ModelRequest::new(blog_prompt(paper, style_sample, self.config.max_style_chars), BLOG_SYSTEM)
                    .with_temperature(self.config.blog_temperature)
                    .with_max_tokens(self.config.blog_max_tokens)
            }
        };

        info!(paper_id = %paper.paper_id, kind = %kind, "Generating");
        let (answer, _) = self
            .retry
            .send(
                self.provider.as_ref(),
                &request,
                call_deadline(self.config.request_timeout_secs),
                cancel,
            )
            .await?;

        let output = match kind {
            GenerationKind::Code => extract_code(&answer),
            GenerationKind::Blog => answer.trim().to_string(),
        };
        if output.is_empty() {
            return Err(GenerateError::EmptyOutput(kind));
        }
        Ok(output)
    }

    /// Where output of `kind` for `paper_id` is saved.
    pub fn output_path(&self, paper_id: &str, kind: GenerationKind) -> PathBuf {
        self.config
            .output_dir
            .join(format!("{}{}", paper_id, kind.file_suffix()))
    }

    /// Write generated text to [`Generator::output_path`], creating the
    /// output directory when needed.
    pub fn save(&self, paper_id: &str, kind: GenerationKind, text: &str) -> GenerateResult<PathBuf> {
        let path = self.output_path(paper_id, kind);
        let write_err = |path: &Path, source| GenerateError::Write {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| write_err(parent, e))?;
        }
        std::fs::write(&path, text).map_err(|e| write_err(path.as_path(), e))?;
        info!(path = %path.display(), "Saved {}", kind);
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ProviderResult};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex;

    struct ScriptedModel {
        answer: String,
        requests: Mutex<Vec<ModelRequest>>,
        failures: Mutex<u32>,
    }

    impl ScriptedModel {
        fn answering(answer: &str) -> Self {
            Self {
                answer: answer.to_string(),
                requests: Mutex::new(Vec::new()),
                failures: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedModel {
        async fn send(&self, request: &ModelRequest) -> ProviderResult<String> {
            self.requests.lock().unwrap().push(request.clone());
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ProviderError::Server("overloaded".to_string()));
            }
            Ok(self.answer.clone())
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn paper(architecture: Option<&str>) -> PaperRecord {
        PaperRecord {
            paper_id: "attn".to_string(),
            title: "Attention Is All You Need".to_string(),
            filepath: String::new(),
            summary: "Replaces recurrence with self-attention.".to_string(),
            takeaways: vec!["Parallel training".to_string()],
            architecture: architecture.map(str::to_string),
            math_formulations: vec!["softmax(QK^T / sqrt(d_k)) V".to_string()],
            domain: "Natural Language Processing".to_string(),
            future_directions: vec!["Longer contexts".to_string()],
            notes: vec![],
            missing_fields: vec![],
            embedding: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Code".parse::<GenerationKind>().unwrap(), GenerationKind::Code);
        assert_eq!(" blog ".parse::<GenerationKind>().unwrap(), GenerationKind::Blog);
        assert!(matches!(
            "poem".parse::<GenerationKind>(),
            Err(GenerateError::UnknownKind(kind)) if kind == "poem"
        ));
    }

    #[test]
    fn test_extract_code_joins_fenced_blocks() {
        let answer = "Here is the model:\n```python\nclass Encoder: pass\n```\nAnd a helper:\n```\ndef mask(): pass\n```\nDone.";
        assert_eq!(extract_code(answer), "class Encoder: pass\n\ndef mask(): pass");
        assert_eq!(extract_code("  import torch\n"), "import torch");
    }

    #[test]
    fn test_code_prompt_falls_back_to_summary() {
        let with = code_prompt(&paper(Some("Six encoder layers")));
        assert!(with.contains("Six encoder layers"));
        assert!(with.contains("softmax(QK^T / sqrt(d_k)) V"));

        let without = code_prompt(&paper(None));
        assert!(without.contains("no architecture was extracted"));
        assert!(without.contains("Replaces recurrence with self-attention."));
    }

    #[test]
    fn test_blog_prompt_truncates_style_sample() {
        let sample = "x".repeat(50);
        let prompt = blog_prompt(&paper(None), Some(&sample), 10);
        assert!(prompt.contains(&format!("---\n{}\n---", "x".repeat(10))));
        assert!(!prompt.contains(&"x".repeat(11)));
        assert!(prompt.contains("- Parallel training"));

        assert!(!blog_prompt(&paper(None), Some("   "), 10).contains("Writing sample"));
    }

    #[tokio::test]
    async fn test_generate_code_retries_and_extracts() {
        let model = Arc::new(ScriptedModel::answering("```python\nimport torch\n```"));
        *model.failures.lock().unwrap() = 1;
        let generator = Generator::new(model.clone(), quick_retry(), GenerationConfig::default());

        let code = generator
            .generate(&paper(Some("Encoder-decoder")), GenerationKind::Code, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, "import torch");

        let requests = model.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].temperature, 0.2);
        assert_eq!(requests[0].max_tokens, 8000);
        assert_eq!(requests[0].system_message, CODE_SYSTEM);
    }

    #[tokio::test]
    async fn test_generate_blog_passes_style_and_rejects_empty() {
        let model = Arc::new(ScriptedModel::answering("# Attention, explained\n\nBody."));
        let generator = Generator::new(model.clone(), quick_retry(), GenerationConfig::default());

        let post = generator
            .generate(&paper(None), GenerationKind::Blog, Some("Short, punchy sentences."), &CancellationToken::new())
            .await
            .unwrap();
        assert!(post.starts_with("# Attention, explained"));
        let requests = model.requests.lock().unwrap();
        assert!(requests[0].prompt.contains("Short, punchy sentences."));
        assert_eq!(requests[0].temperature, 0.7);
        drop(requests);

        let silent = Generator::new(Arc::new(ScriptedModel::answering("  ")), quick_retry(), GenerationConfig::default());
        let result = silent
            .generate(&paper(None), GenerationKind::Blog, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(GenerateError::EmptyOutput(GenerationKind::Blog))));
    }

    #[test]
    fn test_save_writes_under_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = GenerationConfig {
            output_dir: dir.path().join("generated"),
            ..GenerationConfig::default()
        };
        let generator = Generator::new(Arc::new(ScriptedModel::answering("")), RetryPolicy::none(), config);

        let path = generator.save("attn", GenerationKind::Code, "import torch").unwrap();
        assert_eq!(path, dir.path().join("generated").join("attn_implementation.py"));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "import torch");
        assert!(generator
            .output_path("attn", GenerationKind::Blog)
            .ends_with("attn_blog.md"));
    }
}
