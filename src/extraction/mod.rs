//! Extraction orchestrator.
//!
//! For every chunk the orchestrator asks the model about each aspect with a
//! dedicated prompt. Independent aspects run concurrently through a bounded
//! pool; the summary is a sequential left fold over the chunks that shares
//! the same pool. Results land in a slot table indexed by (chunk, aspect), so
//! the output order never depends on completion order.
//!
//! A slot whose retries run out, whose request is rejected, or whose answer
//! is unusable is left empty and recorded in the degradation manifest. The
//! only failures that stop a run are fatal provider errors (bad credentials)
//! and cancellation.

pub mod prompts;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::models::{
    Aspect, Chunk, Degradation, DegradationManifest, ExtractedContent, PartialExtraction,
};
use crate::provider::{
    call_deadline, ModelProvider, ModelRequest, ProviderError, RetryCause, RetryError, RetryPolicy,
};

/// Errors that stop an extraction run.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The caller cancelled the run
    #[error("Extraction cancelled")]
    Cancelled,

    /// A provider failure that every further call would repeat
    #[error("Extraction aborted: {0}")]
    Aborted(ProviderError),

    /// A worker task panicked or was torn down
    #[error("Extraction task failed: {0}")]
    Task(String),
}

/// Result type for extraction.
pub type ExtractionResult<T> = Result<T, ExtractionError>;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Maximum concurrent model calls
    pub max_concurrency: usize,

    pub temperature: f32,

    /// Output token limit per call
    pub max_tokens: u32,

    /// Per-call deadline in seconds; inherits `provider.request_timeout_secs`
    pub request_timeout_secs: Option<u64>,

    /// Only ask for math on chunks tagged as containing equations
    pub math_only_on_tagged: bool,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            temperature: 0.0,
            max_tokens: 4096,
            request_timeout_secs: None,
            math_only_on_tagged: true,
        }
    }
}

impl ExtractionConfig {
    pub fn request_timeout(&self) -> Duration {
        call_deadline(self.request_timeout_secs)
    }

    fn request(&self, aspect: Aspect, prompt: String) -> ModelRequest {
        // domain answers are a few words
        let max_tokens = match aspect {
            Aspect::Domain => self.max_tokens.min(64),
            _ => self.max_tokens,
        };
        ModelRequest::new(prompt, prompts::system_message(aspect))
            .with_temperature(self.temperature)
            .with_max_tokens(max_tokens)
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Default)]
pub struct ExtractionOutput {
    /// One entry per (chunk, aspect) slot, in chunk order then aspect order
    pub partials: Vec<PartialExtraction>,

    pub manifest: DegradationManifest,
}

#[cfg(test)]
impl ExtractionOutput {
    /// Accumulated summary after each chunk.
    pub fn summary_steps(&self) -> impl Iterator<Item = &ExtractedContent> {
        self.partials
            .iter()
            .filter(|p| p.aspect == Aspect::Summary)
            .map(|p| &p.content)
    }
}

#[derive(Debug, Clone)]
enum SlotOutcome {
    /// Parsed answer; `Empty` when the model found nothing relevant
    Filled { content: ExtractedContent },
    Degraded { reason: String, attempts: u32 },
    Skipped,
}

enum TaskOutput {
    Slot {
        position: usize,
        aspect: Aspect,
        outcome: SlotOutcome,
    },
    Fold(Vec<SlotOutcome>),
}

/// Shared per-run call machinery.
#[derive(Clone)]
struct CallContext {
    provider: Arc<dyn ModelProvider>,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallContext {
    /// Run one slot's call under a pool permit and the retry policy.
    async fn call(&self, request: &ModelRequest) -> Result<(String, u32), RetryError> {
        let cancelled = RetryError {
            attempts: 0,
            cause: RetryCause::Cancelled,
        };
        let _permit = tokio::select! {
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Err(cancelled),
            },
            () = self.cancel.cancelled() => return Err(cancelled),
        };
        self.retry
            .send(self.provider.as_ref(), request, self.timeout, &self.cancel)
            .await
    }

    /// Turn a model answer or a final error into a slot outcome.
    fn settle(
        &self,
        aspect: Aspect,
        result: Result<(String, u32), RetryError>,
    ) -> ExtractionResult<SlotOutcome> {
        match result {
            Ok((answer, attempts)) => Ok(match prompts::parse_answer(aspect, &answer) {
                Ok(content) => SlotOutcome::Filled { content },
                Err(reason) => SlotOutcome::Degraded { reason, attempts },
            }),
            Err(RetryError {
                cause: RetryCause::Cancelled,
                ..
            }) => Err(ExtractionError::Cancelled),
            Err(RetryError {
                cause: RetryCause::Provider(err),
                attempts,
            }) => {
                if err.is_fatal() {
                    Err(ExtractionError::Aborted(err))
                } else {
                    Ok(SlotOutcome::Degraded {
                        reason: err.to_string(),
                        attempts,
                    })
                }
            }
        }
    }
}

async fn extract_slot(
    ctx: CallContext,
    config: Arc<ExtractionConfig>,
    chunks: Arc<Vec<Chunk>>,
    title: Arc<str>,
    position: usize,
    aspect: Aspect,
) -> ExtractionResult<TaskOutput> {
    let chunk = &chunks[position];
    let request = config.request(aspect, prompts::aspect_prompt(aspect, &title, chunk, chunks.len()));
    debug!(chunk = position, aspect = %aspect, "Dispatching extraction call");

    let result = ctx.call(&request).await;
    let outcome = ctx.settle(aspect, result)?;
    Ok(TaskOutput::Slot {
        position,
        aspect,
        outcome,
    })
}

/// Left fold over the chunks carrying the accumulated summary.
///
/// A step that degrades or finds nothing leaves the accumulator unchanged.
async fn rolling_summary(
    ctx: CallContext,
    config: Arc<ExtractionConfig>,
    chunks: Arc<Vec<Chunk>>,
    title: Arc<str>,
) -> ExtractionResult<TaskOutput> {
    let mut accumulated = String::new();
    let mut outcomes = Vec::with_capacity(chunks.len());

    for chunk in chunks.iter() {
        let prompt = prompts::summary_prompt(&title, chunk, chunks.len(), &accumulated);
        let request = config.request(Aspect::Summary, prompt);
        debug!(chunk = chunk.index, "Dispatching summary step");

        let result = ctx.call(&request).await;
        let outcome = ctx.settle(Aspect::Summary, result)?;
        if let SlotOutcome::Filled {
            content: ExtractedContent::Text(text),
        } = &outcome
        {
            accumulated = text.clone();
        }
        outcomes.push(outcome);
    }
    Ok(TaskOutput::Fold(outcomes))
}

/// Runs all per-chunk, per-aspect extraction calls for one paper.
pub struct Orchestrator {
    provider: Arc<dyn ModelProvider>,
    config: Arc<ExtractionConfig>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(provider: Arc<dyn ModelProvider>, config: ExtractionConfig, retry: RetryPolicy) -> Self {
        Self {
            provider,
            config: Arc::new(config),
            retry,
        }
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Extract every aspect from every chunk.
    ///
    /// # Arguments
    /// * `chunks` - Segmenter output, in order
    /// * `title` - Resolved paper title, included in every prompt
    /// * `cancel` - Checked before each call and during backoff waits
    ///
    /// # Returns
    /// Partials for every slot (degraded and skipped slots hold
    /// `ExtractedContent::Empty`) plus the degradation manifest
    ///
    /// # Errors
    /// - `Cancelled` if `cancel` fires before the run completes
    /// - `Aborted` on a fatal provider error such as rejected credentials
    pub async fn extract(
        &self,
        chunks: &[Chunk],
        title: &str,
        cancel: &CancellationToken,
    ) -> ExtractionResult<ExtractionOutput> {
        if cancel.is_cancelled() {
            return Err(ExtractionError::Cancelled);
        }
        if chunks.is_empty() {
            return Ok(ExtractionOutput::default());
        }

        info!(
            chunks = chunks.len(),
            provider = self.provider.name(),
            concurrency = self.config.max_concurrency,
            "Starting extraction"
        );

        let run_token = cancel.child_token();
        let ctx = CallContext {
            provider: self.provider.clone(),
            semaphore: Arc::new(Semaphore::new(self.config.max_concurrency.max(1))),
            retry: self.retry.clone(),
            timeout: self.config.request_timeout(),
            cancel: run_token.clone(),
        };
        let shared: Arc<Vec<Chunk>> = Arc::new(chunks.to_vec());
        let title: Arc<str> = Arc::from(title);

        let mut table: Vec<[Option<SlotOutcome>; 6]> =
            (0..chunks.len()).map(|_| std::array::from_fn(|_| None)).collect();
        let mut tasks = JoinSet::new();

        tasks.spawn(rolling_summary(
            ctx.clone(),
            self.config.clone(),
            shared.clone(),
            title.clone(),
        ));

        for (position, chunk) in chunks.iter().enumerate() {
            for aspect in Aspect::ALL {
                if aspect == Aspect::Summary {
                    continue;
                }
                if aspect == Aspect::Math && self.config.math_only_on_tagged && !chunk.has_math {
                    table[position][aspect.slot()] = Some(SlotOutcome::Skipped);
                    continue;
                }
                tasks.spawn(extract_slot(
                    ctx.clone(),
                    self.config.clone(),
                    shared.clone(),
                    title.clone(),
                    position,
                    aspect,
                ));
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let output = match joined {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => {
                    run_token.cancel();
                    tasks.abort_all();
                    match &err {
                        ExtractionError::Aborted(cause) => {
                            warn!(error = %cause, "Aborting extraction on fatal provider error")
                        }
                        _ => info!("Extraction cancelled"),
                    }
                    return Err(err);
                }
                Err(join_err) => {
                    run_token.cancel();
                    tasks.abort_all();
                    return Err(ExtractionError::Task(join_err.to_string()));
                }
            };

            match output {
                TaskOutput::Slot {
                    position,
                    aspect,
                    outcome,
                } => table[position][aspect.slot()] = Some(outcome),
                TaskOutput::Fold(outcomes) => {
                    for (position, outcome) in outcomes.into_iter().enumerate() {
                        table[position][Aspect::Summary.slot()] = Some(outcome);
                    }
                }
            }
        }

        let output = Self::collect(chunks, table);
        info!(
            partials = output.partials.len(),
            degraded = output.manifest.entries.len(),
            skipped = output.manifest.skipped,
            "Extraction finished"
        );
        Ok(output)
    }

    /// Flatten the slot table into ordered partials and a manifest.
    fn collect(chunks: &[Chunk], table: Vec<[Option<SlotOutcome>; 6]>) -> ExtractionOutput {
        let mut output = ExtractionOutput::default();

        for (position, row) in table.into_iter().enumerate() {
            let chunk_index = chunks[position].index;
            for (aspect, slot) in Aspect::ALL.into_iter().zip(row) {
                let content = match slot {
                    Some(SlotOutcome::Filled { content }) => content,
                    Some(SlotOutcome::Skipped) => {
                        output.manifest.skipped += 1;
                        ExtractedContent::Empty
                    }
                    Some(SlotOutcome::Degraded { reason, attempts }) => {
                        warn!(chunk = chunk_index, aspect = %aspect, attempts, %reason, "Slot degraded");
                        output.manifest.record(Degradation {
                            chunk_index,
                            aspect,
                            reason,
                            attempts,
                        });
                        ExtractedContent::Empty
                    }
                    None => {
                        output.manifest.record(Degradation {
                            chunk_index,
                            aspect,
                            reason: "no result recorded".to_string(),
                            attempts: 0,
                        });
                        ExtractedContent::Empty
                    }
                };
                output
                    .partials
                    .push(PartialExtraction::new(chunk_index, aspect, content));
            }
        }
        output
    }
}
