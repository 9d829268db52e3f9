//! Ingestion pipeline module.
//!
//! This module implements the `summarize` operation: read a document, split
//! it into chunks, run the per-aspect extraction calls, merge the answers
//! into one record and store it.
//!
//! # Idempotence
//!
//! The paper id is derived from the file name and the title, and the title is
//! resolved from the layout hints and the first chunk before any model call.
//! Summarizing a source that is already stored therefore returns the stored
//! record without calling the provider, unless `force` is set.
//!
//! ```ignore
//! let pipeline = IngestionPipeline::new(store, provider, &config);
//! let outcome = pipeline.summarize(Path::new("attention.txt"), false, &cancel).await?;
//! if outcome.manifest.is_degraded() {
//!     // retry later with force = true
//! }
//! ```

pub mod document;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::embedding::EmbeddingProvider;
use crate::extraction::{ExtractionConfig, ExtractionError, Orchestrator};
use crate::merge::{resolve_title, MergeConfig, MergeError, Merger, RecordHeader};
use crate::models::{paper_id_for, DegradationManifest, PaperRecord};
use crate::provider::retry::RetryPolicy;
use crate::provider::ModelProvider;
use crate::segmenter::{SegmentationError, Segmenter, SegmenterConfig};
use crate::storage::PaperStorage;
use crate::store::{PaperStore, StoreError};

use document::{DocumentError, DocumentExtractor, PlainTextExtractor};

/// Errors that can occur during ingestion.
#[derive(Debug, Error)]
pub enum IngestionError {
    #[error(transparent)]
    Document(#[from] DocumentError),

    #[error("Segmentation failed: {0}")]
    Segmentation(#[from] SegmentationError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error("Merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestionError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, IngestionError::Extraction(ExtractionError::Cancelled))
    }
}

/// Result type for ingestion operations.
pub type IngestionResult<T> = Result<T, IngestionError>;

/// What `summarize` did with the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizeStatus {
    /// First time this source was processed
    Created,
    /// Already stored; returned without calling the provider
    Reused,
    /// Already stored and re-processed because `force` was set
    Overwritten,
}

/// Result of summarizing one document.
#[derive(Debug, Clone)]
pub struct SummarizeOutcome {
    pub record: PaperRecord,
    pub manifest: DegradationManifest,
    pub status: SummarizeStatus,
    /// Number of chunks the document was split into
    pub chunks: usize,
}

/// Statistics from a batch run.
#[derive(Debug, Default)]
pub struct IngestionStats {
    /// Total number of documents attempted
    pub total_processed: usize,

    pub created: usize,

    /// Skipped because the record already existed
    pub reused: usize,

    pub overwritten: usize,

    /// Stored with at least one degraded slot
    pub degraded: usize,

    /// Documents that failed outright, with the error
    pub failures: Vec<(PathBuf, String)>,

    /// The batch stopped early on cancellation
    pub cancelled: bool,
}

impl IngestionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }

    fn record(&mut self, path: &Path, result: &IngestionResult<SummarizeOutcome>) {
        self.total_processed += 1;
        match result {
            Ok(outcome) => {
                match outcome.status {
                    SummarizeStatus::Created => self.created += 1,
                    SummarizeStatus::Reused => self.reused += 1,
                    SummarizeStatus::Overwritten => self.overwritten += 1,
                }
                if outcome.manifest.is_degraded() {
                    self.degraded += 1;
                }
            }
            Err(err) => self.failures.push((path.to_path_buf(), err.to_string())),
        }
    }
}

/// Settings for the stages the pipeline owns.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub segmenter: SegmenterConfig,
    pub extraction: ExtractionConfig,
    pub retry: RetryPolicy,
    pub merge: MergeConfig,
}

/// Ingestion pipeline coordinator.
pub struct IngestionPipeline<E, S>
where
    E: EmbeddingProvider,
    S: PaperStorage,
{
    store: Arc<PaperStore<E, S>>,
    extractor: Arc<dyn DocumentExtractor>,
    segmenter: Segmenter,
    orchestrator: Orchestrator,
    merger: Merger,
}

impl<E, S> IngestionPipeline<E, S>
where
    E: EmbeddingProvider,
    S: PaperStorage,
{
    /// Create a pipeline reading plain-text documents.
    pub fn new(
        store: Arc<PaperStore<E, S>>,
        provider: Arc<dyn ModelProvider>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            extractor: Arc::new(PlainTextExtractor),
            segmenter: Segmenter::new(config.segmenter),
            orchestrator: Orchestrator::new(provider, config.extraction, config.retry),
            merger: Merger::new(config.merge),
        }
    }

    /// Replace the document extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn extractor(&self) -> &dyn DocumentExtractor {
        self.extractor.as_ref()
    }

    pub fn store(&self) -> &Arc<PaperStore<E, S>> {
        &self.store
    }

    /// Summarize one document into a stored record.
    ///
    /// # Arguments
    /// * `path` - Source document
    /// * `force` - Re-process even if the source is already stored
    /// * `cancel` - Stops the run between model calls
    ///
    /// # Returns
    /// The stored record (possibly degraded, see `missing_fields`) with the
    /// degradation manifest of this run
    ///
    /// # Errors
    /// Unreadable or too-short documents, cancellation, rejected credentials,
    /// and store failures are returned as errors; provider failures on
    /// individual slots only degrade the record.
    pub async fn summarize(
        &self,
        path: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> IngestionResult<SummarizeOutcome> {
        let document = self.extractor.extract(path).await?;
        let chunks = self.segmenter.segment(&document.text, &document.hints)?;

        let title = resolve_title(&document.hints, &chunks, path);
        let paper_id = paper_id_for(path, &title);

        let existing = match self.store.get_paper(&paper_id).await {
            Ok(record) => Some(record),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        };
        if let (Some(record), false) = (&existing, force) {
            info!(paper_id = %paper_id, title = %title, "Paper already summarized, reusing");
            return Ok(SummarizeOutcome {
                record: record.clone(),
                manifest: DegradationManifest::default(),
                status: SummarizeStatus::Reused,
                chunks: chunks.len(),
            });
        }

        info!(paper_id = %paper_id, title = %title, chunks = chunks.len(), force, "Summarizing paper");
        let output = self.orchestrator.extract(&chunks, &title, cancel).await?;

        let header = RecordHeader {
            paper_id: paper_id.clone(),
            title,
            filepath: path.display().to_string(),
        };
        let mut record = self
            .merger
            .merge(header, chunks.len(), &output.partials, Utc::now())?;

        let status = match &existing {
            Some(previous) => {
                record.created_at = previous.created_at;
                record.notes = previous.notes.clone();
                SummarizeStatus::Overwritten
            }
            None => SummarizeStatus::Created,
        };

        if output.manifest.is_degraded() {
            warn!(
                paper_id = %paper_id,
                degraded = output.manifest.entries.len(),
                missing = ?record.missing_fields,
                "Paper stored with degraded slots"
            );
        }

        let record = self.store.add_paper(record).await?;
        Ok(SummarizeOutcome {
            record,
            manifest: output.manifest,
            status,
            chunks: chunks.len(),
        })
    }

    /// Summarize documents one after another.
    ///
    /// A failing document is recorded and the batch continues; cancellation
    /// stops the batch. `on_done` is called after every document.
    pub async fn summarize_batch<F>(
        &self,
        paths: &[PathBuf],
        force: bool,
        cancel: &CancellationToken,
        mut on_done: F,
    ) -> IngestionStats
    where
        F: FnMut(&Path, &IngestionResult<SummarizeOutcome>),
    {
        let mut stats = IngestionStats::new();
        for path in paths {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            let result = self.summarize(path, force, cancel).await;
            if let Err(err) = &result {
                if err.is_cancelled() {
                    stats.cancelled = true;
                    break;
                }
                warn!(path = %path.display(), error = %err, "Failed to summarize document");
            }
            stats.record(path, &result);
            on_done(path, &result);
        }
        info!(
            processed = stats.total_processed,
            created = stats.created,
            reused = stats.reused,
            failed = stats.failed(),
            "Batch finished"
        );
        stats
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::extraction::prompts::system_message;
    use crate::models::Aspect;
    use crate::provider::{ModelRequest, ProviderError, ProviderResult};
    use crate::storage::sqlite::SqliteStorage;
    use crate::store::tests::{temp_store, KeywordEmbedder};
    use async_trait::async_trait;
    use std::sync::Mutex;

    pub(crate) const SECTIONS: [&str; 6] = [
        "1 Introduction",
        "2 Background",
        "3 Model Architecture",
        "4 Training",
        "5 Results",
        "6 Conclusion",
    ];

    /// Six sections that each fill most of a 400-byte chunk.
    pub(crate) fn nlp_paper() -> String {
        let mut text = String::from("Attention Mechanisms for Neural Language Processing\n\n");
        for (i, heading) in SECTIONS.iter().enumerate() {
            text.push_str(heading);
            text.push_str("\n\n");
            for j in 1..=5 {
                text.push_str(&format!(
                    "Sentence {}.{} explains how attention mechanisms weigh tokens. ",
                    i + 1,
                    j
                ));
            }
            text.push_str("\n\n");
        }
        text
    }

    pub(crate) fn small_chunks() -> PipelineConfig {
        PipelineConfig {
            segmenter: SegmenterConfig {
                context_window_tokens: 400,
                reserved_output_tokens: 0,
                prompt_overhead_tokens: 0,
                chars_per_token: 1.0,
                ..SegmenterConfig::default()
            },
            retry: RetryPolicy::none(),
            ..PipelineConfig::default()
        }
    }

    /// Answers every aspect with a fixed NLP-flavoured reply.
    #[derive(Default)]
    pub(crate) struct NlpModel {
        pub(crate) calls: Mutex<usize>,
        pub(crate) fail_auth: bool,
    }

    fn aspect_of(request: &ModelRequest) -> Option<Aspect> {
        Aspect::ALL
            .into_iter()
            .find(|aspect| system_message(*aspect) == request.system_message)
    }

    #[async_trait]
    impl ModelProvider for NlpModel {
        async fn send(&self, request: &ModelRequest) -> ProviderResult<String> {
            *self.calls.lock().unwrap() += 1;
            if self.fail_auth {
                return Err(ProviderError::Auth("invalid api key".to_string()));
            }
            let answer = match aspect_of(request) {
                Some(Aspect::Summary) => {
                    let part = request
                        .prompt
                        .lines()
                        .find(|line| line.starts_with("Part "))
                        .unwrap_or("Part ?")
                        .to_string();
                    format!("The paper studies attention mechanisms in language models ({}).", part)
                }
                Some(Aspect::Takeaways) => r#"["Attention mechanisms replace recurrence"]"#.to_string(),
                Some(Aspect::Math) => "NONE".to_string(),
                Some(Aspect::Architecture) => {
                    "A transformer encoder-decoder built from attention layers.".to_string()
                }
                Some(Aspect::Domain) => "Natural Language Processing".to_string(),
                Some(Aspect::FutureDirections) => {
                    r#"["Apply attention to longer documents"]"#.to_string()
                }
                None => String::new(),
            };
            Ok(answer)
        }

        fn name(&self) -> &str {
            "nlp-test"
        }
    }

    fn calls(model: &NlpModel) -> usize {
        *model.calls.lock().unwrap()
    }

    async fn pipeline(
        model: Arc<NlpModel>,
    ) -> (tempfile::TempDir, IngestionPipeline<KeywordEmbedder, SqliteStorage>) {
        let (dir, store) = temp_store().await;
        let pipeline = IngestionPipeline::new(Arc::new(store), model, small_chunks());
        (dir, pipeline)
    }

    fn write_paper(dir: &tempfile::TempDir) -> PathBuf {
        let path = dir.path().join("attention.txt");
        std::fs::write(&path, nlp_paper()).unwrap();
        path
    }

    #[tokio::test]
    async fn test_six_chunk_nlp_paper_end_to_end() {
        let model = Arc::new(NlpModel::default());
        let (dir, pipeline) = pipeline(Arc::clone(&model)).await;
        let path = write_paper(&dir);

        let outcome = pipeline
            .summarize(&path, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, SummarizeStatus::Created);
        assert_eq!(outcome.chunks, 6);
        assert!(!outcome.manifest.is_degraded());
        assert_eq!(outcome.manifest.skipped, 6);

        let record = &outcome.record;
        assert_eq!(record.title, "Attention Mechanisms for Neural Language Processing");
        assert_eq!(record.domain, "Natural Language Processing");
        assert_eq!(record.takeaways, vec!["Attention mechanisms replace recurrence"]);
        assert!(record.summary.contains("Part 6 of 6"));
        assert_eq!(record.missing_fields, vec![Aspect::Math]);
        assert_eq!(record.paper_id, paper_id_for(&path, &record.title));

        // five aspects per chunk, math skipped on chunks without equations
        assert_eq!(calls(&model), 30);

        let hits = pipeline
            .store()
            .search("attention mechanisms", 5)
            .await
            .unwrap();
        assert_eq!(hits[0].paper.paper_id, record.paper_id);
        assert!(hits[0].score > 0.0);
    }

    #[tokio::test]
    async fn test_resummarize_reuses_unless_forced() {
        let model = Arc::new(NlpModel::default());
        let (dir, pipeline) = pipeline(Arc::clone(&model)).await;
        let path = write_paper(&dir);
        let cancel = CancellationToken::new();

        let first = pipeline.summarize(&path, false, &cancel).await.unwrap();
        pipeline
            .store()
            .append_field(&first.record.paper_id, crate::models::PaperField::Notes, "keep me")
            .await
            .unwrap();
        let calls_after_first = calls(&model);

        let second = pipeline.summarize(&path, false, &cancel).await.unwrap();
        assert_eq!(second.status, SummarizeStatus::Reused);
        assert_eq!(second.record.paper_id, first.record.paper_id);
        assert_eq!(calls(&model), calls_after_first);

        let forced = pipeline.summarize(&path, true, &cancel).await.unwrap();
        assert_eq!(forced.status, SummarizeStatus::Overwritten);
        assert_eq!(forced.record.paper_id, first.record.paper_id);
        assert_eq!(forced.record.created_at, first.record.created_at);
        assert_eq!(forced.record.notes, vec!["keep me"]);
        assert_eq!(calls(&model), calls_after_first * 2);
        assert_eq!(pipeline.store().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_surfaces_and_stores_nothing() {
        let model = Arc::new(NlpModel {
            fail_auth: true,
            ..NlpModel::default()
        });
        let (dir, pipeline) = pipeline(model).await;
        let path = write_paper(&dir);

        let err = pipeline
            .summarize(&path, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            IngestionError::Extraction(ExtractionError::Aborted(ProviderError::Auth(_)))
        ));
        assert_eq!(pipeline.store().count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_records_failures_and_continues() {
        let model = Arc::new(NlpModel::default());
        let (dir, pipeline) = pipeline(model).await;
        let good = write_paper(&dir);
        let short = dir.path().join("short.txt");
        std::fs::write(&short, "Too short to summarize.").unwrap();

        let mut seen = Vec::new();
        let stats = pipeline
            .summarize_batch(
                &[short.clone(), good.clone(), good],
                false,
                &CancellationToken::new(),
                |path, _| seen.push(path.to_path_buf()),
            )
            .await;

        assert_eq!(stats.total_processed, 3);
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
        assert_eq!(stats.failed(), 1);
        assert_eq!(stats.failures[0].0, short);
        assert_eq!(seen.len(), 3);
        assert!(!stats.cancelled);
    }

    #[tokio::test]
    async fn test_cancelled_batch_stops() {
        let model = Arc::new(NlpModel::default());
        let (dir, pipeline) = pipeline(model).await;
        let path = write_paper(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = pipeline.summarize_batch(&[path], false, &cancel, |_, _| {}).await;
        assert!(stats.cancelled);
        assert_eq!(stats.total_processed, 0);
    }
}
