//! Session layer: the operations a user drives interactively.
//!
//! State that lives for one session (the open paper and the comparison set)
//! is an explicit [`SessionContext`] passed into every operation, so one
//! [`Session`] can serve several contexts.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::compare::{
    CompareError, ComparisonAspect, ComparisonConfig, ComparisonEngine, ComparisonSet,
};
use crate::discuss::{DiscussError, Discussion, DiscussionConfig};
use crate::embedding::EmbeddingProvider;
use crate::generate::{GenerateError, GenerationConfig, GenerationKind, Generator};
use crate::ingestion::{IngestionError, IngestionPipeline, SummarizeOutcome};
use crate::models::{DomainCount, PaperField, PaperRecord, SearchResult};
use crate::extraction::ExtractionError;
use crate::provider::retry::{RetryError, RetryPolicy};
use crate::provider::{ModelProvider, ProviderError};
use crate::query::{QueryError, SearchQuery};
use crate::storage::PaperStorage;
use crate::store::{PaperStore, StoreError};

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No paper is open; open one first")]
    NoCurrentPaper,

    #[error("{0}")]
    UnknownField(String),

    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Compare(#[from] CompareError),

    #[error(transparent)]
    Discuss(#[from] DiscussError),

    #[error(transparent)]
    Generate(#[from] GenerateError),
}

impl SessionError {
    /// The final model-call failure behind this error, if there was one.
    pub fn retry_error(&self) -> Option<&RetryError> {
        match self {
            SessionError::Compare(CompareError::Provider(err))
            | SessionError::Discuss(DiscussError::Provider(err))
            | SessionError::Generate(GenerateError::Provider(err)) => Some(err),
            _ => None,
        }
    }

    /// Whether the provider rejected the configured credentials.
    pub fn is_auth_failure(&self) -> bool {
        let provider_error = match self {
            SessionError::Ingestion(IngestionError::Extraction(ExtractionError::Aborted(err))) => {
                Some(err)
            }
            other => other.retry_error().and_then(RetryError::provider_error),
        };
        matches!(provider_error, Some(ProviderError::Auth(_)))
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Per-session state.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    current: Option<PaperRecord>,
    comparison: ComparisonSet,
}

impl SessionContext {
    pub fn new(comparison_capacity: usize) -> Self {
        Self {
            current: None,
            comparison: ComparisonSet::new(comparison_capacity),
        }
    }

    /// The paper questions and `add` apply to.
    pub fn current(&self) -> Option<&PaperRecord> {
        self.current.as_ref()
    }

    pub fn comparison(&self) -> &ComparisonSet {
        &self.comparison
    }

    fn require_current(&self) -> SessionResult<&PaperRecord> {
        self.current.as_ref().ok_or(SessionError::NoCurrentPaper)
    }
}

/// Operation surface over the pipeline, store and model-backed helpers.
pub struct Session<E, S>
where
    E: EmbeddingProvider,
    S: PaperStorage,
{
    pipeline: IngestionPipeline<E, S>,
    comparison: ComparisonEngine,
    discussion: Discussion,
    generator: Generator,
}

impl<E, S> Session<E, S>
where
    E: EmbeddingProvider,
    S: PaperStorage,
{
    pub fn new(
        pipeline: IngestionPipeline<E, S>,
        provider: Arc<dyn ModelProvider>,
        retry: RetryPolicy,
        comparison: ComparisonConfig,
        discussion: DiscussionConfig,
        generation: GenerationConfig,
    ) -> Self {
        Self {
            pipeline,
            comparison: ComparisonEngine::new(Arc::clone(&provider), retry.clone(), comparison),
            discussion: Discussion::new(Arc::clone(&provider), retry.clone(), discussion),
            generator: Generator::new(provider, retry, generation),
        }
    }

    /// A context sized for this session's comparison settings.
    pub fn new_context(&self) -> SessionContext {
        SessionContext::new(self.comparison.config().max_papers)
    }

    pub fn store(&self) -> &PaperStore<E, S> {
        self.pipeline.store()
    }

    /// Summarize a document and make it the current paper.
    pub async fn summarize(
        &self,
        ctx: &mut SessionContext,
        path: &Path,
        force: bool,
        cancel: &CancellationToken,
    ) -> SessionResult<SummarizeOutcome> {
        let outcome = self.pipeline.summarize(path, force, cancel).await?;
        ctx.current = Some(outcome.record.clone());
        Ok(outcome)
    }

    /// Run a search; `input` may carry a `domain:`, `title:` or `takeaway:`
    /// prefix.
    pub async fn search(&self, input: &str, limit: usize) -> SessionResult<Vec<SearchResult>> {
        let query = SearchQuery::parse(input, limit)?;
        Ok(self.store().execute(&query).await?)
    }

    /// Load a paper and make it the current one.
    ///
    /// # Errors
    /// Returns the store's not-found error for an unknown id; the current
    /// paper is left unchanged then
    pub async fn open(&self, ctx: &mut SessionContext, paper_id: &str) -> SessionResult<PaperRecord> {
        let record = self.store().get_paper(paper_id.trim()).await?;
        info!(paper_id = %record.paper_id, "Opened paper");
        ctx.current = Some(record.clone());
        Ok(record)
    }

    /// Ask a question about the current paper.
    pub async fn discuss(
        &self,
        ctx: &SessionContext,
        question: &str,
        cancel: &CancellationToken,
    ) -> SessionResult<String> {
        let paper = ctx.require_current()?;
        Ok(self.discussion.discuss(paper, question, cancel).await?)
    }

    /// Generate code or a blog post for the current paper and save it.
    ///
    /// # Returns
    /// The generated text and the file it was written to
    pub async fn generate(
        &self,
        ctx: &SessionContext,
        kind: GenerationKind,
        style_sample: Option<&str>,
        cancel: &CancellationToken,
    ) -> SessionResult<(String, PathBuf)> {
        let paper = ctx.require_current()?;
        let text = self.generator.generate(paper, kind, style_sample, cancel).await?;
        let path = self.generator.save(&paper.paper_id, kind, &text)?;
        Ok((text, path))
    }

    /// `add <field> <content>` on the current paper.
    pub async fn add(
        &self,
        ctx: &mut SessionContext,
        field: &str,
        content: &str,
    ) -> SessionResult<PaperRecord> {
        let paper_id = ctx.require_current()?.paper_id.clone();
        let field: PaperField = field.parse().map_err(SessionError::UnknownField)?;
        let record = self.store().append_field(&paper_id, field, content).await?;
        ctx.current = Some(record.clone());
        Ok(record)
    }

    /// Add a stored paper to the comparison set.
    ///
    /// # Returns
    /// `false` when the paper was already in the set
    pub async fn compare_add(&self, ctx: &mut SessionContext, paper_id: &str) -> SessionResult<bool> {
        let paper_id = paper_id.trim();
        if !ctx.comparison.contains(paper_id) {
            // unknown ids never enter the set
            self.store().get_paper(paper_id).await?;
        }
        Ok(ctx.comparison.add(paper_id)?)
    }

    pub fn compare_remove(&self, ctx: &mut SessionContext, paper_id: &str) -> SessionResult<()> {
        Ok(ctx.comparison.remove(paper_id.trim())?)
    }

    /// Records currently in the comparison set, in set order.
    pub async fn compare_list(&self, ctx: &SessionContext) -> SessionResult<Vec<PaperRecord>> {
        let mut papers = Vec::with_capacity(ctx.comparison.len());
        for paper_id in ctx.comparison.list() {
            papers.push(self.store().get_paper(paper_id).await?);
        }
        Ok(papers)
    }

    pub fn compare_clear(&self, ctx: &mut SessionContext) {
        ctx.comparison.clear();
    }

    /// Compare the papers in the set on `aspect`.
    ///
    /// # Errors
    /// Returns `CompareError::InsufficientPapers` when fewer than two papers
    /// are in the set; the set is never modified
    pub async fn compare(
        &self,
        ctx: &SessionContext,
        aspect: &str,
        cancel: &CancellationToken,
    ) -> SessionResult<String> {
        if ctx.comparison.len() < 2 {
            return Err(CompareError::InsufficientPapers(ctx.comparison.len()).into());
        }
        let aspect: ComparisonAspect = aspect.parse()?;
        let papers = self.compare_list(ctx).await?;
        Ok(self.comparison.compare(&papers, &aspect, cancel).await?)
    }

    /// Distinct domains with paper counts.
    pub async fn domains(&self, limit: usize) -> SessionResult<Vec<DomainCount>> {
        Ok(self.store().list_domains(limit).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::tests::{nlp_paper, small_chunks, NlpModel};
    use crate::ingestion::SummarizeStatus;
    use crate::query::DEFAULT_LIMIT;
    use crate::storage::sqlite::SqliteStorage;
    use crate::store::tests::{paper, temp_store, KeywordEmbedder};

    async fn session() -> (
        tempfile::TempDir,
        Arc<NlpModel>,
        Session<KeywordEmbedder, SqliteStorage>,
    ) {
        session_with(NlpModel::default()).await
    }

    async fn session_with(
        model: NlpModel,
    ) -> (
        tempfile::TempDir,
        Arc<NlpModel>,
        Session<KeywordEmbedder, SqliteStorage>,
    ) {
        let (dir, store) = temp_store().await;
        store
            .add_paper(paper("gnn", "Graph Attention Networks", "Graph Learning", &["Graph attention"], 2))
            .await
            .unwrap();
        store
            .add_paper(paper("ppo", "Proximal Policy Optimization", "Reinforcement Learning", &["Clipped policy reward"], 3))
            .await
            .unwrap();

        let model = Arc::new(model);
        let pipeline = IngestionPipeline::new(Arc::new(store), model.clone(), small_chunks());
        let session = Session::new(
            pipeline,
            model.clone(),
            RetryPolicy::none(),
            ComparisonConfig::default(),
            DiscussionConfig::default(),
            GenerationConfig {
                output_dir: dir.path().join("generated"),
                ..GenerationConfig::default()
            },
        );
        (dir, model, session)
    }

    #[tokio::test]
    async fn test_summarize_sets_current_paper() {
        let (dir, _model, session) = session().await;
        let mut ctx = session.new_context();
        let path = dir.path().join("attention.txt");
        std::fs::write(&path, nlp_paper()).unwrap();

        let outcome = session
            .summarize(&mut ctx, &path, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.status, SummarizeStatus::Created);
        assert_eq!(ctx.current().unwrap().paper_id, outcome.record.paper_id);
    }

    #[tokio::test]
    async fn test_open_unknown_keeps_current() {
        let (_dir, _model, session) = session().await;
        let mut ctx = session.new_context();

        session.open(&mut ctx, "gnn").await.unwrap();
        let err = session.open(&mut ctx, "missing").await.unwrap_err();
        assert!(matches!(err, SessionError::Store(ref e) if e.is_not_found()));
        assert_eq!(ctx.current().unwrap().paper_id, "gnn");
    }

    #[tokio::test]
    async fn test_discuss_and_add_need_an_open_paper() {
        let (_dir, model, session) = session().await;
        let mut ctx = session.new_context();
        let cancel = CancellationToken::new();

        assert!(matches!(
            session.discuss(&ctx, "What is new?", &cancel).await,
            Err(SessionError::NoCurrentPaper)
        ));
        assert!(matches!(
            session.add(&mut ctx, "notes", "read later").await,
            Err(SessionError::NoCurrentPaper)
        ));

        session.open(&mut ctx, "gnn").await.unwrap();
        session.discuss(&ctx, "What is new?", &cancel).await.unwrap();
        assert_eq!(*model.calls.lock().unwrap(), 1);

        let updated = session.add(&mut ctx, "domain", "Graph Neural Networks").await.unwrap();
        assert_eq!(updated.domain, "Graph Neural Networks");
        assert_eq!(ctx.current().unwrap().domain, "Graph Neural Networks");

        assert!(matches!(
            session.add(&mut ctx, "background", "x").await,
            Err(SessionError::UnknownField(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_needs_an_open_paper_and_model_output() {
        let (dir, model, session) = session().await;
        let mut ctx = session.new_context();
        let cancel = CancellationToken::new();

        assert!(matches!(
            session.generate(&ctx, GenerationKind::Code, None, &cancel).await,
            Err(SessionError::NoCurrentPaper)
        ));
        assert_eq!(*model.calls.lock().unwrap(), 0);

        // the test model has no answer for generation prompts
        session.open(&mut ctx, "gnn").await.unwrap();
        let err = session
            .generate(&ctx, GenerationKind::Blog, Some("Plain words."), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Generate(GenerateError::EmptyOutput(GenerationKind::Blog))
        ));
        assert_eq!(*model.calls.lock().unwrap(), 1);
        assert!(!dir.path().join("generated").join("gnn_blog.md").exists());
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_reported_as_auth_failures() {
        let (dir, _model, session) = session_with(NlpModel {
            fail_auth: true,
            ..NlpModel::default()
        })
        .await;
        let mut ctx = session.new_context();
        let cancel = CancellationToken::new();

        session.open(&mut ctx, "gnn").await.unwrap();
        let err = session.discuss(&ctx, "What is new?", &cancel).await.unwrap_err();
        assert!(err.retry_error().is_some());
        assert!(err.is_auth_failure());

        let path = dir.path().join("attention.txt");
        std::fs::write(&path, nlp_paper()).unwrap();
        let err = session.summarize(&mut ctx, &path, false, &cancel).await.unwrap_err();
        assert!(err.retry_error().is_none());
        assert!(err.is_auth_failure());

        assert!(!SessionError::NoCurrentPaper.is_auth_failure());
    }

    #[tokio::test]
    async fn test_compare_with_fewer_than_two_papers() {
        let (_dir, model, session) = session().await;
        let mut ctx = session.new_context();
        let cancel = CancellationToken::new();

        assert!(session.compare_add(&mut ctx, "gnn").await.unwrap());
        let err = session.compare(&ctx, "methodology", &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Compare(CompareError::InsufficientPapers(1))
        ));
        assert_eq!(ctx.comparison().list(), ["gnn".to_string()]);
        assert_eq!(*model.calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_comparison_set_operations() {
        let (_dir, model, session) = session().await;
        let mut ctx = session.new_context();

        assert!(session.compare_add(&mut ctx, "gnn").await.unwrap());
        assert!(!session.compare_add(&mut ctx, "gnn").await.unwrap());
        assert!(session.compare_add(&mut ctx, "nope").await.is_err());
        assert!(session.compare_add(&mut ctx, "ppo").await.unwrap());

        let titles: Vec<String> = session
            .compare_list(&ctx)
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.title)
            .collect();
        assert_eq!(titles, vec!["Graph Attention Networks", "Proximal Policy Optimization"]);

        session
            .compare(&ctx, "results", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*model.calls.lock().unwrap(), 1);
        assert_eq!(ctx.comparison().len(), 2);

        assert!(matches!(
            session.compare_remove(&mut ctx, "absent"),
            Err(SessionError::Compare(CompareError::NotInSet(_)))
        ));
        session.compare_remove(&mut ctx, "gnn").unwrap();
        session.compare_clear(&mut ctx);
        assert!(ctx.comparison().is_empty());
    }

    #[tokio::test]
    async fn test_search_and_domains() {
        let (_dir, _model, session) = session().await;

        let results = session.search("domain: reinforcement", DEFAULT_LIMIT).await.unwrap();
        assert_eq!(results[0].paper.paper_id, "ppo");

        let results = session.search("graph attention", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].paper.paper_id, "gnn");

        let domains = session.domains(10).await.unwrap();
        assert_eq!(domains.len(), 2);
        assert!(matches!(session.search("   ", 5).await, Err(SessionError::Query(_))));
    }
}
