//! Paper store service.
//!
//! [`PaperStore`] sits between the pipeline and a [`PaperStorage`] backend. It
//! owns the embedder, so every record and every search query is embedded with
//! the model the store was built with, and it serializes writes per paper id
//! so that read-modify-write operations such as [`PaperStore::append_field`]
//! never lose an update.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use chrono::Utc;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::embedding::{
    normalize_text, DynamicEmbeddingProvider, EmbeddingError, EmbeddingProvider, EmbeddingSettings,
};
use crate::merge::similarity;
use crate::models::{Aspect, DomainCount, PaperField, PaperRecord, SearchResult};
use crate::query::{by_recency, by_score, cosine_similarity, SearchKind, SearchQuery};
use crate::storage::sqlite::{SqliteConfig, SqliteStorage};
use crate::storage::{PaperStorage, StorageError};

/// Errors that can occur in the store service.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    /// Rejected caller input (blank content, empty query)
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::Storage(StorageError::NotFound(_)))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Minimum diff ratio for the fuzzy fallback of title and domain search
    pub fuzzy_threshold: f32,

    pub sqlite: SqliteConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.75,
            sqlite: SqliteConfig::default(),
        }
    }
}

/// Paper store over an embedder and a storage backend.
pub struct PaperStore<E, S>
where
    E: EmbeddingProvider,
    S: PaperStorage,
{
    embedder: E,
    storage: S,
    config: StoreConfig,
    write_locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl<E, S> PaperStore<E, S>
where
    E: EmbeddingProvider,
    S: PaperStorage,
{
    /// Open a store, initializing the backend.
    ///
    /// A fresh store records the embedder's configuration; an existing one
    /// must match it.
    ///
    /// # Errors
    /// Returns `StorageError::ConfigMismatch` when the store was built with a
    /// different embedding model or dimension
    pub async fn open(embedder: E, storage: S, config: StoreConfig) -> StoreResult<Self> {
        storage.initialize().await?;

        let wanted = embedder.config();
        match storage.get_config().await? {
            None => {
                info!(model = %wanted.model_name, dimension = wanted.dimension, "initializing embedding config");
                storage.store_config(&wanted).await?;
            }
            Some(stored) if stored != wanted => {
                return Err(StorageError::ConfigMismatch {
                    stored: stored.model_name,
                    stored_dim: stored.dimension,
                    requested: wanted.model_name,
                    requested_dim: wanted.dimension,
                }
                .into());
            }
            Some(_) => {}
        }

        Ok(Self {
            embedder,
            storage,
            config,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn embedder(&self) -> &E {
        &self.embedder
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn write_lock(&self, paper_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .write_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if locks.len() > 128 {
            locks.retain(|_, weak| weak.strong_count() > 0);
        }

        if let Some(existing) = locks.get(paper_id).and_then(Weak::upgrade) {
            return existing;
        }

        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(paper_id.to_string(), Arc::downgrade(&lock));
        lock
    }

    async fn embed_takeaways(&self, takeaways: &[String]) -> StoreResult<Vec<Vec<f32>>> {
        if takeaways.is_empty() {
            return Ok(Vec::new());
        }
        let normalized: Vec<String> = takeaways.iter().map(|t| normalize_text(t)).collect();
        let texts: Vec<&str> = normalized.iter().map(String::as_str).collect();
        Ok(self.embedder.embed_batch(&texts).await?)
    }

    /// Embed the record if needed and write it. Caller holds the id lock.
    async fn write(
        &self,
        mut record: PaperRecord,
        takeaway_embeddings: Option<Vec<Vec<f32>>>,
    ) -> StoreResult<PaperRecord> {
        let stale = record
            .embedding
            .as_ref()
            .map_or(true, |e| e.len() != self.embedder.dimension());
        if stale {
            let text = normalize_text(&record.embedding_text());
            record.embedding = Some(self.embedder.embed(&text).await?);
        }

        let takeaway_embeddings = match takeaway_embeddings {
            Some(embeddings) => embeddings,
            None => self.embed_takeaways(&record.takeaways).await?,
        };

        self.storage
            .upsert_paper(&record, &takeaway_embeddings)
            .await?;
        debug!(paper_id = %record.paper_id, takeaways = record.takeaways.len(), "paper written");
        Ok(record)
    }

    /// Insert or replace a record.
    ///
    /// The whole-paper embedding is computed when absent and the takeaway
    /// index is rebuilt; record and takeaway rows are replaced together.
    pub async fn add_paper(&self, record: PaperRecord) -> StoreResult<PaperRecord> {
        let lock = self.write_lock(&record.paper_id);
        let _guard = lock.lock().await;
        self.write(record, None).await
    }

    /// Extend one field of a stored record.
    ///
    /// List fields skip content already present verbatim; `domain` replaces
    /// the value. `updated_at` is bumped and the embeddings are refreshed when
    /// takeaways change.
    ///
    /// # Errors
    /// Returns `StoreError::InvalidInput` for blank content and
    /// `StorageError::NotFound` for an unknown id
    pub async fn append_field(
        &self,
        paper_id: &str,
        field: PaperField,
        content: &str,
    ) -> StoreResult<PaperRecord> {
        let content = content.trim();
        if content.is_empty() {
            return Err(StoreError::InvalidInput("content cannot be empty".to_string()));
        }

        let lock = self.write_lock(paper_id);
        let _guard = lock.lock().await;

        let mut record = self.storage.get_paper(paper_id).await?;
        let (list, aspect) = match field {
            PaperField::Takeaways => (Some(&mut record.takeaways), Some(Aspect::Takeaways)),
            PaperField::FutureDirections => (
                Some(&mut record.future_directions),
                Some(Aspect::FutureDirections),
            ),
            PaperField::Math => (Some(&mut record.math_formulations), Some(Aspect::Math)),
            PaperField::Notes => (Some(&mut record.notes), None),
            PaperField::Domain => (None, Some(Aspect::Domain)),
        };

        match list {
            Some(items) => {
                if items.iter().any(|item| item == content) {
                    debug!(paper_id, ?field, "content already present");
                    return Ok(record);
                }
                items.push(content.to_string());
            }
            None => record.domain = content.to_string(),
        }
        if let Some(aspect) = aspect {
            record.missing_fields.retain(|missing| *missing != aspect);
        }
        record.updated_at = Utc::now();

        let takeaway_embeddings = if field == PaperField::Takeaways {
            record.embedding = None;
            None
        } else {
            let existing = self.storage.get_takeaways(paper_id).await?;
            if existing.len() == record.takeaways.len() {
                Some(existing.into_iter().map(|entry| entry.embedding).collect())
            } else {
                None
            }
        };

        info!(paper_id, ?field, "appending to paper");
        self.write(record, takeaway_embeddings).await
    }

    /// Exact lookup.
    ///
    /// # Errors
    /// Returns `StorageError::NotFound` if absent
    pub async fn get_paper(&self, paper_id: &str) -> StoreResult<PaperRecord> {
        Ok(self.storage.get_paper(paper_id).await?)
    }

    pub async fn exists(&self, paper_id: &str) -> StoreResult<bool> {
        Ok(self.storage.exists(paper_id).await?)
    }

    pub async fn count(&self) -> StoreResult<usize> {
        Ok(self.storage.count_papers().await?)
    }

    async fn embed_query(&self, text: &str) -> StoreResult<Vec<f32>> {
        let normalized = normalize_text(text);
        if normalized.is_empty() {
            return Err(StoreError::InvalidInput("query cannot be empty".to_string()));
        }
        Ok(self.embedder.embed(&normalized).await?)
    }

    /// Top `limit` papers by cosine similarity to `text`.
    ///
    /// Ties are broken by most recent update, then id.
    pub async fn search(&self, text: &str, limit: usize) -> StoreResult<Vec<SearchResult>> {
        let query_embedding = self.embed_query(text).await?;
        let papers = self.storage.get_all_papers().await?;

        let mut scored: Vec<(f32, PaperRecord)> = papers
            .into_iter()
            .filter_map(|paper| {
                let score = cosine_similarity(&query_embedding, paper.embedding.as_deref()?);
                Some((score, paper))
            })
            .collect();
        scored.sort_by(|a, b| by_score((a.0, &a.1), (b.0, &b.1)));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(score, paper)| SearchResult::new(paper, score))
            .collect())
    }

    /// Case-insensitive substring match on a text field, with a fuzzy
    /// fallback when nothing contains the needle.
    async fn text_search(
        &self,
        needle: &str,
        limit: usize,
        field: fn(&PaperRecord) -> &str,
    ) -> StoreResult<Vec<SearchResult>> {
        let needle = needle.trim().to_lowercase();
        if needle.is_empty() {
            return Err(StoreError::InvalidInput("query cannot be empty".to_string()));
        }
        let papers = self.storage.get_all_papers().await?;

        let mut hits: Vec<(f32, PaperRecord)> = Vec::new();
        let mut fuzzy: Vec<(f32, PaperRecord)> = Vec::new();
        for paper in papers {
            let haystack = field(&paper).to_lowercase();
            if haystack.contains(&needle) {
                hits.push((1.0, paper));
            } else {
                let ratio = similarity(&needle, &haystack);
                if ratio >= self.config.fuzzy_threshold {
                    fuzzy.push((ratio, paper));
                }
            }
        }

        let mut matches = if hits.is_empty() { fuzzy } else { hits };
        matches.sort_by(|a, b| by_recency(&a.1, &b.1));
        matches.truncate(limit);

        Ok(matches
            .into_iter()
            .map(|(score, paper)| SearchResult::new(paper, score))
            .collect())
    }

    pub async fn search_by_title(
        &self,
        fragment: &str,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        self.text_search(fragment, limit, |paper| paper.title.as_str())
            .await
    }

    pub async fn search_by_domain(
        &self,
        domain: &str,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        self.text_search(domain, limit, |paper| paper.domain.as_str())
            .await
    }

    /// Rank papers by their best-matching takeaway.
    ///
    /// Each paper appears once, carrying the takeaway that matched.
    pub async fn search_by_takeaway(
        &self,
        concept: &str,
        limit: usize,
    ) -> StoreResult<Vec<SearchResult>> {
        let query_embedding = self.embed_query(concept).await?;
        let entries = self.storage.get_all_takeaways().await?;

        let mut best: HashMap<String, (f32, usize, String)> = HashMap::new();
        for entry in entries {
            let score = cosine_similarity(&query_embedding, &entry.embedding);
            let replace = best.get(&entry.paper_id).map_or(true, |(current, index, _)| {
                score > *current || (score == *current && entry.takeaway_index < *index)
            });
            if replace {
                best.insert(entry.paper_id, (score, entry.takeaway_index, entry.text));
            }
        }

        let papers = self.storage.get_all_papers().await?;
        let mut scored: Vec<(f32, PaperRecord, String)> = papers
            .into_iter()
            .filter_map(|paper| {
                let (score, _, text) = best.remove(&paper.paper_id)?;
                Some((score, paper, text))
            })
            .collect();
        scored.sort_by(|a, b| by_score((a.0, &a.1), (b.0, &b.1)));
        scored.truncate(limit);

        Ok(scored
            .into_iter()
            .map(|(score, paper, text)| SearchResult::new(paper, score).with_takeaway(text))
            .collect())
    }

    /// Distinct domains with paper counts, most common first.
    ///
    /// Domains differing only in case are grouped; the spelling of the most
    /// recently updated paper is shown.
    pub async fn list_domains(&self, limit: usize) -> StoreResult<Vec<DomainCount>> {
        let mut papers = self.storage.get_all_papers().await?;
        papers.sort_by(by_recency);

        let mut groups: Vec<(String, DomainCount)> = Vec::new();
        for paper in &papers {
            let domain = paper.domain.trim();
            if domain.is_empty() {
                continue;
            }
            let key = domain.to_lowercase();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, group)) => group.count += 1,
                None => groups.push((
                    key,
                    DomainCount {
                        domain: domain.to_string(),
                        count: 1,
                    },
                )),
            }
        }

        groups.sort_by(|(ka, a), (kb, b)| b.count.cmp(&a.count).then_with(|| ka.cmp(kb)));
        Ok(groups
            .into_iter()
            .map(|(_, group)| group)
            .take(limit)
            .collect())
    }

    /// Run a parsed query.
    pub async fn execute(&self, query: &SearchQuery) -> StoreResult<Vec<SearchResult>> {
        match query.kind {
            SearchKind::Semantic => self.search(&query.text, query.limit).await,
            SearchKind::Domain => self.search_by_domain(&query.text, query.limit).await,
            SearchKind::Title => self.search_by_title(&query.text, query.limit).await,
            SearchKind::Takeaway => self.search_by_takeaway(&query.text, query.limit).await,
        }
    }
}

/// Open the SQLite-backed store at `path`.
///
/// An existing store picks the embedder matching its persisted config; a
/// fresh one is built with `settings`.
pub async fn open_sqlite(
    path: &Path,
    settings: &EmbeddingSettings,
    config: StoreConfig,
) -> StoreResult<PaperStore<DynamicEmbeddingProvider, SqliteStorage>> {
    let storage = SqliteStorage::open(path, config.sqlite.clone())?;
    storage.initialize().await?;

    let embedder = match storage.get_config().await? {
        Some(stored) => {
            debug!(model = %stored.model_name, dimension = stored.dimension, "using stored embedding config");
            DynamicEmbeddingProvider::for_stored_config(&stored, settings)?
        }
        None => DynamicEmbeddingProvider::from_settings(settings)?,
    };
    PaperStore::open(embedder, storage, config).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::embedding::EmbeddingResult;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};

    const VOCABULARY: [&str; 8] = [
        "attention",
        "transformer",
        "image",
        "convolution",
        "policy",
        "reward",
        "graph",
        "language",
    ];

    /// Bag-of-words embedder over a fixed vocabulary; deterministic and
    /// never zero.
    pub(crate) struct KeywordEmbedder {
        pub(crate) model_name: String,
        pub(crate) calls: Arc<Mutex<usize>>,
    }

    impl KeywordEmbedder {
        pub(crate) fn new() -> Self {
            Self {
                model_name: "keyword-test".to_string(),
                calls: Arc::new(Mutex::new(0)),
            }
        }

        fn vector(text: &str) -> Vec<f32> {
            let lower = text.to_lowercase();
            let mut vector: Vec<f32> = VOCABULARY
                .iter()
                .map(|word| lower.matches(word).count() as f32)
                .collect();
            vector.push(0.05);
            vector
        }
    }

    #[async_trait]
    impl EmbeddingProvider for KeywordEmbedder {
        async fn embed(&self, text: &str) -> EmbeddingResult<Vec<f32>> {
            *self.calls.lock().unwrap() += 1;
            Ok(Self::vector(text))
        }

        async fn embed_batch(&self, texts: &[&str]) -> EmbeddingResult<Vec<Vec<f32>>> {
            *self.calls.lock().unwrap() += 1;
            Ok(texts.iter().map(|t| Self::vector(t)).collect())
        }

        fn dimension(&self) -> usize {
            VOCABULARY.len() + 1
        }

        fn model_name(&self) -> &str {
            &self.model_name
        }
    }

    pub(crate) fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap()
    }

    pub(crate) fn paper(id: &str, title: &str, domain: &str, takeaways: &[&str], day: u32) -> PaperRecord {
        PaperRecord {
            paper_id: id.to_string(),
            title: title.to_string(),
            filepath: format!("/papers/{}.txt", id),
            summary: format!("{} summary", title),
            takeaways: takeaways.iter().map(|t| t.to_string()).collect(),
            architecture: None,
            math_formulations: vec![],
            domain: domain.to_string(),
            future_directions: vec![],
            notes: vec![],
            missing_fields: vec![],
            embedding: None,
            created_at: at(day),
            updated_at: at(day),
        }
    }

    pub(crate) async fn temp_store() -> (tempfile::TempDir, PaperStore<KeywordEmbedder, SqliteStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = SqliteStorage::open(dir.path().join("papers.db"), SqliteConfig::default()).unwrap();
        let store = PaperStore::open(KeywordEmbedder::new(), storage, StoreConfig::default())
            .await
            .unwrap();
        (dir, store)
    }

    async fn seeded() -> (tempfile::TempDir, PaperStore<KeywordEmbedder, SqliteStorage>) {
        let (dir, store) = temp_store().await;
        store
            .add_paper(paper(
                "attn",
                "Attention Is All You Need",
                "Natural Language Processing",
                &["Self-attention replaces recurrence", "Transformer trains faster"],
                1,
            ))
            .await
            .unwrap();
        store
            .add_paper(paper(
                "resnet",
                "Deep Residual Learning for Image Recognition",
                "Computer Vision",
                &["Residual connections ease convolution depth"],
                2,
            ))
            .await
            .unwrap();
        store
            .add_paper(paper(
                "ppo",
                "Proximal Policy Optimization",
                "Reinforcement Learning",
                &["Clipped policy updates keep reward stable"],
                3,
            ))
            .await
            .unwrap();
        store
            .add_paper(paper(
                "bert",
                "BERT: Pre-training of Deep Bidirectional Transformers",
                "natural language processing",
                &["Masked language modelling with a transformer encoder"],
                4,
            ))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_add_and_get_round_trip() {
        let (_dir, store) = temp_store().await;
        let record = paper("p1", "Graph Attention Networks", "Graph Neural Networks", &["attention over graph neighbours"], 1);

        let stored = store.add_paper(record.clone()).await.unwrap();
        assert!(stored.embedding.is_some());

        let loaded = store.get_paper("p1").await.unwrap();
        assert_eq!(loaded, stored);
        assert_eq!(loaded.takeaways, record.takeaways);
        assert!(store.exists("p1").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.storage().get_takeaways("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_get_unknown_paper_is_not_found() {
        let (_dir, store) = temp_store().await;
        let err = store.get_paper("missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_search_is_bounded_and_sorted() {
        let (_dir, store) = seeded().await;

        let results = store.search("attention transformer", 2).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].score >= results[1].score);
        assert_eq!(results[0].paper.paper_id, "attn");

        let all = store.search("image convolution", 10).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(all[0].paper.paper_id, "resnet");
        for pair in all.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_search_ties_prefer_recent_updates() {
        let (_dir, store) = temp_store().await;
        store.add_paper(paper("old", "Graph", "X", &[], 1)).await.unwrap();
        store.add_paper(paper("new", "Graph", "X", &[], 5)).await.unwrap();

        let results = store.search("graph", 2).await.unwrap();
        assert_eq!(results[0].paper.paper_id, "new");
        assert_eq!(results[1].paper.paper_id, "old");
    }

    #[tokio::test]
    async fn test_domain_search_substring_then_fuzzy() {
        let (_dir, store) = seeded().await;

        let results = store.search_by_domain("LANGUAGE", 5).await.unwrap();
        let ids: Vec<_> = results.iter().map(|r| r.paper.paper_id.as_str()).collect();
        assert_eq!(ids, vec!["bert", "attn"]);

        let fuzzy = store.search_by_domain("Computer Visoin", 5).await.unwrap();
        assert_eq!(fuzzy.len(), 1);
        assert_eq!(fuzzy[0].paper.paper_id, "resnet");
        assert!(fuzzy[0].score < 1.0);

        assert!(store.search_by_domain("Astrophysics", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_title_search() {
        let (_dir, store) = seeded().await;
        let results = store.search_by_title("residual", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].paper.paper_id, "resnet");
    }

    #[tokio::test]
    async fn test_takeaway_search_returns_best_takeaway_once_per_paper() {
        let (_dir, store) = seeded().await;
        let results = store.search_by_takeaway("transformer", 10).await.unwrap();

        let mut ids: Vec<_> = results.iter().map(|r| r.paper.paper_id.clone()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), results.len());

        let attn = results.iter().find(|r| r.paper.paper_id == "attn").unwrap();
        assert_eq!(attn.matched_takeaway.as_deref(), Some("Transformer trains faster"));
    }

    #[tokio::test]
    async fn test_list_domains_groups_case_insensitively() {
        let (_dir, store) = seeded().await;
        let domains = store.list_domains(10).await.unwrap();

        assert_eq!(domains.len(), 3);
        assert_eq!(domains[0].count, 2);
        assert_eq!(domains[0].domain, "natural language processing");
        assert_eq!(domains[1].domain, "Computer Vision");
        assert_eq!(store.list_domains(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_execute_dispatches_on_kind() {
        let (_dir, store) = seeded().await;
        let query = SearchQuery::parse("domain: computer vision", 5).unwrap();
        let results = store.execute(&query).await.unwrap();
        assert_eq!(results[0].paper.paper_id, "resnet");
    }

    #[tokio::test]
    async fn test_append_field_semantics() {
        let (_dir, store) = temp_store().await;
        let mut record = paper("p1", "Policy Gradients", "RL", &["reward shaping helps"], 1);
        record.missing_fields = vec![Aspect::FutureDirections];
        store.add_paper(record).await.unwrap();

        let updated = store
            .append_field("p1", PaperField::FutureDirections, "scale to graph policies")
            .await
            .unwrap();
        assert_eq!(updated.future_directions, vec!["scale to graph policies"]);
        assert!(updated.missing_fields.is_empty());
        assert!(updated.updated_at > at(1));

        let again = store
            .append_field("p1", PaperField::FutureDirections, "scale to graph policies")
            .await
            .unwrap();
        assert_eq!(again.future_directions.len(), 1);

        let domain = store
            .append_field("p1", PaperField::Domain, "Reinforcement Learning")
            .await
            .unwrap();
        assert_eq!(domain.domain, "Reinforcement Learning");

        store
            .append_field("p1", PaperField::Takeaways, "graph attention policy")
            .await
            .unwrap();
        let hits = store.search_by_takeaway("graph", 1).await.unwrap();
        assert_eq!(hits[0].matched_takeaway.as_deref(), Some("graph attention policy"));

        assert!(matches!(
            store.append_field("p1", PaperField::Notes, "   ").await,
            Err(StoreError::InvalidInput(_))
        ));
        assert!(store
            .append_field("nope", PaperField::Notes, "x")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_appends_to_one_paper_are_serialized() {
        let (_dir, store) = temp_store().await;
        store.add_paper(paper("p1", "Graph", "X", &[], 1)).await.unwrap();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..6 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .append_field("p1", PaperField::Notes, &format!("note {}", i))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let record = store.get_paper("p1").await.unwrap();
        assert_eq!(record.notes.len(), 6);
    }

    #[tokio::test]
    async fn test_reopen_with_other_model_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("papers.db");

        let storage = SqliteStorage::open(&path, SqliteConfig::default()).unwrap();
        PaperStore::open(KeywordEmbedder::new(), storage, StoreConfig::default())
            .await
            .unwrap();

        let storage = SqliteStorage::open(&path, SqliteConfig::default()).unwrap();
        let mut other = KeywordEmbedder::new();
        other.model_name = "another-model".to_string();
        let result = PaperStore::open(other, storage, StoreConfig::default()).await;
        assert!(matches!(
            result,
            Err(StoreError::Storage(StorageError::ConfigMismatch { .. }))
        ));
    }
}
