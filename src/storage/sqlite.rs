//! SQLite storage implementation.
//!
//! This module provides a SQLite-based implementation of the `PaperStorage`
//! trait on top of an `r2d2` connection pool. Every connection runs in WAL
//! mode, so readers never block on (or observe half of) a write.
//!
//! # Schema
//! - `config`: key/value pairs, holding the embedding configuration as JSON
//! - `papers`: one row per record; list fields as JSON arrays, the embedding
//!   as a little-endian f32 BLOB
//! - `takeaways`: one row per (`paper_id`, `takeaway_index`) with the takeaway
//!   text and its own embedding

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{PaperStorage, StorageError, StorageResult, TakeawayEntry};
use crate::models::{EmbeddingConfig, PaperRecord};

/// Alias for the connection pool type.
pub type ConnectionPool = Pool<SqliteConnectionManager>;

const EMBEDDING_CONFIG_KEY: &str = "embedding_config";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS papers (
    paper_id          TEXT PRIMARY KEY,
    title             TEXT NOT NULL,
    filepath          TEXT NOT NULL,
    summary           TEXT NOT NULL,
    takeaways         TEXT NOT NULL,
    architecture      TEXT,
    math_formulations TEXT NOT NULL,
    domain            TEXT NOT NULL,
    future_directions TEXT NOT NULL,
    notes             TEXT NOT NULL,
    missing_fields    TEXT NOT NULL,
    embedding         BLOB,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS takeaways (
    paper_id       TEXT NOT NULL REFERENCES papers(paper_id) ON DELETE CASCADE,
    takeaway_index INTEGER NOT NULL,
    text           TEXT NOT NULL,
    embedding      BLOB NOT NULL,
    PRIMARY KEY (paper_id, takeaway_index)
);
CREATE INDEX IF NOT EXISTS idx_papers_domain ON papers(domain COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_papers_updated ON papers(updated_at);
";

const PAPER_COLUMNS: &str = "paper_id, title, filepath, summary, takeaways, architecture, \
     math_formulations, domain, future_directions, notes, missing_fields, embedding, \
     created_at, updated_at";

/// Connection pool settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Maximum pool size (default: 8)
    pub pool_size: u32,

    /// SQLite busy timeout per statement in milliseconds (default: 5000)
    pub busy_timeout_ms: u32,

    /// Extra attempts after a BUSY/LOCKED failure before giving up (default: 8)
    pub busy_max_retries: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 5_000,
            busy_max_retries: 8,
        }
    }
}

/// Pragmas applied to every pooled connection.
#[derive(Debug)]
struct PragmaCustomizer {
    busy_timeout_ms: u32,
}

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for PragmaCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;\
             PRAGMA busy_timeout = {};\
             PRAGMA foreign_keys = ON;\
             PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
    }
}

fn build_pool(
    manager: SqliteConnectionManager,
    max_size: u32,
    config: &SqliteConfig,
) -> StorageResult<ConnectionPool> {
    Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(5))
        .connection_customizer(Box::new(PragmaCustomizer {
            busy_timeout_ms: config.busy_timeout_ms,
        }))
        .build(manager)
        .map_err(|e| StorageError::ConnectionError(e.to_string()))
}

/// SQLite-based paper storage.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: ConnectionPool,
    config: SqliteConfig,
}

impl SqliteStorage {
    /// Open (or create) a database file.
    ///
    /// The parent directory is created when missing. Call
    /// [`PaperStorage::initialize`] before use.
    ///
    /// # Errors
    /// Returns `StorageError::ConnectionError` if the pool cannot be built
    pub fn open(path: impl AsRef<Path>, config: SqliteConfig) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::ConnectionError(format!(
                    "cannot create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let pool = build_pool(
            SqliteConnectionManager::file(path),
            config.pool_size,
            &config,
        )?;
        Ok(Self { pool, config })
    }

    /// Create an in-memory database.
    ///
    /// Every in-memory connection is its own database, so the pool is capped
    /// at a single connection.
    pub fn in_memory(config: SqliteConfig) -> StorageResult<Self> {
        let pool = build_pool(SqliteConnectionManager::memory(), 1, &config)?;
        Ok(Self { pool, config })
    }

    /// Run `f` with a pooled connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StorageError::ConnectionError(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Other(format!("storage task failed: {}", e)))?
    }

    async fn load_takeaways(&self, paper_id: Option<String>) -> StorageResult<Vec<TakeawayEntry>> {
        let raw: Vec<(String, i64, String, Vec<u8>)> = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT paper_id, takeaway_index, text, embedding FROM takeaways
                         WHERE ?1 IS NULL OR paper_id = ?1
                         ORDER BY paper_id, takeaway_index",
                    )
                    .map_err(query_error)?;
                let rows = stmt
                    .query_map(params![paper_id], |row| {
                        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
                    })
                    .map_err(query_error)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(query_error)
            })
            .await?;

        raw.into_iter()
            .map(|(paper_id, index, text, blob)| {
                Ok(TakeawayEntry {
                    paper_id,
                    takeaway_index: usize::try_from(index).unwrap_or_default(),
                    text,
                    embedding: deserialize_embedding(&blob)?,
                })
            })
            .collect()
    }
}

/// Serialize an embedding vector to little-endian f32 bytes.
pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Deserialize an embedding vector from BLOB bytes.
///
/// # Errors
/// Returns `StorageError::SerializationError` if the byte length is not a
/// multiple of four
pub fn deserialize_embedding(bytes: &[u8]) -> StorageResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StorageError::SerializationError(format!(
            "embedding blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// Retry `f` on BUSY/LOCKED with linear backoff and ±25% jitter.
///
/// Runs on a blocking thread, so the sleep is a thread sleep.
fn retry_on_busy<T>(
    max_retries: u32,
    mut f: impl FnMut() -> rusqlite::Result<T>,
) -> rusqlite::Result<T> {
    let mut attempts = 0u32;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if is_busy(&err) && attempts < max_retries => {
                attempts += 1;
                let base_ms = u64::from(attempts).saturating_mul(10).min(500);
                let jitter_range = base_ms / 4;
                let jitter = if jitter_range > 0 {
                    rand::random::<u64>() % (jitter_range * 2 + 1)
                } else {
                    0
                };
                let backoff_ms = base_ms.saturating_sub(jitter_range) + jitter;
                debug!(attempts, backoff_ms, "database busy, retrying write");
                std::thread::sleep(Duration::from_millis(backoff_ms));
            }
            Err(err) => return Err(err),
        }
    }
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn timestamp_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn paper_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PaperRecord> {
    let embedding: Option<Vec<u8>> = row.get(11)?;
    let embedding = embedding
        .map(|bytes| deserialize_embedding(&bytes))
        .transpose()
        .map_err(|e| conversion_error(11, e))?;

    Ok(PaperRecord {
        paper_id: row.get(0)?,
        title: row.get(1)?,
        filepath: row.get(2)?,
        summary: row.get(3)?,
        takeaways: json_column(row, 4)?,
        architecture: row.get(5)?,
        math_formulations: json_column(row, 6)?,
        domain: row.get(7)?,
        future_directions: json_column(row, 8)?,
        notes: json_column(row, 9)?,
        missing_fields: json_column(row, 10)?,
        embedding,
        created_at: timestamp_column(row, 12)?,
        updated_at: timestamp_column(row, 13)?,
    })
}

/// List columns of a record, encoded once before the write loop.
struct EncodedLists {
    takeaways: String,
    math_formulations: String,
    future_directions: String,
    notes: String,
    missing_fields: String,
}

impl EncodedLists {
    fn encode(record: &PaperRecord) -> StorageResult<Self> {
        Ok(Self {
            takeaways: encode_json(&record.takeaways)?,
            math_formulations: encode_json(&record.math_formulations)?,
            future_directions: encode_json(&record.future_directions)?,
            notes: encode_json(&record.notes)?,
            missing_fields: encode_json(&record.missing_fields)?,
        })
    }
}

fn encode_json<T: Serialize>(value: &T) -> StorageResult<String> {
    serde_json::to_string(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn write_paper(
    conn: &mut Connection,
    record: &PaperRecord,
    lists: &EncodedLists,
    takeaway_embeddings: &[Vec<f32>],
) -> rusqlite::Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    tx.execute(
        "INSERT INTO papers (paper_id, title, filepath, summary, takeaways, architecture,
             math_formulations, domain, future_directions, notes, missing_fields, embedding,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(paper_id) DO UPDATE SET
             title = excluded.title,
             filepath = excluded.filepath,
             summary = excluded.summary,
             takeaways = excluded.takeaways,
             architecture = excluded.architecture,
             math_formulations = excluded.math_formulations,
             domain = excluded.domain,
             future_directions = excluded.future_directions,
             notes = excluded.notes,
             missing_fields = excluded.missing_fields,
             embedding = excluded.embedding,
             created_at = excluded.created_at,
             updated_at = excluded.updated_at",
        params![
            record.paper_id,
            record.title,
            record.filepath,
            record.summary,
            lists.takeaways,
            record.architecture,
            lists.math_formulations,
            record.domain,
            lists.future_directions,
            lists.notes,
            lists.missing_fields,
            record.embedding.as_deref().map(serialize_embedding),
            record.created_at.to_rfc3339(),
            record.updated_at.to_rfc3339(),
        ],
    )?;

    tx.execute(
        "DELETE FROM takeaways WHERE paper_id = ?1",
        params![record.paper_id],
    )?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO takeaways (paper_id, takeaway_index, text, embedding)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for (index, (text, embedding)) in record
            .takeaways
            .iter()
            .zip(takeaway_embeddings)
            .enumerate()
        {
            stmt.execute(params![
                record.paper_id,
                index as i64,
                text,
                serialize_embedding(embedding)
            ])?;
        }
    }

    tx.commit()
}

fn query_error(err: rusqlite::Error) -> StorageError {
    StorageError::QueryError(err.to_string())
}

#[async_trait]
impl PaperStorage for SqliteStorage {
    async fn initialize(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(SCHEMA)
                .map_err(|e| StorageError::SchemaError(e.to_string()))
        })
        .await?;
        debug!("sqlite schema ready");
        Ok(())
    }

    async fn store_config(&self, config: &EmbeddingConfig) -> StorageResult<()> {
        let value = serde_json::to_string(config)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let max_retries = self.config.busy_max_retries;
        self.with_conn(move |conn| {
            retry_on_busy(max_retries, || {
                conn.execute(
                    "INSERT INTO config (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![EMBEDDING_CONFIG_KEY, value],
                )
            })
            .map(|_| ())
            .map_err(query_error)
        })
        .await
    }

    async fn get_config(&self) -> StorageResult<Option<EmbeddingConfig>> {
        let raw: Option<String> = self
            .with_conn(|conn| {
                conn.query_row(
                    "SELECT value FROM config WHERE key = ?1",
                    params![EMBEDDING_CONFIG_KEY],
                    |row| row.get(0),
                )
                .optional()
                .map_err(query_error)
            })
            .await?;

        raw.map(|value| {
            serde_json::from_str(&value)
                .map_err(|e| StorageError::SerializationError(e.to_string()))
        })
        .transpose()
    }

    async fn upsert_paper(
        &self,
        record: &PaperRecord,
        takeaway_embeddings: &[Vec<f32>],
    ) -> StorageResult<()> {
        if takeaway_embeddings.len() != record.takeaways.len() {
            return Err(StorageError::SerializationError(format!(
                "{} takeaway embeddings for {} takeaways",
                takeaway_embeddings.len(),
                record.takeaways.len()
            )));
        }

        let lists = EncodedLists::encode(record)?;
        let record = record.clone();
        let embeddings = takeaway_embeddings.to_vec();
        let max_retries = self.config.busy_max_retries;

        self.with_conn(move |conn| {
            retry_on_busy(max_retries, || {
                write_paper(conn, &record, &lists, &embeddings)
            })
            .map_err(|e| {
                if is_busy(&e) {
                    warn!(paper_id = %record.paper_id, "write gave up after busy retries");
                    StorageError::WriteConflict {
                        paper_id: record.paper_id.clone(),
                        message: e.to_string(),
                    }
                } else {
                    query_error(e)
                }
            })
        })
        .await
    }

    async fn get_paper(&self, paper_id: &str) -> StorageResult<PaperRecord> {
        let id = paper_id.to_string();
        let found = self
            .with_conn(move |conn| {
                conn.query_row(
                    &format!("SELECT {} FROM papers WHERE paper_id = ?1", PAPER_COLUMNS),
                    params![id],
                    paper_from_row,
                )
                .optional()
                .map_err(query_error)
            })
            .await?;
        found.ok_or_else(|| StorageError::NotFound(paper_id.to_string()))
    }

    async fn get_all_papers(&self) -> StorageResult<Vec<PaperRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM papers ORDER BY paper_id",
                    PAPER_COLUMNS
                ))
                .map_err(query_error)?;
            let rows = stmt.query_map([], paper_from_row).map_err(query_error)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(query_error)
        })
        .await
    }

    async fn get_all_takeaways(&self) -> StorageResult<Vec<TakeawayEntry>> {
        self.load_takeaways(None).await
    }

    async fn get_takeaways(&self, paper_id: &str) -> StorageResult<Vec<TakeawayEntry>> {
        self.load_takeaways(Some(paper_id.to_string())).await
    }

    async fn exists(&self, paper_id: &str) -> StorageResult<bool> {
        let id = paper_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM papers WHERE paper_id = ?1)",
                params![id],
                |row| row.get::<_, bool>(0),
            )
            .map_err(query_error)
        })
        .await
    }

    async fn count_papers(&self) -> StorageResult<usize> {
        let count: i64 = self
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM papers", [], |row| row.get(0))
                    .map_err(query_error)
            })
            .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
