//! SQLite-backed index adapters.
//!
//! One database file provides all three boundary traits: an FTS5 table for
//! [`KeywordIndex`], two sqlite-vec `vec0` virtual tables (one per
//! [`Granularity`]) for [`VectorIndex`], and the `chunks` table itself for
//! [`ChunkSource`]. Code-block chunks are stored in the message-granularity
//! collection.
//!
//! Writes exist only so the store can be populated by an ingestion process
//! or a test fixture; within a query the store is treated as read-only and
//! stale reads are tolerated.

use std::mem::transmute;
use std::os::raw::c_char;
use std::path::Path;
use std::sync::Once;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_rusqlite::{Connection, OptionalExtension, ffi};
use tracing::debug;

use super::{ChunkSource, Granularity, KeywordIndex, RankedHit, VectorIndex, VectorHit};
use crate::types::{Chunk, ChunkId, ChunkOrigin, RetraceError, Sender};

/// SQLite store implementing all three retrieval-boundary traits.
#[derive(Clone)]
pub struct SqliteIndex {
    conn: Connection,
}

impl SqliteIndex {
    /// Open (or create) the database at `path` and ensure the schema.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Storage`] when the file cannot be opened or
    /// the sqlite-vec extension is unavailable.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, RetraceError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open(path)
            .await
            .map_err(|err| RetraceError::Storage(err.to_string()))?;
        let index = Self { conn };
        index.ensure_vec_loaded().await?;
        index.init_schema().await?;
        Ok(index)
    }

    /// Open an in-memory database. Used by tests and demos.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Storage`] on initialization failure.
    pub async fn open_in_memory() -> Result<Self, RetraceError> {
        Self::register_sqlite_vec()?;
        let conn = Connection::open_in_memory()
            .await
            .map_err(|err| RetraceError::Storage(err.to_string()))?;
        let index = Self { conn };
        index.ensure_vec_loaded().await?;
        index.init_schema().await?;
        Ok(index)
    }

    async fn ensure_vec_loaded(&self) -> Result<(), RetraceError> {
        self.conn
            .call(|conn| {
                let result =
                    conn.query_row("select vec_version()", [], |row| row.get::<_, String>(0));
                match result {
                    Ok(version) => {
                        debug!(version, "sqlite-vec loaded");
                        Ok(())
                    }
                    Err(err) => Err(tokio_rusqlite::Error::Rusqlite(err)),
                }
            })
            .await
            .map_err(|err| RetraceError::Storage(err.to_string()))
    }

    async fn init_schema(&self) -> Result<(), RetraceError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS chunks (
                        id TEXT PRIMARY KEY,
                        origin TEXT NOT NULL,
                        conversation_id TEXT NOT NULL,
                        message_id TEXT,
                        sender TEXT,
                        created_at TEXT NOT NULL,
                        text TEXT NOT NULL,
                        token_count INTEGER NOT NULL,
                        metadata TEXT NOT NULL DEFAULT '{}'
                    );
                    CREATE INDEX IF NOT EXISTS idx_chunks_conversation
                        ON chunks(conversation_id);
                    CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts
                        USING fts5(text);",
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| RetraceError::Storage(err.to_string()))
    }

    /// Insert a chunk, idempotently: a chunk whose id already exists is left
    /// untouched and no duplicate FTS row is created.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Storage`] on write failure.
    pub async fn add_chunk(&self, chunk: &Chunk) -> Result<(), RetraceError> {
        let chunk = chunk.clone();
        self.conn
            .call(move |conn| {
                let inserted = conn
                    .execute(
                        "INSERT OR IGNORE INTO chunks
                         (id, origin, conversation_id, message_id, sender,
                          created_at, text, token_count, metadata)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                        (
                            chunk.id.as_str(),
                            chunk.origin.as_str(),
                            chunk.conversation_id.as_str(),
                            chunk.message_id.as_deref(),
                            chunk.sender.map(sender_to_str),
                            chunk.created_at.to_rfc3339(),
                            chunk.text.as_str(),
                            chunk.token_count as i64,
                            chunk.metadata.to_string(),
                        ),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                if inserted == 1 {
                    let rowid = conn.last_insert_rowid();
                    conn.execute(
                        "INSERT INTO chunks_fts (rowid, text) VALUES (?1, ?2)",
                        (rowid, chunk.text.as_str()),
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                }
                Ok(())
            })
            .await
            .map_err(|err| RetraceError::Storage(err.to_string()))
    }

    /// Store the embedding for a chunk in the collection for `granularity`.
    ///
    /// The `vec0` table is created on first insert, sized to the embedding's
    /// dimension.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Storage`] on write failure or a dimension
    /// mismatch with the existing collection.
    pub async fn add_embedding(
        &self,
        chunk_id: &ChunkId,
        granularity: Granularity,
        embedding: &[f32],
    ) -> Result<(), RetraceError> {
        if embedding.is_empty() {
            return Err(RetraceError::Storage("empty embedding".into()));
        }
        let chunk_id = chunk_id.clone();
        let table = vec_table(granularity);
        let dimension = embedding.len();
        let vector_json = serde_json::to_string(embedding)
            .map_err(|err| RetraceError::Storage(err.to_string()))?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    &format!(
                        "CREATE VIRTUAL TABLE IF NOT EXISTS {table}
                         USING vec0(embedding float[{dimension}])"
                    ),
                    [],
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let rowid: Option<i64> = conn
                    .query_row(
                        "SELECT rowid FROM chunks WHERE id = ?1",
                        [chunk_id.as_str()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let Some(rowid) = rowid else {
                    return Err(tokio_rusqlite::Error::Other(
                        format!("no chunk with id {} to embed", chunk_id).into(),
                    ));
                };

                conn.execute(
                    &format!("INSERT OR REPLACE INTO {table} (rowid, embedding) VALUES (?1, ?2)"),
                    (rowid, vector_json.as_str()),
                )
                .map_err(tokio_rusqlite::Error::Rusqlite)?;
                Ok(())
            })
            .await
            .map_err(|err| RetraceError::Storage(err.to_string()))
    }

    /// Number of stored chunks.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Storage`] on query failure.
    pub async fn count(&self) -> Result<usize, RetraceError> {
        self.conn
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM chunks", [], |row| {
                    row.get::<_, i64>(0)
                })
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map(|n| n as usize)
            .map_err(|err| RetraceError::Storage(err.to_string()))
    }

    fn register_sqlite_vec() -> Result<(), RetraceError> {
        use std::sync::Mutex;

        static INIT: Once = Once::new();
        static INIT_RESULT: Mutex<Option<Result<(), String>>> = Mutex::new(None);

        INIT.call_once(|| {
            let result = unsafe {
                type SqliteExtensionInit = unsafe extern "C" fn(
                    *mut ffi::sqlite3,
                    *mut *const c_char,
                    *const ffi::sqlite3_api_routines,
                ) -> i32;

                let init: unsafe extern "C" fn() = sqlite_vec::sqlite3_vec_init;
                let init_fn: SqliteExtensionInit =
                    transmute::<unsafe extern "C" fn(), SqliteExtensionInit>(init);
                let rc = ffi::sqlite3_auto_extension(Some(init_fn));
                if rc != 0 {
                    Err(format!("failed to register sqlite-vec extension (code {rc})"))
                } else {
                    Ok(())
                }
            };
            *INIT_RESULT.lock().expect("init result mutex poisoned") = Some(result);
        });

        INIT_RESULT
            .lock()
            .expect("init result mutex poisoned")
            .clone()
            .expect("init was called but result not set")
            .map_err(RetraceError::Storage)
    }
}

fn vec_table(granularity: Granularity) -> &'static str {
    match granularity {
        Granularity::Conversation => "vec_conversation",
        Granularity::Message => "vec_message",
    }
}

fn sender_to_str(sender: Sender) -> &'static str {
    match sender {
        Sender::Human => "human",
        Sender::Assistant => "assistant",
    }
}

fn parse_sender(raw: Option<String>) -> Option<Sender> {
    match raw.as_deref() {
        Some("human") => Some(Sender::Human),
        Some("assistant") => Some(Sender::Assistant),
        _ => None,
    }
}

fn parse_origin(raw: &str) -> ChunkOrigin {
    match raw {
        "conversation" => ChunkOrigin::Conversation,
        "code_block" => ChunkOrigin::CodeBlock,
        _ => ChunkOrigin::Message,
    }
}

/// Build an FTS5 MATCH expression scoped to the text column: each
/// whitespace-separated word becomes a quoted `text:` term, OR-joined.
fn fts_query(query: &str) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|word| word.replace('"', ""))
        .filter(|word| !word.is_empty())
        .map(|word| format!("text:\"{word}\""))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

#[async_trait]
impl KeywordIndex for SqliteIndex {
    async fn search_keyword(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RankedHit>, RetraceError> {
        let Some(match_expr) = fts_query(query) else {
            return Ok(Vec::new());
        };
        self.conn
            .call(move |conn| {
                let mut stmt = conn
                    .prepare(
                        "SELECT c.id
                         FROM chunks_fts f
                         JOIN chunks c ON c.rowid = f.rowid
                         WHERE chunks_fts MATCH ?1
                         ORDER BY rank
                         LIMIT ?2",
                    )
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map((match_expr.as_str(), limit as i64), |row| {
                        row.get::<_, String>(0)
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let mut hits = Vec::new();
                for (position, row) in rows.enumerate() {
                    let id = row.map_err(tokio_rusqlite::Error::Rusqlite)?;
                    hits.push(RankedHit::new(id, position + 1));
                }
                Ok(hits)
            })
            .await
            .map_err(|err| RetraceError::RetrievalUnavailable(err.to_string()))
    }
}

#[async_trait]
impl VectorIndex for SqliteIndex {
    async fn search_vector(
        &self,
        embedding: &[f32],
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<VectorHit>, RetraceError> {
        let table = vec_table(granularity);
        let vector_json = serde_json::to_string(embedding)
            .map_err(|err| RetraceError::RetrievalUnavailable(err.to_string()))?;
        self.conn
            .call(move |conn| {
                // The collection may not exist yet when nothing of this
                // granularity has been embedded.
                let exists: Option<String> = conn
                    .query_row(
                        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                        [table],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                if exists.is_none() {
                    return Ok(Vec::new());
                }

                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT c.id, v.distance
                         FROM (SELECT rowid, distance FROM {table}
                               WHERE embedding MATCH ?1 AND k = ?2
                               ORDER BY distance) v
                         JOIN chunks c ON c.rowid = v.rowid
                         ORDER BY v.distance"
                    ))
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;
                let rows = stmt
                    .query_map((vector_json.as_str(), limit as i64), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                    })
                    .map_err(tokio_rusqlite::Error::Rusqlite)?;

                let mut hits = Vec::new();
                for (position, row) in rows.enumerate() {
                    let (id, distance) = row.map_err(tokio_rusqlite::Error::Rusqlite)?;
                    hits.push(VectorHit::new(id, position + 1, distance as f32));
                }
                Ok(hits)
            })
            .await
            .map_err(|err| RetraceError::RetrievalUnavailable(err.to_string()))
    }
}

#[async_trait]
impl ChunkSource for SqliteIndex {
    async fn chunk(&self, id: &ChunkId) -> Result<Option<Chunk>, RetraceError> {
        let id = id.clone();
        self.conn
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, origin, conversation_id, message_id, sender,
                            created_at, text, token_count, metadata
                     FROM chunks WHERE id = ?1",
                    [id.as_str()],
                    |row| {
                        let created_raw: String = row.get(5)?;
                        let created_at = DateTime::parse_from_rfc3339(&created_raw)
                            .map(|dt| dt.with_timezone(&Utc))
                            .unwrap_or_default();
                        let metadata_raw: String = row.get(8)?;
                        Ok(Chunk {
                            id: ChunkId::new(row.get::<_, String>(0)?),
                            origin: parse_origin(&row.get::<_, String>(1)?),
                            conversation_id: row.get(2)?,
                            message_id: row.get(3)?,
                            sender: parse_sender(row.get(4)?),
                            created_at,
                            text: row.get(6)?,
                            token_count: row.get::<_, i64>(7)? as usize,
                            metadata: serde_json::from_str(&metadata_raw)
                                .unwrap_or(serde_json::Value::Null),
                        })
                    },
                )
                .optional()
                .map_err(tokio_rusqlite::Error::Rusqlite)
            })
            .await
            .map_err(|err| RetraceError::Storage(err.to_string()))
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
