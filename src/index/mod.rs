//! The retrieval boundary: keyword search, vector search, chunk hydration.
//!
//! These traits are the narrow seam between the pipeline core and the
//! external persistence engines. Each lookup returns a ranked list of chunk
//! ids; hydration of full [`Chunk`]s happens separately so fusion operates
//! on ids alone.
//!
//! ```text
//!   query ──► KeywordIndex::search_keyword ──► [RankedHit]
//!   embed ──► VectorIndex::search_vector   ──► [VectorHit]
//!                       fused ids ──► ChunkSource::chunk (provenance)
//! ```
//!
//! The bundled SQLite adapters live in [`sqlite`] behind the `sqlite`
//! feature; any engine that can produce ranked id lists can slot in.

#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Chunk, ChunkId, RetraceError};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteIndex;

// ── Hit types ──────────────────────────────────────────────────────────

/// Logical vector collection to search, by chunk granularity.
///
/// Which physical store backs each granularity is an adapter detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Conversation,
    Message,
}

/// One entry of a keyword-ranked list. `rank` is 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedHit {
    pub chunk_id: ChunkId,
    pub rank: usize,
}

impl RankedHit {
    #[must_use]
    pub fn new(chunk_id: impl Into<ChunkId>, rank: usize) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            rank,
        }
    }
}

/// One entry of a vector-ranked list. `rank` is 1-based; `distance` is the
/// raw metric from the store (lower is more similar).
#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: ChunkId,
    pub rank: usize,
    pub distance: f32,
}

impl VectorHit {
    #[must_use]
    pub fn new(chunk_id: impl Into<ChunkId>, rank: usize, distance: f32) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            rank,
            distance,
        }
    }
}

// ── Traits ─────────────────────────────────────────────────────────────

/// Lexical full-text search over chunk text.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Rank chunks matching `query`, best first, at most `limit` entries.
    ///
    /// An empty or unmatchable query yields an empty list, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::RetrievalUnavailable`] when the engine is
    /// unreachable; the orchestrator degrades to the other leg.
    async fn search_keyword(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<RankedHit>, RetraceError>;
}

/// Nearest-neighbour search over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Rank the `limit` chunks nearest to `embedding` within `granularity`.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::RetrievalUnavailable`] when the engine is
    /// unreachable; the orchestrator degrades to the other leg.
    async fn search_vector(
        &self,
        embedding: &[f32],
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<VectorHit>, RetraceError>;
}

/// Read-only access to stored chunks, for provenance hydration.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch a chunk by id. `Ok(None)` when the id is unknown (e.g. the
    /// index is momentarily ahead of or behind the chunk store).
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Storage`] on an engine failure.
    async fn chunk(&self, id: &ChunkId) -> Result<Option<Chunk>, RetraceError>;
}
