//! Shared data types for the retrieval pipeline.
//!
//! Everything here is either an immutable unit of retrievable text
//! ([`Chunk`]), a per-query ephemeral ([`SearchResult`], [`Citation`]), or a
//! session-scoped record ([`ConversationTurn`]). None of these types own I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

// ── ChunkId ────────────────────────────────────────────────────────────

/// Stable identifier of a [`Chunk`].
///
/// Ordered and hashable so fused result lists can be deduplicated and
/// tie-broken deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the content-addressed id for a chunk.
    ///
    /// The id is a UUIDv5 over (origin, conversation, message, text), so
    /// re-ingesting unchanged source text always maps to the same chunk and
    /// never creates a duplicate.
    #[must_use]
    pub fn derive(
        origin: ChunkOrigin,
        conversation_id: &str,
        message_id: Option<&str>,
        text: &str,
    ) -> Self {
        let mut name = String::with_capacity(
            origin.as_str().len() + conversation_id.len() + text.len() + 3,
        );
        name.push_str(origin.as_str());
        name.push('\x1f');
        name.push_str(conversation_id);
        name.push('\x1f');
        name.push_str(message_id.unwrap_or(""));
        name.push('\x1f');
        name.push_str(text);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChunkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for ChunkId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// ── Chunk ──────────────────────────────────────────────────────────────

/// Granularity at which a chunk was carved out of its conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkOrigin {
    /// Conversation-level summary/topic text.
    Conversation,
    /// A single message (or a slice of a long one).
    Message,
    /// A fenced code block lifted out of a message.
    CodeBlock,
}

impl ChunkOrigin {
    /// Stable string form used in storage and id derivation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Conversation => "conversation",
            Self::Message => "message",
            Self::CodeBlock => "code_block",
        }
    }
}

impl std::fmt::Display for ChunkOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored the source text of a message-level chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Human,
    Assistant,
}

/// An immutable, independently retrievable fragment of conversation text.
///
/// Chunks are produced once by an external ingestion process and read-only
/// here. `token_count` is computed at ingestion time and trusted by the
/// context assembler; [`Chunk::validate`] re-checks the two invariants
/// (non-empty text, bounded size) when a chunk is hydrated from storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub origin: ChunkOrigin,
    pub conversation_id: String,
    pub message_id: Option<String>,
    /// `None` for conversation-level chunks.
    pub sender: Option<Sender>,
    pub created_at: DateTime<Utc>,
    pub text: String,
    pub token_count: usize,
    /// Free-form metadata: source platform, language tag for code, etc.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Chunk {
    /// Check the chunk invariants against the configured maximum size.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::InvalidChunk`] when the text is empty or the
    /// token count exceeds `max_tokens`.
    pub fn validate(&self, max_tokens: usize) -> Result<(), RetraceError> {
        if self.text.is_empty() {
            return Err(RetraceError::InvalidChunk {
                id: self.id.to_string(),
                reason: "empty text".into(),
            });
        }
        if self.token_count > max_tokens {
            return Err(RetraceError::InvalidChunk {
                id: self.id.to_string(),
                reason: format!("{} tokens exceeds maximum {max_tokens}", self.token_count),
            });
        }
        Ok(())
    }

    /// The source platform recorded in metadata, if any.
    #[must_use]
    pub fn source_platform(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

// ── SearchResult ───────────────────────────────────────────────────────

/// One per-query ranked entry, hydrated with display provenance.
///
/// Ephemeral: built during a query, handed to the context assembler and the
/// citation set, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub conversation_id: String,
    pub conversation_name: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Source platform the conversation was exported from.
    pub source: String,
    pub text: String,
    /// Relevance score: RRF score after fusion, model score after reranking.
    pub score: f64,
    /// 1-based rank in the keyword list, when present there.
    pub keyword_rank: Option<usize>,
    /// 1-based rank in the vector list, when present there.
    pub vector_rank: Option<usize>,
}

// ── Conversation turns & citations ─────────────────────────────────────

/// Role of a turn in the active RAG session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    /// Wire name used by chat-style generation APIs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A reference to the evidence behind an answer, surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: ChunkId,
    pub conversation_id: String,
    pub display_title: String,
    pub date: Option<DateTime<Utc>>,
    pub score: f64,
}

impl From<&SearchResult> for Citation {
    fn from(result: &SearchResult) -> Self {
        Self {
            chunk_id: result.chunk_id.clone(),
            conversation_id: result.conversation_id.clone(),
            display_title: result.conversation_name.clone(),
            date: result.created_at,
            score: result.score,
        }
    }
}

/// One exchange in the active RAG session.
///
/// Held only in conversation memory; never written to durable storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
}

impl ConversationTurn {
    /// A user question turn.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            citations: Vec::new(),
        }
    }

    /// An assistant answer turn with its citation set.
    #[must_use]
    pub fn assistant(text: impl Into<String>, citations: Vec<Citation>) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            citations,
        }
    }
}

// ── Error taxonomy ─────────────────────────────────────────────────────

/// Errors raised by the retrieval pipeline and its adapters.
///
/// "No evidence found" is deliberately absent: an empty fused list is a
/// valid state that yields an answer with no citations, not an error.
/// `RetrievalUnavailable` and `RerankUnavailable` are absorbed inside the
/// orchestrator (degraded evidence, fusion-order fallback); only generation
/// failures and invariant violations reach the caller.
#[derive(Debug, Error)]
pub enum RetraceError {
    /// An index lookup failed or timed out. Recoverable: the orchestrator
    /// proceeds with whichever list succeeded.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// The cross-encoder could not load or score. Recoverable: fall back to
    /// fusion order.
    #[error("reranker unavailable: {0}")]
    RerankUnavailable(String),

    /// The generation backend was unreachable, timed out, or returned a
    /// malformed response. Distinct from an empty answer.
    #[error("generation via '{backend}' failed: {reason}")]
    GenerationFailed { backend: String, reason: String },

    /// The assembled context exceeded its budget. Indicates a bug in the
    /// assembler; the request fails loudly rather than silently truncating.
    #[error("assembled context of {used} tokens exceeds budget of {budget}")]
    BudgetExceeded { used: usize, budget: usize },

    /// A hydrated chunk violated its invariants.
    #[error("invalid chunk {id}: {reason}")]
    InvalidChunk { id: String, reason: String },

    /// Storage adapter failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// The embedding service failed to vectorize the query.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// No generation backend is registered under the requested name.
    #[error("unknown generation backend '{0}'")]
    UnknownBackend(String),

    /// Pipeline construction or configuration problem.
    #[error("configuration error: {0}")]
    Config(String),
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(text: &str, tokens: usize) -> Chunk {
        Chunk {
            id: ChunkId::new("c1"),
            origin: ChunkOrigin::Message,
            conversation_id: "conv-1".into(),
            message_id: Some("msg-1".into()),
            sender: Some(Sender::Human),
            created_at: Utc::now(),
            text: text.into(),
            token_count: tokens,
            metadata: serde_json::json!({"source": "claude"}),
        }
    }

    #[test]
    fn derived_id_is_idempotent() {
        let a = ChunkId::derive(ChunkOrigin::Message, "conv", Some("msg"), "hello");
        let b = ChunkId::derive(ChunkOrigin::Message, "conv", Some("msg"), "hello");
        assert_eq!(a, b);
    }

    #[test]
    fn derived_id_changes_with_origin() {
        let a = ChunkId::derive(ChunkOrigin::Message, "conv", None, "hello");
        let b = ChunkId::derive(ChunkOrigin::Conversation, "conv", None, "hello");
        assert_ne!(a, b);
    }

    #[test]
    fn validate_rejects_empty_text() {
        let c = chunk("", 0);
        assert!(matches!(
            c.validate(512),
            Err(RetraceError::InvalidChunk { .. })
        ));
    }

    #[test]
    fn validate_rejects_oversized_chunk() {
        let c = chunk("some text", 1000);
        assert!(c.validate(512).is_err());
        assert!(c.validate(1000).is_ok());
    }

    #[test]
    fn source_platform_reads_metadata() {
        let c = chunk("text", 2);
        assert_eq!(c.source_platform(), Some("claude"));
    }

    #[test]
    fn citation_from_search_result() {
        let result = SearchResult {
            chunk_id: ChunkId::new("c9"),
            conversation_id: "conv-9".into(),
            conversation_name: "Budget planning".into(),
            created_at: None,
            source: "claude".into(),
            text: "t".into(),
            score: 0.5,
            keyword_rank: Some(1),
            vector_rank: None,
        };
        let citation = Citation::from(&result);
        assert_eq!(citation.chunk_id, ChunkId::new("c9"));
        assert_eq!(citation.display_title, "Budget planning");
    }
}
