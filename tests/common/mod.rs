//! Shared fixtures for integration tests: static index doubles, an
//! in-memory chunk store, and a programmable generation backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use retrace::embeddings::EmbeddingProvider;
use retrace::index::{
    ChunkSource, Granularity, KeywordIndex, RankedHit, VectorHit, VectorIndex,
};
use retrace::llm::{GenerationBackend, GenerationRequest};
use retrace::types::{Chunk, ChunkId, ChunkOrigin, RetraceError, Sender};

/// A message-level chunk with display provenance in its metadata.
pub fn chunk(id: &str, conversation: &str, name: &str, text: &str) -> Chunk {
    Chunk {
        id: ChunkId::new(id),
        origin: ChunkOrigin::Message,
        conversation_id: conversation.into(),
        message_id: Some(format!("{id}-msg")),
        sender: Some(Sender::Human),
        created_at: Utc.with_ymd_and_hms(2025, 3, 10, 9, 30, 0).unwrap(),
        text: text.into(),
        token_count: text.len().div_ceil(4),
        metadata: serde_json::json!({
            "source": "claude",
            "conversation_name": name,
        }),
    }
}

// ── Index doubles ──────────────────────────────────────────────────────

pub struct StaticKeywordIndex(pub Vec<RankedHit>);

#[async_trait]
impl KeywordIndex for StaticKeywordIndex {
    async fn search_keyword(
        &self,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<RankedHit>, RetraceError> {
        Ok(self.0.iter().take(limit).cloned().collect())
    }
}

pub struct FailingKeywordIndex;

#[async_trait]
impl KeywordIndex for FailingKeywordIndex {
    async fn search_keyword(
        &self,
        _query: &str,
        _limit: usize,
    ) -> Result<Vec<RankedHit>, RetraceError> {
        Err(RetraceError::RetrievalUnavailable("keyword index down".into()))
    }
}

#[derive(Default)]
pub struct StaticVectorIndex {
    pub conversation: Vec<VectorHit>,
    pub message: Vec<VectorHit>,
}

#[async_trait]
impl VectorIndex for StaticVectorIndex {
    async fn search_vector(
        &self,
        _embedding: &[f32],
        granularity: Granularity,
        limit: usize,
    ) -> Result<Vec<VectorHit>, RetraceError> {
        let hits = match granularity {
            Granularity::Conversation => &self.conversation,
            Granularity::Message => &self.message,
        };
        Ok(hits.iter().take(limit).cloned().collect())
    }
}

pub struct FailingVectorIndex;

#[async_trait]
impl VectorIndex for FailingVectorIndex {
    async fn search_vector(
        &self,
        _embedding: &[f32],
        _granularity: Granularity,
        _limit: usize,
    ) -> Result<Vec<VectorHit>, RetraceError> {
        Err(RetraceError::RetrievalUnavailable("vector index down".into()))
    }
}

// ── Chunk store double ─────────────────────────────────────────────────

pub struct InMemoryChunks(pub HashMap<ChunkId, Chunk>);

impl InMemoryChunks {
    pub fn of(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self(
            chunks
                .into_iter()
                .map(|chunk| (chunk.id.clone(), chunk))
                .collect(),
        )
    }
}

#[async_trait]
impl ChunkSource for InMemoryChunks {
    async fn chunk(&self, id: &ChunkId) -> Result<Option<Chunk>, RetraceError> {
        Ok(self.0.get(id).cloned())
    }
}

// ── Embedding double ───────────────────────────────────────────────────

pub struct StaticEmbedder;

#[async_trait]
impl EmbeddingProvider for StaticEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, RetraceError> {
        Ok(vec![0.25, 0.5, 0.25])
    }
}

// ── Generation backend double ──────────────────────────────────────────

enum Mode {
    Reply(String),
    Fail(String),
}

/// Programmable backend that records every request it sees.
pub struct MockBackend {
    mode: Mutex<Mode>,
    requests: Mutex<Vec<GenerationRequest>>,
    delay: Option<Duration>,
}

impl MockBackend {
    pub fn replying(text: &str) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(Mode::Reply(text.into())),
            requests: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    pub fn failing(reason: &str) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(Mode::Fail(reason.into())),
            requests: Mutex::new(Vec::new()),
            delay: None,
        })
    }

    pub fn replying_after(text: &str, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(Mode::Reply(text.into())),
            requests: Mutex::new(Vec::new()),
            delay: Some(delay),
        })
    }

    pub fn set_reply(&self, text: &str) {
        *self.mode.lock() = Mode::Reply(text.into());
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> GenerationRequest {
        self.requests
            .lock()
            .last()
            .expect("backend was never called")
            .clone()
    }
}

#[async_trait]
impl GenerationBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    fn context_window(&self) -> usize {
        8192
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, RetraceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.requests.lock().push(request.clone());
        match &*self.mode.lock() {
            Mode::Reply(text) => Ok(text.clone()),
            Mode::Fail(reason) => Err(RetraceError::GenerationFailed {
                backend: "mock".into(),
                reason: reason.clone(),
            }),
        }
    }
}
