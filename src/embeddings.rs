//! Query embedding.
//!
//! The pipeline embeds exactly one thing: the raw query text, to drive the
//! vector lookup. Chunk embeddings are computed by the external ingestion
//! process against the same model, so the provider here only has to agree
//! with it on dimensionality.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::types::RetraceError;

/// Turns text into a vector.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Embedding`] when the model is unreachable or
    /// produces no vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetraceError>;
}

// ── Ollama ─────────────────────────────────────────────────────────────

/// Embeddings via a local Ollama instance's `/api/embeddings` endpoint.
pub struct OllamaEmbeddings {
    http: reqwest::Client,
    host: String,
    model: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl OllamaEmbeddings {
    /// Create a provider against `host` (e.g. `http://localhost:11434`).
    #[must_use]
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddings {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetraceError> {
        let url = format!("{}/api/embeddings", self.host);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "model": self.model, "prompt": text }))
            .send()
            .await
            .map_err(|err| RetraceError::Embedding(err.to_string()))?
            .error_for_status()
            .map_err(|err| RetraceError::Embedding(err.to_string()))?;

        let body: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| RetraceError::Embedding(err.to_string()))?;
        if body.embedding.is_empty() {
            return Err(RetraceError::Embedding(format!(
                "model '{}' returned an empty embedding",
                self.model
            )));
        }
        debug!(dimension = body.embedding.len(), "embedded query");
        Ok(body.embedding)
    }
}

// ── Mock ───────────────────────────────────────────────────────────────

/// Deterministic hash-based embeddings for tests and offline runs.
///
/// The same text always maps to the same vector; different texts almost
/// always differ. No semantic meaning whatsoever.
pub struct MockEmbeddingProvider {
    dimension: usize,
}

impl MockEmbeddingProvider {
    #[must_use]
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, RetraceError> {
        use std::hash::{Hash, Hasher};

        let mut state = rustc_hash::FxHasher::default();
        text.hash(&mut state);
        let mut seed = state.finish();

        let mut vector = Vec::with_capacity(self.dimension);
        for _ in 0..self.dimension {
            // Simple xorshift walk from the text hash.
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            vector.push(((seed % 2000) as f32 / 1000.0) - 1.0);
        }
        Ok(vector)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_is_deterministic() {
        let provider = MockEmbeddingProvider::new(8);
        let a = provider.embed("hello").await.unwrap();
        let b = provider.embed("hello").await.unwrap();
        let c = provider.embed("other").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert_ne!(a, c);
    }
}
