//! Cross-encoder reranking of the fused candidate list.
//!
//! A cross-encoder scores (query, passage) pairs jointly, which is more
//! precise than the first-stage retrieval but far too slow to run over the
//! whole corpus — so it only sees the fused list's head. The model is
//! loaded lazily on first use and every failure degrades to fusion order:
//! reranking can make results better, never make a query fail.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::types::{RetraceError, SearchResult};

/// Scores (query, passage) pairs. Implementations are pure: scores depend
/// only on the inputs, with no memory across calls.
#[async_trait]
pub trait CrossEncoder: Send + Sync {
    /// Relevance score for each passage against `query`, in input order.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::RerankUnavailable`] when the model cannot
    /// score; the caller falls back to the incoming order.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RetraceError>;
}

type EncoderLoader =
    Box<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn CrossEncoder>, RetraceError>> + Send + Sync>;

/// Outcome of a rerank call.
///
/// `degraded` carries the non-fatal warning the orchestrator surfaces when
/// the model could not be used and the results are simply the fused head.
#[derive(Debug)]
pub struct RerankOutcome {
    pub results: Vec<SearchResult>,
    pub degraded: Option<String>,
}

/// Lazily-loaded cross-encoder reranker.
///
/// The loader runs at most once, on the first [`rerank`](Self::rerank)
/// call; until then the process pays no model-loading cost.
pub struct Reranker {
    loader: EncoderLoader,
    encoder: OnceCell<Arc<dyn CrossEncoder>>,
}

impl Reranker {
    /// Create a reranker from an async loader for its scoring model.
    pub fn new<F, Fut>(loader: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn CrossEncoder>, RetraceError>> + Send + 'static,
    {
        Self {
            loader: Box::new(move || Box::pin(loader())),
            encoder: OnceCell::new(),
        }
    }

    /// Create a reranker around an already-loaded encoder.
    #[must_use]
    pub fn preloaded(encoder: Arc<dyn CrossEncoder>) -> Self {
        Self {
            loader: Box::new(move || {
                let encoder = Arc::clone(&encoder);
                Box::pin(async move { Ok(encoder) })
            }),
            encoder: OnceCell::new(),
        }
    }

    /// Whether the scoring model has been loaded.
    #[must_use]
    pub fn is_loaded(&self) -> bool {
        self.encoder.initialized()
    }

    /// Re-order `candidates` by cross-encoder relevance to `query` and keep
    /// the best `top_k`.
    ///
    /// On any model failure the first `top_k` candidates are returned
    /// unchanged and [`RerankOutcome::degraded`] explains why.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<SearchResult>,
        top_k: usize,
    ) -> RerankOutcome {
        if candidates.is_empty() {
            return RerankOutcome {
                results: candidates,
                degraded: None,
            };
        }

        let encoder = match self.encoder.get_or_try_init(|| (self.loader)()).await {
            Ok(encoder) => Arc::clone(encoder),
            Err(err) => {
                warn!(error = %err, "reranker model failed to load, keeping fusion order");
                return Self::fallback(candidates, top_k, format!("model load failed: {err}"));
            }
        };

        let passages: Vec<String> = candidates.iter().map(|r| r.text.clone()).collect();
        let scores = match encoder.score(query, &passages).await {
            Ok(scores) if scores.len() == candidates.len() => scores,
            Ok(scores) => {
                warn!(
                    expected = candidates.len(),
                    got = scores.len(),
                    "reranker returned wrong score count, keeping fusion order"
                );
                return Self::fallback(candidates, top_k, "mismatched score count".into());
            }
            Err(err) => {
                warn!(error = %err, "rerank scoring failed, keeping fusion order");
                return Self::fallback(candidates, top_k, format!("scoring failed: {err}"));
            }
        };

        let mut scored: Vec<(SearchResult, f32)> = candidates.into_iter().zip(scores).collect();
        // Stable sort keeps fusion order between equal scores, so the
        // overall ordering stays deterministic.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let results: Vec<SearchResult> = scored
            .into_iter()
            .take(top_k)
            .map(|(mut result, score)| {
                result.score = f64::from(score);
                result
            })
            .collect();
        debug!(kept = results.len(), "reranked candidates");
        RerankOutcome {
            results,
            degraded: None,
        }
    }

    fn fallback(mut candidates: Vec<SearchResult>, top_k: usize, reason: String) -> RerankOutcome {
        candidates.truncate(top_k);
        RerankOutcome {
            results: candidates,
            degraded: Some(reason),
        }
    }
}

// ── Bundled BGE cross-encoder (feature `rerank-local`) ─────────────────

/// Cross-encoder backed by fastembed's BGE reranker.
///
/// Loading downloads the model on first use; both loading and scoring are
/// CPU-bound and run on the blocking pool.
#[cfg(feature = "rerank-local")]
pub struct BgeCrossEncoder {
    model: Arc<std::sync::Mutex<fastembed::TextRerank>>,
}

#[cfg(feature = "rerank-local")]
impl BgeCrossEncoder {
    /// Load the BGE reranker model. Blocking.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::RerankUnavailable`] when the model cannot be
    /// downloaded or initialized.
    pub fn load() -> Result<Self, RetraceError> {
        use fastembed::{RerankInitOptions, RerankerModel, TextRerank};

        let options = RerankInitOptions::new(RerankerModel::BGERerankerBase);
        let model = TextRerank::try_new(options)
            .map_err(|err| RetraceError::RerankUnavailable(err.to_string()))?;
        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(model)),
        })
    }
}

#[cfg(feature = "rerank-local")]
#[async_trait]
impl CrossEncoder for BgeCrossEncoder {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RetraceError> {
        let model = Arc::clone(&self.model);
        let query = query.to_owned();
        let passages = passages.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut guard = model
                .lock()
                .map_err(|_| RetraceError::RerankUnavailable("model mutex poisoned".into()))?;
            let documents: Vec<&str> = passages.iter().map(String::as_str).collect();
            let ranked = guard
                .rerank(query.as_str(), documents, false, None)
                .map_err(|err| RetraceError::RerankUnavailable(err.to_string()))?;

            let mut scores = vec![0.0f32; passages.len()];
            for entry in ranked {
                if let Some(slot) = scores.get_mut(entry.index) {
                    *slot = entry.score;
                }
            }
            Ok(scores)
        })
        .await
        .map_err(|err| RetraceError::RerankUnavailable(err.to_string()))?
    }
}

#[cfg(feature = "rerank-local")]
impl Reranker {
    /// Reranker backed by the bundled BGE model, loaded lazily off the
    /// async runtime.
    #[must_use]
    pub fn local() -> Self {
        Self::new(|| async {
            let encoder = tokio::task::spawn_blocking(BgeCrossEncoder::load)
                .await
                .map_err(|err| RetraceError::RerankUnavailable(err.to_string()))??;
            Ok(Arc::new(encoder) as Arc<dyn CrossEncoder>)
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn result(id: &str, text: &str) -> SearchResult {
        SearchResult {
            chunk_id: ChunkId::new(id),
            conversation_id: "conv".into(),
            conversation_name: "Conv".into(),
            created_at: None,
            source: "test".into(),
            text: text.into(),
            score: 0.0,
            keyword_rank: None,
            vector_rank: None,
        }
    }

    /// Scores each passage by its length.
    struct LengthEncoder;

    #[async_trait]
    impl CrossEncoder for LengthEncoder {
        async fn score(&self, _query: &str, passages: &[String]) -> Result<Vec<f32>, RetraceError> {
            Ok(passages.iter().map(|p| p.len() as f32).collect())
        }
    }

    struct BrokenEncoder;

    #[async_trait]
    impl CrossEncoder for BrokenEncoder {
        async fn score(&self, _query: &str, _passages: &[String]) -> Result<Vec<f32>, RetraceError> {
            Err(RetraceError::RerankUnavailable("boom".into()))
        }
    }

    #[tokio::test]
    async fn reorders_by_model_score() {
        let reranker = Reranker::preloaded(Arc::new(LengthEncoder));
        let candidates = vec![result("a", "short"), result("b", "much longer passage")];
        let outcome = reranker.rerank("q", candidates, 2).await;

        assert!(outcome.degraded.is_none());
        assert_eq!(outcome.results[0].chunk_id, ChunkId::new("b"));
        assert_eq!(outcome.results[1].chunk_id, ChunkId::new("a"));
        assert!(outcome.results[0].score > outcome.results[1].score);
    }

    #[tokio::test]
    async fn keeps_top_k_only() {
        let reranker = Reranker::preloaded(Arc::new(LengthEncoder));
        let candidates = vec![
            result("a", "aaaa"),
            result("b", "bbbbbbbb"),
            result("c", "cc"),
        ];
        let outcome = reranker.rerank("q", candidates, 1).await;
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].chunk_id, ChunkId::new("b"));
    }

    #[tokio::test]
    async fn load_failure_degrades_to_input_order() {
        let reranker =
            Reranker::new(|| async { Err(RetraceError::RerankUnavailable("no model".into())) });
        let candidates = vec![result("a", "1"), result("b", "2"), result("c", "3")];
        let outcome = reranker.rerank("q", candidates, 2).await;

        assert!(outcome.degraded.is_some());
        let ids: Vec<&str> = outcome.results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
    }

    #[tokio::test]
    async fn scoring_failure_degrades_to_input_order() {
        let reranker = Reranker::preloaded(Arc::new(BrokenEncoder));
        let candidates = vec![result("a", "1"), result("b", "2")];
        let outcome = reranker.rerank("q", candidates, 5).await;

        assert!(outcome.degraded.is_some());
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn loads_lazily_and_once() {
        static LOADS: AtomicUsize = AtomicUsize::new(0);

        let reranker = Reranker::new(|| async {
            LOADS.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(LengthEncoder) as Arc<dyn CrossEncoder>)
        });
        assert!(!reranker.is_loaded());
        assert_eq!(LOADS.load(Ordering::SeqCst), 0);

        reranker.rerank("q", vec![result("a", "x")], 1).await;
        assert!(reranker.is_loaded());
        reranker.rerank("q", vec![result("a", "x")], 1).await;
        assert_eq!(LOADS.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_candidates_skip_loading() {
        let reranker =
            Reranker::new(|| async { Err(RetraceError::RerankUnavailable("unused".into())) });
        let outcome = reranker.rerank("q", Vec::new(), 5).await;
        assert!(outcome.results.is_empty());
        assert!(outcome.degraded.is_none());
        assert!(!reranker.is_loaded());
    }
}
