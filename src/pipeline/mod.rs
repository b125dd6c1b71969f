//! The top-level RAG orchestrator.
//!
//! Each question drives one pass through a fixed state machine:
//!
//! ```text
//!   Idle ──► Retrieving ──► Assembling ──► Generating ──► Responded
//!                │                             │
//!                └───────────► Errored ◄───────┘
//! ```
//!
//! Retrieval failures never abort a question: a failed or timed-out index
//! leg degrades to an empty list, a failed reranker degrades to fusion
//! order, and an empty fused list means "no evidence found", which is a
//! valid answer state. Only two things are surfaced to the caller as more
//! than a warning: a generation failure (reported inside a well-formed
//! answer carrying a fixed apology turn) and a context-budget invariant
//! violation (a hard error).

use std::sync::Arc;

use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::RetraceConfig;
use crate::context::{ContextAssembler, ContextBudget};
use crate::embeddings::EmbeddingProvider;
use crate::index::{ChunkSource, Granularity, KeywordIndex, RankedHit, VectorHit, VectorIndex};
use crate::llm::{GenerationBackend, GenerationRequest};
use crate::retrieval::fusion::{FusedHit, reciprocal_rank_fusion};
use crate::retrieval::rerank::Reranker;
use crate::session::SessionStore;
use crate::tokens::TokenCounter;
use crate::types::{Citation, ConversationTurn, RetraceError, SearchResult};

/// System instruction handed to every generation call.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are a personal knowledge assistant answering \
    questions from the user's own past AI conversations. Always cite the conversation name and \
    date when referencing specific information. If the context contains nothing relevant, say so \
    honestly instead of guessing.";

/// Fixed apology text appended as the assistant turn when generation fails.
pub const GENERATION_APOLOGY: &str = "Sorry, I could not generate an answer this time. \
    The answer model was unavailable; your session is unaffected, please try again.";

// ── Phases ─────────────────────────────────────────────────────────────

/// Orchestrator states. Every question starts the cycle anew at `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Idle,
    Retrieving,
    Assembling,
    Generating,
    Responded,
    Errored,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Retrieving => "retrieving",
            Self::Assembling => "assembling",
            Self::Generating => "generating",
            Self::Responded => "responded",
            Self::Errored => "errored",
        };
        f.write_str(name)
    }
}

// ── Answer & report ────────────────────────────────────────────────────

/// What one question produced.
#[derive(Debug, Clone)]
pub struct Answer {
    /// The generated answer, or the fixed apology on generation failure.
    pub text: String,
    /// Evidence actually handed to the backend; empty when none was found
    /// or none fit the budget.
    pub citations: Vec<Citation>,
    /// How the pipeline got there.
    pub report: RunReport,
}

/// Diagnostics for one pass through the state machine.
///
/// Degradations recorded here were already absorbed; they explain a thinner
/// citation set, they do not invalidate the answer.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Terminal state: `Responded`, or `Errored` when generation failed.
    pub phase: Phase,
    /// The keyword lookup failed or timed out.
    pub keyword_degraded: bool,
    /// The vector lookup (or query embedding) failed or timed out.
    pub vector_degraded: bool,
    /// Why reranking fell back to fusion order, when it did.
    pub rerank_degraded: Option<String>,
    /// The generation error, when the answer is the apology turn.
    pub generation_error: Option<String>,
    /// Evidence blocks included in the context.
    pub evidence_count: usize,
    /// Tokens the assembled context used.
    pub context_tokens: usize,
    /// The budget those tokens were held under.
    pub budget_tokens: usize,
}

// ── Builder ────────────────────────────────────────────────────────────

/// Builder for [`RagPipeline`].
#[derive(Default)]
pub struct RagPipelineBuilder {
    config: RetraceConfig,
    keyword: Option<Arc<dyn KeywordIndex>>,
    vector: Option<Arc<dyn VectorIndex>>,
    chunks: Option<Arc<dyn ChunkSource>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    backend: Option<Arc<dyn GenerationBackend>>,
    reranker: Option<Reranker>,
    counter: Option<TokenCounter>,
    system_instruction: Option<String>,
}

impl RagPipelineBuilder {
    /// Use `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: RetraceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the keyword index.
    #[must_use]
    pub fn keyword_index(mut self, index: Arc<dyn KeywordIndex>) -> Self {
        self.keyword = Some(index);
        self
    }

    /// Set the vector index.
    #[must_use]
    pub fn vector_index(mut self, index: Arc<dyn VectorIndex>) -> Self {
        self.vector = Some(index);
        self
    }

    /// Set the chunk store used for provenance hydration.
    #[must_use]
    pub fn chunk_source(mut self, chunks: Arc<dyn ChunkSource>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    /// Set the query embedding provider.
    #[must_use]
    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Set the generation backend.
    #[must_use]
    pub fn backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Enable cross-encoder reranking.
    #[must_use]
    pub fn reranker(mut self, reranker: Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Use a specific token counter (defaults to the character heuristic).
    #[must_use]
    pub fn token_counter(mut self, counter: TokenCounter) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Replace the default system instruction.
    #[must_use]
    pub fn system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Finish the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Config`] when a required collaborator is
    /// missing or the configuration fails validation.
    pub fn build(self) -> Result<RagPipeline, RetraceError> {
        self.config
            .validate()
            .map_err(|err| RetraceError::Config(err.to_string()))?;

        let counter = self.counter.unwrap_or_default();
        let memory_capacity = self.config.memory_capacity;
        Ok(RagPipeline {
            keyword: self.keyword.ok_or_else(|| missing("keyword index"))?,
            vector: self.vector.ok_or_else(|| missing("vector index"))?,
            chunks: self.chunks.ok_or_else(|| missing("chunk source"))?,
            embedder: self.embedder.ok_or_else(|| missing("embedding provider"))?,
            backend: self.backend.ok_or_else(|| missing("generation backend"))?,
            reranker: self.reranker,
            assembler: ContextAssembler::new(counter.clone()),
            counter,
            sessions: SessionStore::new(memory_capacity),
            system_instruction: self
                .system_instruction
                .unwrap_or_else(|| DEFAULT_SYSTEM_INSTRUCTION.to_owned()),
            config: self.config,
        })
    }
}

fn missing(what: &str) -> RetraceError {
    RetraceError::Config(format!("pipeline is missing its {what}"))
}

// ── RagPipeline ────────────────────────────────────────────────────────

/// The retrieval-augmented answering engine.
///
/// One pipeline serves any number of sessions; per-session state lives in
/// an internal [`SessionStore`] keyed by caller-chosen session id.
pub struct RagPipeline {
    config: RetraceConfig,
    keyword: Arc<dyn KeywordIndex>,
    vector: Arc<dyn VectorIndex>,
    chunks: Arc<dyn ChunkSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    backend: Arc<dyn GenerationBackend>,
    reranker: Option<Reranker>,
    assembler: ContextAssembler,
    counter: TokenCounter,
    sessions: SessionStore,
    system_instruction: String,
}

impl RagPipeline {
    /// Start building a pipeline.
    #[must_use]
    pub fn builder() -> RagPipelineBuilder {
        RagPipelineBuilder::default()
    }

    /// Answer `question` within the session `session_id`.
    ///
    /// Questions on the same session are serialized: a second call queues
    /// until the first has committed its memory turns. Dropping the future
    /// mid-flight commits nothing.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::BudgetExceeded`] on an assembler invariant
    /// violation. Generation failures do NOT error: they come back as a
    /// well-formed apology answer with `report.phase == Phase::Errored`.
    pub async fn ask(&self, question: &str, session_id: &str) -> Result<Answer, RetraceError> {
        let session = self.sessions.session(session_id);
        let mut memory = session.lock_memory().await;
        info!(session = session_id, "question accepted");

        debug!(phase = %Phase::Retrieving, "entering");
        let retrieval = self.retrieve(question).await;
        let fused = reciprocal_rank_fusion(
            &retrieval.keyword_hits,
            &retrieval.vector_hits,
            self.config.fusion_k,
        );
        if fused.is_empty() {
            debug!("no evidence found, continuing with question-only context");
        }
        let candidates = self.hydrate(&fused).await;

        let (evidence, rerank_degraded) = match &self.reranker {
            Some(reranker) => {
                let outcome = reranker
                    .rerank(question, candidates, self.config.rerank_top_k)
                    .await;
                (outcome.results, outcome.degraded)
            }
            None => {
                let mut kept = candidates;
                kept.truncate(self.config.rerank_top_k);
                (kept, None)
            }
        };

        debug!(phase = %Phase::Assembling, "entering");
        let window = self
            .config
            .context_window
            .unwrap_or_else(|| self.backend.context_window());
        let budget = ContextBudget::derive(
            window,
            &self.system_instruction,
            question,
            self.config.answer_reserve_tokens,
            &self.counter,
        );
        let context = self.assembler.assemble(&evidence, &memory, budget)?;

        debug!(phase = %Phase::Generating, "entering");
        // Replayed history is whatever the assembler kept under budget,
        // not the raw memory buffer.
        let request = GenerationRequest {
            system: self.system_instruction.clone(),
            context: context.render(),
            question: question.to_owned(),
            history: GenerationRequest::history_from_turns(context.turns()),
        };
        let citations: Vec<Citation> = context.evidence().map(Citation::from).collect();

        let mut report = RunReport {
            phase: Phase::Responded,
            keyword_degraded: retrieval.keyword_degraded,
            vector_degraded: retrieval.vector_degraded,
            rerank_degraded,
            generation_error: None,
            evidence_count: context.evidence_count(),
            context_tokens: context.token_count,
            budget_tokens: budget.tokens(),
        };

        match self.backend.generate(&request).await {
            Ok(text) => {
                // Both turns are committed only now, so an abandoned
                // request leaves memory untouched.
                memory.append(ConversationTurn::user(question));
                memory.append(ConversationTurn::assistant(text.clone(), citations.clone()));
                info!(
                    session = session_id,
                    citations = citations.len(),
                    "answer generated"
                );
                Ok(Answer {
                    text,
                    citations,
                    report,
                })
            }
            Err(err) => {
                warn!(session = session_id, error = %err, "generation failed");
                memory.append(ConversationTurn::user(question));
                memory.append(ConversationTurn::assistant(GENERATION_APOLOGY, Vec::new()));
                report.phase = Phase::Errored;
                report.generation_error = Some(err.to_string());
                Ok(Answer {
                    text: GENERATION_APOLOGY.to_owned(),
                    citations: Vec::new(),
                    report,
                })
            }
        }
    }

    /// Drop all memory for `session_id`. Returns whether it existed.
    pub fn clear_session(&self, session_id: &str) -> bool {
        self.sessions.clear(session_id)
    }

    /// The active generation backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.backend
    }

    // ── Retrieval internals ────────────────────────────────────────────

    async fn retrieve(&self, question: &str) -> RetrievalOutcome {
        let per_leg_timeout = self.config.lookup_timeout();
        let limit = self.config.retrieval_limit;

        let keyword_fut = timeout(per_leg_timeout, self.keyword.search_keyword(question, limit));
        let vector_fut = timeout(per_leg_timeout, self.vector_leg(question, limit));
        let (keyword_outcome, vector_outcome) = tokio::join!(keyword_fut, vector_fut);

        let (keyword_hits, keyword_degraded) = match keyword_outcome {
            Ok(Ok(hits)) => (hits, false),
            Ok(Err(err)) => {
                warn!(error = %err, "keyword lookup failed, degrading to vector-only");
                (Vec::new(), true)
            }
            Err(_) => {
                warn!("keyword lookup timed out, degrading to vector-only");
                (Vec::new(), true)
            }
        };
        let (vector_hits, vector_degraded) = match vector_outcome {
            Ok(Ok(hits)) => (hits, false),
            Ok(Err(err)) => {
                warn!(error = %err, "vector lookup failed, degrading to keyword-only");
                (Vec::new(), true)
            }
            Err(_) => {
                warn!("vector lookup timed out, degrading to keyword-only");
                (Vec::new(), true)
            }
        };

        RetrievalOutcome {
            keyword_hits,
            vector_hits,
            keyword_degraded,
            vector_degraded,
        }
    }

    /// Embed the query and search both vector collections, merged by
    /// distance into one ranked list.
    async fn vector_leg(
        &self,
        question: &str,
        limit: usize,
    ) -> Result<Vec<VectorHit>, RetraceError> {
        let embedding = self.embedder.embed(question).await?;

        let (conversation, message) = tokio::join!(
            self.vector
                .search_vector(&embedding, Granularity::Conversation, limit),
            self.vector
                .search_vector(&embedding, Granularity::Message, limit),
        );

        let mut merged: Vec<VectorHit> = conversation?;
        merged.extend(message?);
        merged.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        let mut seen = rustc_hash::FxHashSet::default();
        merged.retain(|hit| seen.insert(hit.chunk_id.clone()));
        merged.truncate(limit);
        for (position, hit) in merged.iter_mut().enumerate() {
            hit.rank = position + 1;
        }
        Ok(merged)
    }

    /// Fetch chunks for the fused head and attach display provenance.
    /// Unknown or invalid chunks are skipped with a warning.
    async fn hydrate(&self, fused: &[FusedHit]) -> Vec<SearchResult> {
        let mut results = Vec::with_capacity(self.config.rerank_candidates.min(fused.len()));
        for hit in fused.iter().take(self.config.rerank_candidates) {
            let chunk = match self.chunks.chunk(&hit.chunk_id).await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    debug!(chunk = %hit.chunk_id, "indexed chunk missing from store");
                    continue;
                }
                Err(err) => {
                    warn!(chunk = %hit.chunk_id, error = %err, "chunk hydration failed");
                    continue;
                }
            };
            if let Err(err) = chunk.validate(self.config.max_chunk_tokens) {
                warn!(error = %err, "dropping invalid chunk");
                continue;
            }

            let conversation_name = chunk
                .metadata
                .get("conversation_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_owned();
            let source = chunk.source_platform().unwrap_or_default().to_owned();
            results.push(SearchResult {
                chunk_id: chunk.id,
                conversation_id: chunk.conversation_id,
                conversation_name,
                created_at: Some(chunk.created_at),
                source,
                text: chunk.text,
                score: hit.score,
                keyword_rank: hit.keyword_rank,
                vector_rank: hit.vector_rank,
            });
        }
        results
    }
}

struct RetrievalOutcome {
    keyword_hits: Vec<RankedHit>,
    vector_hits: Vec<VectorHit>,
    keyword_degraded: bool,
    vector_degraded: bool,
}

// ── Tests ──────────────────────────────────────────────────────────────
