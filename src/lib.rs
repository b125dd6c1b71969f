//! Ask natural-language questions over your own archive of AI-assistant
//! conversations and get answers grounded in, and citing, your past
//! messages.
//!
//! ```text
//! question ─┬─► index::KeywordIndex ──► [RankedHit] ──┐
//!           │                                         ├─► retrieval::fusion
//!           └─► embeddings ──► index::VectorIndex ────┘         │
//!                                                               ▼
//!                                              retrieval::rerank (optional)
//!                                                               │
//! memory::ConversationMemory ──► context::ContextAssembler ◄────┘
//!                                         │
//!                                         ▼
//!                    llm::GenerationBackend ──► pipeline::Answer
//!                                                 │
//!                        citations + memory update┘
//! ```
//!
//! [`pipeline::RagPipeline`] is the front door: build one with its indexes,
//! embedder, and generation backend, then call
//! [`ask`](pipeline::RagPipeline::ask) per question and
//! [`clear_session`](pipeline::RagPipeline::clear_session) to forget a
//! session. Everything external (storage engines, the embedding model, the
//! generation model) hangs off the narrow traits in [`index`],
//! [`embeddings`], and [`llm`].

pub mod config;
pub mod context;
pub mod embeddings;
pub mod index;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod retrieval;
pub mod session;
pub mod tokens;
pub mod types;

pub use config::{ConfigBuilder, RetraceConfig};
pub use context::{AssembledContext, ContextAssembler, ContextBudget};
pub use memory::ConversationMemory;
pub use pipeline::{Answer, Phase, RagPipeline, RunReport};
pub use retrieval::{Reranker, reciprocal_rank_fusion};
pub use tokens::TokenCounter;
pub use types::{
    Chunk, ChunkId, ChunkOrigin, Citation, ConversationTurn, RetraceError, Role, SearchResult,
    Sender,
};
