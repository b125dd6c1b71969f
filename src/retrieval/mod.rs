//! Ranked-list processing between raw lookups and context assembly.
//!
//! [`fusion`] merges the keyword and vector lists into one ranked list via
//! reciprocal rank fusion; [`rerank`] optionally re-scores the fused head
//! with a cross-encoder, degrading to fusion order when the model is
//! unavailable.

pub mod fusion;
pub mod rerank;

pub use fusion::{FusedHit, reciprocal_rank_fusion};
pub use rerank::{CrossEncoder, RerankOutcome, Reranker};
