//! Reciprocal rank fusion of the keyword and vector result lists.
//!
//! Each list contributes `1 / (k + rank)` per chunk (1-based ranks); a
//! chunk's total is the sum over the lists it appears in, so agreement
//! between the two retrieval methods outranks a strong showing in one.
//! Ordering is fully deterministic: score descending, then the better
//! vector rank, then the chunk id.

use rustc_hash::FxHashMap;

use crate::index::{RankedHit, VectorHit};
use crate::types::ChunkId;

/// One entry of the fused list, with its contributing ranks preserved for
/// downstream display and tie-breaking.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub chunk_id: ChunkId,
    /// Sum of reciprocal-rank contributions across both lists.
    pub score: f64,
    pub keyword_rank: Option<usize>,
    pub vector_rank: Option<usize>,
}

/// Merge two ranked lists into one deduplicated, deterministically ordered
/// list.
///
/// Either input may be empty; the fused list then mirrors the other input's
/// order (with RRF scores attributable to that single list). Both empty
/// yields an empty list, which callers treat as "no evidence found".
#[must_use]
pub fn reciprocal_rank_fusion(
    keyword: &[RankedHit],
    vector: &[VectorHit],
    k: u32,
) -> Vec<FusedHit> {
    let k = f64::from(k);
    let mut fused: FxHashMap<ChunkId, FusedHit> =
        FxHashMap::with_capacity_and_hasher(keyword.len() + vector.len(), Default::default());

    for hit in keyword {
        let entry = fused
            .entry(hit.chunk_id.clone())
            .or_insert_with(|| FusedHit {
                chunk_id: hit.chunk_id.clone(),
                score: 0.0,
                keyword_rank: None,
                vector_rank: None,
            });
        entry.score += 1.0 / (k + hit.rank as f64);
        entry.keyword_rank = Some(hit.rank);
    }

    for hit in vector {
        let entry = fused
            .entry(hit.chunk_id.clone())
            .or_insert_with(|| FusedHit {
                chunk_id: hit.chunk_id.clone(),
                score: 0.0,
                keyword_rank: None,
                vector_rank: None,
            });
        entry.score += 1.0 / (k + hit.rank as f64);
        entry.vector_rank = Some(hit.rank);
    }

    let mut list: Vec<FusedHit> = fused.into_values().collect();
    list.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| {
                let a_rank = a.vector_rank.unwrap_or(usize::MAX);
                let b_rank = b.vector_rank.unwrap_or(usize::MAX);
                a_rank.cmp(&b_rank)
            })
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    list
}

// ── Tests ──────────────────────────────────────────────────────────────
