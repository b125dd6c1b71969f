//! Token-bounded context construction.
//!
//! The assembler turns the reranked evidence list and the session's memory
//! into an ordered block sequence that is guaranteed to fit the per-request
//! [`ContextBudget`]. Two hard rules shape the policy:
//!
//! - a chunk is included whole or not at all, never truncated;
//! - evidence inclusion stops at the first chunk that does not fit, so the
//!   block order always mirrors relevance order.
//!
//! Leftover budget replays memory turns newest-backward (older turns are
//! the first to be dropped), then emits them chronologically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::memory::ConversationMemory;
use crate::tokens::TokenCounter;
use crate::types::{ConversationTurn, RetraceError, SearchResult};

// ── ContextBudget ──────────────────────────────────────────────────────

/// Token allowance for retrieved evidence plus replayed history in one
/// generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget(usize);

impl ContextBudget {
    /// A budget of exactly `tokens`.
    #[must_use]
    pub fn new(tokens: usize) -> Self {
        Self(tokens)
    }

    /// Derive the budget for one request: the backend's context window
    /// minus what the system instruction, the question, and the reserved
    /// answer headroom already claim. Saturates at zero.
    #[must_use]
    pub fn derive(
        context_window: usize,
        system_instruction: &str,
        question: &str,
        answer_reserve: usize,
        counter: &TokenCounter,
    ) -> Self {
        let reserved = counter
            .count(system_instruction)
            .saturating_add(counter.count(question))
            .saturating_add(answer_reserve);
        Self(context_window.saturating_sub(reserved))
    }

    /// The allowance in tokens.
    #[must_use]
    pub fn tokens(self) -> usize {
        self.0
    }
}

// ── Context blocks ─────────────────────────────────────────────────────

/// One unit of assembled context.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextBlock {
    /// A complete evidence chunk with its provenance.
    Evidence {
        result: SearchResult,
        token_count: usize,
    },
    /// A replayed conversation turn.
    Turn {
        turn: ConversationTurn,
        token_count: usize,
    },
}

impl ContextBlock {
    /// Tokens this block contributes to the context.
    #[must_use]
    pub fn token_count(&self) -> usize {
        match self {
            Self::Evidence { token_count, .. } | Self::Turn { token_count, .. } => *token_count,
        }
    }
}

/// The assembled, budget-conforming context: evidence blocks first (in
/// relevance order), replayed turns after (in chronological order).
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub blocks: Vec<ContextBlock>,
    pub token_count: usize,
}

impl AssembledContext {
    /// Number of evidence blocks.
    #[must_use]
    pub fn evidence_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| matches!(b, ContextBlock::Evidence { .. }))
            .count()
    }

    /// The evidence results, in block order.
    pub fn evidence(&self) -> impl Iterator<Item = &SearchResult> {
        self.blocks.iter().filter_map(|block| match block {
            ContextBlock::Evidence { result, .. } => Some(result),
            ContextBlock::Turn { .. } => None,
        })
    }

    /// The replayed turns that fit the budget, in chronological order.
    /// These go to the backend as prior messages, not as context text.
    pub fn turns(&self) -> impl Iterator<Item = &ConversationTurn> {
        self.blocks.iter().filter_map(|block| match block {
            ContextBlock::Turn { turn, .. } => Some(turn),
            ContextBlock::Evidence { .. } => None,
        })
    }

    /// Whether nothing fit (question-only context).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Render the evidence as the context text handed to the generation
    /// backend: numbered blocks with provenance headers, separated by
    /// rules. Replayed turns are not rendered here; they travel as prior
    /// messages (see [`turns`](Self::turns)).
    #[must_use]
    pub fn render(&self) -> String {
        let parts: Vec<String> = self
            .evidence()
            .enumerate()
            .map(|(i, result)| render_evidence(i + 1, result))
            .collect();
        parts.join("\n\n---\n\n")
    }
}

fn render_evidence(number: usize, result: &SearchResult) -> String {
    let title = if result.conversation_name.is_empty() {
        "Untitled"
    } else {
        &result.conversation_name
    };
    let mut header = format!("[{number}] Conversation: {title}");
    if let Some(details) = provenance_details(result.created_at, &result.source) {
        header.push_str(&format!(" ({details})"));
    }
    format!("{header}\n{}", result.text)
}

fn provenance_details(date: Option<DateTime<Utc>>, source: &str) -> Option<String> {
    match (date, source.is_empty()) {
        (Some(date), false) => Some(format!("{}, {source}", date.format("%b %d, %Y"))),
        (Some(date), true) => Some(date.format("%b %d, %Y").to_string()),
        (None, false) => Some(source.to_string()),
        (None, true) => None,
    }
}

fn render_turn(turn: &ConversationTurn) -> String {
    format!("{}: {}", turn.role.as_str(), turn.text)
}

// ── ContextAssembler ───────────────────────────────────────────────────

/// Builds [`AssembledContext`]s under a [`ContextBudget`].
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler {
    counter: TokenCounter,
}

impl ContextAssembler {
    /// An assembler measuring blocks with `counter`.
    #[must_use]
    pub fn new(counter: TokenCounter) -> Self {
        Self { counter }
    }

    /// Select and order context blocks for one request.
    ///
    /// Evidence is taken in the given (reranked) order until the next chunk
    /// would not fit; memory turns fill whatever remains, newest retained
    /// first but emitted chronologically. A budget smaller than the first
    /// chunk yields an evidence-free context rather than an error.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::BudgetExceeded`] if the assembled total
    /// somehow lands above the budget. This is an invariant violation, not
    /// an expected runtime condition.
    pub fn assemble(
        &self,
        evidence: &[SearchResult],
        memory: &ConversationMemory,
        budget: ContextBudget,
    ) -> Result<AssembledContext, RetraceError> {
        let mut blocks = Vec::new();
        let mut remaining = budget.tokens();

        let mut evidence_number = 0usize;
        for result in evidence {
            evidence_number += 1;
            let cost = self.counter.count(&render_evidence(evidence_number, result));
            if cost > remaining {
                // Relevance order is also inclusion order: once a chunk
                // fails to fit, lower-ranked evidence is not considered.
                break;
            }
            remaining -= cost;
            blocks.push(ContextBlock::Evidence {
                result: result.clone(),
                token_count: cost,
            });
        }

        let mut replayed: Vec<ContextBlock> = Vec::new();
        for turn in memory.iter().rev() {
            let cost = self.counter.count(&render_turn(turn));
            if cost > remaining {
                break;
            }
            remaining -= cost;
            replayed.push(ContextBlock::Turn {
                turn: turn.clone(),
                token_count: cost,
            });
        }
        // Collected newest-first; replay chronologically.
        replayed.reverse();
        blocks.extend(replayed);

        let token_count: usize = blocks.iter().map(ContextBlock::token_count).sum();
        if token_count > budget.tokens() {
            return Err(RetraceError::BudgetExceeded {
                used: token_count,
                budget: budget.tokens(),
            });
        }

        debug!(
            blocks = blocks.len(),
            tokens = token_count,
            budget = budget.tokens(),
            "assembled context"
        );
        Ok(AssembledContext {
            blocks,
            token_count,
        })
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
