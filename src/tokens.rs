//! Token counting for budget arithmetic.
//!
//! The default counter is the cl100k BPE when the `tiktoken` feature is on
//! (the default), with a quarter-length character heuristic as the
//! feature-off fallback. The heuristic rounds up so budget checks stay
//! conservative.

#[cfg(feature = "tiktoken")]
use std::sync::Arc;

#[cfg(feature = "tiktoken")]
use crate::types::RetraceError;

/// Counts tokens in text for [`ContextBudget`](crate::context::ContextBudget)
/// arithmetic.
///
/// Cheap to clone; the BPE table is shared behind an `Arc`.
#[derive(Clone)]
pub enum TokenCounter {
    /// `len / 4` rounded up. Zero for empty text.
    Heuristic,
    /// Exact counts via the cl100k_base encoding.
    #[cfg(feature = "tiktoken")]
    Tiktoken(Arc<tiktoken_rs::CoreBPE>),
}

impl TokenCounter {
    /// The character heuristic counter.
    #[must_use]
    pub fn heuristic() -> Self {
        Self::Heuristic
    }

    /// A cl100k_base BPE counter.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::Config`] if the encoding tables fail to load.
    #[cfg(feature = "tiktoken")]
    pub fn cl100k() -> Result<Self, RetraceError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|err| RetraceError::Config(format!("failed to load cl100k_base: {err}")))?;
        Ok(Self::Tiktoken(Arc::new(bpe)))
    }

    /// Number of tokens in `text`.
    #[must_use]
    pub fn count(&self, text: &str) -> usize {
        match self {
            Self::Heuristic => text.len().div_ceil(4),
            #[cfg(feature = "tiktoken")]
            Self::Tiktoken(bpe) => bpe.encode_ordinary(text).len(),
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::Heuristic
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Heuristic => f.write_str("TokenCounter::Heuristic"),
            #[cfg(feature = "tiktoken")]
            Self::Tiktoken(_) => f.write_str("TokenCounter::Tiktoken"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_rounds_up() {
        let counter = TokenCounter::heuristic();
        assert_eq!(counter.count(""), 0);
        assert_eq!(counter.count("abc"), 1);
        assert_eq!(counter.count("abcd"), 1);
        assert_eq!(counter.count("abcde"), 2);
    }

    #[cfg(feature = "tiktoken")]
    #[test]
    fn cl100k_counts_nonzero() {
        let counter = TokenCounter::cl100k().unwrap();
        assert!(counter.count("hello world") >= 2);
        assert_eq!(counter.count(""), 0);
    }
}
