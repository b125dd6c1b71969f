//! Generation backends.
//!
//! Every backend implements the same narrow [`GenerationBackend`] contract,
//! so the orchestrator is indifferent to which concrete model answers. The
//! closed set of built-in backends is resolved by name through
//! [`backend_by_name`]; failure to generate is always an `Err`, never an
//! empty string, so callers can tell "the model said nothing" apart from
//! "the model was unreachable".

pub mod anthropic;
pub mod ollama;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::RetraceConfig;
use crate::types::{ConversationTurn, RetraceError, Role};

pub use anthropic::AnthropicBackend;
pub use ollama::OllamaBackend;

// ── Request shape ──────────────────────────────────────────────────────

/// One chat message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything a backend needs for one generation call.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The fixed system instruction.
    pub system: String,
    /// Rendered context blocks; empty when no evidence or history fit.
    pub context: String,
    /// The user's current question.
    pub question: String,
    /// Prior session turns, chronological.
    pub history: Vec<ChatMessage>,
}

impl GenerationRequest {
    /// The system prompt with the context section appended, the form both
    /// built-in backends put on the wire.
    #[must_use]
    pub fn system_with_context(&self) -> String {
        if self.context.is_empty() {
            self.system.clone()
        } else {
            format!("{}\n\n### Context\n{}", self.system, self.context)
        }
    }

    /// History plus the current question, as the message list for
    /// chat-style APIs.
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut messages = self.history.clone();
        messages.push(ChatMessage::new(Role::User, self.question.clone()));
        messages
    }

    /// Convert memory turns into wire messages.
    #[must_use]
    pub fn history_from_turns<'a>(turns: impl Iterator<Item = &'a ConversationTurn>) -> Vec<ChatMessage> {
        turns
            .map(|turn| ChatMessage::new(turn.role, turn.text.clone()))
            .collect()
    }
}

// ── Backend contract ───────────────────────────────────────────────────

/// A pluggable answer-generation model.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Registry name of this backend.
    fn name(&self) -> &str;

    /// Context window size in tokens, used to derive the per-request
    /// context budget.
    fn context_window(&self) -> usize;

    /// Whether the backend is currently reachable/configured.
    async fn is_available(&self) -> bool;

    /// Produce the answer text.
    ///
    /// # Errors
    ///
    /// Returns [`RetraceError::GenerationFailed`] when the backend is
    /// unreachable, times out, or responds with something unparseable.
    /// An empty answer is `Ok("")`, distinct from failure.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, RetraceError>;
}

// ── Registry ───────────────────────────────────────────────────────────

/// Resolve a built-in backend by registry name.
///
/// # Errors
///
/// Returns [`RetraceError::UnknownBackend`] for names outside the closed
/// set (`"ollama"`, `"anthropic"`).
pub fn backend_by_name(
    name: &str,
    config: &RetraceConfig,
) -> Result<Arc<dyn GenerationBackend>, RetraceError> {
    match name {
        "ollama" => Ok(Arc::new(OllamaBackend::new(
            &config.ollama_host,
            &config.ollama_model,
        ))),
        "anthropic" => Ok(Arc::new(AnthropicBackend::from_env(
            &config.anthropic_model,
        ))),
        other => Err(RetraceError::UnknownBackend(other.to_owned())),
    }
}

/// All built-in backends that report themselves available right now.
pub async fn available_backends(config: &RetraceConfig) -> Vec<Arc<dyn GenerationBackend>> {
    let candidates: [Arc<dyn GenerationBackend>; 2] = [
        Arc::new(OllamaBackend::new(
            &config.ollama_host,
            &config.ollama_model,
        )),
        Arc::new(AnthropicBackend::from_env(&config.anthropic_model)),
    ];

    let mut available = Vec::new();
    for backend in candidates {
        if backend.is_available().await {
            available.push(backend);
        }
    }
    available
}

// ── Tests ──────────────────────────────────────────────────────────────
