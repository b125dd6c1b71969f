//! Generation via a local Ollama instance.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::{GenerationBackend, GenerationRequest};
use crate::types::RetraceError;

const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default window for local models; most Ollama models run with at least
/// this much context configured.
const DEFAULT_CONTEXT_WINDOW: usize = 8192;

/// Backend driving Ollama's `/api/chat` endpoint.
pub struct OllamaBackend {
    http: reqwest::Client,
    host: String,
    model: String,
    context_window: usize,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: String,
}

impl OllamaBackend {
    /// Backend against `host` using `model`.
    #[must_use]
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.into(),
            model: model.into(),
            context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    /// Override the assumed context window.
    #[must_use]
    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    fn failed(&self, reason: impl Into<String>) -> RetraceError {
        RetraceError::GenerationFailed {
            backend: "ollama".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    fn context_window(&self) -> usize {
        self.context_window
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.host);
        matches!(
            self.http.get(&url).timeout(PROBE_TIMEOUT).send().await,
            Ok(response) if response.status().is_success()
        )
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, RetraceError> {
        let messages: Vec<serde_json::Value> =
            std::iter::once(json!({ "role": "system", "content": request.system_with_context() }))
                .chain(request.messages().into_iter().map(|message| {
                    json!({ "role": message.role.as_str(), "content": message.content })
                }))
                .collect();

        let url = format!("{}/api/chat", self.host);
        debug!(model = %self.model, messages = messages.len(), "ollama chat request");
        let response = self
            .http
            .post(&url)
            .timeout(GENERATE_TIMEOUT)
            .json(&json!({
                "model": self.model,
                "messages": messages,
                "stream": false,
            }))
            .send()
            .await
            .map_err(|err| self.failed(err.to_string()))?
            .error_for_status()
            .map_err(|err| self.failed(err.to_string()))?;

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|err| self.failed(format!("malformed response: {err}")))?;
        match body.message {
            Some(message) => Ok(message.content),
            None => Err(self.failed("response carried no message")),
        }
    }
}
