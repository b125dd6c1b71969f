//! Generation via the Anthropic Messages API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{GenerationBackend, GenerationRequest};
use crate::types::{RetraceError, Role};

const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const GENERATE_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_ANSWER_TOKENS: u32 = 2048;
const CONTEXT_WINDOW: usize = 200_000;

/// Backend driving the Anthropic Messages API.
pub struct AnthropicBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl AnthropicBackend {
    /// Backend reading its API key from `ANTHROPIC_API_KEY`.
    #[must_use]
    pub fn from_env(model: impl Into<String>) -> Self {
        Self::new(
            std::env::var("ANTHROPIC_API_KEY").unwrap_or_default(),
            model,
        )
    }

    /// Backend with an explicit API key.
    #[must_use]
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    /// Point the client at a different API host (proxies, test doubles).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn failed(&self, reason: impl Into<String>) -> RetraceError {
        RetraceError::GenerationFailed {
            backend: "anthropic".into(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl GenerationBackend for AnthropicBackend {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn context_window(&self) -> usize {
        CONTEXT_WINDOW
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String, RetraceError> {
        if self.api_key.is_empty() {
            return Err(self.failed("ANTHROPIC_API_KEY is not set"));
        }

        // The Messages API accepts only user/assistant roles.
        let messages: Vec<serde_json::Value> = request
            .messages()
            .into_iter()
            .map(|message| {
                let role = match message.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                json!({ "role": role, "content": message.content })
            })
            .collect();

        let url = format!("{}/v1/messages", self.base_url);
        let response = self
            .http
            .post(&url)
            .timeout(GENERATE_TIMEOUT)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&json!({
                "model": self.model,
                "max_tokens": MAX_ANSWER_TOKENS,
                "system": request.system_with_context(),
                "messages": messages,
            }))
            .send()
            .await
            .map_err(|err| self.failed(err.to_string()))?
            .error_for_status()
            .map_err(|err| self.failed(err.to_string()))?;

        let body: MessagesResponse = response
            .json()
            .await
            .map_err(|err| self.failed(format!("malformed response: {err}")))?;
        body.content
            .into_iter()
            .next()
            .map(|block| block.text)
            .ok_or_else(|| self.failed("response carried no content blocks"))
    }
}
