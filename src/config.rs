//! Pipeline configuration.
//!
//! Settings resolve in three layers, later wins:
//!
//! 1. Compiled defaults
//! 2. A YAML or TOML config file
//! 3. Environment variables (`RETRACE_*`, plus the conventional
//!    `OLLAMA_HOST` / `OLLAMA_MODEL` overrides)
//!
//! ```rust,ignore
//! use retrace::config::ConfigBuilder;
//!
//! let config = ConfigBuilder::new()
//!     .with_file("retrace.yaml")?
//!     .with_env()
//!     .build()?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file at {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to parse the configuration file.
    #[error("failed to parse {format} config: {source}")]
    Parse {
        format: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Unrecognised configuration file extension.
    #[error("unsupported config file format: {0}")]
    UnsupportedFormat(String),

    /// A setting failed validation.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tunable settings for the retrieval pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetraceConfig {
    /// Name of the generation backend to drive ("ollama" or "anthropic").
    pub backend: String,
    /// Ollama API base URL.
    pub ollama_host: String,
    /// Ollama chat/embedding model name.
    pub ollama_model: String,
    /// Anthropic model name.
    pub anthropic_model: String,
    /// RRF smoothing constant `k`.
    pub fusion_k: u32,
    /// Per-index lookup limit handed to keyword and vector search.
    pub retrieval_limit: usize,
    /// Fused candidates offered to the reranker.
    pub rerank_candidates: usize,
    /// Evidence results kept after reranking.
    pub rerank_top_k: usize,
    /// Conversation memory capacity in turns.
    pub memory_capacity: usize,
    /// Upper bound on each index lookup, in milliseconds. A timed-out leg
    /// degrades to an empty list.
    pub lookup_timeout_ms: u64,
    /// Maximum tokens a single chunk may carry.
    pub max_chunk_tokens: usize,
    /// Tokens held back from the context window for the model's reply.
    pub answer_reserve_tokens: usize,
    /// Overrides the backend-reported context window when set.
    pub context_window: Option<usize>,
}

impl Default for RetraceConfig {
    fn default() -> Self {
        Self {
            backend: "ollama".into(),
            ollama_host: "http://localhost:11434".into(),
            ollama_model: "llama3".into(),
            anthropic_model: "claude-sonnet-4-20250514".into(),
            fusion_k: 60,
            retrieval_limit: 20,
            rerank_candidates: 20,
            rerank_top_k: 5,
            memory_capacity: 10,
            lookup_timeout_ms: 10_000,
            max_chunk_tokens: 512,
            answer_reserve_tokens: 1024,
            context_window: None,
        }
    }
}

impl RetraceConfig {
    /// Lookup timeout as a [`Duration`].
    #[must_use]
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] on an inconsistent combination.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rerank_top_k == 0 {
            return Err(ConfigError::Invalid("rerank_top_k must be at least 1".into()));
        }
        if self.rerank_top_k > self.rerank_candidates {
            return Err(ConfigError::Invalid(format!(
                "rerank_top_k ({}) cannot exceed rerank_candidates ({})",
                self.rerank_top_k, self.rerank_candidates
            )));
        }
        if self.memory_capacity == 0 {
            return Err(ConfigError::Invalid("memory_capacity must be at least 1".into()));
        }
        if self.max_chunk_tokens == 0 {
            return Err(ConfigError::Invalid("max_chunk_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

/// Builder merging defaults, a config file, and environment overrides.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    base: RetraceConfig,
    use_env: bool,
}

impl ConfigBuilder {
    /// Start from compiled defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge settings from a YAML or TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        self.base = match ext.as_str() {
            "yaml" | "yml" => serde_yaml::from_str(&raw).map_err(|err| ConfigError::Parse {
                format: "YAML".into(),
                source: Box::new(err),
            })?,
            "toml" => toml::from_str(&raw).map_err(|err| ConfigError::Parse {
                format: "TOML".into(),
                source: Box::new(err),
            })?,
            other => {
                return Err(ConfigError::UnsupportedFormat(format!(
                    "extension '{other}' (expected yaml, yml, or toml)"
                )));
            }
        };
        Ok(self)
    }

    /// Apply environment variable overrides at build time.
    ///
    /// Loads a `.env` file first when one is present.
    #[must_use]
    pub fn with_env(mut self) -> Self {
        self.use_env = true;
        self
    }

    /// Finish and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the merged settings are
    /// inconsistent.
    pub fn build(mut self) -> Result<RetraceConfig, ConfigError> {
        if self.use_env {
            dotenvy::dotenv().ok();
            apply_env(&mut self.base);
        }
        self.base.validate()?;
        Ok(self.base)
    }
}

fn apply_env(config: &mut RetraceConfig) {
    // Conventional Ollama variables are honoured, RETRACE_-prefixed ones win.
    let string_overrides: [(&[&str], &mut String); 4] = [
        (&["RETRACE_BACKEND"], &mut config.backend),
        (&["OLLAMA_HOST", "RETRACE_OLLAMA_HOST"], &mut config.ollama_host),
        (&["OLLAMA_MODEL", "RETRACE_OLLAMA_MODEL"], &mut config.ollama_model),
        (&["RETRACE_ANTHROPIC_MODEL"], &mut config.anthropic_model),
    ];
    for (keys, slot) in string_overrides {
        for key in keys {
            if let Ok(value) = std::env::var(key) {
                if !value.is_empty() {
                    *slot = value;
                }
            }
        }
    }

    if let Ok(raw) = std::env::var("RETRACE_LOOKUP_TIMEOUT_MS") {
        if let Ok(ms) = raw.parse() {
            config.lookup_timeout_ms = ms;
        }
    }
    if let Ok(raw) = std::env::var("RETRACE_CONTEXT_WINDOW") {
        if let Ok(window) = raw.parse() {
            config.context_window = Some(window);
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = RetraceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fusion_k, 60);
        assert_eq!(config.rerank_candidates, 20);
        assert_eq!(config.rerank_top_k, 5);
        assert_eq!(config.memory_capacity, 10);
    }

    #[test]
    fn top_k_cannot_exceed_candidates() {
        let config = RetraceConfig {
            rerank_top_k: 30,
            rerank_candidates: 20,
            ..RetraceConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_memory_capacity_rejected() {
        let config = RetraceConfig {
            memory_capacity: 0,
            ..RetraceConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_yaml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "backend: anthropic\nfusion_k: 42").unwrap();

        let config = ConfigBuilder::new()
            .with_file(file.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.backend, "anthropic");
        assert_eq!(config.fusion_k, 42);
        // Untouched fields keep their defaults.
        assert_eq!(config.retrieval_limit, 20);
    }

    #[test]
    fn loads_toml_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(file, "backend = \"ollama\"\nrerank_top_k = 3").unwrap();

        let config = ConfigBuilder::new()
            .with_file(file.path())
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(config.rerank_top_k, 3);
    }

    #[test]
    fn rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        let result = ConfigBuilder::new().with_file(file.path());
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
