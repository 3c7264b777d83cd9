//! Pipeline configuration.
//!
//! One explicit value handed to every component constructor. Loaded from
//! JSON (every field optional, missing fields take defaults) and then
//! patched from `VERIGEN_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{env_key, CONFIG_PATH_ENV};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    EnvOverride { key: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

/// Which HTTP API the model backend speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local Ollama daemon (`/api/chat`, `/api/embed`).
    Ollama,
    /// Any server exposing `/v1/chat/completions` and `/v1/embeddings`.
    OpenAiCompatible,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub base_url: String,
    /// Name of the environment variable holding the API key, if any.
    pub api_key_env: Option<String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Ollama,
            base_url: "http://localhost:11434".into(),
            api_key_env: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Model used for per-chunk generation.
    pub generation_model: String,
    /// Model used for the consolidation call.
    pub consolidation_model: String,
    /// Model used for retrieval embeddings.
    pub embedding_model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            generation_model: "llama3.1:8b".into(),
            consolidation_model: "llama3.1:8b".into(),
            embedding_model: "nomic-embed-text".into(),
            temperature: 0.2,
            max_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chunk_chars: usize,
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 12_000,
            overlap_chars: 400,
        }
    }
}

/// Timeouts and retry budgets applied by the gateway middleware.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub call_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub max_transient_retries: u32,
    pub max_rate_limit_retries: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: 300,
            heartbeat_interval_secs: 30,
            max_transient_retries: 2,
            max_rate_limit_retries: 4,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl GatewayConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Upper bound on in-flight chunk generation calls.
    pub max_concurrent_chunks: usize,
    /// Upper bound on in-flight authority queries.
    pub max_concurrent_verifications: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_chunks: 4,
            max_concurrent_verifications: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifierConfig {
    /// Base URL of the legal-authority search service.
    pub authority_url: Option<String>,
    pub api_key_env: Option<String>,
    pub citation_timeout_secs: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            authority_url: None,
            api_key_env: None,
            citation_timeout_secs: 15,
        }
    }
}

impl VerifierConfig {
    pub fn citation_timeout(&self) -> Duration {
        Duration::from_secs(self.citation_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Dimension every vector in the index must have.
    pub embedding_dimension: usize,
    /// MMR re-ranks `top_k * candidate_multiplier` nearest candidates.
    pub candidate_multiplier: usize,
    /// Passage size used when supporting documents are split for indexing.
    pub passage_chars: usize,
    pub passage_overlap_chars: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 768,
            candidate_multiplier: 4,
            passage_chars: 1500,
            passage_overlap_chars: 150,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub backend: BackendConfig,
    pub models: ModelConfig,
    pub chunking: ChunkingConfig,
    pub gateway: GatewayConfig,
    pub concurrency: ConcurrencyConfig,
    pub verifier: VerifierConfig,
    pub retrieval: RetrievalConfig,
    /// Overall deadline for one request. `None` means no deadline.
    pub command_deadline_secs: Option<u64>,
}

// ═══════════════════════════════════════════════════════════
// Loading
// ═══════════════════════════════════════════════════════════

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Load from `$VERIGEN_CONFIG` (or defaults) and apply env overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                tracing::info!(path = %path, "Loading pipeline config");
                Self::from_file(Path::new(&path))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Patch fields from a key lookup (the process environment in `load`).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(&env_key("BACKEND_URL")) {
            self.backend.base_url = v;
        }
        if let Some(v) = lookup(&env_key("GENERATION_MODEL")) {
            self.models.generation_model = v;
        }
        if let Some(v) = lookup(&env_key("CONSOLIDATION_MODEL")) {
            self.models.consolidation_model = v;
        }
        if let Some(v) = lookup(&env_key("EMBEDDING_MODEL")) {
            self.models.embedding_model = v;
        }
        if let Some(v) = lookup(&env_key("AUTHORITY_URL")) {
            self.verifier.authority_url = Some(v);
        }
        if let Some(v) = lookup(&env_key("MAX_CONCURRENT_CHUNKS")) {
            self.concurrency.max_concurrent_chunks = parse_override("MAX_CONCURRENT_CHUNKS", &v)?;
        }
        if let Some(v) = lookup(&env_key("CALL_TIMEOUT_SECS")) {
            self.gateway.call_timeout_secs = parse_override("CALL_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup(&env_key("COMMAND_DEADLINE_SECS")) {
            self.command_deadline_secs = Some(parse_override("COMMAND_DEADLINE_SECS", &v)?);
        }
        Ok(())
    }

    /// Reject combinations no component can work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.max_chunk_chars == 0 {
            return Err(ConfigError::Invalid("chunking.max_chunk_chars must be > 0".into()));
        }
        if self.chunking.overlap_chars >= self.chunking.max_chunk_chars {
            return Err(ConfigError::Invalid(format!(
                "chunking.overlap_chars ({}) must be smaller than max_chunk_chars ({})",
                self.chunking.overlap_chars, self.chunking.max_chunk_chars
            )));
        }
        if self.retrieval.passage_overlap_chars >= self.retrieval.passage_chars {
            return Err(ConfigError::Invalid(
                "retrieval.passage_overlap_chars must be smaller than passage_chars".into(),
            ));
        }
        if self.concurrency.max_concurrent_chunks == 0
            || self.concurrency.max_concurrent_verifications == 0
        {
            return Err(ConfigError::Invalid("concurrency limits must be >= 1".into()));
        }
        if self.retrieval.embedding_dimension == 0 || self.retrieval.candidate_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.embedding_dimension and candidate_multiplier must be >= 1".into(),
            ));
        }
        if self.gateway.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid("gateway.heartbeat_interval_secs must be >= 1".into()));
        }
        if self.gateway.call_timeout_secs == 0 {
            return Err(ConfigError::Invalid("gateway.call_timeout_secs must be >= 1".into()));
        }
        if self.verifier.citation_timeout_secs == 0 {
            return Err(ConfigError::Invalid("verifier.citation_timeout_secs must be >= 1".into()));
        }
        // A single lookup must fit inside the command deadline.
        if let Some(deadline) = self.command_deadline_secs {
            if self.verifier.citation_timeout_secs >= deadline {
                return Err(ConfigError::Invalid(format!(
                    "verifier.citation_timeout_secs ({}) must be shorter than command_deadline_secs ({deadline})",
                    self.verifier.citation_timeout_secs
                )));
            }
        }
        if !(0.0..=2.0).contains(&self.models.temperature) {
            return Err(ConfigError::Invalid(format!(
                "models.temperature out of range: {}",
                self.models.temperature
            )));
        }
        Ok(())
    }

    pub fn command_deadline(&self) -> Option<Duration> {
        self.command_deadline_secs.map(Duration::from_secs)
    }
}

fn parse_override<T: std::str::FromStr>(suffix: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::EnvOverride {
        key: env_key(suffix),
        value: value.to_string(),
    })
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
