//! LLM gateway: one call interface over several model backends.
//!
//! Backends only translate requests and normalize errors. Timeout, retry and
//! heartbeat behaviour live in explicit middleware layers stacked by
//! [`GatewayBuilder`], so the wrapping is visible where the gateway is built:
//!
//! ```text
//! Heartbeat( Retry( Timeout( backend ) ) )
//! ```

pub mod types;
pub mod middleware;
pub mod ollama;
pub mod openai;
pub mod mock;

pub use types::*;
pub use middleware::{HeartbeatLayer, RetryLayer, RetryPolicy, TimeoutLayer};
pub use ollama::OllamaBackend;
pub use openai::OpenAiBackend;
pub use mock::MockGateway;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::pipeline::events::EventSink;
use crate::pipeline_config::{BackendKind, GatewayConfig, PipelineConfig};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("Rate limited by model backend (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Content policy rejection: {0}")]
    ContentPolicy(String),

    #[error("Context window exceeded: {0}")]
    ContextOverflow(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend returned error (status {status}): {body}")]
    Backend { status: u16, body: String },

    #[error("Invalid backend response: {0}")]
    InvalidResponse(String),

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}

impl GatewayError {
    /// Errors the retry layer may absorb.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::TransientNetwork(_) | Self::Timeout(_)
        )
    }
}

/// Uniform interface over model backends.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError>;

    async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError>;
}

// ═══════════════════════════════════════════════════════════
// Composition
// ═══════════════════════════════════════════════════════════

/// Stacks middleware around a backend, innermost first.
pub struct GatewayBuilder {
    inner: Arc<dyn LlmGateway>,
}

impl GatewayBuilder {
    pub fn new<G: LlmGateway + 'static>(backend: G) -> Self {
        Self {
            inner: Arc::new(backend),
        }
    }

    pub fn from_arc(inner: Arc<dyn LlmGateway>) -> Self {
        Self { inner }
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(TimeoutLayer::new(self.inner, timeout)),
        }
    }

    pub fn with_retry(self, policy: RetryPolicy) -> Self {
        Self {
            inner: Arc::new(RetryLayer::new(self.inner, policy)),
        }
    }

    pub fn with_heartbeat(self, interval: Duration, events: EventSink) -> Self {
        Self {
            inner: Arc::new(HeartbeatLayer::new(self.inner, interval, events)),
        }
    }

    /// Apply the standard stack configured in `GatewayConfig`.
    pub fn with_standard_layers(self, config: &GatewayConfig, events: EventSink) -> Self {
        self.with_timeout(config.call_timeout())
            .with_retry(RetryPolicy::from_config(config))
            .with_heartbeat(config.heartbeat_interval(), events)
    }

    pub fn build(self) -> Arc<dyn LlmGateway> {
        self.inner
    }
}

/// Build the configured backend wrapped in the standard middleware stack.
pub fn connect(config: &PipelineConfig, events: EventSink) -> Result<Arc<dyn LlmGateway>, GatewayError> {
    let api_key = match &config.backend.api_key_env {
        Some(var) => Some(std::env::var(var).map_err(|_| {
            GatewayError::Authentication(format!("API key variable {var} is not set"))
        })?),
        None => None,
    };

    let builder = match config.backend.kind {
        BackendKind::Ollama => GatewayBuilder::new(OllamaBackend::new(&config.backend.base_url)?),
        BackendKind::OpenAiCompatible => {
            GatewayBuilder::new(OpenAiBackend::new(&config.backend.base_url, api_key)?)
        }
    };

    tracing::info!(
        backend = ?config.backend.kind,
        base_url = %config.backend.base_url,
        "LLM gateway configured"
    );

    Ok(builder.with_standard_layers(&config.gateway, events).build())
}

// ═══════════════════════════════════════════════════════════
// Error normalization shared by HTTP backends
// ═══════════════════════════════════════════════════════════

/// Map a non-success HTTP response onto the gateway taxonomy.
pub(crate) fn classify_http_error(
    status: u16,
    retry_after: Option<Duration>,
    body: String,
) -> GatewayError {
    let lower = body.to_lowercase();
    match status {
        401 | 403 => GatewayError::Authentication(body),
        429 => GatewayError::RateLimited { retry_after },
        400 | 413 | 422
            if lower.contains("context length")
                || lower.contains("context window")
                || lower.contains("maximum context")
                || lower.contains("too many tokens") =>
        {
            GatewayError::ContextOverflow(body)
        }
        400 | 422
            if lower.contains("content_policy")
                || lower.contains("content_filter")
                || lower.contains("content policy") =>
        {
            GatewayError::ContentPolicy(body)
        }
        500..=599 => GatewayError::TransientNetwork(format!("status {status}: {body}")),
        _ => GatewayError::Backend { status, body },
    }
}

/// Map a transport-level reqwest failure onto the gateway taxonomy.
pub(crate) fn classify_transport_error(e: &reqwest::Error, base_url: &str) -> GatewayError {
    if e.is_timeout() {
        GatewayError::TransientNetwork(format!("request to {base_url} timed out"))
    } else if e.is_connect() {
        GatewayError::TransientNetwork(format!("cannot connect to {base_url}"))
    } else if e.is_decode() {
        GatewayError::InvalidResponse(e.to_string())
    } else {
        GatewayError::TransientNetwork(e.to_string())
    }
}

/// Parse a `Retry-After` header given in seconds.
pub(crate) fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_to_taxonomy() {
        assert!(matches!(
            classify_http_error(401, None, "bad key".into()),
            GatewayError::Authentication(_)
        ));
        assert_eq!(
            classify_http_error(429, Some(Duration::from_secs(3)), String::new()),
            GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(matches!(
            classify_http_error(503, None, "overloaded".into()),
            GatewayError::TransientNetwork(_)
        ));
        assert!(matches!(
            classify_http_error(404, None, "no such model".into()),
            GatewayError::Backend { status: 404, .. }
        ));
    }

    #[test]
    fn context_overflow_detected_from_body() {
        let err = classify_http_error(
            400,
            None,
            "This model's maximum context length is 8192 tokens".into(),
        );
        assert!(matches!(err, GatewayError::ContextOverflow(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn content_policy_detected_from_body() {
        let err = classify_http_error(400, None, r#"{"error":{"code":"content_filter"}}"#.into());
        assert!(matches!(err, GatewayError::ContentPolicy(_)));
    }

    #[test]
    fn retryable_classification() {
        assert!(GatewayError::TransientNetwork("x".into()).is_retryable());
        assert!(GatewayError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(GatewayError::RateLimited { retry_after: None }.is_retryable());
        assert!(!GatewayError::Authentication("x".into()).is_retryable());
        assert!(!GatewayError::ContentPolicy("x".into()).is_retryable());
    }

    #[test]
    fn retry_after_header_parsed() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(reqwest::header::RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn builder_stacks_layers_around_backend() {
        let mock = Arc::new(MockGateway::echo());
        let gateway = GatewayBuilder::from_arc(mock.clone())
            .with_standard_layers(&GatewayConfig::default(), EventSink::disabled())
            .build();

        let completion = gateway
            .complete(&CompletionRequest {
                model_id: "m".into(),
                messages: vec![ChatMessage::user("ping")],
                temperature: 0.0,
                max_tokens: 16,
            })
            .await
            .unwrap();

        assert_eq!(completion.text, "ping");
        assert_eq!(mock.call_count(), 1);
    }
}
