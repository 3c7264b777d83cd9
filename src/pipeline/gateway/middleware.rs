//! Gateway middleware layers.
//!
//! Each layer owns the next one down and implements [`LlmGateway`] itself,
//! so layers compose in any order. `GatewayBuilder` fixes the standard order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::time::{Instant, MissedTickBehavior};

use super::{Completion, CompletionRequest, GatewayError, LlmGateway};
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline_config::GatewayConfig;

// ═══════════════════════════════════════════════════════════
// Timeout
// ═══════════════════════════════════════════════════════════

/// Bounds every call to the inner gateway.
pub struct TimeoutLayer {
    inner: Arc<dyn LlmGateway>,
    timeout: Duration,
}

impl TimeoutLayer {
    pub fn new(inner: Arc<dyn LlmGateway>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl LlmGateway for TimeoutLayer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        tokio::time::timeout(self.timeout, self.inner.complete(request))
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout))?
    }

    async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        tokio::time::timeout(self.timeout, self.inner.embed(model_id, texts))
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout))?
    }
}

// ═══════════════════════════════════════════════════════════
// Retry
// ═══════════════════════════════════════════════════════════

/// Local retry budget for network-level failures.
///
/// Separate from the regeneration budget, which is about citations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_transient_retries: u32,
    pub max_rate_limit_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            max_transient_retries: config.max_transient_retries,
            max_rate_limit_retries: config.max_rate_limit_retries,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Retries without sleeping between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_transient_retries: max_retries,
            max_rate_limit_retries: max_retries,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Exponential backoff with up to 50% jitter, capped at `max_backoff`.
    pub fn backoff(&self, retry: u32) -> Duration {
        if self.base_backoff.is_zero() {
            return Duration::ZERO;
        }
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_backoff);
        let jitter: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        exp.mul_f64(jitter)
    }
}

/// Retries rate-limited and transient failures; everything else surfaces.
pub struct RetryLayer {
    inner: Arc<dyn LlmGateway>,
    policy: RetryPolicy,
}

impl RetryLayer {
    pub fn new(inner: Arc<dyn LlmGateway>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, GatewayError>> + Send,
        T: Send,
    {
        let mut transient_retries = 0u32;
        let mut rate_limit_retries = 0u32;

        loop {
            let err = match call().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            let delay = match &err {
                GatewayError::RateLimited { retry_after }
                    if rate_limit_retries < self.policy.max_rate_limit_retries =>
                {
                    rate_limit_retries += 1;
                    retry_after.unwrap_or_else(|| self.policy.backoff(rate_limit_retries - 1))
                }
                GatewayError::TransientNetwork(_) | GatewayError::Timeout(_)
                    if transient_retries < self.policy.max_transient_retries =>
                {
                    transient_retries += 1;
                    self.policy.backoff(transient_retries - 1)
                }
                _ => return Err(err),
            };

            tracing::warn!(
                backend = self.inner.name(),
                operation,
                transient_retries,
                rate_limit_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Model call failed, retrying"
            );

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[async_trait]
impl LlmGateway for RetryLayer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        self.run("complete", || self.inner.complete(request)).await
    }

    async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        self.run("embed", || self.inner.embed(model_id, texts)).await
    }
}

// ═══════════════════════════════════════════════════════════
// Heartbeat
// ═══════════════════════════════════════════════════════════

/// Emits a "still working" signal on a fixed interval while a call is
/// pending. Purely observational: the inner call is never restarted.
pub struct HeartbeatLayer {
    inner: Arc<dyn LlmGateway>,
    interval: Duration,
    events: EventSink,
}

impl HeartbeatLayer {
    pub fn new(inner: Arc<dyn LlmGateway>, interval: Duration, events: EventSink) -> Self {
        Self {
            inner,
            interval,
            events,
        }
    }
}

#[async_trait]
impl LlmGateway for HeartbeatLayer {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let started = Instant::now();
        let call = self.inner.complete(request);
        tokio::pin!(call);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Consume initial immediate tick

        loop {
            tokio::select! {
                biased;
                result = &mut call => return result,
                _ = ticker.tick() => {
                    let elapsed_secs = started.elapsed().as_secs();
                    tracing::info!(
                        model = %request.model_id,
                        elapsed_secs,
                        "Model call still working"
                    );
                    self.events.emit(PipelineEvent::Heartbeat {
                        model_id: request.model_id.clone(),
                        elapsed_secs,
                    });
                }
            }
        }
    }

    async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        self.inner.embed(model_id, texts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::gateway::{ChatMessage, MockGateway};

    fn request() -> CompletionRequest {
        CompletionRequest {
            model_id: "test-model".into(),
            messages: vec![ChatMessage::user("hello")],
            temperature: 0.0,
            max_tokens: 32,
        }
    }

    #[tokio::test]
    async fn retry_recovers_from_transient_errors() {
        let mock = Arc::new(MockGateway::scripted(vec![
            Err(GatewayError::TransientNetwork("reset".into())),
            Err(GatewayError::Timeout(Duration::from_secs(1))),
            Ok("done".into()),
        ]));
        let layer = RetryLayer::new(mock.clone(), RetryPolicy::immediate(2));

        let completion = layer.complete(&request()).await.unwrap();
        assert_eq!(completion.text, "done");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn retry_surfaces_after_budget_exhausted() {
        let mock = Arc::new(MockGateway::scripted(vec![Err(GatewayError::TransientNetwork(
            "down".into(),
        ))]));
        let layer = RetryLayer::new(mock.clone(), RetryPolicy::immediate(2));

        let err = layer.complete(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::TransientNetwork(_)));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn authentication_errors_are_not_retried() {
        let mock = Arc::new(MockGateway::scripted(vec![
            Err(GatewayError::Authentication("bad key".into())),
            Ok("unreachable".into()),
        ]));
        let layer = RetryLayer::new(mock.clone(), RetryPolicy::immediate(5));

        let err = layer.complete(&request()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Authentication(_)));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn context_overflow_is_not_retried() {
        let mock = Arc::new(MockGateway::scripted(vec![Err(GatewayError::ContextOverflow(
            "too long".into(),
        ))]));
        let layer = RetryLayer::new(mock.clone(), RetryPolicy::immediate(5));

        assert!(layer.complete(&request()).await.is_err());
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_honours_retry_after() {
        let mock = Arc::new(MockGateway::scripted(vec![
            Err(GatewayError::RateLimited {
                retry_after: Some(Duration::from_secs(2)),
            }),
            Ok("ok".into()),
        ]));
        let policy = RetryPolicy {
            max_transient_retries: 0,
            max_rate_limit_retries: 1,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
        };
        let layer = RetryLayer::new(mock.clone(), policy);

        let started = tokio::time::Instant::now();
        layer.complete(&request()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(mock.call_count(), 2);
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_transient_retries: 3,
            max_rate_limit_retries: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(300),
        };
        assert!(policy.backoff(0) <= Duration::from_millis(100));
        assert!(policy.backoff(0) >= Duration::from_millis(50));
        assert!(policy.backoff(5) <= Duration::from_millis(300));
        assert_eq!(RetryPolicy::immediate(3).backoff(4), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_layer_converts_slow_calls() {
        let mock = Arc::new(MockGateway::echo().with_delay(Duration::from_secs(60)));
        let layer = TimeoutLayer::new(mock, Duration::from_secs(5));

        let err = layer.complete(&request()).await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_emits_while_call_pending() {
        let mock = Arc::new(MockGateway::echo().with_delay(Duration::from_secs(95)));
        let (events, mut rx) = EventSink::channel();
        let layer = HeartbeatLayer::new(mock.clone(), Duration::from_secs(30), events);

        let completion = layer.complete(&request()).await.unwrap();
        assert_eq!(completion.text, "hello");
        // Heartbeats never restart the underlying call
        assert_eq!(mock.call_count(), 1);

        let mut beats = Vec::new();
        while let Ok(event) = rx.try_recv() {
            beats.push(event);
        }
        assert_eq!(beats.len(), 3);
        assert!(matches!(
            &beats[0],
            PipelineEvent::Heartbeat { elapsed_secs: 30, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fast_call_emits_no_heartbeat() {
        let mock = Arc::new(MockGateway::echo());
        let (events, mut rx) = EventSink::channel();
        let layer = HeartbeatLayer::new(mock, Duration::from_secs(30), events);

        layer.complete(&request()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }
}
