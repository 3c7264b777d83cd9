//! Stub gateway for tests and offline runs.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{Completion, CompletionRequest, GatewayError, LlmGateway, Usage};

type Responder = Box<dyn Fn(&CompletionRequest, usize) -> Result<String, GatewayError> + Send + Sync>;
type Embedder = Box<dyn Fn(&str) -> Vec<f32> + Send + Sync>;

/// Mock gateway: answers from a closure, records every request.
pub struct MockGateway {
    responder: Responder,
    embedder: Option<Embedder>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    embed_calls: AtomicUsize,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockGateway {
    /// Respond with `f(request)`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, GatewayError> + Send + Sync + 'static,
    {
        Self::with_responder(Box::new(move |req: &CompletionRequest, _call: usize| f(req)))
    }

    /// Echo the user text back.
    pub fn echo() -> Self {
        Self::new(|req| Ok(req.user_text()))
    }

    /// Return scripted results in order; the last one repeats.
    pub fn scripted(script: Vec<Result<String, GatewayError>>) -> Self {
        Self::with_responder(Box::new(move |_req: &CompletionRequest, call: usize| {
            match script.get(call).or_else(|| script.last()) {
                Some(result) => result.clone(),
                None => Err(GatewayError::InvalidResponse("empty mock script".into())),
            }
        }))
    }

    fn with_responder(responder: Responder) -> Self {
        Self {
            responder,
            embedder: None,
            delay: None,
            calls: AtomicUsize::new(0),
            embed_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer `embed` calls with `f(text)` for each text.
    pub fn with_embedder<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Vec<f32> + Send + Sync + 'static,
    {
        self.embedder = Some(Box::new(f));
        self
    }

    /// Sleep before answering each completion.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `embed` calls (not texts).
    pub fn embed_call_count(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    /// Snapshot of every completion request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl LlmGateway for MockGateway {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(request.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let text = (self.responder)(request, call)?;
        let usage = Usage {
            prompt_tokens: (request.prompt_chars() / 4) as u64,
            completion_tokens: (text.chars().count() / 4) as u64,
        };
        Ok(Completion { text, usage })
    }

    async fn embed(&self, _model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        let embedder = self
            .embedder
            .as_ref()
            .ok_or_else(|| GatewayError::InvalidResponse("mock has no embedder".into()))?;
        Ok(texts.iter().map(|t| embedder(t.as_str())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::gateway::ChatMessage;

    fn request(text: &str) -> CompletionRequest {
        CompletionRequest {
            model_id: "m".into(),
            messages: vec![ChatMessage::user(text)],
            temperature: 0.0,
            max_tokens: 8,
        }
    }

    #[tokio::test]
    async fn scripted_repeats_last_entry() {
        let mock = MockGateway::scripted(vec![Ok("a".into()), Ok("b".into())]);
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(mock.complete(&request("x")).await.unwrap().text);
        }
        assert_eq!(seen, vec!["a", "b", "b"]);
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn records_requests() {
        let mock = MockGateway::echo();
        mock.complete(&request("first")).await.unwrap();
        mock.complete(&request("second")).await.unwrap();
        let texts: Vec<String> = mock.requests().iter().map(|r| r.user_text()).collect();
        assert_eq!(texts, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn embed_without_embedder_errors() {
        let mock = MockGateway::echo();
        assert!(mock.embed("e", &["x".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn embed_uses_closure() {
        let mock = MockGateway::echo().with_embedder(|t| vec![t.len() as f32]);
        let vectors = mock.embed("e", &["ab".to_string(), "abc".to_string()]).await.unwrap();
        assert_eq!(vectors, vec![vec![2.0], vec![3.0]]);
        assert_eq!(mock.embed_call_count(), 1);
    }
}
