//! OpenAI-compatible backend (`/v1/chat/completions`, `/v1/embeddings`).
//!
//! Works against hosted APIs and local servers (vLLM, llama.cpp, LM Studio)
//! that speak the same wire format.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{
    classify_http_error, classify_transport_error, retry_after, ChatMessage, Completion,
    CompletionRequest, GatewayError, LlmGateway, Usage,
};

pub struct OpenAiBackend {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::HttpClient(e.to_string()))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client,
        })
    }

    async fn post_json<B: Serialize + ?Sized, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, GatewayError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| classify_transport_error(&e, &self.base_url))?;

        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(response.headers());
            let body = response.text().await.unwrap_or_default();
            return Err(classify_http_error(status.as_u16(), wait, body));
        }

        response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Pull the text out of a chat completion, mapping filter stops to policy errors.
fn completion_text(parsed: ChatCompletionResponse) -> Result<Completion, GatewayError> {
    let usage = parsed
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| GatewayError::InvalidResponse("no choices in response".into()))?;

    if choice.finish_reason.as_deref() == Some("content_filter") {
        return Err(GatewayError::ContentPolicy(
            "completion stopped by content filter".into(),
        ));
    }

    Ok(Completion {
        text: choice.message.content.unwrap_or_default(),
        usage,
    })
}

#[async_trait]
impl LlmGateway for OpenAiBackend {
    fn name(&self) -> &str {
        "openai_compatible"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, GatewayError> {
        let body = ChatCompletionRequest {
            model: &request.model_id,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };
        let parsed: ChatCompletionResponse = self.post_json("/v1/chat/completions", &body).await?;
        completion_text(parsed)
    }

    async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, GatewayError> {
        let body = EmbeddingRequest {
            model: model_id,
            input: texts,
        };
        let mut parsed: EmbeddingResponse = self.post_json("/v1/embeddings", &body).await?;

        if parsed.data.len() != texts.len() {
            return Err(GatewayError::InvalidResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }
}
