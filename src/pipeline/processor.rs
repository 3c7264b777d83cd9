//! Per-chunk generation.
//!
//! Each chunk gets exactly one gateway call with no knowledge of its
//! neighbours. `process_all` runs chunks concurrently under a fixed limit and
//! fails the whole run on the first chunk error: downstream consolidation
//! requires every chunk to contribute.

use std::sync::Arc;

use futures_util::{stream, StreamExt};
use thiserror::Error;

use super::events::{EventSink, PipelineEvent};
use super::gateway::{ChatMessage, CompletionRequest, GatewayError, LlmGateway};
use super::prompt_templates::{PromptError, PromptSet};
use super::types::{Chunk, PartialResult};
use super::PipelineError;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error("Model returned an empty response")]
    EmptyResponse,

    #[error("No result was produced")]
    Missing,
}

// ---------------------------------------------------------------------------
// Shared call settings
// ---------------------------------------------------------------------------

/// Model parameters for one kind of call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSettings {
    pub model_id: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CallSettings {
    pub fn request(&self, system: String, user: String) -> CompletionRequest {
        CompletionRequest {
            model_id: self.model_id.clone(),
            messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// Request-level inputs shared by every chunk and by consolidation.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// The caller's task prompt, already rendered.
    pub task: String,
    pub target_format: String,
    /// Retrieved passages, empty without grounding.
    pub grounding: Vec<String>,
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct ChunkProcessor {
    gateway: Arc<dyn LlmGateway>,
    prompts: Arc<PromptSet>,
    settings: CallSettings,
    max_concurrent: usize,
    events: EventSink,
}

impl ChunkProcessor {
    pub fn new(
        gateway: Arc<dyn LlmGateway>,
        prompts: Arc<PromptSet>,
        settings: CallSettings,
        max_concurrent: usize,
        events: EventSink,
    ) -> Self {
        Self {
            gateway,
            prompts,
            settings,
            max_concurrent: max_concurrent.max(1),
            events,
        }
    }

    pub async fn process(
        &self,
        chunk: &Chunk,
        ctx: &TaskContext,
    ) -> Result<PartialResult, PipelineError> {
        self.try_process(chunk, ctx)
            .await
            .map_err(|source| PipelineError::ChunkProcessing {
                chunk_index: chunk.index,
                total: chunk.total,
                source,
            })
    }

    async fn try_process(&self, chunk: &Chunk, ctx: &TaskContext) -> Result<PartialResult, ChunkError> {
        let grounding = self.prompts.render_grounding(&ctx.grounding)?;
        let number = (chunk.index + 1).to_string();
        let total = chunk.total.to_string();
        let sources = chunk.sources.join(", ");

        let system = self.prompts.chunk_system.render(&[])?;
        let user = self.prompts.chunk_user.render(&[
            ("task", ctx.task.as_str()),
            ("chunk_number", number.as_str()),
            ("chunk_total", total.as_str()),
            ("sources", sources.as_str()),
            ("excerpt", chunk.text.as_str()),
            ("grounding", grounding.as_str()),
        ])?;

        let completion = self
            .gateway
            .complete(&self.settings.request(system, user))
            .await?;

        let content = completion.text.trim();
        if content.is_empty() {
            return Err(ChunkError::EmptyResponse);
        }

        tracing::debug!(
            chunk_index = chunk.index,
            total = chunk.total,
            output_chars = content.len(),
            "Chunk processed"
        );

        Ok(PartialResult {
            chunk_index: chunk.index,
            content: content.to_string(),
            usage: completion.usage,
        })
    }

    /// Process every chunk, at most `max_concurrent` at a time.
    ///
    /// Returns results ordered by chunk index. The first failure drops every
    /// in-flight call and is returned as-is.
    pub async fn process_all(
        &self,
        chunks: &[Chunk],
        ctx: &TaskContext,
    ) -> Result<Vec<PartialResult>, PipelineError> {
        let total = chunks.len();
        let mut slots: Vec<Option<PartialResult>> = vec![None; total];

        tracing::info!(
            chunks = total,
            max_concurrent = self.max_concurrent,
            "Processing chunks"
        );

        let mut results = stream::iter(chunks.iter().map(|chunk| self.process(chunk, ctx)))
            .buffer_unordered(self.max_concurrent);

        while let Some(result) = results.next().await {
            let partial = match result {
                Ok(partial) => partial,
                Err(e) => {
                    tracing::warn!(error = %e, "Chunk failed, aborting run");
                    return Err(e);
                }
            };
            self.events.emit(PipelineEvent::ChunkCompleted {
                chunk_index: partial.chunk_index,
                total,
            });
            if let Some(slot) = slots.get_mut(partial.chunk_index) {
                *slot = Some(partial);
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(chunk_index, slot)| {
                slot.ok_or_else(|| PipelineError::ChunkProcessing {
                    chunk_index,
                    total,
                    source: ChunkError::Missing,
                })
            })
            .collect()
    }
}
