//! Cross-chunk consolidation: N partial results in, one result out.

use std::sync::Arc;

use thiserror::Error;

use super::gateway::{GatewayError, LlmGateway};
use super::processor::{CallSettings, TaskContext};
use super::prompt_templates::{PromptError, PromptSet};
use super::types::{ConsolidatedResult, PartialResult};

#[derive(Debug, Error)]
pub enum ConsolidationError {
    #[error("No partial results to consolidate")]
    NoPartials,

    #[error("Partial result at position {position} belongs to chunk {chunk_index}")]
    OutOfOrder { position: usize, chunk_index: usize },

    #[error("Model call failed: {0}")]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Prompt(#[from] PromptError),

    #[error("Model returned an empty consolidation")]
    EmptyOutput,
}

pub struct Consolidator {
    gateway: Arc<dyn LlmGateway>,
    prompts: Arc<PromptSet>,
    settings: CallSettings,
}

impl Consolidator {
    pub fn new(gateway: Arc<dyn LlmGateway>, prompts: Arc<PromptSet>, settings: CallSettings) -> Self {
        Self {
            gateway,
            prompts,
            settings,
        }
    }

    /// Merge partial results, which must be exactly chunks `0..N` in order.
    ///
    /// A single partial with nothing to avoid is returned unchanged without
    /// a model call. `avoid` lists citations a previous attempt failed to
    /// verify; when non-empty the model is always called.
    pub async fn consolidate(
        &self,
        partials: &[PartialResult],
        ctx: &TaskContext,
        avoid: &[String],
    ) -> Result<ConsolidatedResult, ConsolidationError> {
        if partials.is_empty() {
            return Err(ConsolidationError::NoPartials);
        }
        if let Some((position, p)) = partials
            .iter()
            .enumerate()
            .find(|(i, p)| p.chunk_index != *i)
        {
            return Err(ConsolidationError::OutOfOrder {
                position,
                chunk_index: p.chunk_index,
            });
        }

        if let ([only], true) = (partials, avoid.is_empty()) {
            tracing::debug!("Single partial result, consolidation is a pass-through");
            return Ok(ConsolidatedResult {
                content: only.content.clone(),
                partial_count: 1,
                passthrough: true,
                usage: Default::default(),
            });
        }

        let count = partials.len();
        let sections = partials
            .iter()
            .map(|p| {
                let n = p.chunk_index + 1;
                format!(
                    "=== PARTIAL RESULT {n}/{count} ===\n{}\n=== END PARTIAL RESULT {n} ===",
                    p.content
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let grounding = self.prompts.render_grounding(&ctx.grounding)?;
        let feedback = self.prompts.render_feedback(avoid)?;
        let count_text = count.to_string();

        let system = self.prompts.consolidation_system.render(&[])?;
        let user = self.prompts.consolidation_user.render(&[
            ("task", ctx.task.as_str()),
            ("partial_count", count_text.as_str()),
            ("target_format", ctx.target_format.as_str()),
            ("partials", sections.as_str()),
            ("grounding", grounding.as_str()),
            ("feedback", feedback.as_str()),
        ])?;

        tracing::info!(
            partials = count,
            avoid = avoid.len(),
            model = %self.settings.model_id,
            "Consolidating partial results"
        );

        let completion = self
            .gateway
            .complete(&self.settings.request(system, user))
            .await?;

        let content = completion.text.trim();
        if content.is_empty() {
            return Err(ConsolidationError::EmptyOutput);
        }

        Ok(ConsolidatedResult {
            content: content.to_string(),
            partial_count: count,
            passthrough: false,
            usage: completion.usage,
        })
    }
}
