//! Request orchestration: wires every stage for one generation request.
//!
//! Each awaited stage runs under a guard that races it against the external
//! cancellation token and the command deadline. Losing the race drops the
//! stage future, which drops every in-flight gateway or authority call, and
//! surfaces a single `Cancelled { stage }`, tagged with the attempt number
//! when the stage belongs to a generation attempt.

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use super::chunker::ChunkPlanner;
use super::citation::{extract, AuthoritySearch, CitationVerifier, VerificationReport};
use super::consolidate::Consolidator;
use super::events::{EventSink, PipelineEvent};
use super::gateway::{LlmGateway, Usage};
use super::processor::{CallSettings, ChunkProcessor, TaskContext};
use super::prompt_templates::{PromptSet, PromptTemplate};
use super::rag::{Passage, RetrievalEngine, RetrievalError};
use super::regeneration::{AttemptRunner, RegenerationController};
use super::types::{
    ConsolidatedResult, Document, DocumentRole, GenerationAttempt, PartialResult, Verdict,
    VerificationPolicy,
};
use super::{PipelineError, Stage};
use crate::pipeline_config::PipelineConfig;

// ═══════════════════════════════════════════════════════════
// Request / output types
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroundingPolicy {
    /// Continue without grounding when retrieval fails.
    #[default]
    BestEffort,
    /// Fail the request when retrieval fails.
    Required,
}

#[derive(Debug, Clone)]
pub struct GroundingRequest {
    pub corpus_id: String,
    /// Retrieval query. Empty means the rendered task prompt.
    pub query: String,
    /// Passages to index first. Empty means: split the request's
    /// supporting documents.
    pub passages: Vec<Passage>,
    pub top_k: usize,
    /// 0 = pure relevance, 1 = maximum spread.
    pub diversity: f32,
    pub policy: GroundingPolicy,
}

impl GroundingRequest {
    pub fn new(corpus_id: impl Into<String>, top_k: usize, diversity: f32) -> Self {
        Self {
            corpus_id: corpus_id.into(),
            query: String::new(),
            passages: Vec::new(),
            top_k,
            diversity,
            policy: GroundingPolicy::BestEffort,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = query.into();
        self
    }

    pub fn with_passages(mut self, passages: Vec<Passage>) -> Self {
        self.passages = passages;
        self
    }

    pub fn required(mut self) -> Self {
        self.policy = GroundingPolicy::Required;
        self
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub documents: Vec<Document>,
    pub task_prompt: PromptTemplate,
    /// Values for the task prompt's placeholders.
    pub prompt_values: Vec<(String, String)>,
    pub target_format: String,
    pub policy: VerificationPolicy,
    pub grounding: Option<GroundingRequest>,
}

impl GenerationRequest {
    pub fn new(
        documents: Vec<Document>,
        task_prompt: PromptTemplate,
        target_format: impl Into<String>,
        policy: VerificationPolicy,
    ) -> Self {
        Self {
            documents,
            task_prompt,
            prompt_values: Vec::new(),
            target_format: target_format.into(),
            policy,
            grounding: None,
        }
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.prompt_values.push((name.into(), value.into()));
        self
    }

    pub fn with_grounding(mut self, grounding: GroundingRequest) -> Self {
        self.grounding = Some(grounding);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Accepted,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineOutput {
    pub status: OutcomeStatus,
    /// The final attempt's consolidated result.
    pub result: ConsolidatedResult,
    /// The final attempt's verification report.
    pub report: VerificationReport,
    pub attempts: Vec<GenerationAttempt>,
    pub warnings: Vec<String>,
    /// Every gateway call of the request, chunks and all attempts.
    pub usage: Usage,
}

impl PipelineOutput {
    /// Turn a `Failed` outcome into `UnverifiedCitations`.
    pub fn into_accepted(self) -> Result<Self, PipelineError> {
        if self.status == OutcomeStatus::Accepted {
            return Ok(self);
        }
        let mut citations = self.report.failing_citations();
        if citations.is_empty() {
            citations = self.report.unverifiable_citations();
        }
        Err(PipelineError::UnverifiedCitations {
            attempt: self.attempts.last().map_or(0, |a| a.attempt_number),
            citations,
        })
    }
}

// ═══════════════════════════════════════════════════════════
// Cancellation guard
// ═══════════════════════════════════════════════════════════

#[derive(Clone)]
struct StageGuard {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl StageGuard {
    async fn run<F: Future>(&self, stage: Stage, work: F) -> Result<F::Output, PipelineError> {
        self.run_attempt(stage, None, work).await
    }

    async fn run_attempt<F: Future>(
        &self,
        stage: Stage,
        attempt: Option<u32>,
        work: F,
    ) -> Result<F::Output, PipelineError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::warn!(%stage, ?attempt, "Request cancelled");
                Err(PipelineError::Cancelled { stage, attempt })
            }
            _ = deadline_reached(self.deadline) => {
                tracing::warn!(%stage, ?attempt, "Command deadline exceeded");
                Err(PipelineError::Cancelled { stage, attempt })
            }
            output = work => Ok(output),
        }
    }
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

// ═══════════════════════════════════════════════════════════
// Pipeline
// ═══════════════════════════════════════════════════════════

pub struct VerifiedPipeline {
    config: PipelineConfig,
    gateway: Arc<dyn LlmGateway>,
    verifier: Arc<CitationVerifier>,
    prompts: Arc<PromptSet>,
    retrieval: Option<Arc<RetrievalEngine>>,
    events: EventSink,
}

impl VerifiedPipeline {
    pub fn new(
        config: PipelineConfig,
        gateway: Arc<dyn LlmGateway>,
        authority: Arc<dyn AuthoritySearch>,
        events: EventSink,
    ) -> Result<Self, PipelineError> {
        config
            .validate()
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;
        let verifier = Arc::new(CitationVerifier::from_config(authority, &config));
        Ok(Self {
            config,
            gateway,
            verifier,
            prompts: Arc::new(PromptSet::builtin()?),
            retrieval: None,
            events,
        })
    }

    /// Replace the built-in framing prompts.
    pub fn with_prompts(mut self, prompts: PromptSet) -> Self {
        self.prompts = Arc::new(prompts);
        self
    }

    pub fn with_retrieval(mut self, engine: RetrievalEngine) -> Self {
        self.retrieval = Some(Arc::new(engine));
        self
    }

    pub async fn run(&self, request: GenerationRequest) -> Result<PipelineOutput, PipelineError> {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    pub async fn run_with_cancel(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("verified_generation", %request_id);
        self.execute(request, cancel).instrument(span).await
    }

    async fn execute(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<PipelineOutput, PipelineError> {
        let guard = StageGuard {
            cancel,
            deadline: self.config.command_deadline().map(|d| Instant::now() + d),
        };
        request.policy.validate().map_err(PipelineError::InvalidConfig)?;

        let values: Vec<(&str, &str)> = request
            .prompt_values
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let task = request.task_prompt.render(&values)?;

        // ── Planning ─────────────────────────────────────────
        let planned: Vec<Document> = request
            .documents
            .iter()
            .filter(|d| d.role == DocumentRole::Primary || request.grounding.is_none())
            .cloned()
            .collect();
        let chunks = ChunkPlanner::from_config(&self.config.chunking)?.plan(&planned)?;
        self.events.emit(PipelineEvent::Planned { chunks: chunks.len() });
        tracing::info!(
            documents = planned.len(),
            chunks = chunks.len(),
            mode = ?request.policy.mode,
            max_attempts = request.policy.max_attempts,
            "Request planned"
        );

        // ── Retrieval ────────────────────────────────────────
        let mut warnings = Vec::new();
        let grounding = match &request.grounding {
            Some(grounding) => {
                self.ground(grounding, &request.documents, &task, &guard, &mut warnings)
                    .await?
            }
            None => Vec::new(),
        };

        let ctx = TaskContext {
            task,
            target_format: request.target_format.clone(),
            grounding,
        };

        // ── Chunk processing ─────────────────────────────────
        let processor = ChunkProcessor::new(
            self.gateway.clone(),
            self.prompts.clone(),
            self.call_settings(&self.config.models.generation_model),
            self.config.concurrency.max_concurrent_chunks,
            self.events.clone(),
        );
        let partials = guard
            .run(Stage::ChunkProcessing, processor.process_all(&chunks, &ctx))
            .await??;

        // ── Consolidate / verify / regenerate ────────────────
        let runner = StageRunner {
            consolidator: Consolidator::new(
                self.gateway.clone(),
                self.prompts.clone(),
                self.call_settings(&self.config.models.consolidation_model),
            ),
            verifier: self.verifier.clone(),
            partials: &partials,
            ctx: &ctx,
            guard: &guard,
        };
        let controller = RegenerationController::new(request.policy, self.events.clone())?;
        let outcome = controller.run(&runner).await?;

        let Some(last) = outcome.attempts.last().cloned() else {
            return Err(PipelineError::InvalidInput("no generation attempt was recorded".into()));
        };

        let mut usage = Usage::default();
        for partial in &partials {
            usage += partial.usage;
        }
        for attempt in &outcome.attempts {
            usage += attempt.consolidated_result.usage;
        }

        warnings.extend(last.verification_report.warnings());
        let status = match outcome.verdict {
            Verdict::Accepted => OutcomeStatus::Accepted,
            _ => OutcomeStatus::Failed,
        };

        tracing::info!(
            ?status,
            attempts = outcome.attempts.len(),
            warnings = warnings.len(),
            total_tokens = usage.total(),
            "Request finished"
        );

        Ok(PipelineOutput {
            status,
            result: last.consolidated_result,
            report: last.verification_report,
            attempts: outcome.attempts,
            warnings,
            usage,
        })
    }

    fn call_settings(&self, model_id: &str) -> CallSettings {
        CallSettings {
            model_id: model_id.to_string(),
            temperature: self.config.models.temperature,
            max_tokens: self.config.models.max_tokens,
        }
    }

    /// Retrieve grounding passages, applying the request's failure policy.
    async fn ground(
        &self,
        grounding: &GroundingRequest,
        documents: &[Document],
        task: &str,
        guard: &StageGuard,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<String>, PipelineError> {
        let result = match &self.retrieval {
            Some(engine) => {
                guard
                    .run(Stage::Retrieval, retrieve(engine, grounding, documents, task))
                    .await?
            }
            None => Err(RetrievalError::NotConfigured),
        };

        match (result, grounding.policy) {
            (Ok(passages), _) => Ok(passages),
            (Err(e), GroundingPolicy::Required) => {
                tracing::error!(corpus_id = %grounding.corpus_id, error = %e, "Required grounding failed");
                Err(PipelineError::RetrievalUnavailable(e))
            }
            (Err(e), GroundingPolicy::BestEffort) => {
                tracing::warn!(corpus_id = %grounding.corpus_id, error = %e, "Continuing without grounding");
                warnings.push(format!("grounding unavailable: {e}"));
                Ok(Vec::new())
            }
        }
    }
}

async fn retrieve(
    engine: &RetrievalEngine,
    grounding: &GroundingRequest,
    documents: &[Document],
    task: &str,
) -> Result<Vec<String>, RetrievalError> {
    let passages = if grounding.passages.is_empty() {
        engine.passages_from_documents(documents)?
    } else {
        grounding.passages.clone()
    };
    if !passages.is_empty() {
        engine.index_corpus(&grounding.corpus_id, &passages).await?;
    }

    let query = if grounding.query.trim().is_empty() {
        task
    } else {
        grounding.query.as_str()
    };
    let selected = engine
        .retrieve(query, &grounding.corpus_id, grounding.top_k, grounding.diversity)
        .await?;
    Ok(selected.into_iter().map(|s| s.passage.text).collect())
}

/// One request's attempt halves: re-consolidate the fixed partials, then
/// extract and verify citations.
struct StageRunner<'a> {
    consolidator: Consolidator,
    verifier: Arc<CitationVerifier>,
    partials: &'a [PartialResult],
    ctx: &'a TaskContext,
    guard: &'a StageGuard,
}

#[async_trait::async_trait]
impl AttemptRunner for StageRunner<'_> {
    async fn generate(&self, attempt: u32, avoid: &[String]) -> Result<ConsolidatedResult, PipelineError> {
        tracing::debug!(attempt, "Consolidating");
        self.guard
            .run_attempt(
                Stage::Consolidation,
                Some(attempt),
                self.consolidator.consolidate(self.partials, self.ctx, avoid),
            )
            .await?
            .map_err(|source| PipelineError::Consolidation { attempt, source })
    }

    async fn verify(&self, attempt: u32, result: &ConsolidatedResult) -> Result<VerificationReport, PipelineError> {
        let citations = extract(&result.content);
        tracing::debug!(attempt, citations = citations.len(), "Extracted citations");
        self.guard
            .run_attempt(
                Stage::Verification,
                Some(attempt),
                self.verifier.verify_all(&citations),
            )
            .await
    }
}
