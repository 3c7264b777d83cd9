//! Verified generation pipeline.
//!
//! ```text
//! documents → chunker → processor (×N) → consolidate → citation extract
//!           → citation verify → regeneration → output
//! ```
//!
//! When grounding is requested, `rag` retrieves passages once before chunk
//! processing and both generation stages see them.

pub mod events;
pub mod gateway;
pub mod types;
pub mod prompt_templates;
pub mod chunker;
pub mod processor;
pub mod consolidate;
pub mod citation;
pub mod rag;
pub mod regeneration;
pub mod orchestrator;

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use consolidate::ConsolidationError;
use processor::ChunkError;
use prompt_templates::PromptError;
use rag::RetrievalError;

pub use events::{EventSink, PipelineEvent};
pub use orchestrator::{
    GenerationRequest, GroundingPolicy, GroundingRequest, OutcomeStatus, PipelineOutput,
    VerifiedPipeline,
};
pub use types::*;

/// Where in the pipeline an error arose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Configuration,
    Planning,
    Retrieval,
    ChunkProcessing,
    Consolidation,
    Verification,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configuration => "configuration",
            Self::Planning => "planning",
            Self::Retrieval => "retrieval",
            Self::ChunkProcessing => "chunk_processing",
            Self::Consolidation => "consolidation",
            Self::Verification => "verification",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Document {source_id} cannot be planned: {chars} chars of framing exceed max_chunk_chars {max_chunk_chars}")]
    DocumentTooLarge {
        source_id: String,
        chars: usize,
        max_chunk_chars: usize,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Prompt template error: {0}")]
    Prompt(#[from] PromptError),

    #[error("Chunk {} of {total} failed: {source}", .chunk_index + 1)]
    ChunkProcessing {
        chunk_index: usize,
        total: usize,
        source: ChunkError,
    },

    #[error("Attempt {attempt}: consolidation failed: {source}")]
    Consolidation {
        attempt: u32,
        source: ConsolidationError,
    },

    #[error("Retrieval unavailable: {0}")]
    RetrievalUnavailable(#[from] RetrievalError),

    #[error("Attempt {attempt} ended with unverified citations: {}", .citations.join("; "))]
    UnverifiedCitations { attempt: u32, citations: Vec<String> },

    /// `attempt` is set when the cancelled stage belongs to a generation
    /// attempt.
    #[error("Cancelled during {stage}{}", attempt_suffix(.attempt))]
    Cancelled { stage: Stage, attempt: Option<u32> },
}

fn attempt_suffix(attempt: &Option<u32>) -> String {
    attempt.map(|n| format!(" (attempt {n})")).unwrap_or_default()
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            Self::InvalidConfig(_) | Self::Prompt(_) => Stage::Configuration,
            Self::DocumentTooLarge { .. } | Self::InvalidInput(_) => Stage::Planning,
            Self::ChunkProcessing { .. } => Stage::ChunkProcessing,
            Self::Consolidation { .. } => Stage::Consolidation,
            Self::RetrievalUnavailable(_) => Stage::Retrieval,
            Self::UnverifiedCitations { .. } => Stage::Verification,
            Self::Cancelled { stage, .. } => *stage,
        }
    }

    /// The generation attempt the error belongs to, if any.
    pub fn attempt(&self) -> Option<u32> {
        match self {
            Self::Consolidation { attempt, .. } | Self::UnverifiedCitations { attempt, .. } => {
                Some(*attempt)
            }
            Self::Cancelled { attempt, .. } => *attempt,
            _ => None,
        }
    }
}
