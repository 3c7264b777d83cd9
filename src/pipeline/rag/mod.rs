//! Retrieval-augmented grounding: embed, index, retrieve diverse passages.

pub mod types;
pub mod vectordb;
pub mod retrieval;

pub use types::*;
pub use vectordb::InMemoryVectorIndex;
pub use retrieval::{mmr_select, RetrievalEngine};

use thiserror::Error;

use super::gateway::GatewayError;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("Embedding generation failed: {0}")]
    Embedding(#[from] GatewayError),

    #[error("Embedding dimension mismatch: index expects {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Embedding model returned {received} vectors for {sent} texts")]
    EmbeddingCount { sent: usize, received: usize },

    #[error("Corpus not indexed: {0}")]
    UnknownCorpus(String),

    #[error("Invalid retrieval parameters: {0}")]
    InvalidParameters(String),

    #[error("No retrieval engine configured")]
    NotConfigured,
}
