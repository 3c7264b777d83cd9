use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::RetrievalError;

/// A unit of grounding text. The id is content-derived so re-indexing the
/// same text is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Passage {
    pub id: String,
    pub source_id: String,
    pub text: String,
}

impl Passage {
    pub fn new(source_id: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            id: passage_id(&text),
            source_id: source_id.into(),
            text,
        }
    }
}

/// Hex SHA-256 of the passage text.
pub fn passage_id(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub passage: Passage,
    pub vector: Vec<f32>,
}

/// Nearest-neighbour hit, carrying its vector for MMR re-ranking.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub passage: Passage,
    pub vector: Vec<f32>,
    /// Cosine similarity to the query.
    pub relevance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub relevance: f32,
}

/// Storage seam for embeddings, partitioned by corpus id.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    /// Insert entries whose passage id is not yet in the corpus.
    /// Returns the number actually inserted.
    async fn upsert(&self, corpus_id: &str, entries: Vec<IndexEntry>) -> Result<usize, RetrievalError>;

    /// Up to `top_k` entries ordered by decreasing cosine similarity.
    async fn query(&self, corpus_id: &str, vector: &[f32], top_k: usize) -> Result<Vec<Candidate>, RetrievalError>;

    async fn contains(&self, corpus_id: &str, passage_id: &str) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passage_id_is_content_hash() {
        let a = Passage::new("lease.txt", "The rent is payable monthly.");
        let b = Passage::new("other.txt", "The rent is payable monthly.");
        assert_eq!(a.id, b.id);
        assert_eq!(a.id.len(), 64);
        assert_ne!(a.id, Passage::new("lease.txt", "The rent is payable weekly.").id);
    }
}
