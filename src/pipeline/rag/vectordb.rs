use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::types::{Candidate, IndexEntry, VectorIndex};
use super::RetrievalError;

/// In-memory vector index. One entry list per corpus behind a single
/// `RwLock`; queries take the read lock only.
pub struct InMemoryVectorIndex {
    dimension: usize,
    corpora: RwLock<HashMap<String, Vec<IndexEntry>>>,
}

impl InMemoryVectorIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            corpora: RwLock::new(HashMap::new()),
        }
    }

    pub async fn count(&self, corpus_id: &str) -> usize {
        self.corpora
            .read()
            .await
            .get(corpus_id)
            .map_or(0, |entries| entries.len())
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), RetrievalError> {
        if vector.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, corpus_id: &str, entries: Vec<IndexEntry>) -> Result<usize, RetrievalError> {
        for entry in &entries {
            self.check_dimension(&entry.vector)?;
        }

        let mut corpora = self.corpora.write().await;
        let corpus = corpora.entry(corpus_id.to_string()).or_default();
        let mut inserted = 0;
        for entry in entries {
            if corpus.iter().any(|e| e.passage.id == entry.passage.id) {
                continue;
            }
            corpus.push(entry);
            inserted += 1;
        }

        tracing::debug!(corpus_id, inserted, total = corpus.len(), "Upserted passages");
        Ok(inserted)
    }

    async fn query(&self, corpus_id: &str, vector: &[f32], top_k: usize) -> Result<Vec<Candidate>, RetrievalError> {
        self.check_dimension(vector)?;

        let corpora = self.corpora.read().await;
        let corpus = corpora
            .get(corpus_id)
            .ok_or_else(|| RetrievalError::UnknownCorpus(corpus_id.to_string()))?;

        let mut scored: Vec<Candidate> = corpus
            .iter()
            .map(|entry| Candidate {
                passage: entry.passage.clone(),
                vector: entry.vector.clone(),
                relevance: cosine_similarity(vector, &entry.vector),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(top_k);
        Ok(scored)
    }

    async fn contains(&self, corpus_id: &str, passage_id: &str) -> bool {
        self.corpora
            .read()
            .await
            .get(corpus_id)
            .is_some_and(|entries| entries.iter().any(|e| e.passage.id == passage_id))
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::rag::types::Passage;

    fn entry(text: &str, vector: Vec<f32>) -> IndexEntry {
        IndexEntry {
            passage: Passage::new("doc", text),
            vector,
        }
    }

    #[test]
    fn cosine_similarity_identical_vectors() {
        let sim = cosine_similarity(&[1.0, 0.0, 0.0], &[1.0, 0.0, 0.0]);
        assert!((sim - 1.0).abs() < 0.01);
    }

    #[test]
    fn cosine_similarity_orthogonal_vectors() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 0.01);
    }

    #[test]
    fn cosine_similarity_zero_vector_is_zero() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn query_returns_top_k_by_similarity() {
        let index = InMemoryVectorIndex::new(3);
        index
            .upsert(
                "c",
                vec![
                    entry("lease", vec![1.0, 0.0, 0.0]),
                    entry("rent", vec![0.8, 0.6, 0.0]),
                    entry("garden", vec![0.0, 1.0, 0.0]),
                ],
            )
            .await
            .unwrap();

        let hits = index.query("c", &[1.0, 0.0, 0.0], 2).await.unwrap();
        let texts: Vec<&str> = hits.iter().map(|h| h.passage.text.as_str()).collect();
        assert_eq!(texts, vec!["lease", "rent"]);
    }

    #[tokio::test]
    async fn existing_passages_are_skipped() {
        let index = InMemoryVectorIndex::new(2);
        assert_eq!(index.upsert("c", vec![entry("a", vec![1.0, 0.0])]).await.unwrap(), 1);
        assert_eq!(
            index
                .upsert("c", vec![entry("a", vec![1.0, 0.0]), entry("b", vec![0.0, 1.0])])
                .await
                .unwrap(),
            1
        );
        assert_eq!(index.count("c").await, 2);
        assert!(index.contains("c", &Passage::new("x", "a").id).await);
    }

    #[tokio::test]
    async fn corpora_are_isolated() {
        let index = InMemoryVectorIndex::new(2);
        index.upsert("one", vec![entry("a", vec![1.0, 0.0])]).await.unwrap();
        index.upsert("two", vec![entry("b", vec![1.0, 0.0])]).await.unwrap();

        let hits = index.query("two", &[1.0, 0.0], 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].passage.text, "b");
        assert!(matches!(
            index.query("three", &[1.0, 0.0], 10).await,
            Err(RetrievalError::UnknownCorpus(_))
        ));
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_rejected() {
        let index = InMemoryVectorIndex::new(3);
        assert!(matches!(
            index.upsert("c", vec![entry("a", vec![1.0, 0.0])]).await,
            Err(RetrievalError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(index.count("c").await, 0);

        index.upsert("c", vec![entry("a", vec![1.0, 0.0, 0.0])]).await.unwrap();
        assert!(matches!(
            index.query("c", &[1.0; 4], 1).await,
            Err(RetrievalError::DimensionMismatch { expected: 3, actual: 4 })
        ));
    }
}
