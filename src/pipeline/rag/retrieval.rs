//! Retrieval engine: embeds through the gateway, stores in a [`VectorIndex`],
//! re-ranks nearest neighbours with maximal marginal relevance.

use std::collections::HashSet;
use std::sync::Arc;

use super::types::{Candidate, IndexEntry, Passage, ScoredPassage, VectorIndex};
use super::vectordb::cosine_similarity;
use super::RetrievalError;
use crate::pipeline::chunker::ChunkPlanner;
use crate::pipeline::events::{EventSink, PipelineEvent};
use crate::pipeline::gateway::LlmGateway;
use crate::pipeline::types::{Document, DocumentRole};
use crate::pipeline_config::PipelineConfig;

const DIMENSION_PROBE: &str = "dimension probe";

pub struct RetrievalEngine {
    gateway: Arc<dyn LlmGateway>,
    index: Arc<dyn VectorIndex>,
    embedding_model: String,
    candidate_multiplier: usize,
    splitter: ChunkPlanner,
    events: EventSink,
}

impl RetrievalEngine {
    /// Build the engine after checking the index and the embedding model
    /// both match the configured dimension.
    pub async fn connect(
        gateway: Arc<dyn LlmGateway>,
        index: Arc<dyn VectorIndex>,
        config: &PipelineConfig,
        events: EventSink,
    ) -> Result<Self, RetrievalError> {
        let configured = config.retrieval.embedding_dimension;
        if index.dimension() != configured {
            tracing::error!(
                configured,
                index = index.dimension(),
                "Vector index dimension does not match configuration"
            );
            return Err(RetrievalError::DimensionMismatch {
                expected: configured,
                actual: index.dimension(),
            });
        }

        let embedding_model = config.models.embedding_model.clone();
        let probe = gateway
            .embed(&embedding_model, &[DIMENSION_PROBE.to_string()])
            .await?;
        let actual = probe.first().map_or(0, |v| v.len());
        if actual != index.dimension() {
            tracing::error!(
                model = %embedding_model,
                expected = index.dimension(),
                actual,
                "Embedding model dimension does not match index"
            );
            return Err(RetrievalError::DimensionMismatch {
                expected: index.dimension(),
                actual,
            });
        }

        let splitter = ChunkPlanner::new(
            config.retrieval.passage_chars,
            config.retrieval.passage_overlap_chars,
        )
        .map_err(|e| RetrievalError::InvalidParameters(e.to_string()))?;

        tracing::info!(model = %embedding_model, dimension = actual, "Retrieval engine connected");
        Ok(Self {
            gateway,
            index,
            embedding_model,
            candidate_multiplier: config.retrieval.candidate_multiplier.max(1),
            splitter,
            events,
        })
    }

    /// Embed and store passages not already in the corpus. One embedding
    /// call covers every new passage. Returns the number inserted.
    pub async fn index_corpus(&self, corpus_id: &str, passages: &[Passage]) -> Result<usize, RetrievalError> {
        let mut seen = HashSet::new();
        let mut fresh: Vec<&Passage> = Vec::new();
        for passage in passages {
            if !seen.insert(passage.id.as_str()) {
                continue;
            }
            if self.index.contains(corpus_id, &passage.id).await {
                continue;
            }
            fresh.push(passage);
        }

        if fresh.is_empty() {
            tracing::debug!(corpus_id, "Corpus already indexed");
            return Ok(0);
        }

        let texts: Vec<String> = fresh.iter().map(|p| p.text.clone()).collect();
        let vectors = self.gateway.embed(&self.embedding_model, &texts).await?;
        if vectors.len() != texts.len() {
            return Err(RetrievalError::EmbeddingCount {
                sent: texts.len(),
                received: vectors.len(),
            });
        }

        let entries = fresh
            .into_iter()
            .zip(vectors)
            .map(|(passage, vector)| IndexEntry {
                passage: passage.clone(),
                vector,
            })
            .collect();

        let inserted = self.index.upsert(corpus_id, entries).await?;
        tracing::info!(corpus_id, inserted, "Indexed corpus passages");
        Ok(inserted)
    }

    /// Split supporting-role documents into passages. Primary documents are
    /// the generation input and are never indexed.
    pub fn passages_from_documents(&self, documents: &[Document]) -> Result<Vec<Passage>, RetrievalError> {
        let mut passages = Vec::new();
        for doc in documents.iter().filter(|d| d.role == DocumentRole::Supporting) {
            if doc.text.trim().is_empty() {
                continue;
            }
            let chunks = self
                .splitter
                .plan(std::slice::from_ref(doc))
                .map_err(|e| RetrievalError::InvalidParameters(e.to_string()))?;
            passages.extend(chunks.into_iter().map(|c| Passage::new(doc.source_id.clone(), c.text)));
        }
        Ok(passages)
    }

    /// `top_k` passages balancing relevance against redundancy.
    ///
    /// `diversity` is in `[0, 1]`: 0 ranks purely by relevance, 1 purely by
    /// dissimilarity to what is already selected.
    pub async fn retrieve(
        &self,
        query: &str,
        corpus_id: &str,
        top_k: usize,
        diversity: f32,
    ) -> Result<Vec<ScoredPassage>, RetrievalError> {
        if top_k == 0 {
            return Err(RetrievalError::InvalidParameters("top_k must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&diversity) {
            return Err(RetrievalError::InvalidParameters(format!(
                "diversity must be in [0, 1], got {diversity}"
            )));
        }

        let mut vectors = self
            .gateway
            .embed(&self.embedding_model, &[query.to_string()])
            .await?;
        let query_vector = vectors.pop().ok_or(RetrievalError::EmbeddingCount {
            sent: 1,
            received: 0,
        })?;

        let candidates = self
            .index
            .query(corpus_id, &query_vector, top_k.saturating_mul(self.candidate_multiplier))
            .await?;
        let candidate_count = candidates.len();
        let selected = mmr_select(candidates, top_k, 1.0 - diversity);

        tracing::info!(
            corpus_id,
            candidates = candidate_count,
            selected = selected.len(),
            diversity,
            "Retrieved grounding passages"
        );
        self.events.emit(PipelineEvent::Retrieved {
            corpus_id: corpus_id.to_string(),
            passages: selected.len(),
        });
        Ok(selected)
    }
}

/// Maximal marginal relevance selection.
///
/// Starts from the most relevant candidate, then repeatedly picks
/// `argmax λ·relevance − (1−λ)·max_similarity_to_selected`. Ties go to the
/// earlier (more relevant) candidate.
pub fn mmr_select(mut candidates: Vec<Candidate>, top_k: usize, lambda: f32) -> Vec<ScoredPassage> {
    candidates.sort_by(|a, b| {
        b.relevance
            .partial_cmp(&a.relevance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut selected: Vec<Candidate> = Vec::with_capacity(top_k.min(candidates.len()));
    while selected.len() < top_k && !candidates.is_empty() {
        let mut best = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (i, candidate) in candidates.iter().enumerate() {
            let redundancy = selected
                .iter()
                .map(|s| cosine_similarity(&candidate.vector, &s.vector))
                .fold(0.0_f32, f32::max);
            let score = if selected.is_empty() {
                candidate.relevance
            } else {
                lambda * candidate.relevance - (1.0 - lambda) * redundancy
            };
            if score > best_score {
                best = i;
                best_score = score;
            }
        }
        selected.push(candidates.remove(best));
    }

    selected
        .into_iter()
        .map(|c| ScoredPassage {
            passage: c.passage,
            relevance: c.relevance,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::gateway::{GatewayError, MockGateway};
    use crate::pipeline::rag::InMemoryVectorIndex;

    /// Scenario vectors: A and A' nearly identical, B and C equally relevant
    /// but pointing in different directions.
    fn scenario_vector(text: &str) -> Vec<f32> {
        match text {
            "A" => vec![1.0, 0.0, 0.0],
            "A'" => vec![0.99, 0.14, 0.0],
            "B" => vec![0.6, 0.8, 0.0],
            "C" => vec![0.6, 0.0, 0.8],
            _ => vec![1.0, 0.0, 0.0],
        }
    }

    fn config(dimension: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.retrieval.embedding_dimension = dimension;
        config.retrieval.passage_chars = 40;
        config.retrieval.passage_overlap_chars = 0;
        config
    }

    async fn engine(mock: Arc<MockGateway>) -> RetrievalEngine {
        let index = Arc::new(InMemoryVectorIndex::new(3));
        RetrievalEngine::connect(mock, index, &config(3), EventSink::disabled())
            .await
            .unwrap()
    }

    fn passages(texts: &[&str]) -> Vec<Passage> {
        texts.iter().map(|t| Passage::new("support", *t)).collect()
    }

    fn texts(selected: &[ScoredPassage]) -> Vec<&str> {
        selected.iter().map(|s| s.passage.text.as_str()).collect()
    }

    #[tokio::test]
    async fn diversity_trades_relevance_for_coverage() {
        let mock = Arc::new(MockGateway::echo().with_embedder(scenario_vector));
        let engine = engine(mock).await;
        engine
            .index_corpus("law", &passages(&["A", "A'", "B", "C"]))
            .await
            .unwrap();

        let relevant = engine.retrieve("query", "law", 2, 0.0).await.unwrap();
        assert_eq!(texts(&relevant), vec!["A", "A'"]);

        let diverse = engine.retrieve("query", "law", 2, 1.0).await.unwrap();
        assert_eq!(texts(&diverse), vec!["A", "B"]);

        let three = engine.retrieve("query", "law", 3, 1.0).await.unwrap();
        assert_eq!(texts(&three), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn connect_rejects_dimension_mismatch() {
        let mock = Arc::new(MockGateway::echo().with_embedder(|_: &str| vec![0.5; 4]));
        let index = Arc::new(InMemoryVectorIndex::new(3));
        let result = RetrievalEngine::connect(mock, index, &config(3), EventSink::disabled()).await;
        assert!(matches!(
            result,
            Err(RetrievalError::DimensionMismatch { expected: 3, actual: 4 })
        ));
    }

    #[tokio::test]
    async fn connect_rejects_index_not_matching_configuration() {
        let mock = Arc::new(MockGateway::echo().with_embedder(scenario_vector));
        let index = Arc::new(InMemoryVectorIndex::new(3));
        let result = RetrievalEngine::connect(
            mock.clone(),
            index,
            &PipelineConfig::default(),
            EventSink::disabled(),
        )
        .await;
        assert!(matches!(
            result,
            Err(RetrievalError::DimensionMismatch { expected: 768, actual: 3 })
        ));
        assert_eq!(mock.embed_call_count(), 0);
    }

    #[tokio::test]
    async fn huge_top_k_returns_whole_corpus() {
        let mock = Arc::new(MockGateway::echo().with_embedder(scenario_vector));
        let engine = engine(mock).await;
        engine
            .index_corpus("law", &passages(&["A", "B", "C"]))
            .await
            .unwrap();

        let selected = engine.retrieve("query", "law", usize::MAX / 2, 0.0).await.unwrap();
        assert_eq!(selected.len(), 3);
    }

    #[tokio::test]
    async fn connect_surfaces_embedding_failure() {
        let mock = Arc::new(MockGateway::echo());
        let index = Arc::new(InMemoryVectorIndex::new(3));
        let result = RetrievalEngine::connect(mock, index, &config(3), EventSink::disabled()).await;
        assert!(matches!(
            result,
            Err(RetrievalError::Embedding(GatewayError::InvalidResponse(_)))
        ));
    }

    #[tokio::test]
    async fn indexing_embeds_each_passage_once() {
        let mock = Arc::new(MockGateway::echo().with_embedder(scenario_vector));
        let engine = engine(mock.clone()).await;
        let probe_calls = mock.embed_call_count();

        let corpus = passages(&["A", "B", "A"]);
        assert_eq!(engine.index_corpus("law", &corpus).await.unwrap(), 2);
        assert_eq!(mock.embed_call_count(), probe_calls + 1);

        assert_eq!(engine.index_corpus("law", &corpus).await.unwrap(), 0);
        assert_eq!(mock.embed_call_count(), probe_calls + 1);
    }

    #[tokio::test]
    async fn retrieve_emits_event_and_validates_parameters() {
        let mock = Arc::new(MockGateway::echo().with_embedder(scenario_vector));
        let (events, mut rx) = EventSink::channel();
        let index = Arc::new(InMemoryVectorIndex::new(3));
        let engine = RetrievalEngine::connect(mock, index, &config(3), events)
            .await
            .unwrap();
        engine.index_corpus("law", &passages(&["A", "B"])).await.unwrap();

        engine.retrieve("query", "law", 5, 0.5).await.unwrap();
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::Retrieved {
                corpus_id: "law".into(),
                passages: 2
            }
        );

        assert!(matches!(
            engine.retrieve("query", "law", 0, 0.5).await,
            Err(RetrievalError::InvalidParameters(_))
        ));
        assert!(matches!(
            engine.retrieve("query", "law", 1, 1.5).await,
            Err(RetrievalError::InvalidParameters(_))
        ));
        assert!(matches!(
            engine.retrieve("query", "missing", 1, 0.5).await,
            Err(RetrievalError::UnknownCorpus(_))
        ));
    }

    #[tokio::test]
    async fn only_supporting_documents_become_passages() {
        let mock = Arc::new(MockGateway::echo().with_embedder(scenario_vector));
        let engine = engine(mock).await;
        let docs = vec![
            Document::primary("claim.txt", "The primary text is never indexed."),
            Document::supporting(
                "statute.txt",
                "Section one applies to tenancies.\n\nSection two applies to licences.",
            ),
            Document::supporting("blank.txt", "   "),
        ];

        let passages = engine.passages_from_documents(&docs).unwrap();
        assert!(passages.len() >= 2);
        assert!(passages.iter().all(|p| p.source_id == "statute.txt"));
        assert!(passages.iter().all(|p| p.text.chars().count() <= 40));
        assert!(passages.iter().any(|p| p.text.contains("Section one")));
        assert!(passages.iter().any(|p| p.text.contains("Section two")));
    }

    #[test]
    fn mmr_with_lambda_one_is_relevance_order() {
        let candidates = ["C", "A", "B"]
            .iter()
            .map(|t| {
                let vector = scenario_vector(t);
                Candidate {
                    passage: Passage::new("s", *t),
                    relevance: cosine_similarity(&vector, &[1.0, 0.0, 0.0]),
                    vector,
                }
            })
            .collect();
        let picked = mmr_select(candidates, 2, 1.0);
        assert_eq!(picked[0].passage.text, "A");
        assert_eq!(picked.len(), 2);
    }
}
