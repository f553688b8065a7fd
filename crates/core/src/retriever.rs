use crate::embeddings::Embedder;
use crate::models::{ChunkMetadata, Citation, RetrievedChunk, DEFAULT_INDEX_NAME};
use crate::rerank::{position_score, rerank, RelevanceScorer, RerankCandidate, RerankWeights};
use crate::store::{QueryFilter, StoreHit};
use crate::traits::IndexStore;
use crate::{EmbeddingError, RetrievalError, StoreError};
use std::sync::Arc;
use tracing::debug;

/// Reranked score a passage needs before it is handed to the agent.
pub const DEFAULT_MIN_SCORE: f64 = 0.3;

#[derive(Debug, Clone)]
pub struct RetrieverOptions {
    pub index_name: String,
    /// Candidates fetched from the index before reranking.
    pub candidate_pool: usize,
    pub top_k: usize,
    pub weights: RerankWeights,
    pub filter: QueryFilter,
    /// Reranked candidates scoring below this are dropped.
    pub min_score: f64,
}

impl Default for RetrieverOptions {
    fn default() -> Self {
        Self {
            index_name: DEFAULT_INDEX_NAME.to_string(),
            candidate_pool: 20,
            top_k: 3,
            weights: RerankWeights::default(),
            filter: QueryFilter::default(),
            min_score: DEFAULT_MIN_SCORE,
        }
    }
}

/// Embeds `text` and returns the nearest records. Shared by chunk retrieval
/// and conversation recall.
pub async fn vector_search(
    embedder: &dyn Embedder,
    store: &dyn IndexStore,
    index_name: &str,
    text: &str,
    top_k: usize,
    filter: &QueryFilter,
) -> Result<Vec<StoreHit>, RetrievalError> {
    let query_vector = embedder.embed(text).await?;
    if query_vector.len() != embedder.dimensions() {
        return Err(RetrievalError::Embedding(EmbeddingError::DimensionMismatch {
            expected: embedder.dimensions(),
            actual: query_vector.len(),
        }));
    }

    Ok(store.query(index_name, &query_vector, top_k, filter).await?)
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    store: Arc<dyn IndexStore>,
    scorer: Arc<dyn RelevanceScorer>,
    options: RetrieverOptions,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        store: Arc<dyn IndexStore>,
        scorer: Arc<dyn RelevanceScorer>,
        options: RetrieverOptions,
    ) -> Self {
        Self {
            embedder,
            store,
            scorer,
            options,
        }
    }

    pub fn options(&self) -> &RetrieverOptions {
        &self.options
    }

    pub async fn query(&self, text: &str) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        self.query_with_filter(text, &self.options.filter).await
    }

    pub async fn query_with_filter(
        &self,
        text: &str,
        filter: &QueryFilter,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RetrievalError::EmptyQuery);
        }

        let hits = vector_search(
            self.embedder.as_ref(),
            self.store.as_ref(),
            &self.options.index_name,
            text,
            self.options.candidate_pool,
            filter,
        )
        .await?;
        if hits.is_empty() {
            debug!(query = text, "no candidates in index");
            return Ok(Vec::new());
        }

        let mut candidates = Vec::with_capacity(hits.len());
        for (vector_rank, hit) in hits.into_iter().enumerate() {
            let metadata = ChunkMetadata::from_map(&hit.metadata).map_err(StoreError::from)?;
            candidates.push(RerankCandidate {
                position_score: position_score(metadata.page_number, metadata.ordinal),
                id: hit.id,
                metadata,
                vector_rank,
                semantic_score: 0.0,
                vector_score: hit.score,
            });
        }

        let passages: Vec<String> = candidates
            .iter()
            .map(|candidate| candidate.metadata.text.clone())
            .collect();
        let semantic = self.scorer.score(text, &passages).await?;
        for (candidate, score) in candidates.iter_mut().zip(semantic) {
            candidate.semantic_score = score;
        }

        let pool = candidates.len();
        let ranked = rerank(candidates, &self.options.weights, self.options.top_k);
        let results: Vec<RetrievedChunk> = ranked
            .into_iter()
            .filter(|ranked| ranked.score >= self.options.min_score)
            .map(|ranked| {
                let candidate = ranked.candidate;
                RetrievedChunk {
                    id: candidate.id,
                    citation: Citation {
                        file_name: candidate.metadata.file_name,
                        year: candidate.metadata.year_of_publish,
                        page_number: candidate.metadata.page_number,
                    },
                    text: candidate.metadata.text,
                    heading_path: candidate.metadata.heading_path,
                    score: ranked.score,
                    semantic_score: candidate.semantic_score,
                    vector_score: candidate.vector_score,
                    position_score: candidate.position_score,
                }
            })
            .collect();

        debug!(query = text, pool, returned = results.len(), "reranked candidates");
        Ok(results)
    }
}
