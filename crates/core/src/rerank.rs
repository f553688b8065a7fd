use crate::models::{ChatMessage, ChunkMetadata};
use crate::traits::LanguageModel;
use crate::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::warn;

const RELEVANCE_PROMPT: &str = "You rate how relevant a passage from a shareholder letter is to a question. \
Reply with a single number between 0 and 1, where 0 means unrelated and 1 means it answers the question directly. \
Reply with the number only.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RerankWeights {
    pub semantic: f64,
    pub vector: f64,
    pub position: f64,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self {
            semantic: 0.6,
            vector: 0.3,
            position: 0.1,
        }
    }
}

impl RerankWeights {
    pub fn combine(&self, semantic: f64, vector: f64, position: f64) -> f64 {
        self.semantic * semantic + self.vector * vector + self.position * position
    }
}

#[derive(Debug, Clone)]
pub struct RerankCandidate {
    pub id: String,
    pub metadata: ChunkMetadata,
    /// Zero-based rank in the vector search result.
    pub vector_rank: usize,
    pub semantic_score: f64,
    pub vector_score: f64,
    pub position_score: f64,
}

#[derive(Debug, Clone)]
pub struct RankedCandidate {
    pub candidate: RerankCandidate,
    pub score: f64,
}

/// Favours chunks near the start of their letter: strictly decreasing in
/// both page number and the chunk's position on the page.
pub fn position_score(page_number: u32, ordinal: u32) -> f64 {
    1.0 / (f64::from(page_number.max(1)) + 0.1 * f64::from(ordinal))
}

/// Orders candidates by weighted score; ties fall back to vector rank, then
/// to insertion order in the index.
pub fn rerank(candidates: Vec<RerankCandidate>, weights: &RerankWeights, top_k: usize) -> Vec<RankedCandidate> {
    let mut ranked: Vec<RankedCandidate> = candidates
        .into_iter()
        .map(|candidate| RankedCandidate {
            score: weights.combine(
                candidate.semantic_score,
                candidate.vector_score,
                candidate.position_score,
            ),
            candidate,
        })
        .collect();

    ranked.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.candidate.vector_rank.cmp(&right.candidate.vector_rank))
            .then_with(|| {
                left.candidate
                    .metadata
                    .sequence
                    .cmp(&right.candidate.metadata.sequence)
            })
    });
    ranked.truncate(top_k);
    ranked
}

#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// One score in `0.0..=1.0` per passage, index-aligned with `passages`.
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, LlmError>;
}

/// Asks the reranking model tier to grade each passage.
pub struct LlmRelevanceScorer {
    model: Arc<dyn LanguageModel>,
}

impl LlmRelevanceScorer {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl RelevanceScorer for LlmRelevanceScorer {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, LlmError> {
        let mut tasks = JoinSet::new();
        for (position, passage) in passages.iter().enumerate() {
            let model = Arc::clone(&self.model);
            let messages = vec![
                ChatMessage::system(RELEVANCE_PROMPT),
                ChatMessage::user(format!("Question: {query}\n\nPassage:\n{passage}")),
            ];
            tasks.spawn(async move { (position, model.complete(&messages).await) });
        }

        let mut scores = vec![0.0; passages.len()];
        while let Some(joined) = tasks.join_next().await {
            let (position, reply) = joined.map_err(|error| LlmError::Config(error.to_string()))?;
            let reply = reply?;
            scores[position] = parse_relevance(&reply).unwrap_or_else(|| {
                warn!(reply = %reply, "unparseable relevance score, using 0");
                0.0
            });
        }

        Ok(scores)
    }
}

fn parse_relevance(reply: &str) -> Option<f64> {
    reply
        .split(|ch: char| !(ch.is_ascii_digit() || ch == '.'))
        .filter(|token| !token.is_empty())
        .find_map(|token| token.parse::<f64>().ok())
        .map(|value| value.clamp(0.0, 1.0))
}

/// Fraction of the query's terms found in the passage. Works without a model.
#[derive(Debug, Clone, Copy, Default)]
pub struct TermOverlapScorer;

pub fn query_terms(query: &str) -> Vec<String> {
    let mut terms: Vec<String> = query
        .split(|ch: char| !ch.is_alphanumeric())
        .map(str::to_lowercase)
        .filter(|token| token.chars().count() > 2)
        .collect();
    terms.sort();
    terms.dedup();
    terms
}

#[async_trait]
impl RelevanceScorer for TermOverlapScorer {
    async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f64>, LlmError> {
        let terms = query_terms(query);
        if terms.is_empty() {
            return Ok(vec![0.0; passages.len()]);
        }

        Ok(passages
            .iter()
            .map(|passage| {
                let lowered = passage.to_lowercase();
                let found = terms.iter().filter(|term| lowered.contains(term.as_str())).count();
                found as f64 / terms.len() as f64
            })
            .collect())
    }
}
