use crate::error::ConfigError;
use crate::models::DEFAULT_INDEX_NAME;
use crate::rerank::RerankWeights;
use crate::retriever::{RetrieverOptions, DEFAULT_MIN_SCORE};
use crate::store::QueryFilter;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Agent surface, read from a camelCase JSON file. Missing keys keep their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentOptions {
    pub semantic_recall: SemanticRecallOptions,
    pub threads: ThreadOptions,
    /// Most recent thread messages replayed into every turn.
    pub last_messages: usize,
    pub reranker: RerankerOptions,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SemanticRecallOptions {
    pub top_k: usize,
    /// Neighbouring messages included around each recalled message.
    pub message_range: usize,
    pub scope: RecallScope,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecallScope {
    /// Every thread of the same resource.
    #[default]
    Resource,
    Thread,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct ThreadOptions {
    pub generate_title: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RerankerOptions {
    pub weights: RerankWeights,
    pub top_k: usize,
    pub candidate_pool: usize,
    /// Reranked passages scoring below this never reach the agent.
    pub min_score: f64,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            semantic_recall: SemanticRecallOptions::default(),
            threads: ThreadOptions::default(),
            last_messages: 10,
            reranker: RerankerOptions::default(),
        }
    }
}

impl Default for SemanticRecallOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            message_range: 4,
            scope: RecallScope::Resource,
        }
    }
}

impl Default for ThreadOptions {
    fn default() -> Self {
        Self {
            generate_title: true,
        }
    }
}

impl Default for RerankerOptions {
    fn default() -> Self {
        Self {
            weights: RerankWeights::default(),
            top_k: 3,
            candidate_pool: 20,
            min_score: DEFAULT_MIN_SCORE,
        }
    }
}

impl AgentOptions {
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(content)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let reranker = &self.reranker;
        if reranker.top_k == 0 {
            return Err(ConfigError::Invalid("reranker.topK must be positive".to_string()));
        }
        if reranker.candidate_pool < reranker.top_k {
            return Err(ConfigError::Invalid(format!(
                "reranker.candidatePool ({}) is smaller than reranker.topK ({})",
                reranker.candidate_pool, reranker.top_k
            )));
        }
        if !reranker.min_score.is_finite() || reranker.min_score < 0.0 {
            return Err(ConfigError::Invalid(format!(
                "reranker.minScore ({}) must be finite and non-negative",
                reranker.min_score
            )));
        }

        let weights = reranker.weights;
        let all = [weights.semantic, weights.vector, weights.position];
        if all.iter().any(|weight| !weight.is_finite() || *weight < 0.0) {
            return Err(ConfigError::Invalid(
                "reranker weights must be finite and non-negative".to_string(),
            ));
        }
        if all.iter().sum::<f64>() <= 0.0 {
            return Err(ConfigError::Invalid(
                "reranker weights must not all be zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn retriever_options(&self, index_name: Option<&str>) -> RetrieverOptions {
        RetrieverOptions {
            index_name: index_name.unwrap_or(DEFAULT_INDEX_NAME).to_string(),
            candidate_pool: self.reranker.candidate_pool,
            top_k: self.reranker.top_k,
            weights: self.reranker.weights,
            filter: QueryFilter::default(),
            min_score: self.reranker.min_score,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_the_deployed_agent() {
        let options = AgentOptions::default();
        assert_eq!(options.semantic_recall.top_k, 3);
        assert_eq!(options.semantic_recall.message_range, 4);
        assert_eq!(options.semantic_recall.scope, RecallScope::Resource);
        assert!(options.threads.generate_title);
        assert_eq!(options.reranker.candidate_pool, 20);
        assert_eq!(options.reranker.weights, RerankWeights::default());
        assert_eq!(options.reranker.min_score, DEFAULT_MIN_SCORE);
    }

    #[test]
    fn partial_json_keeps_remaining_defaults() {
        let options = AgentOptions::from_json(
            r#"{"semanticRecall": {"scope": "thread"}, "lastMessages": 4, "reranker": {"topK": 5}}"#,
        )
        .expect("valid options");

        assert_eq!(options.semantic_recall.scope, RecallScope::Thread);
        assert_eq!(options.semantic_recall.top_k, 3);
        assert_eq!(options.last_messages, 4);
        assert_eq!(options.reranker.top_k, 5);
        assert_eq!(options.reranker.candidate_pool, 20);
        assert!(options.threads.generate_title);
    }

    #[test]
    fn weights_are_read_from_camel_case_keys() {
        let options = AgentOptions::from_json(
            r#"{"reranker": {"weights": {"semantic": 0.5, "vector": 0.5, "position": 0.0}}, "threads": {"generateTitle": false}}"#,
        )
        .expect("valid options");

        assert_eq!(options.reranker.weights.semantic, 0.5);
        assert_eq!(options.reranker.weights.position, 0.0);
        assert!(!options.threads.generate_title);
    }

    #[test]
    fn invalid_reranker_settings_are_rejected() {
        let pool = AgentOptions::from_json(r#"{"reranker": {"topK": 30, "candidatePool": 20}}"#);
        assert!(matches!(pool, Err(ConfigError::Invalid(_))));

        let weights = AgentOptions::from_json(
            r#"{"reranker": {"weights": {"semantic": -1.0, "vector": 0.3, "position": 0.1}}}"#,
        );
        assert!(matches!(weights, Err(ConfigError::Invalid(_))));

        let negative = AgentOptions::from_json(r#"{"reranker": {"minScore": -0.1}}"#);
        assert!(matches!(negative, Err(ConfigError::Invalid(_))));

        assert!(matches!(
            AgentOptions::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_file_and_builds_retriever_options() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"reranker": {{"candidatePool": 12, "topK": 4}}}}"#).expect("write");

        let options = AgentOptions::from_file(file.path()).expect("load");
        let retriever = options.retriever_options(None);
        assert_eq!(retriever.index_name, "papers");
        assert_eq!(retriever.candidate_pool, 12);
        assert_eq!(retriever.top_k, 4);
        assert_eq!(retriever.min_score, DEFAULT_MIN_SCORE);
    }

    #[test]
    fn min_score_reaches_the_retriever() {
        let options = AgentOptions::from_json(r#"{"reranker": {"minScore": 0.45}}"#).expect("valid options");
        assert_eq!(options.reranker.min_score, 0.45);
        assert_eq!(options.retriever_options(Some("letters")).min_score, 0.45);
    }
}
