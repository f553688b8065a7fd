//! OpenAI-compatible HTTP clients for embeddings and chat completions.

use crate::embeddings::{validate_embeddings, Embedder};
use crate::error::{EmbeddingError, LlmError};
use crate::models::ChatMessage;
use crate::traits::LanguageModel;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";
pub const DEFAULT_RERANK_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_EMBEDDING_BATCH: usize = 512;

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl OpenAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn client(&self) -> Result<Client, String> {
        if self.api_key.trim().is_empty() {
            return Err("missing OpenAI API key".to_string());
        }
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).map_err(|_| "invalid OpenAI API key".to_string())?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Client::builder()
            .timeout(self.timeout)
            .default_headers(headers)
            .build()
            .map_err(|error| format!("failed to build OpenAI HTTP client: {error}"))
    }
}

/// Batched embeddings client. A call over N texts issues `ceil(N / batch_size)`
/// requests and fails as a whole if any of them fails.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        config: &OpenAiConfig,
        model: impl Into<String>,
        dimensions: usize,
        batch_size: usize,
    ) -> Result<Self, EmbeddingError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(EmbeddingError::Config("missing embedding model name".to_string()));
        }
        if dimensions == 0 {
            return Err(EmbeddingError::Config("dimensions must be positive".to_string()));
        }

        Ok(Self {
            client: config.client().map_err(EmbeddingError::Config)?,
            endpoint: config.endpoint("embeddings"),
            model,
            dimensions,
            batch_size: batch_size.max(1),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            dimensions: Some(self.dimensions),
        };
        let response = self.client.post(&self.endpoint).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let mut parsed: EmbeddingResponse = response.json().await?;
        parsed.data.sort_by_key(|entry| entry.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|entry| entry.embedding).collect();
        validate_embeddings(&vectors, inputs.len(), self.dimensions)?;
        Ok(vectors)
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for (batch, inputs) in texts.chunks(self.batch_size).enumerate() {
            debug!(batch, size = inputs.len(), model = %self.model, "requesting embeddings");
            vectors.extend(self.request(inputs).await?);
        }
        Ok(vectors)
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

pub struct OpenAiChatModel {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
}

impl OpenAiChatModel {
    pub fn new(config: &OpenAiConfig, model: impl Into<String>) -> Result<Self, LlmError> {
        let model = model.into();
        if model.trim().is_empty() {
            return Err(LlmError::Config("missing chat model name".to_string()));
        }
        Ok(Self {
            client: config.client().map_err(LlmError::Config)?,
            endpoint: config.endpoint("chat/completions"),
            model,
            temperature: 0.2,
        })
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: messages
                .iter()
                .map(|message| WireMessage {
                    role: message.role.as_str(),
                    content: &message.content,
                })
                .collect(),
        };

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(LlmError::Provider {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response.json().await?;
        parsed
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
