use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("regex error: {0}")]
    RegexError(#[from] regex::Error),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index store failed: {0}")]
    Store(#[from] StoreError),

    #[error("file task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("provider returned {returned} embeddings for {requested} inputs")]
    CountMismatch { requested: usize, returned: usize },

    #[error("embedding dimension {actual} does not match expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid embedder configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("query is empty")]
    EmptyQuery,

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("index query failed: {0}")]
    Store(#[from] StoreError),

    #[error("relevance scoring failed: {0}")]
    Scoring(#[from] LlmError),
}

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("language model provider returned {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("language model returned no content")]
    EmptyResponse,

    #[error("invalid language model configuration: {0}")]
    Config(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("retrieval tool failed: {0}")]
    Retrieval(#[from] RetrievalError),

    #[error("generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("memory store failed: {0}")]
    MemoryStore(#[from] StoreError),

    #[error("memory embedding failed: {0}")]
    MemoryEmbedding(#[from] EmbeddingError),

    #[error("semantic recall failed: {0}")]
    Recall(#[source] RetrievalError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("agent options are not valid json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid agent options: {0}")]
    Invalid(String),
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
