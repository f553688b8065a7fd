pub mod agent;
pub mod chunking;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod memory;
pub mod models;
pub mod openai;
pub mod pages;
pub mod rerank;
pub mod retriever;
pub mod store;
pub mod stores;
pub mod traits;

pub use agent::{Agent, AgentReply, KnowledgeTool, AGENT_NAME, LIMITATION_STATEMENT};
pub use chunking::{make_chunk_id, ChunkingConfig, HeaderLevel, MarkdownChunker};
pub use config::{AgentOptions, RecallScope, RerankerOptions, SemanticRecallOptions, ThreadOptions};
pub use embeddings::{CharacterNgramEmbedder, Embedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{
    AgentError, ConfigError, EmbeddingError, IngestError, LlmError, RetrievalError, StoreError,
};
pub use ingest::{
    discover_markdown_files, ingest_documents, load_document, IngestionReport, IngestionRun,
    SkippedFile,
};
pub use memory::{ConversationMemory, ThreadSummary, MEMORY_INDEX_NAME};
pub use models::{
    ChatMessage, Chunk, ChunkMetadata, Citation, Document, IngestionOptions, MemoryMessage, Page,
    RetrievedChunk, Role, ThreadRecord, DEFAULT_INDEX_NAME,
};
pub use openai::{OpenAiChatModel, OpenAiConfig, OpenAiEmbedder};
pub use pages::{pages_from_document, split_pages, year_of_publish, PageSplitter};
pub use rerank::{LlmRelevanceScorer, RelevanceScorer, RerankWeights, TermOverlapScorer};
pub use retriever::{Retriever, RetrieverOptions, DEFAULT_MIN_SCORE};
pub use store::{ensure_index, QueryFilter, StoreHit};
pub use stores::{InMemoryMessageStore, JsonMessageStore, MemoryIndexStore, QdrantStore};
pub use traits::{IndexStore, LanguageModel, MessageStore};
