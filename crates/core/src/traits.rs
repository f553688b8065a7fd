use crate::models::{ChatMessage, MemoryMessage, Metadata, ThreadRecord};
use crate::store::{QueryFilter, StoreHit};
use crate::{LlmError, StoreError};
use async_trait::async_trait;

/// Persistent vector index addressed by name.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Fails with [`StoreError::IndexAlreadyExists`] when `name` is taken.
    async fn create_index(&self, name: &str, dimension: usize) -> Result<(), StoreError>;

    async fn upsert(
        &self,
        name: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadata: &[Metadata],
    ) -> Result<(), StoreError>;

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<StoreHit>, StoreError>;

    async fn count(&self, name: &str) -> Result<usize, StoreError>;
}

/// Durable conversation history, loaded one resource at a time.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Threads of the resource, oldest first, each with its messages in order.
    async fn load_resource(&self, resource_id: &str) -> Result<Vec<ThreadRecord>, StoreError>;

    async fn append_message(&self, message: &MemoryMessage) -> Result<(), StoreError>;

    async fn set_thread_title(
        &self,
        resource_id: &str,
        thread_id: &str,
        title: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}
