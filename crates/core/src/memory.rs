use crate::config::{AgentOptions, RecallScope, SemanticRecallOptions};
use crate::embeddings::Embedder;
use crate::error::AgentError;
use crate::models::{MemoryMessage, Metadata, Role, ThreadRecord};
use crate::retriever::vector_search;
use crate::store::{ensure_index, QueryFilter};
use crate::stores::{InMemoryMessageStore, MemoryIndexStore};
use crate::traits::{IndexStore, MessageStore};
use crate::StoreError;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OnceCell, OwnedMutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

pub const MEMORY_INDEX_NAME: &str = "memory_messages";

/// Conversation history of one resource (a user), across all of its threads.
#[derive(Debug, Default)]
pub struct ResourceState {
    threads: HashMap<String, ThreadState>,
    next_sequence: u64,
    loaded: bool,
}

#[derive(Debug, Clone)]
pub struct ThreadState {
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<MemoryMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreadSummary {
    pub thread_id: String,
    pub title: Option<String>,
    pub message_count: usize,
    pub created_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn thread(&self, thread_id: &str) -> Option<&ThreadState> {
        self.threads.get(thread_id)
    }

    pub fn is_new_thread(&self, thread_id: &str) -> bool {
        self.threads
            .get(thread_id)
            .map_or(true, |thread| thread.messages.is_empty())
    }

    pub fn summaries(&self) -> Vec<ThreadSummary> {
        let mut summaries: Vec<ThreadSummary> = self
            .threads
            .iter()
            .map(|(thread_id, thread)| ThreadSummary {
                thread_id: thread_id.clone(),
                title: thread.title.clone(),
                message_count: thread.messages.len(),
                created_at: thread.created_at,
            })
            .collect();
        summaries.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.thread_id.cmp(&right.thread_id))
        });
        summaries
    }

    fn restore(&mut self, records: Vec<ThreadRecord>) {
        for record in records {
            if let Some(last) = record.messages.iter().map(|message| message.sequence).max() {
                self.next_sequence = self.next_sequence.max(last + 1);
            }
            self.threads.insert(
                record.thread_id,
                ThreadState {
                    title: record.title,
                    created_at: record.created_at,
                    messages: record.messages,
                },
            );
        }
        self.loaded = true;
    }

    fn thread_mut(&mut self, thread_id: &str) -> &mut ThreadState {
        self.threads
            .entry(thread_id.to_string())
            .or_insert_with(|| ThreadState {
                title: None,
                created_at: Utc::now(),
                messages: Vec::new(),
            })
    }

    /// The message with `message_id` and up to `range` neighbours on each side.
    fn message_window(&self, thread_id: &str, message_id: &str, range: usize) -> Option<&[MemoryMessage]> {
        let thread = self.threads.get(thread_id)?;
        let position = thread
            .messages
            .iter()
            .position(|message| message.id == message_id)?;

        let start = position.saturating_sub(range);
        let end = (position + range + 1).min(thread.messages.len());
        Some(&thread.messages[start..end])
    }
}

/// Working and semantic memory for the agent. Each resource has its own
/// lock; a turn holds it from context assembly until both messages are stored.
pub struct ConversationMemory {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn IndexStore>,
    messages: Arc<dyn MessageStore>,
    index_name: String,
    index_ready: OnceCell<()>,
    recall: SemanticRecallOptions,
    last_messages: usize,
    resources: Mutex<HashMap<String, Arc<AsyncMutex<ResourceState>>>>,
}

impl ConversationMemory {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn IndexStore>,
        messages: Arc<dyn MessageStore>,
        options: &AgentOptions,
    ) -> Self {
        Self {
            embedder,
            index,
            messages,
            index_name: MEMORY_INDEX_NAME.to_string(),
            index_ready: OnceCell::new(),
            recall: options.semantic_recall,
            last_messages: options.last_messages,
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// Memory whose history and recall index both live in process.
    pub fn in_process(embedder: Arc<dyn Embedder>, options: &AgentOptions) -> Self {
        Self::new(
            embedder,
            Arc::new(MemoryIndexStore::new()),
            Arc::new(InMemoryMessageStore::new()),
            options,
        )
    }

    pub fn with_index_name(mut self, index_name: impl Into<String>) -> Self {
        self.index_name = index_name.into();
        self
    }

    /// Locks the resource, loading its stored history on first use.
    pub async fn lock(&self, resource_id: &str) -> Result<OwnedMutexGuard<ResourceState>, AgentError> {
        let mut state = self.resource(resource_id).lock_owned().await;
        if !state.loaded {
            let records = self.messages.load_resource(resource_id).await?;
            debug!(resource_id, threads = records.len(), "restored conversation history");
            state.restore(records);
        }
        Ok(state)
    }

    /// Non-blocking lock. Does not load stored history.
    pub fn try_lock(&self, resource_id: &str) -> Option<OwnedMutexGuard<ResourceState>> {
        self.resource(resource_id).try_lock_owned().ok()
    }

    fn resource(&self, resource_id: &str) -> Arc<AsyncMutex<ResourceState>> {
        let mut resources = match self.resources.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(resources.entry(resource_id.to_string()).or_default())
    }

    /// Last `lastMessages` messages of the thread, oldest first.
    pub fn recent(&self, state: &ResourceState, thread_id: &str) -> Vec<MemoryMessage> {
        state
            .thread(thread_id)
            .map(|thread| {
                let start = thread.messages.len().saturating_sub(self.last_messages);
                thread.messages[start..].to_vec()
            })
            .unwrap_or_default()
    }

    /// Earlier messages similar to `query`, each with `messageRange` neighbours,
    /// excluding what the recent window already carries.
    pub async fn recall(
        &self,
        state: &ResourceState,
        resource_id: &str,
        thread_id: &str,
        query: &str,
    ) -> Result<Vec<MemoryMessage>, AgentError> {
        if self.recall.top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.ready().await?;

        let mut filter = QueryFilter::eq("resource_id", resource_id);
        if self.recall.scope == RecallScope::Thread {
            filter = filter.and_eq("thread_id", thread_id);
        }

        let hits = vector_search(
            self.embedder.as_ref(),
            self.index.as_ref(),
            &self.index_name,
            query,
            self.recall.top_k,
            &filter,
        )
        .await
        .map_err(AgentError::Recall)?;

        let recent: BTreeSet<String> = self
            .recent(state, thread_id)
            .into_iter()
            .map(|message| message.id)
            .collect();

        let mut seen = BTreeSet::new();
        let mut recalled = Vec::new();
        for hit in &hits {
            let stored = match message_from_metadata(&hit.metadata) {
                Ok(message) => message,
                Err(error) => {
                    warn!(id = %hit.id, %error, "recall hit without a message payload");
                    continue;
                }
            };

            let window = state
                .message_window(&stored.thread_id, &stored.id, self.recall.message_range)
                .map(<[MemoryMessage]>::to_vec)
                .unwrap_or_else(|| vec![stored]);
            for message in window {
                if !recent.contains(&message.id) && seen.insert(message.id.clone()) {
                    recalled.push(message);
                }
            }
        }

        recalled.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.sequence.cmp(&right.sequence))
        });
        debug!(resource_id, thread_id, hits = hits.len(), recalled = recalled.len(), "semantic recall");
        Ok(recalled)
    }

    /// Stores a message in the history, the recall index and the thread.
    pub async fn append(
        &self,
        state: &mut ResourceState,
        resource_id: &str,
        thread_id: &str,
        role: Role,
        content: &str,
    ) -> Result<MemoryMessage, AgentError> {
        self.ready().await?;

        let message = MemoryMessage {
            id: Uuid::new_v4().to_string(),
            resource_id: resource_id.to_string(),
            thread_id: thread_id.to_string(),
            sequence: state.next_sequence,
            role,
            content: content.to_string(),
            created_at: Utc::now(),
        };

        let vector = self.embedder.embed(content).await?;
        let metadata = message_metadata(&message)?;
        self.index
            .upsert(
                &self.index_name,
                std::slice::from_ref(&message.id),
                &[vector],
                &[metadata],
            )
            .await?;
        self.messages.append_message(&message).await?;

        state.next_sequence += 1;
        state.thread_mut(thread_id).messages.push(message.clone());
        Ok(message)
    }

    pub async fn set_title(
        &self,
        state: &mut ResourceState,
        resource_id: &str,
        thread_id: &str,
        title: &str,
    ) -> Result<(), AgentError> {
        self.messages
            .set_thread_title(resource_id, thread_id, title)
            .await?;
        state.thread_mut(thread_id).title = Some(title.to_string());
        Ok(())
    }

    pub async fn threads(&self, resource_id: &str) -> Result<Vec<ThreadSummary>, AgentError> {
        Ok(self.lock(resource_id).await?.summaries())
    }

    async fn ready(&self) -> Result<(), AgentError> {
        self.index_ready
            .get_or_try_init(|| async {
                ensure_index(self.index.as_ref(), &self.index_name, self.embedder.dimensions())
                    .await
                    .map(|_| ())
            })
            .await?;
        Ok(())
    }
}

/// The whole message travels in the payload, keyed by its id, so a hit can be
/// resolved without assuming anything about how sequences were numbered.
fn message_metadata(message: &MemoryMessage) -> Result<Metadata, StoreError> {
    match serde_json::to_value(message)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::Validation("message did not serialize to an object".to_string())),
    }
}

fn message_from_metadata(metadata: &Metadata) -> Result<MemoryMessage, serde_json::Error> {
    serde_json::from_value(Value::Object(metadata.clone()))
}
