use crate::models::{MemoryMessage, ThreadRecord};
use crate::traits::MessageStore;
use crate::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// One change to a resource's history. Loading replays these in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum MessageEvent {
    Message(MemoryMessage),
    Title {
        thread_id: String,
        title: String,
        at: DateTime<Utc>,
    },
}

fn replay(resource_id: &str, events: impl IntoIterator<Item = MessageEvent>) -> Vec<ThreadRecord> {
    let mut threads: Vec<ThreadRecord> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();

    for event in events {
        let (thread_id, at) = match &event {
            MessageEvent::Message(message) => (message.thread_id.clone(), message.created_at),
            MessageEvent::Title { thread_id, at, .. } => (thread_id.clone(), *at),
        };
        let position = *positions.entry(thread_id.clone()).or_insert_with(|| {
            threads.push(ThreadRecord {
                resource_id: resource_id.to_string(),
                thread_id,
                title: None,
                created_at: at,
                messages: Vec::new(),
            });
            threads.len() - 1
        });

        let thread = &mut threads[position];
        match event {
            MessageEvent::Message(message) => thread.messages.push(message),
            MessageEvent::Title { title, .. } => thread.title = Some(title),
        }
    }

    threads
}

/// Message history that lives as long as the process.
#[derive(Default)]
pub struct InMemoryMessageStore {
    events: RwLock<HashMap<String, Vec<MessageEvent>>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn push(&self, resource_id: &str, event: MessageEvent) {
        self.events
            .write()
            .await
            .entry(resource_id.to_string())
            .or_default()
            .push(event);
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn load_resource(&self, resource_id: &str) -> Result<Vec<ThreadRecord>, StoreError> {
        let events = self.events.read().await;
        let history = events.get(resource_id).cloned().unwrap_or_default();
        Ok(replay(resource_id, history))
    }

    async fn append_message(&self, message: &MemoryMessage) -> Result<(), StoreError> {
        self.push(&message.resource_id, MessageEvent::Message(message.clone()))
            .await;
        Ok(())
    }

    async fn set_thread_title(
        &self,
        resource_id: &str,
        thread_id: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let event = MessageEvent::Title {
            thread_id: thread_id.to_string(),
            title: title.to_string(),
            at: Utc::now(),
        };
        self.push(resource_id, event).await;
        Ok(())
    }
}

/// Message history kept as one JSON-lines file per resource under `root`.
/// File names are the sha256 of the resource id, so any id is a safe name.
pub struct JsonMessageStore {
    root: PathBuf,
    writes: Mutex<()>,
}

impl JsonMessageStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            writes: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resource_path(&self, resource_id: &str) -> PathBuf {
        let digest = Sha256::digest(resource_id.as_bytes());
        let name: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        self.root.join(format!("{name}.jsonl"))
    }

    async fn write_event(&self, resource_id: &str, event: &MessageEvent) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.writes.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.resource_path(resource_id))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for JsonMessageStore {
    async fn load_resource(&self, resource_id: &str) -> Result<Vec<ThreadRecord>, StoreError> {
        let path = self.resource_path(resource_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };

        let events = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<MessageEvent>)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(resource_id, path = %path.display(), events = events.len(), "loaded message history");
        Ok(replay(resource_id, events))
    }

    async fn append_message(&self, message: &MemoryMessage) -> Result<(), StoreError> {
        self.write_event(&message.resource_id, &MessageEvent::Message(message.clone()))
            .await
    }

    async fn set_thread_title(
        &self,
        resource_id: &str,
        thread_id: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let event = MessageEvent::Title {
            thread_id: thread_id.to_string(),
            title: title.to_string(),
            at: Utc::now(),
        };
        self.write_event(resource_id, &event).await
    }
}
