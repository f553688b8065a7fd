use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

pub const DEFAULT_INDEX_NAME: &str = "papers";

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone)]
pub struct Document {
    pub source_path: PathBuf,
    pub file_name: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub text: String,
    pub page_number: u32,
    pub year_of_publish: u32,
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub text: String,
    pub heading_path: Vec<String>,
    pub headings: BTreeMap<String, String>,
    pub title: String,
    pub file_name: String,
    pub page_number: u32,
    pub year_of_publish: u32,
    pub ordinal: u32,
}

impl Chunk {
    pub fn metadata(&self, sequence: u64) -> ChunkMetadata {
        ChunkMetadata {
            text: self.text.clone(),
            file_name: self.file_name.clone(),
            page_number: self.page_number,
            year_of_publish: self.year_of_publish,
            heading_path: self.heading_path.clone(),
            headings: self.headings.clone(),
            title: self.title.clone(),
            ordinal: self.ordinal,
            sequence,
        }
    }
}

/// Payload stored next to every chunk vector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub text: String,
    pub file_name: String,
    pub page_number: u32,
    pub year_of_publish: u32,
    #[serde(default)]
    pub heading_path: Vec<String>,
    /// Heading text keyed by configured level name, e.g. `"header 2"`.
    #[serde(default)]
    pub headings: BTreeMap<String, String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub ordinal: u32,
    #[serde(default)]
    pub sequence: u64,
}

impl ChunkMetadata {
    pub fn to_map(&self) -> Result<Metadata, serde_json::Error> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            _ => Ok(Metadata::new()),
        }
    }

    pub fn from_map(map: &Metadata) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(map.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    pub file_name: String,
    pub year: u32,
    pub page_number: u32,
}

impl fmt::Display for Citation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.year == 0 {
            write!(f, "{}, page {}", self.file_name, self.page_number)
        } else {
            write!(f, "{} Letter, page {}", self.year, self.page_number)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub heading_path: Vec<String>,
    pub citation: Citation,
    pub score: f64,
    pub semantic_score: f64,
    pub vector_score: f64,
    pub position_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMessage {
    pub id: String,
    pub resource_id: String,
    pub thread_id: String,
    pub sequence: u64,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A persisted conversation thread with its messages in order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadRecord {
    pub resource_id: String,
    pub thread_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<MemoryMessage>,
}

#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub index_name: String,
    pub chunk_max_chars: usize,
    pub chunk_overlap_chars: usize,
}

impl Default for IngestionOptions {
    fn default() -> Self {
        Self {
            index_name: DEFAULT_INDEX_NAME.to_string(),
            chunk_max_chars: 4_000,
            chunk_overlap_chars: 512,
        }
    }
}
