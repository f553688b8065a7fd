pub mod memory;
pub mod messages;
pub mod qdrant;

pub use memory::MemoryIndexStore;
pub use messages::{InMemoryMessageStore, JsonMessageStore};
pub use qdrant::QdrantStore;
