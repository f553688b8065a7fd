use crate::models::Metadata;
use crate::traits::IndexStore;
use crate::StoreError;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct StoreHit {
    pub id: String,
    pub score: f64,
    pub metadata: Metadata,
}

/// Conjunction of `key == value` conditions over record metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub equals: Vec<(String, Value)>,
}

impl QueryFilter {
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::default().and_eq(key, value)
    }

    pub fn and_eq(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.equals.push((key.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.equals.is_empty()
    }

    pub fn matches(&self, metadata: &Metadata) -> bool {
        self.equals
            .iter()
            .all(|(key, expected)| metadata.get(key) == Some(expected))
    }
}

pub fn validate_upsert(
    ids: &[String],
    vectors: &[Vec<f32>],
    metadata: &[Metadata],
    dimension: usize,
) -> Result<(), StoreError> {
    if vectors.len() != metadata.len() || vectors.len() != ids.len() {
        return Err(StoreError::Validation(format!(
            "ids ({}), vectors ({}) and metadata ({}) must be index-aligned",
            ids.len(),
            vectors.len(),
            metadata.len()
        )));
    }

    if let Some((position, vector)) = vectors
        .iter()
        .enumerate()
        .find(|(_, vector)| vector.len() != dimension)
    {
        return Err(StoreError::Validation(format!(
            "vector {position} has dimension {} but the index expects {dimension}",
            vector.len()
        )));
    }

    Ok(())
}

/// Creates the index unless it already exists. Returns whether it was created.
///
/// Only [`StoreError::IndexAlreadyExists`] is absorbed; every other failure
/// is returned to the caller.
pub async fn ensure_index(
    store: &dyn IndexStore,
    name: &str,
    dimension: usize,
) -> Result<bool, StoreError> {
    match store.create_index(name, dimension).await {
        Ok(()) => {
            info!(index = name, dimension, "created index");
            Ok(true)
        }
        Err(StoreError::IndexAlreadyExists(_)) => {
            info!(index = name, "index already exists, continuing");
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f64 {
    if left.len() != right.len() || left.is_empty() {
        return 0.0;
    }

    let mut dot = 0f64;
    let mut left_norm = 0f64;
    let mut right_norm = 0f64;
    for (a, b) in left.iter().zip(right) {
        let (a, b) = (f64::from(*a), f64::from(*b));
        dot += a * b;
        left_norm += a * a;
        right_norm += b * b;
    }

    if left_norm == 0.0 || right_norm == 0.0 {
        return 0.0;
    }
    dot / (left_norm.sqrt() * right_norm.sqrt())
}

/// Maps an arbitrary record id onto a UUID, for backends that only accept
/// UUID or integer keys.
pub fn record_uuid(id: &str) -> Uuid {
    let digest = Sha256::digest(id.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn metadata(value: Value) -> Metadata {
        match value {
            Value::Object(map) => map,
            _ => Metadata::new(),
        }
    }

    #[test]
    fn filter_requires_every_condition() {
        let record = metadata(json!({"resource_id": "alice", "thread_id": "t1"}));
        assert!(QueryFilter::default().matches(&record));
        assert!(QueryFilter::eq("resource_id", "alice").matches(&record));
        assert!(!QueryFilter::eq("resource_id", "alice")
            .and_eq("thread_id", "t2")
            .matches(&record));
    }

    #[test]
    fn upsert_arrays_must_be_aligned() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let vectors = vec![vec![0.0; 3], vec![0.0; 3]];
        let one = vec![Metadata::new()];
        assert!(matches!(
            validate_upsert(&ids, &vectors, &one, 3),
            Err(StoreError::Validation(_))
        ));

        let two = vec![Metadata::new(), Metadata::new()];
        assert!(validate_upsert(&ids, &vectors, &two, 3).is_ok());
        assert!(matches!(
            validate_upsert(&ids, &vectors, &two, 4),
            Err(StoreError::Validation(_))
        ));
    }

    #[test]
    fn cosine_similarity_handles_degenerate_vectors() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-9);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-9);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn record_uuid_is_stable() {
        assert_eq!(record_uuid("chunk-1"), record_uuid("chunk-1"));
        assert_ne!(record_uuid("chunk-1"), record_uuid("chunk-2"));
    }
}
