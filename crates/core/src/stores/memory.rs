use crate::models::Metadata;
use crate::store::{cosine_similarity, validate_upsert, QueryFilter, StoreHit};
use crate::traits::IndexStore;
use crate::StoreError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-process index store. Records keep their first insertion slot when
/// overwritten, so equal scores come back in insertion order.
#[derive(Default)]
pub struct MemoryIndexStore {
    indexes: RwLock<HashMap<String, MemoryIndex>>,
}

struct MemoryIndex {
    dimension: usize,
    records: Vec<MemoryRecord>,
    positions: HashMap<String, usize>,
}

struct MemoryRecord {
    id: String,
    vector: Vec<f32>,
    metadata: Metadata,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn create_index(&self, name: &str, dimension: usize) -> Result<(), StoreError> {
        if dimension == 0 {
            return Err(StoreError::Validation(
                "index dimension must be positive".to_string(),
            ));
        }

        let mut indexes = self.indexes.write().await;
        if indexes.contains_key(name) {
            return Err(StoreError::IndexAlreadyExists(name.to_string()));
        }
        indexes.insert(
            name.to_string(),
            MemoryIndex {
                dimension,
                records: Vec::new(),
                positions: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn upsert(
        &self,
        name: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadata: &[Metadata],
    ) -> Result<(), StoreError> {
        let mut indexes = self.indexes.write().await;
        let index = indexes
            .get_mut(name)
            .ok_or_else(|| StoreError::IndexNotFound(name.to_string()))?;
        validate_upsert(ids, vectors, metadata, index.dimension)?;

        for ((id, vector), metadata) in ids.iter().zip(vectors).zip(metadata) {
            let record = MemoryRecord {
                id: id.clone(),
                vector: vector.clone(),
                metadata: metadata.clone(),
            };
            match index.positions.get(id) {
                Some(&position) => index.records[position] = record,
                None => {
                    index.positions.insert(id.clone(), index.records.len());
                    index.records.push(record);
                }
            }
        }

        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<StoreHit>, StoreError> {
        let indexes = self.indexes.read().await;
        let index = indexes
            .get(name)
            .ok_or_else(|| StoreError::IndexNotFound(name.to_string()))?;
        if query_vector.len() != index.dimension {
            return Err(StoreError::Validation(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                index.dimension
            )));
        }

        let mut hits: Vec<StoreHit> = index
            .records
            .iter()
            .filter(|record| filter.matches(&record.metadata))
            .map(|record| StoreHit {
                id: record.id.clone(),
                score: cosine_similarity(query_vector, &record.vector),
                metadata: record.metadata.clone(),
            })
            .collect();

        hits.sort_by(|left, right| right.score.total_cmp(&left.score));
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        let indexes = self.indexes.read().await;
        indexes
            .get(name)
            .map(|index| index.records.len())
            .ok_or_else(|| StoreError::IndexNotFound(name.to_string()))
    }
}
