use crate::models::Metadata;
use crate::store::{record_uuid, validate_upsert, QueryFilter, StoreHit};
use crate::traits::IndexStore;
use crate::StoreError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use url::Url;

const BACKEND: &str = "qdrant";
const RECORD_ID_KEY: &str = "record_id";

/// Qdrant over its REST API. One collection per index, cosine distance.
pub struct QdrantStore {
    endpoint: Url,
    api_key: Option<String>,
    client: Client,
    vector_size: usize,
}

impl QdrantStore {
    pub fn new(connection: &str, vector_size: usize) -> Result<Self, StoreError> {
        let endpoint = Url::parse(connection.trim_end_matches('/'))?;
        Ok(Self {
            endpoint,
            api_key: None,
            client: Client::new(),
            vector_size,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.as_str().trim_end_matches('/'), path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("api-key", key),
            None => request,
        }
    }

    async fn checked(&self, name: &str, response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::IndexNotFound(name.to_string()));
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::BackendResponse {
            backend: BACKEND.to_string(),
            details: format!("{status}: {body}"),
        })
    }
}

fn filter_body(filter: &QueryFilter) -> Value {
    let must: Vec<Value> = filter
        .equals
        .iter()
        .map(|(key, value)| json!({ "key": key, "match": { "value": value } }))
        .collect();
    json!({ "must": must })
}

#[async_trait]
impl IndexStore for QdrantStore {
    async fn create_index(&self, name: &str, dimension: usize) -> Result<(), StoreError> {
        if dimension != self.vector_size {
            return Err(StoreError::Validation(format!(
                "configured vector size {} does not match requested {}",
                self.vector_size, dimension
            )));
        }

        let collection = self.url(&format!("/collections/{name}"));
        let existing = self.authorized(self.client.get(&collection)).send().await?;
        if existing.status().is_success() {
            return Err(StoreError::IndexAlreadyExists(name.to_string()));
        }
        if existing.status() != StatusCode::NOT_FOUND {
            return Err(StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: existing.status().to_string(),
            });
        }

        let response = self
            .authorized(self.client.put(&collection))
            .json(&json!({
                "vectors": {
                    "size": dimension,
                    "distance": "Cosine",
                }
            }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Err(StoreError::IndexAlreadyExists(name.to_string()));
        }
        self.checked(name, response).await?;
        Ok(())
    }

    async fn upsert(
        &self,
        name: &str,
        ids: &[String],
        vectors: &[Vec<f32>],
        metadata: &[Metadata],
    ) -> Result<(), StoreError> {
        validate_upsert(ids, vectors, metadata, self.vector_size)?;
        if ids.is_empty() {
            return Ok(());
        }

        let points: Vec<Value> = ids
            .iter()
            .zip(vectors)
            .zip(metadata)
            .map(|((id, vector), metadata)| {
                let mut payload = metadata.clone();
                payload.insert(RECORD_ID_KEY.to_string(), Value::String(id.clone()));
                json!({
                    "id": record_uuid(id).to_string(),
                    "vector": vector,
                    "payload": payload,
                })
            })
            .collect();

        let response = self
            .authorized(
                self.client
                    .put(self.url(&format!("/collections/{name}/points?wait=true"))),
            )
            .json(&json!({ "points": points }))
            .send()
            .await?;
        self.checked(name, response).await?;
        Ok(())
    }

    async fn query(
        &self,
        name: &str,
        query_vector: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<StoreHit>, StoreError> {
        if query_vector.len() != self.vector_size {
            return Err(StoreError::Validation(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.vector_size
            )));
        }

        let mut body = json!({
            "vector": query_vector,
            "limit": top_k,
            "with_payload": true,
        });
        if !filter.is_empty() {
            body["filter"] = filter_body(filter);
        }

        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/search"))),
            )
            .json(&body)
            .send()
            .await?;
        let parsed: Value = self.checked(name, response).await?.json().await?;

        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: "search response has no result array".to_string(),
            })?;

        let mut result = Vec::with_capacity(hits.len());
        for hit in hits {
            let mut metadata = hit
                .pointer("/payload")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            let id = match metadata.remove(RECORD_ID_KEY) {
                Some(Value::String(id)) => id,
                _ => hit
                    .pointer("/id")
                    .map(|id| match id {
                        Value::String(id) => id.clone(),
                        other => other.to_string(),
                    })
                    .unwrap_or_default(),
            };
            let score = hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0);

            result.push(StoreHit {
                id,
                score,
                metadata,
            });
        }

        Ok(result)
    }

    async fn count(&self, name: &str) -> Result<usize, StoreError> {
        let response = self
            .authorized(
                self.client
                    .post(self.url(&format!("/collections/{name}/points/count"))),
            )
            .json(&json!({ "exact": true }))
            .send()
            .await?;
        let parsed: Value = self.checked(name, response).await?.json().await?;

        parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .map(|count| count as usize)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                details: "count response has no result.count".to_string(),
            })
    }
}
