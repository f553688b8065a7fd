use crate::error::EmbeddingError;
use async_trait::async_trait;

/// Output width of `text-embedding-3-small`, the model the letters index is built with.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimensions(&self) -> usize;

    /// Embeds `texts` in order; the result is index-aligned with the input.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::CountMismatch {
                requested: 1,
                returned: vectors.len(),
            });
        }
        vectors.pop().ok_or(EmbeddingError::CountMismatch {
            requested: 1,
            returned: 0,
        })
    }
}

/// Checks count and width of a provider response against the request.
pub fn validate_embeddings(
    vectors: &[Vec<f32>],
    requested: usize,
    dimensions: usize,
) -> Result<(), EmbeddingError> {
    if vectors.len() != requested {
        return Err(EmbeddingError::CountMismatch {
            requested,
            returned: vectors.len(),
        });
    }
    if let Some(vector) = vectors.iter().find(|vector| vector.len() != dimensions) {
        return Err(EmbeddingError::DimensionMismatch {
            expected: dimensions,
            actual: vector.len(),
        });
    }
    Ok(())
}

/// Local hashing embedder over character trigrams. Deterministic and
/// dependency free, used for offline runs and tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let mut hash = 1469598103934665603u64;
            for byte in token.bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}
