use std::sync::Arc;

use async_trait::async_trait;

use crate::{config::SimilarityModel, providers::LLMProvider, types::EmbeddingRequest, LLMError};

/// Sentence embedding model. Loaded once and shared read-only across tasks.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LLMError>;
    fn name(&self) -> &'static str;
    fn model_id(&self) -> String;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Result<f32, LLMError> {
    if a.len() != b.len() {
        return Err(LLMError::InvalidResponse("embedding dimensions differ"));
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return Ok(0.0);
    }
    Ok(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

pub const HASHING_DIMENSIONS: usize = 384;

/// Offline bag-of-words model: each lowercased word is hashed (FNV-1a) into a
/// signed bucket and the vector is L2-normalized. Same input, same vector.
/// It sees word overlap only, not meaning.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new() -> Self {
        Self::with_dimensions(HASHING_DIMENSIONS)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let hash = fnv1a(token.to_lowercase().as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(*byte)).wrapping_mul(PRIME))
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LLMError> {
        Ok(self.embed_sync(text))
    }

    fn name(&self) -> &'static str {
        "hashing"
    }

    fn model_id(&self) -> String {
        format!("hashing-bow-{}", self.dimensions)
    }
}

/// Remote embeddings through any provider that supports them.
pub struct ProviderEmbedder {
    provider: Arc<dyn LLMProvider>,
    model: String,
}

impl ProviderEmbedder {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for ProviderEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LLMError> {
        let response = self
            .provider
            .create_embeddings(EmbeddingRequest::new(self.model.clone(), vec![text.to_string()]))
            .await?;

        response
            .data
            .into_iter()
            .min_by_key(|embedding| embedding.index)
            .map(|embedding| embedding.embedding)
            .ok_or(LLMError::InvalidResponse("embedding response was empty"))
    }

    fn name(&self) -> &'static str {
        self.provider.name()
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }
}

/// Build the embedder for `model`. Remote models need `provider`.
pub fn embedder_for(
    model: &SimilarityModel,
    provider: Option<&Arc<dyn LLMProvider>>,
) -> Result<Arc<dyn Embedder>, LLMError> {
    match model {
        SimilarityModel::Remote(name) => {
            let provider = provider.ok_or(LLMError::MissingApiKey("OPENAI_API_KEY"))?;
            Ok(Arc::new(ProviderEmbedder::new(Arc::clone(provider), name.clone())))
        }
        SimilarityModel::Hashing => Ok(Arc::new(HashingEmbedder::new())),
    }
}
