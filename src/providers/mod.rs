use async_trait::async_trait;

use crate::types::{CompletionRequest, CompletionResponse, EmbeddingRequest, EmbeddingResponse};
use crate::LLMError;

pub mod openai;
pub mod scripted;

/// Model backend used by the judge and by remote embeddings.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    async fn create_embeddings(
        &self,
        _request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, LLMError> {
        Err(LLMError::Unsupported("embeddings"))
    }

    fn name(&self) -> &'static str;
}
