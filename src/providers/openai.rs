use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};

use crate::{
    error::LLMError,
    providers::LLMProvider,
    types::{
        ChatMessage, CompletionRequest, CompletionResponse, Embedding, EmbeddingRequest,
        EmbeddingResponse, TokenUsage,
    },
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    pub api_key: String,
    pub base_url: String,
    pub organization: Option<String>,
    pub request_timeout: Duration,
}

impl OpenAIConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            organization: None,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

/// OpenAI-compatible chat completion and embeddings backend.
#[derive(Debug, Clone)]
pub struct OpenAI {
    client: Client,
    config: OpenAIConfig,
}

impl OpenAI {
    pub fn new(api_key: impl Into<String>) -> Result<Self, LLMError> {
        Self::from_config(OpenAIConfig::new(api_key))
    }

    pub fn from_env() -> Result<Self, LLMError> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| LLMError::MissingApiKey("OPENAI_API_KEY"))?;
        let mut config = OpenAIConfig::new(api_key);

        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(org) = env::var("OPENAI_ORGANIZATION") {
            config.organization = Some(org);
        }
        if let Ok(timeout_ms) = env::var("OPENAI_REQUEST_TIMEOUT_MS") {
            if let Ok(ms) = timeout_ms.parse::<u64>() {
                config.request_timeout = Duration::from_millis(ms);
            }
        }

        Self::from_config(config)
    }

    pub fn from_config(config: OpenAIConfig) -> Result<Self, LLMError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.bearer_auth(&self.config.api_key);

        match self.config.organization {
            Some(ref org) => builder.header("OpenAI-Organization", org),
            None => builder,
        }
    }

    async fn post_json<B: Serialize>(&self, path: &str, body: &B) -> Result<reqwest::Response, LLMError> {
        let response = self
            .with_default_headers(self.client.post(self.endpoint(path)))
            .json(body)
            .send()
            .await?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await?;
            if let Ok(error) = serde_json::from_str::<OpenAIErrorEnvelope>(&text) {
                return Err(LLMError::Provider(error.error.message));
            }

            return Err(LLMError::Provider(format!("unexpected status {status}: {text}")));
        }

        Ok(response)
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequestBody {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ResponseChoice>,
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIErrorEnvelope {
    error: OpenAIError,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
}

#[derive(Debug, Serialize)]
struct OpenAIEmbeddingRequestBody {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbedding>,
    model: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIEmbedding {
    embedding: Vec<f32>,
    index: usize,
}

#[async_trait]
impl LLMProvider for OpenAI {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let CompletionRequest {
            model,
            messages,
            max_tokens,
            temperature,
        } = request;

        let body = OpenAIRequestBody {
            model,
            messages,
            max_tokens,
            temperature,
        };

        let parsed: ChatCompletionResponse = self.post_json("chat/completions", &body).await?.json().await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or(LLMError::InvalidResponse("response did not contain any choices"))?;

        Ok(CompletionResponse {
            message: choice.message,
            usage: parsed.usage,
        })
    }

    async fn create_embeddings(
        &self,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse, LLMError> {
        let body = OpenAIEmbeddingRequestBody {
            model: request.model,
            input: request.input,
        };

        let parsed: OpenAIEmbeddingResponse = self.post_json("embeddings", &body).await?.json().await?;

        Ok(EmbeddingResponse {
            data: parsed
                .data
                .into_iter()
                .map(|embedding| Embedding {
                    embedding: embedding.embedding,
                    index: embedding.index,
                })
                .collect(),
            model: parsed.model,
        })
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}
