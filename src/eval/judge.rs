use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest},
};

pub const JUDGE_SYSTEM_PROMPT: &str =
    "You are an evaluation assistant.\nReturn JSON {\"pass\": true/false}.";

const JUDGE_MAX_TOKENS: u32 = 50;

/// LLM-as-judge. Any malfunction (call error, non-JSON output, missing or
/// non-boolean `pass`) is a failing verdict.
pub struct LlmJudge {
    provider: Arc<dyn LLMProvider>,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>) -> Self {
        Self {
            provider,
            model: model.into(),
            max_tokens: JUDGE_MAX_TOKENS,
            temperature: 0.0,
        }
    }

    pub fn build_request(&self, prompt: &str, reply: &str) -> CompletionRequest {
        let messages = vec![
            ChatMessage::system(JUDGE_SYSTEM_PROMPT),
            ChatMessage::user(format!("USER: {prompt}\nBOT: {reply}")),
        ];
        CompletionRequest::new(self.model.clone(), messages)
            .with_temperature(self.temperature)
            .with_max_tokens(self.max_tokens)
    }

    pub async fn judge(&self, prompt: &str, reply: &str) -> bool {
        let response = match self.provider.complete(self.build_request(prompt, reply)).await {
            Ok(response) => response,
            Err(err) => {
                warn!(provider = self.provider.name(), error = %err, "judge call failed; counting as fail");
                return false;
            }
        };

        let text = response.message.text().unwrap_or_default();
        match parse_verdict(text) {
            Some(verdict) => {
                debug!(verdict, "judge verdict");
                verdict
            }
            None => {
                warn!(output = %text, "judge returned malformed verdict; counting as fail");
                false
            }
        }
    }
}

/// `Some(pass)` for a strict `{"pass": bool}` object, `None` otherwise.
pub fn parse_verdict(text: &str) -> Option<bool> {
    let value: Value = serde_json::from_str(text.trim()).ok()?;
    value.get("pass")?.as_bool()
}
