use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;

use crate::{
    providers::LLMProvider,
    types::{ChatMessage, CompletionRequest, CompletionResponse},
    LLMError,
};

/// Replays canned completions in order. Used for judge dry runs and tests.
pub struct ScriptedProvider {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn from_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests seen so far, in arrival order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        match self.requests.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn next_response(&self) -> Option<String> {
        match self.responses.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LLMProvider for ScriptedProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        match self.requests.lock() {
            Ok(mut guard) => guard.push(request),
            Err(poisoned) => poisoned.into_inner().push(request),
        }

        let response = self
            .next_response()
            .ok_or_else(|| LLMError::Provider("no more scripted responses".to_string()))?;

        Ok(CompletionResponse {
            message: ChatMessage::assistant(response),
            usage: None,
        })
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
