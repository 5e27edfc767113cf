//! Client for the chat service under test.

use std::{sync::Arc, time::Duration};

use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::{
    config::{Account, AuthScheme},
    HarnessError,
};

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("request timed out: {0}")]
    Timeout(#[source] reqwest::Error),

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("HTTP {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("response was not valid JSON: {0}")]
    InvalidBody(String),
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err)
        } else {
            Self::Transport(err)
        }
    }
}

impl ChatError {
    /// Text recorded as the reply of a turn whose call failed.
    pub fn as_reply(&self) -> String {
        match self {
            Self::Status { status, body } => format!("[HTTP {}] {}", status.as_u16(), body),
            Self::Timeout(err) => format!("[timeout] {err}"),
            Self::Transport(err) => format!("[transport error] {err}"),
            Self::InvalidBody(body) => format!("[invalid response] {body}"),
        }
    }
}

/// A successful chat call, already reduced to what grading needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub tokens: u64,
    /// The configured reply field was absent from the response.
    pub reply_missing: bool,
}

/// One shared connection pool; the per-call timeout applies to every request.
pub fn build_http_client(timeout: Duration) -> Result<Client, HarnessError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(HarnessError::Client)
}

#[derive(Debug, Clone)]
pub struct ChatClient {
    client: Client,
    account: Arc<Account>,
}

impl ChatClient {
    pub fn new(client: Client, account: Arc<Account>) -> Self {
        Self { client, account }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = match &self.account.auth {
            AuthScheme::Bearer => builder.bearer_auth(&self.account.token),
            AuthScheme::Header { name } => builder.header(name.as_str(), &self.account.token),
        };

        self.account
            .headers
            .iter()
            .fold(builder, |builder, (name, value)| builder.header(name.as_str(), value))
    }

    /// Post one prompt into a conversation.
    pub async fn send(&self, conversation_id: &str, prompt: &str) -> Result<ChatReply, ChatError> {
        let mut body = Map::new();
        body.insert("conversation_id".to_string(), Value::from(conversation_id));
        body.insert(
            self.account.message_field.as_str().to_string(),
            Value::from(prompt),
        );

        let response = self
            .authorize(self.client.post(&self.account.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Status { status, body: text });
        }

        let value: Value = serde_json::from_str(&text).map_err(|_| ChatError::InvalidBody(text))?;
        Ok(self.extract_reply(&value))
    }

    fn extract_reply(&self, value: &Value) -> ChatReply {
        let tokens = value
            .get(&self.account.tokens_field)
            .and_then(Value::as_u64)
            .unwrap_or(0);

        match value.get(&self.account.reply_field) {
            Some(Value::String(text)) => ChatReply {
                text: text.clone(),
                tokens,
                reply_missing: false,
            },
            Some(Value::Null) | None => ChatReply {
                text: String::new(),
                tokens,
                reply_missing: true,
            },
            Some(other) => ChatReply {
                text: other.to_string(),
                tokens,
                reply_missing: false,
            },
        }
    }

    /// Id of the most recent remote conversation, if the account has any.
    pub async fn latest_conversation(&self) -> Result<Option<String>, ChatError> {
        let response = self
            .authorize(self.client.get(&self.account.conversations_url))
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(ChatError::Status { status, body: text });
        }

        let value: Value = serde_json::from_str(&text).map_err(|_| ChatError::InvalidBody(text))?;
        let first = match value.as_array() {
            Some(items) => items.first(),
            None => {
                warn!(account = %self.account.id, "conversation list was not an array");
                None
            }
        };

        Ok(first.and_then(|item| match item.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(id)) => Some(id.to_string()),
            _ => None,
        }))
    }
}
