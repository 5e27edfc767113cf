//! Account book and run-wide settings.
//!
//! Both are built once at startup and handed to the dispatcher by reference;
//! nothing here is mutated after loading.

use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::HarnessError;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

const MESSAGES_SUFFIX: &str = "/chat/messages";
const CONVERSATIONS_SUFFIX: &str = "/chat/conversations";

/// How the chat service expects the credential to be presented.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `<name>: <token>`, e.g. `sessionToken`.
    Header { name: String },
}

impl Default for AuthScheme {
    fn default() -> Self {
        Self::Bearer
    }
}

/// JSON key carrying the user prompt in the chat request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageField {
    Message,
    Prompt,
}

impl MessageField {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Prompt => "prompt",
        }
    }
}

impl Default for MessageField {
    fn default() -> Self {
        Self::Message
    }
}

/// What to do with rows that leave `conversation_id` blank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationMode {
    /// Every such row becomes its own conversation with a synthesized id.
    #[default]
    Fresh,
    /// All such rows of an account share the most recent remote conversation.
    Resume,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Account {
    pub id: String,
    pub base_url: String,
    pub token: String,
    pub auth: AuthScheme,
    pub message_field: MessageField,
    pub reply_field: String,
    pub tokens_field: String,
    pub conversations_url: String,
    pub headers: BTreeMap<String, String>,
}

impl Account {
    pub fn new(id: impl Into<String>, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            id: id.into(),
            conversations_url: derive_conversations_url(&base_url),
            base_url,
            token: token.into(),
            auth: AuthScheme::default(),
            message_field: MessageField::default(),
            reply_field: default_reply_field(),
            tokens_field: default_tokens_field(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_auth(mut self, auth: AuthScheme) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_message_field(mut self, field: MessageField) -> Self {
        self.message_field = field;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_conversations_url(mut self, url: impl Into<String>) -> Self {
        self.conversations_url = url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    base_url: String,
    #[serde(default)]
    session_token: Option<String>,
    #[serde(default)]
    token_env: Option<String>,
    #[serde(default)]
    auth: AuthScheme,
    #[serde(default)]
    message_field: MessageField,
    #[serde(default = "default_reply_field")]
    reply_field: String,
    #[serde(default = "default_tokens_field")]
    tokens_field: String,
    #[serde(default)]
    conversations_url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

fn default_reply_field() -> String {
    "message".to_string()
}

fn default_tokens_field() -> String {
    "tokens_used_message".to_string()
}

fn derive_conversations_url(base_url: &str) -> String {
    if base_url.contains(MESSAGES_SUFFIX) {
        base_url.replace(MESSAGES_SUFFIX, CONVERSATIONS_SUFFIX)
    } else {
        format!("{}/conversations", base_url.trim_end_matches('/'))
    }
}

impl AccountEntry {
    fn into_account(self, id: String) -> Result<Account, HarnessError> {
        let token = match (self.session_token, self.token_env) {
            (Some(token), _) => token,
            (None, Some(var)) => env::var(&var).map_err(|_| HarnessError::InvalidAccount {
                account: id.clone(),
                message: format!("environment variable {var} is not set"),
            })?,
            (None, None) => {
                return Err(HarnessError::InvalidAccount {
                    account: id,
                    message: "either session_token or token_env is required".to_string(),
                })
            }
        };

        if self.base_url.trim().is_empty() {
            return Err(HarnessError::InvalidAccount {
                account: id,
                message: "base_url is empty".to_string(),
            });
        }

        let conversations_url = self
            .conversations_url
            .unwrap_or_else(|| derive_conversations_url(&self.base_url));

        Ok(Account {
            id,
            base_url: self.base_url,
            token,
            auth: self.auth,
            message_field: self.message_field,
            reply_field: self.reply_field,
            tokens_field: self.tokens_field,
            conversations_url,
            headers: self.headers,
        })
    }
}

/// Accounts in file order. The first entry is the implicit default.
#[derive(Debug, Clone)]
pub struct AccountBook {
    accounts: Vec<Arc<Account>>,
}

impl AccountBook {
    pub fn new(accounts: Vec<Account>) -> Result<Self, HarnessError> {
        if accounts.is_empty() {
            return Err(HarnessError::NoAccounts);
        }
        Ok(Self {
            accounts: accounts.into_iter().map(Arc::new).collect(),
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, HarnessError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| HarnessError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, HarnessError> {
        // Mapping keeps insertion order, which decides the default account.
        let raw: serde_yaml::Mapping = serde_yaml::from_str(text)?;
        let mut accounts = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let id = match key {
                serde_yaml::Value::String(id) => id,
                other => serde_yaml::to_string(&other)?.trim().to_string(),
            };
            let entry: AccountEntry = serde_yaml::from_value(value)?;
            accounts.push(entry.into_account(id)?);
        }
        Self::new(accounts)
    }

    pub fn get(&self, id: &str) -> Option<&Arc<Account>> {
        self.accounts.iter().find(|account| account.id == id)
    }

    pub fn first(&self) -> &Arc<Account> {
        // Non-empty by construction.
        &self.accounts[0]
    }

    /// The explicitly named default, or the first configured account.
    pub fn default_account(&self, preferred: Option<&str>) -> Result<&Arc<Account>, HarnessError> {
        match preferred {
            Some(id) => self
                .get(id)
                .ok_or_else(|| HarnessError::UnknownAccount(id.to_string())),
            None => Ok(self.first()),
        }
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }
}

/// Model behind the similarity stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimilarityModel {
    /// Sentence embeddings from an OpenAI-compatible provider.
    Remote(String),
    /// Local word-hashing vectors. Only measures word overlap, so paraphrases
    /// score low; meant for offline runs.
    Hashing,
}

impl SimilarityModel {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl Default for SimilarityModel {
    fn default() -> Self {
        Self::Remote(DEFAULT_EMBEDDING_MODEL.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub request_timeout: Duration,
    pub similarity_threshold: f32,
    pub similarity_model: SimilarityModel,
    pub conversation_mode: ConversationMode,
    pub reports_dir: PathBuf,
    /// Overall budget; outstanding conversations are cancelled when it expires.
    pub deadline: Option<Duration>,
    pub default_account: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            similarity_model: SimilarityModel::default(),
            conversation_mode: ConversationMode::Fresh,
            reports_dir: PathBuf::from("reports"),
            deadline: None,
            default_account: None,
        }
    }
}

impl RunConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_similarity_threshold(mut self, threshold: f32) -> Self {
        self.similarity_threshold = threshold;
        self
    }

    pub fn with_similarity_model(mut self, model: SimilarityModel) -> Self {
        self.similarity_model = model;
        self
    }

    pub fn with_conversation_mode(mut self, mode: ConversationMode) -> Self {
        self.conversation_mode = mode;
        self
    }

    pub fn with_reports_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.reports_dir = dir.into();
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_default_account(mut self, account: impl Into<String>) -> Self {
        self.default_account = Some(account.into());
        self
    }
}
