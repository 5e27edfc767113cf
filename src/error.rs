use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LLMError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(&'static str),

    #[error("invalid response from provider: {0}")]
    InvalidResponse(&'static str),

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Errors that abort a run before (or instead of) any grading happens.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid test table: {0}")]
    Csv(#[from] csv::Error),

    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported test file extension: {0}")]
    UnsupportedFormat(String),

    #[error("invalid row {row}: {message}")]
    InvalidRow { row: usize, message: String },

    #[error("no accounts configured")]
    NoAccounts,

    #[error("invalid account '{account}': {message}")]
    InvalidAccount { account: String, message: String },

    #[error("unknown account '{0}' referenced by the test table")]
    UnknownAccount(String),

    #[error("duplicate turn {turn} in conversation {account}:{conversation}")]
    DuplicateTurn {
        account: String,
        conversation: String,
        turn: u32,
    },

    #[error("{rows} row(s) request an LLM judge but no judge is configured")]
    JudgeNotConfigured { rows: usize },

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("failed to write report to {path}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Provider(#[from] LLMError),
}
