pub mod config;
pub mod error;
pub mod eval;
pub mod providers;
pub mod types;

use std::sync::Arc;

pub use config::{
    Account, AccountBook, AuthScheme, ConversationMode, MessageField, RunConfig, SimilarityModel,
};
pub use error::{HarnessError, LLMError};
pub use eval::{
    case::{load_cases, parse_csv_cases, TestCase},
    chat::{ChatClient, ChatError, ChatReply},
    dispatch::Dispatcher,
    embedding::{cosine_similarity, embedder_for, Embedder, HashingEmbedder, ProviderEmbedder},
    grader::{keywords_match, GradeInput, Grader, Verdict},
    grouping::{group_cases, ConversationRef, ConversationSession, Plan},
    judge::{parse_verdict, LlmJudge},
    report::{JsonFileSink, Report, ReportSink, Summary, TurnResult},
    runner::ConversationRunner,
};
pub use providers::LLMProvider;
pub use types::{ChatMessage, CompletionRequest, CompletionResponse, MessageRole, TokenUsage};

/// Group `cases`, check the configuration, then replay every conversation.
///
/// Configuration problems are returned before any request is sent. Failures
/// of individual turns end up in the report instead.
pub async fn run_suite(
    cases: Vec<TestCase>,
    accounts: &AccountBook,
    config: &RunConfig,
    grader: Arc<Grader>,
    allow_missing_judge: bool,
) -> Result<Report, HarnessError> {
    let plan = group_cases(
        cases,
        accounts,
        config.conversation_mode,
        config.default_account.as_deref(),
    )?;
    let dispatcher = Dispatcher::new(config, grader)?;
    dispatcher.preflight(&plan, allow_missing_judge)?;
    Ok(dispatcher.run(plan).await)
}
