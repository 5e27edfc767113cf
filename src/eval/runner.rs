use std::{sync::Arc, time::Instant};

use reqwest::Client;
use tracing::{debug, info, warn};

use crate::eval::{
    chat::ChatClient,
    grader::{GradeInput, Grader},
    grouping::{ConversationRef, ConversationSession, IdSynthesizer},
    report::{composite_id, TurnResult},
    case::TestCase,
};

/// Replays one conversation, strictly one turn at a time.
///
/// A turn is only sent after the previous turn's response has arrived. Call
/// failures become failed results; they never stop the remaining turns.
#[derive(Clone)]
pub struct ConversationRunner {
    http: Client,
    grader: Arc<Grader>,
}

impl ConversationRunner {
    pub fn new(http: Client, grader: Arc<Grader>) -> Self {
        Self { http, grader }
    }

    pub async fn run(&self, session: ConversationSession) -> Vec<TurnResult> {
        self.run_with_callback(session, |_| {}).await
    }

    /// Like [`run`](Self::run), reporting each result as soon as it exists.
    pub async fn run_with_callback<F>(&self, session: ConversationSession, mut on_turn: F) -> Vec<TurnResult>
    where
        F: FnMut(&TurnResult) + Send,
    {
        let chat = ChatClient::new(self.http.clone(), Arc::clone(&session.account));
        let conversation_id = resolve_conversation(&chat, &session.conversation).await;
        info!(
            account = %session.account.id,
            conversation = %conversation_id,
            turns = session.turns.len(),
            "starting conversation"
        );

        let mut results = Vec::with_capacity(session.turns.len());
        for case in &session.turns {
            let result = self.run_turn(&chat, &conversation_id, case).await;
            on_turn(&result);
            results.push(result);
        }
        results
    }

    async fn run_turn(&self, chat: &ChatClient, conversation_id: &str, case: &TestCase) -> TurnResult {
        let account_id = chat.account().id.as_str();
        let id = composite_id(account_id, conversation_id, case.turn_index);

        let started = Instant::now();
        let outcome = chat.send(conversation_id, &case.prompt_text).await;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let reply = match outcome {
            Ok(reply) => reply,
            Err(err) => {
                warn!(turn = %id, error = %err, "chat call failed");
                return TurnResult {
                    composite_id: id,
                    prompt: case.prompt_text.clone(),
                    reply: err.as_reply(),
                    passed: false,
                    latency_ms,
                    token_count: 0,
                    failures: vec![format!("chat call failed: {err}")],
                };
            }
        };

        if reply.reply_missing {
            warn!(
                turn = %id,
                field = %chat.account().reply_field,
                "response had no reply field; grading an empty reply"
            );
        }

        let verdict = self
            .grader
            .grade(GradeInput {
                reply: &reply.text,
                prompt: &case.prompt_text,
                keywords: &case.keyword_spec,
                expected: case.expected(),
                use_judge: case.use_judge,
            })
            .await;
        debug!(turn = %id, pass = verdict.pass, latency_ms, "turn graded");

        TurnResult {
            composite_id: id,
            prompt: case.prompt_text.clone(),
            failures: verdict.failures(self.grader.threshold()),
            reply: reply.text,
            passed: verdict.pass,
            latency_ms,
            token_count: reply.tokens,
        }
    }
}

async fn resolve_conversation(chat: &ChatClient, conversation: &ConversationRef) -> String {
    match conversation {
        ConversationRef::Id(id) => id.clone(),
        ConversationRef::Latest => {
            let account_id = &chat.account().id;
            match chat.latest_conversation().await {
                Ok(Some(id)) => id,
                Ok(None) => {
                    let id = IdSynthesizer::new().next_id(account_id);
                    warn!(account = %account_id, conversation = %id, "no remote conversation found; starting a new one");
                    id
                }
                Err(err) => {
                    let id = IdSynthesizer::new().next_id(account_id);
                    warn!(account = %account_id, conversation = %id, error = %err, "conversation lookup failed; starting a new one");
                    id
                }
            }
        }
    }
}
