//! Fan-out/fan-in over conversations.
//!
//! Every conversation becomes one future; all of them are polled from the
//! calling task, so they interleave only at network boundaries. Results flow
//! through a channel whose only reader is the dispatcher, and the report is
//! built once every conversation has finished or the deadline has expired.

use std::{sync::Arc, time::Duration};

use futures_util::{stream::FuturesUnordered, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    config::RunConfig,
    eval::{
        chat::build_http_client,
        grader::Grader,
        grouping::Plan,
        report::{Report, TurnResult},
        runner::ConversationRunner,
    },
    HarnessError,
};

pub struct Dispatcher {
    runner: ConversationRunner,
    deadline: Option<Duration>,
    has_judge: bool,
}

impl Dispatcher {
    /// Fails only when the HTTP client itself cannot be built.
    pub fn new(config: &RunConfig, grader: Arc<Grader>) -> Result<Self, HarnessError> {
        let http = build_http_client(config.request_timeout)?;
        Ok(Self {
            has_judge: grader.has_judge(),
            runner: ConversationRunner::new(http, grader),
            deadline: config.deadline,
        })
    }

    /// Configuration checks that must pass before any network call.
    pub fn preflight(&self, plan: &Plan, allow_missing_judge: bool) -> Result<(), HarnessError> {
        let rows = plan.judge_rows();
        if rows > 0 && !self.has_judge {
            if !allow_missing_judge {
                return Err(HarnessError::JudgeNotConfigured { rows });
            }
            warn!(rows, "judge requested but disabled; those rows use basic checks");
        }
        Ok(())
    }

    pub async fn run(&self, plan: Plan) -> Report {
        info!(
            conversations = plan.conversation_count(),
            turns = plan.turn_count(),
            "dispatching"
        );
        let sessions = plan.into_sessions();
        let total = sessions.len();

        let (tx, mut rx) = mpsc::unbounded_channel::<TurnResult>();
        let mut tasks = FuturesUnordered::new();
        for session in sessions {
            let span = info_span!(
                "conversation",
                account = %session.account.id,
                conversation = %session.conversation
            );
            let tx = tx.clone();
            let runner = &self.runner;
            tasks.push(
                async move {
                    runner
                        .run_with_callback(session, |result| {
                            // Receiver outlives every task.
                            let _ = tx.send(result.clone());
                        })
                        .await
                        .len()
                }
                .instrument(span),
            );
        }
        drop(tx);

        let drive = async {
            let mut finished = 0usize;
            while let Some(turns) = tasks.next().await {
                finished += 1;
                info!(turns, "conversation finished ({finished}/{total})");
            }
        };

        let completed = match self.deadline {
            Some(deadline) => tokio::time::timeout(deadline, drive).await.is_ok(),
            None => {
                drive.await;
                true
            }
        };

        let cancelled = if completed {
            0
        } else {
            warn!(
                outstanding = tasks.len(),
                "run deadline expired; cancelling outstanding conversations"
            );
            tasks.len()
        };
        // Dropping the futures cancels them and closes the remaining senders.
        drop(tasks);

        let mut results = Vec::new();
        while let Some(result) = rx.recv().await {
            results.push(result);
        }

        let mut report = Report::new(results);
        report.cancelled_conversations = cancelled;
        report
    }
}
