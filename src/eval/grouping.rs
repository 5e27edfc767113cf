//! Turns the flat test table into per-conversation work.
//!
//! Blank accounts resolve to the default account. Blank conversation ids are
//! handled by [`ConversationMode`]: `Fresh` gives every such row its own
//! synthesized id, `Resume` puts all of an account's blank rows into one
//! conversation that is resolved against the remote service at run time.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fmt,
    sync::Arc,
};

use tracing::warn;

use crate::{
    config::{Account, AccountBook, ConversationMode},
    eval::case::TestCase,
    HarnessError,
};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConversationRef {
    /// Supplied by the table or synthesized during grouping.
    Id(String),
    /// The account's most recent remote conversation, looked up on first use.
    Latest,
}

impl fmt::Display for ConversationRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => f.write_str(id),
            Self::Latest => f.write_str("latest"),
        }
    }
}

/// Work for one runner task. Owned by that task alone.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    pub account: Arc<Account>,
    pub conversation: ConversationRef,
    /// Sorted ascending by `turn_index`.
    pub turns: Vec<TestCase>,
}

#[derive(Debug, Clone)]
pub struct AccountGroup {
    pub account: Arc<Account>,
    pub conversations: BTreeMap<ConversationRef, Vec<TestCase>>,
}

/// account id → conversation → ordered turns.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    groups: BTreeMap<String, AccountGroup>,
}

impl Plan {
    pub fn account(&self, account: &str) -> Option<&AccountGroup> {
        self.groups.get(account)
    }

    pub fn turns(&self, account: &str, conversation: &ConversationRef) -> Option<&[TestCase]> {
        self.groups
            .get(account)
            .and_then(|group| group.conversations.get(conversation))
            .map(Vec::as_slice)
    }

    /// Number of conversations, i.e. concurrent tasks.
    pub fn conversation_count(&self) -> usize {
        self.groups.values().map(|g| g.conversations.len()).sum()
    }

    pub fn turn_count(&self) -> usize {
        self.groups
            .values()
            .flat_map(|g| g.conversations.values())
            .map(Vec::len)
            .sum()
    }

    /// Rows that asked for an LLM judge verdict.
    pub fn judge_rows(&self) -> usize {
        self.groups
            .values()
            .flat_map(|g| g.conversations.values())
            .flatten()
            .filter(|case| case.use_judge)
            .count()
    }

    pub fn into_sessions(self) -> Vec<ConversationSession> {
        self.groups
            .into_values()
            .flat_map(|group| {
                let account = group.account;
                group
                    .conversations
                    .into_iter()
                    .map(move |(conversation, turns)| ConversationSession {
                        account: Arc::clone(&account),
                        conversation,
                        turns,
                    })
            })
            .collect()
    }
}

/// Produces collision-resistant conversation ids from the clock and account id.
#[derive(Debug)]
pub struct IdSynthesizer {
    epoch_nanos: i64,
    counter: u64,
}

impl IdSynthesizer {
    pub fn new() -> Self {
        let now = chrono::Utc::now();
        let epoch_nanos = now
            .timestamp_nanos_opt()
            .unwrap_or_else(|| now.timestamp_micros().saturating_mul(1_000));
        Self::starting_at(epoch_nanos)
    }

    pub fn starting_at(epoch_nanos: i64) -> Self {
        Self {
            epoch_nanos,
            counter: 0,
        }
    }

    pub fn next_id(&mut self, account: &str) -> String {
        let id = format!("{account}-{:x}-{}", self.epoch_nanos, self.counter);
        self.counter += 1;
        id
    }
}

impl Default for IdSynthesizer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn group_cases(
    cases: Vec<TestCase>,
    accounts: &AccountBook,
    mode: ConversationMode,
    default_account: Option<&str>,
) -> Result<Plan, HarnessError> {
    group_cases_with(cases, accounts, mode, default_account, &mut IdSynthesizer::new())
}

pub fn group_cases_with(
    cases: Vec<TestCase>,
    accounts: &AccountBook,
    mode: ConversationMode,
    default_account: Option<&str>,
    ids: &mut IdSynthesizer,
) -> Result<Plan, HarnessError> {
    let fallback = accounts.default_account(default_account)?;
    let mut groups: BTreeMap<String, AccountGroup> = BTreeMap::new();
    let mut defaulted_accounts = 0usize;
    let mut defaulted_conversations = 0usize;

    for case in cases {
        let account = match case.account_id.as_deref() {
            Some(id) => accounts
                .get(id)
                .ok_or_else(|| HarnessError::UnknownAccount(id.to_string()))?,
            None => {
                defaulted_accounts += 1;
                fallback
            }
        };

        let conversation = match (&case.conversation_id, mode) {
            (Some(id), _) => ConversationRef::Id(id.clone()),
            (None, ConversationMode::Fresh) => {
                defaulted_conversations += 1;
                ConversationRef::Id(ids.next_id(&account.id))
            }
            (None, ConversationMode::Resume) => {
                defaulted_conversations += 1;
                ConversationRef::Latest
            }
        };

        let turns = groups
            .entry(account.id.clone())
            .or_insert_with(|| AccountGroup {
                account: Arc::clone(account),
                conversations: BTreeMap::new(),
            })
            .conversations
            .entry(conversation)
            .or_default();
        turns.push(case);
    }

    for (account_id, group) in &mut groups {
        for (conversation, turns) in &mut group.conversations {
            turns.sort_by_key(|case| case.turn_index);
            if let Some(pair) = turns.windows(2).find(|w| w[0].turn_index == w[1].turn_index) {
                return Err(HarnessError::DuplicateTurn {
                    account: account_id.clone(),
                    conversation: conversation.to_string(),
                    turn: pair[0].turn_index,
                });
            }
        }
    }

    if defaulted_accounts > 0 {
        warn!(
            rows = defaulted_accounts,
            account = %fallback.id,
            "rows without an account were assigned to the default account"
        );
    }
    if defaulted_conversations > 0 {
        warn!(
            rows = defaulted_conversations,
            mode = ?mode,
            "rows without a conversation id were assigned one"
        );
    }

    Ok(Plan { groups })
}
