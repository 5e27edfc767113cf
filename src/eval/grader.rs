//! Pass/fail decision for one reply.
//!
//! `basic_pass` is the keyword stage AND the similarity stage. When a row asks
//! for the judge and has a prompt, the judge verdict replaces `basic_pass`.

use std::sync::Arc;

use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::warn;

use crate::{
    config::DEFAULT_SIMILARITY_THRESHOLD,
    eval::{
        embedding::{cosine_similarity, Embedder, HashingEmbedder},
        judge::LlmJudge,
    },
};

#[derive(Debug, Clone, Copy)]
pub struct GradeInput<'a> {
    pub reply: &'a str,
    pub prompt: &'a str,
    pub keywords: &'a str,
    pub expected: &'a str,
    pub use_judge: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Verdict {
    pub pass: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub similarity_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge: Option<bool>,
}

impl Verdict {
    pub fn keywords_ok(&self) -> bool {
        self.missing_keywords.is_empty()
    }

    pub fn basic_pass(&self) -> bool {
        self.keywords_ok() && self.similarity_ok
    }

    /// Human-readable reasons for a failing verdict.
    pub fn failures(&self, threshold: f32) -> Vec<String> {
        if self.pass {
            return Vec::new();
        }
        let mut failures = Vec::new();
        if let Some(false) = self.judge {
            failures.push("judge verdict: fail".to_string());
        }
        failures.extend(
            self.missing_keywords
                .iter()
                .map(|k| format!("missing keyword: {k}")),
        );
        if !self.similarity_ok {
            failures.push(match self.similarity {
                Some(score) => format!("similarity {score:.3} below {threshold:.2}"),
                None => "similarity could not be computed".to_string(),
            });
        }
        failures
    }
}

enum KeywordMatcher {
    Pattern(Regex),
    /// Lowercased fragment, for fragments no regex can be built from.
    Literal(String),
}

impl KeywordMatcher {
    fn new(fragment: &str) -> Self {
        RegexBuilder::new(fragment)
            .case_insensitive(true)
            .build()
            .or_else(|_| {
                RegexBuilder::new(&regex::escape(fragment))
                    .case_insensitive(true)
                    .build()
            })
            .map(Self::Pattern)
            .unwrap_or_else(|_| Self::Literal(fragment.to_lowercase()))
    }

    fn is_match(&self, reply: &str) -> bool {
        match self {
            Self::Pattern(regex) => regex.is_match(reply),
            Self::Literal(fragment) => reply.to_lowercase().contains(fragment.as_str()),
        }
    }
}

fn keyword_patterns(spec: &str) -> impl Iterator<Item = (&str, KeywordMatcher)> {
    spec.split(';')
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .map(|fragment| (fragment, KeywordMatcher::new(fragment)))
}

/// Keyword fragments from `spec` that do not occur in `reply`.
pub fn missing_keywords(reply: &str, spec: &str) -> Vec<String> {
    keyword_patterns(spec)
        .filter(|(_, matcher)| !matcher.is_match(reply))
        .map(|(fragment, _)| fragment.to_string())
        .collect()
}

/// Every `;`-separated fragment must match, case-insensitively. Empty spec passes.
pub fn keywords_match(reply: &str, spec: &str) -> bool {
    keyword_patterns(spec).all(|(_, matcher)| matcher.is_match(reply))
}

fn same_text(a: &str, b: &str) -> bool {
    a.split_whitespace().eq(b.split_whitespace())
}

pub struct Grader {
    embedder: Arc<dyn Embedder>,
    judge: Option<Arc<LlmJudge>>,
    threshold: f32,
}

impl Grader {
    pub fn new(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            judge: None,
            threshold: DEFAULT_SIMILARITY_THRESHOLD,
        }
    }

    /// Offline grader: local hashing embeddings, no judge.
    pub fn offline() -> Self {
        Self::new(Arc::new(HashingEmbedder::new()))
    }

    pub fn with_judge(mut self, judge: Arc<LlmJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn has_judge(&self) -> bool {
        self.judge.is_some()
    }

    /// `(score, ok)`. An empty gold answer passes without a score; a reply
    /// equal to the gold answer up to whitespace scores 1.0 without embedding.
    pub async fn similarity_ok(&self, reply: &str, expected: &str) -> (Option<f32>, bool) {
        if expected.is_empty() {
            return (None, true);
        }
        if same_text(reply, expected) {
            return (Some(1.0), true);
        }

        let score = async {
            let a = self.embedder.embed(reply).await?;
            let b = self.embedder.embed(expected).await?;
            cosine_similarity(&a, &b)
        }
        .await;

        match score {
            Ok(score) => (Some(score), score >= self.threshold),
            Err(err) => {
                warn!(model = %self.embedder.model_id(), error = %err, "similarity check failed");
                (None, false)
            }
        }
    }

    pub async fn grade(&self, input: GradeInput<'_>) -> Verdict {
        let missing_keywords = missing_keywords(input.reply, input.keywords);
        let (similarity, similarity_ok) = self.similarity_ok(input.reply, input.expected).await;
        let basic_pass = missing_keywords.is_empty() && similarity_ok;

        let judge = if input.use_judge && !input.prompt.is_empty() {
            match &self.judge {
                Some(judge) => Some(judge.judge(input.prompt, input.reply).await),
                None => {
                    warn!("judge requested but none configured; using basic checks");
                    None
                }
            }
        } else {
            None
        };

        Verdict {
            pass: judge.unwrap_or(basic_pass),
            missing_keywords,
            similarity,
            similarity_ok,
            judge,
        }
    }
}
