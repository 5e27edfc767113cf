use std::{path::PathBuf, sync::Arc, time::Duration};

use chatqa::{
    config::{DEFAULT_EMBEDDING_MODEL, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SIMILARITY_THRESHOLD},
    embedder_for, load_cases,
    providers::openai::OpenAI,
    run_suite, AccountBook, ConversationMode, Embedder, Grader, HashingEmbedder, JsonFileSink,
    LLMProvider, LlmJudge, ReportSink, RunConfig, SimilarityModel,
};
use tracing::{info, warn};
use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, ValueEnum)]
enum ModeArg {
    /// Blank conversation ids get a fresh id per row
    Fresh,
    /// Blank conversation ids append to the account's latest remote conversation
    Resume,
}

impl From<ModeArg> for ConversationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Fresh => ConversationMode::Fresh,
            ModeArg::Resume => ConversationMode::Resume,
        }
    }
}

#[derive(Parser)]
#[command(name = "chatqa")]
#[command(about = "Replay scripted conversations against a chat API and grade the replies")]
struct Args {
    /// Test table (CSV, or JSON/YAML array of rows)
    #[arg(long, default_value = "prompts/tests.csv")]
    tests: PathBuf,

    /// Accounts file (YAML)
    #[arg(long, default_value = "config/accounts.yaml")]
    accounts: PathBuf,

    /// Directory for the JSON report
    #[arg(long, default_value = "reports")]
    reports_dir: PathBuf,

    /// Account used for rows with a blank account (defaults to the first configured)
    #[arg(long)]
    default_account: Option<String>,

    /// How rows with a blank conversation id are assigned
    #[arg(long, value_enum, default_value = "fresh")]
    conversation_mode: ModeArg,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Overall run budget in seconds; unfinished conversations are cancelled
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Minimum cosine similarity to the expected answer
    #[arg(long, default_value_t = DEFAULT_SIMILARITY_THRESHOLD)]
    threshold: f32,

    /// Judge model (OpenAI-compatible, credentials from OPENAI_* env vars)
    #[arg(long, default_value = "gpt-4o-mini")]
    judge_model: String,

    /// Grade judge rows with basic checks instead of calling a judge
    #[arg(long)]
    skip_judge: bool,

    /// Sentence-embedding model for the similarity check (OpenAI-compatible)
    #[arg(long, default_value = DEFAULT_EMBEDDING_MODEL)]
    embedding_model: String,

    /// Use local word-hashing vectors instead of sentence embeddings.
    /// Only word overlap is measured, so paraphrases may fail.
    #[arg(long)]
    offline_similarity: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,chatqa=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let accounts = AccountBook::load(&args.accounts)?;
    let cases = load_cases(&args.tests)?;
    info!(accounts = accounts.len(), rows = cases.len(), "loaded test table");
    let needs_judge = cases.iter().any(|case| case.use_judge);
    let needs_similarity = cases.iter().any(|case| case.expected_text.is_some());
    let similarity_model = if args.offline_similarity {
        SimilarityModel::Hashing
    } else {
        SimilarityModel::Remote(args.embedding_model)
    };

    let mut config = RunConfig::default()
        .with_request_timeout(Duration::from_secs(args.timeout_secs))
        .with_similarity_threshold(args.threshold)
        .with_similarity_model(similarity_model)
        .with_conversation_mode(args.conversation_mode.into())
        .with_reports_dir(args.reports_dir);
    if let Some(secs) = args.deadline_secs {
        config = config.with_deadline(Duration::from_secs(secs));
    }
    if let Some(account) = args.default_account {
        config = config.with_default_account(account);
    }

    let remote_similarity = needs_similarity && config.similarity_model.is_remote();
    let remote: Option<Arc<dyn LLMProvider>> = if (needs_judge && !args.skip_judge) || remote_similarity {
        Some(Arc::new(OpenAI::from_env()?))
    } else {
        None
    };

    let embedder: Arc<dyn Embedder> = if needs_similarity {
        if !config.similarity_model.is_remote() {
            warn!("offline similarity compares word overlap only; paraphrased replies may fail");
        }
        embedder_for(&config.similarity_model, remote.as_ref())?
    } else {
        // No row has a gold answer, so nothing is ever embedded.
        Arc::new(HashingEmbedder::new())
    };
    let mut grader = Grader::new(embedder).with_threshold(config.similarity_threshold);
    if needs_judge && !args.skip_judge {
        if let Some(provider) = &remote {
            grader = grader.with_judge(Arc::new(LlmJudge::new(Arc::clone(provider), args.judge_model)));
        }
    }

    let report = run_suite(cases, &accounts, &config, Arc::new(grader), args.skip_judge).await?;

    let path = JsonFileSink::new(&config.reports_dir).write(&report)?;
    let summary = report.summary();

    for failed in report.failed() {
        eprintln!("FAIL {}", failed.composite_id);
        for reason in &failed.failures {
            eprintln!("  - {reason}");
        }
    }
    if report.cancelled_conversations > 0 {
        eprintln!(
            "{} conversation(s) cancelled by the run deadline",
            report.cancelled_conversations
        );
    }
    println!("{summary} – report saved to {}", path.display());

    if summary.all_passed() && report.cancelled_conversations == 0 {
        Ok(())
    } else {
        std::process::exit(1);
    }
}
