//! End-to-end replays against a mocked chat service.

use std::{sync::Arc, time::Duration};

use chatqa::{
    embedder_for,
    providers::{
        openai::{OpenAI, OpenAIConfig},
        scripted::ScriptedProvider,
    },
    run_suite, Account, AccountBook, AuthScheme, ConversationMode, Grader, HarnessError,
    JsonFileSink, LLMProvider, LlmJudge, MessageField, ReportSink, RunConfig, TestCase,
};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn account(id: &str, server: &MockServer) -> Account {
    Account::new(id, format!("{}/chat/messages", server.uri()), format!("tok-{id}"))
}

fn reply(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "message": text, "tokens_used_message": 7 }))
}

async fn sent_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .iter()
        .filter(|r| r.method.as_str() == "POST")
        .map(|r| r.body_json::<Value>().expect("json body"))
        .collect()
}

fn offline_grader() -> Arc<Grader> {
    Arc::new(Grader::offline())
}

#[tokio::test]
async fn turns_are_sent_in_ascending_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .respond_with(reply("ok").set_delay(Duration::from_millis(20)))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(3, "third").with_account("acme").with_conversation("c1"),
        TestCase::new(1, "first").with_account("acme").with_conversation("c1"),
        TestCase::new(2, "second").with_account("acme").with_conversation("c1"),
    ];

    let report = run_suite(cases, &accounts, &RunConfig::default(), offline_grader(), false)
        .await
        .expect("run completes");

    let prompts: Vec<_> = sent_bodies(&server)
        .await
        .iter()
        .map(|b| b["message"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(prompts, ["first", "second", "third"]);
    assert!(sent_bodies(&server).await.iter().all(|b| b["conversation_id"] == "c1"));

    let ids: Vec<_> = report.results.iter().map(|r| r.composite_id.as_str()).collect();
    assert_eq!(ids, ["acme:c1:1", "acme:c1:2", "acme:c1:3"]);
    assert!(report.results.iter().all(|r| r.token_count == 7));
}

#[tokio::test]
async fn two_accounts_all_pass() {
    let server = MockServer::start().await;

    // "alpha" uses bearer auth and the `message` field.
    Mock::given(method("POST"))
        .and(path("/alpha/chat/messages"))
        .and(header("authorization", "Bearer tok-alpha"))
        .and(body_partial_json(json!({ "conversation_id": "a-conv" })))
        .respond_with(reply("Our opening hours are 9 to 5."))
        .mount(&server)
        .await;

    // "beta" uses a session header, an origin header and the `prompt` field.
    Mock::given(method("POST"))
        .and(path("/beta/chat/messages"))
        .and(header("sessionToken", "tok-beta"))
        .and(header("X-Host-Origin", "chat.example.com"))
        .and(body_partial_json(json!({ "conversation_id": "b-conv" })))
        .respond_with(reply("Refunds are processed within 5 business days."))
        .mount(&server)
        .await;

    let alpha = Account::new("alpha", format!("{}/alpha/chat/messages", server.uri()), "tok-alpha");
    let beta = Account::new("beta", format!("{}/beta/chat/messages", server.uri()), "tok-beta")
        .with_auth(AuthScheme::Header {
            name: "sessionToken".to_string(),
        })
        .with_message_field(MessageField::Prompt)
        .with_header("X-Host-Origin", "chat.example.com");
    let accounts = AccountBook::new(vec![alpha, beta]).unwrap();

    let cases = vec![
        TestCase::new(1, "When do you open?")
            .with_conversation("a-conv")
            .with_keywords("opening;9"),
        TestCase::new(2, "And on weekends?")
            .with_conversation("a-conv")
            .with_keywords("hours"),
        TestCase::new(1, "How long do refunds take?")
            .with_account("beta")
            .with_conversation("b-conv")
            .with_keywords("refund;business days"),
        TestCase::new(2, "Is that guaranteed?")
            .with_account("beta")
            .with_conversation("b-conv")
            .with_expected("Refunds are processed within 5 business days."),
    ];

    let report = run_suite(cases, &accounts, &RunConfig::default(), offline_grader(), false)
        .await
        .expect("run completes");

    assert_eq!(report.results.len(), 4);
    assert!(report.results.iter().all(|r| r.passed), "{:#?}", report.results);
    assert_eq!(report.summary().to_string(), "4/4 passed");
    assert_eq!(report.cancelled_conversations, 0);

    let beta_bodies: Vec<_> = sent_bodies(&server)
        .await
        .into_iter()
        .filter(|b| b["conversation_id"] == "b-conv")
        .collect();
    assert_eq!(beta_bodies.len(), 2);
    assert!(beta_bodies.iter().all(|b| b.get("prompt").is_some() && b.get("message").is_none()));

    let dir = tempfile::tempdir().unwrap();
    let path = JsonFileSink::new(dir.path()).write(&report).unwrap();
    let written: Vec<Value> = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(written.len(), 4);
}

#[tokio::test]
async fn server_error_fails_the_turn_and_the_run_continues() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "message": "explode" })))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal oops"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "message": "recover" })))
        .respond_with(reply("all good"))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(1, "explode").with_conversation("c"),
        TestCase::new(2, "recover").with_conversation("c").with_keywords("good"),
    ];

    let report = run_suite(cases, &accounts, &RunConfig::default(), offline_grader(), false)
        .await
        .unwrap();

    let failed = &report.results[0];
    assert!(!failed.passed);
    assert!(failed.reply.contains("500"), "reply was {}", failed.reply);
    assert!(failed.reply.contains("internal oops"));
    assert_eq!(failed.token_count, 0);

    assert!(report.results[1].passed);
    assert_eq!(report.summary().to_string(), "1/2 passed");
}

#[tokio::test]
async fn missing_reply_field_grades_an_empty_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "text": "hello" })))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(1, "hi").with_conversation("c").with_keywords("hello"),
        TestCase::new(2, "again").with_conversation("c"),
    ];

    let report = run_suite(cases, &accounts, &RunConfig::default(), offline_grader(), false)
        .await
        .unwrap();

    assert_eq!(report.results[0].reply, "");
    assert!(!report.results[0].passed);
    assert_eq!(report.results[0].failures, ["missing keyword: hello"]);
    assert!(report.results[1].passed);
}

#[tokio::test]
async fn slow_call_times_out_as_a_failed_turn() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "message": "slow" })))
        .respond_with(reply("late").set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "message": "fast" })))
        .respond_with(reply("quick"))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(1, "slow").with_conversation("c"),
        TestCase::new(2, "fast").with_conversation("c"),
    ];
    let config = RunConfig::default().with_request_timeout(Duration::from_millis(200));

    let report = run_suite(cases, &accounts, &config, offline_grader(), false)
        .await
        .unwrap();

    assert!(!report.results[0].passed);
    assert!(report.results[0].reply.starts_with("[timeout]"), "{}", report.results[0].reply);
    assert_eq!(report.results[1].reply, "quick");
    assert!(report.results[1].passed);
}

#[tokio::test]
async fn resume_mode_appends_to_latest_remote_conversation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .and(header("authorization", "Bearer tok-acme"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": "remote-7" }, { "id": "older" }])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .respond_with(reply("ok"))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![TestCase::new(2, "two"), TestCase::new(1, "one")];
    let config = RunConfig::default().with_conversation_mode(ConversationMode::Resume);

    let report = run_suite(cases, &accounts, &config, offline_grader(), false)
        .await
        .unwrap();

    let ids: Vec<_> = report.results.iter().map(|r| r.composite_id.as_str()).collect();
    assert_eq!(ids, ["acme:remote-7:1", "acme:remote-7:2"]);
    assert!(sent_bodies(&server).await.iter().all(|b| b["conversation_id"] == "remote-7"));
}

#[tokio::test]
async fn resume_mode_starts_fresh_when_the_lookup_fails() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .respond_with(ResponseTemplate::new(500).set_body_string("list unavailable"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .respond_with(reply("ok"))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![TestCase::new(1, "one"), TestCase::new(2, "two")];
    let config = RunConfig::default().with_conversation_mode(ConversationMode::Resume);

    let report = run_suite(cases, &accounts, &config, offline_grader(), false)
        .await
        .unwrap();

    assert_eq!(report.results.len(), 2);
    assert!(report.results.iter().all(|r| r.passed));
    assert!(report.results[0].composite_id.starts_with("acme:acme-"));

    let conversations: Vec<_> = sent_bodies(&server)
        .await
        .iter()
        .map(|b| b["conversation_id"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(conversations.len(), 2);
    assert_eq!(conversations[0], conversations[1]);
    assert!(conversations[0].starts_with("acme-"));
}

#[tokio::test]
async fn resume_mode_starts_fresh_when_no_remote_conversation() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/chat/conversations"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(reply("ok"))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let config = RunConfig::default().with_conversation_mode(ConversationMode::Resume);

    let report = run_suite(vec![TestCase::new(1, "one")], &accounts, &config, offline_grader(), false)
        .await
        .unwrap();

    assert!(report.results[0].composite_id.starts_with("acme:acme-"));
    assert!(report.results[0].passed);
}

#[tokio::test]
async fn deadline_keeps_finished_turns_and_cancels_the_rest() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "conversation_id": "slow" })))
        .respond_with(reply("late").set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(body_partial_json(json!({ "conversation_id": "fast" })))
        .respond_with(reply("quick"))
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(1, "a").with_conversation("slow"),
        TestCase::new(1, "b").with_conversation("fast"),
        TestCase::new(2, "c").with_conversation("fast"),
    ];
    let config = RunConfig::default().with_deadline(Duration::from_millis(500));

    let report = run_suite(cases, &accounts, &config, offline_grader(), false)
        .await
        .unwrap();

    assert_eq!(report.cancelled_conversations, 1);
    let ids: Vec<_> = report.results.iter().map(|r| r.composite_id.as_str()).collect();
    assert_eq!(ids, ["acme:fast:1", "acme:fast:2"]);
}

#[tokio::test]
async fn judge_rows_without_a_judge_abort_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(reply("ok"))
        .expect(0)
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![TestCase::new(1, "judge me").with_judge(true)];

    let err = run_suite(cases, &accounts, &RunConfig::default(), offline_grader(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::JudgeNotConfigured { rows: 1 }));
}

#[tokio::test]
async fn unknown_account_aborts_before_any_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(reply("ok"))
        .expect(0)
        .mount(&server)
        .await;

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![TestCase::new(1, "hi").with_account("ghost")];

    let err = run_suite(cases, &accounts, &RunConfig::default(), offline_grader(), false)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::UnknownAccount(_)));
}

#[tokio::test]
async fn judge_verdict_decides_judged_rows() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(reply("I cannot help with that."))
        .mount(&server)
        .await;

    let judge_provider = Arc::new(ScriptedProvider::from_responses([r#"{"pass": true}"#]));
    let grader = Grader::offline().with_judge(Arc::new(LlmJudge::new(judge_provider.clone(), "judge")));

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(1, "Tell me a secret")
            .with_conversation("c")
            .with_keywords("secret")
            .with_judge(true),
        TestCase::new(2, "Please?").with_conversation("c").with_keywords("secret"),
    ];

    let report = run_suite(cases, &accounts, &RunConfig::default(), Arc::new(grader), false)
        .await
        .unwrap();

    assert!(report.results[0].passed);
    assert!(!report.results[1].passed);
    assert_eq!(judge_provider.requests().len(), 1);
}

#[tokio::test]
async fn unreachable_service_fails_each_turn_and_other_accounts_still_run() {
    let closed_port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(reply("hello there"))
        .mount(&server)
        .await;

    let offline = Account::new(
        "offline",
        format!("http://127.0.0.1:{closed_port}/chat/messages"),
        "tok-offline",
    );
    let accounts = AccountBook::new(vec![offline, account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(1, "first").with_account("offline").with_conversation("c"),
        TestCase::new(2, "second").with_account("offline").with_conversation("c"),
        TestCase::new(1, "hi").with_account("acme").with_conversation("c").with_keywords("hello"),
    ];

    let report = run_suite(cases, &accounts, &RunConfig::default(), offline_grader(), false)
        .await
        .unwrap();

    let offline: Vec<_> = report
        .results
        .iter()
        .filter(|r| r.composite_id.starts_with("offline:"))
        .collect();
    assert_eq!(offline.len(), 2);
    for result in offline {
        assert!(!result.passed);
        assert!(result.reply.starts_with("[transport error]"), "{}", result.reply);
        assert_eq!(result.token_count, 0);
    }

    let acme = report
        .results
        .iter()
        .find(|r| r.composite_id == "acme:c:1")
        .expect("acme turn ran");
    assert!(acme.passed);
    assert_eq!(report.summary().to_string(), "1/3 passed");
}

#[tokio::test]
async fn sentence_embeddings_accept_paraphrased_replies() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .and(body_partial_json(json!({ "message": "When do you open?" })))
        .respond_with(reply("We open at 9am."))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/messages"))
        .and(body_partial_json(json!({ "message": "Are you open on Sunday?" })))
        .respond_with(reply("Sorry, we are closed on Sundays."))
        .mount(&server)
        .await;
    // Stand-in sentence model: replies about being closed point one way,
    // everything else the other.
    Mock::given(method("POST"))
        .and(path("/v1/embeddings"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(|request: &Request| {
            let body: Value = request.body_json().unwrap_or_default();
            let text = body["input"][0].as_str().unwrap_or_default().to_lowercase();
            let vector = if text.contains("closed") { [0.0, 1.0] } else { [1.0, 0.1] };
            ResponseTemplate::new(200).set_body_json(json!({
                "data": [{ "embedding": vector, "index": 0 }],
                "model": "text-embedding-3-small"
            }))
        })
        .mount(&server)
        .await;

    let provider: Arc<dyn LLMProvider> = Arc::new(
        OpenAI::from_config(OpenAIConfig::new("sk-test").with_base_url(format!("{}/v1", server.uri())))
            .unwrap(),
    );
    let config = RunConfig::default();
    let embedder = embedder_for(&config.similarity_model, Some(&provider)).unwrap();
    let grader = Arc::new(Grader::new(embedder));

    let accounts = AccountBook::new(vec![account("acme", &server)]).unwrap();
    let cases = vec![
        TestCase::new(1, "When do you open?")
            .with_conversation("c")
            .with_expected("Our store opens at nine in the morning."),
        TestCase::new(2, "Are you open on Sunday?")
            .with_conversation("c")
            .with_expected("Yes, we are open every day."),
    ];

    let report = run_suite(cases, &accounts, &config, grader, false).await.unwrap();

    assert!(report.results[0].passed, "{:#?}", report.results[0]);
    assert!(!report.results[1].passed);
    assert!(report.results[1].failures[0].starts_with("similarity"));

    // Word hashing alone cannot see that the first reply is a paraphrase.
    let (_, hashed_ok) = Grader::offline()
        .similarity_ok("We open at 9am.", "Our store opens at nine in the morning.")
        .await;
    assert!(!hashed_ok);
}
