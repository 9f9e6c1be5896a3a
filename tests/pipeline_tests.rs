//! End-to-end pipeline tests against the builtin agents.
//!
//! These exercise the full dispatch flow: rule reasoning, parallel and
//! serial execution, fallback substitution, validation-triggered retries,
//! streaming events, and query-log records.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use conductor::config::{LoadedConfig, OrchestratorConfig, ReasoningMode};
use conductor::pipeline::{EventSink, Orchestrator, StreamEventKind};
use conductor::reasoner::{Combinator, Condition, ConditionOp, Rule};
use conductor::session::QueryRecord;
use conductor::types::{AgentDescriptor, TransportKind};
use conductor::{BuiltinCatalog, QueryId, RequestEnvelope, ResponseEnvelope};

fn agent(name: &str, capabilities: &[&str]) -> AgentDescriptor {
    AgentDescriptor {
        name: name.into(),
        capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        description: None,
        transport: TransportKind::InProcess,
        endpoint: None,
        tool: None,
        allow_fields: vec![],
        deny_fields: vec![],
        max_retries: 0,
        timeout: Duration::from_secs(5),
        fallback: None,
        enabled: true,
        optional: false,
    }
}

fn contains_rule(name: &str, priority: i64, needle: &str, targets: &[&str], conf: f64) -> Rule {
    Rule {
        name: name.into(),
        priority,
        combinator: Combinator::And,
        conditions: vec![Condition {
            field_path: "query".into(),
            operator: ConditionOp::Contains,
            value: json!(needle),
            case_sensitive: false,
        }],
        target_agents: targets.iter().map(|s| s.to_string()).collect(),
        base_confidence: conf,
        parallel: false,
        enabled: true,
    }
}

fn demo_rules() -> Vec<Rule> {
    vec![
        Rule {
            name: "math".into(),
            priority: 100,
            combinator: Combinator::Or,
            conditions: vec![
                Condition {
                    field_path: "query".into(),
                    operator: ConditionOp::MatchesRegex,
                    value: json!(r"\b(calculate|compute|add|sum|subtract|multiply|divide|digits?)\b"),
                    case_sensitive: false,
                },
                Condition {
                    field_path: "operation".into(),
                    operator: ConditionOp::Exists,
                    value: json!(null),
                    case_sensitive: true,
                },
            ],
            target_agents: vec!["calculator".into()],
            base_confidence: 0.9,
            parallel: false,
            enabled: true,
        },
        contains_rule("weather", 90, "weather", &["weather"], 0.85),
        contains_rule("news", 85, "news", &["tavily_search"], 0.8),
        contains_rule("corpus_search", 70, "search", &["search"], 0.75),
    ]
}

fn demo_agents() -> Vec<AgentDescriptor> {
    let mut tavily = agent("tavily_search", &["web-search", "news"]);
    tavily.transport = TransportKind::RemoteTool;
    // Nothing listens here: every call fails with a connection error.
    tavily.endpoint = Some("http://127.0.0.1:1/tools".into());
    tavily.fallback = Some("search".into());
    tavily.timeout = Duration::from_secs(2);

    vec![
        agent("calculator", &["math"]),
        agent("search", &["search"]),
        agent("weather", &["weather"]),
        agent("data_processor", &["data"]),
        tavily,
    ]
}

fn loaded_config(log_dir: Option<&std::path::Path>) -> LoadedConfig {
    let mut settings = OrchestratorConfig::default();
    settings.reasoning.mode = ReasoningMode::Hybrid;
    settings.execution.backoff_base = Duration::from_millis(1);
    settings.execution.backoff_cap = Duration::from_millis(4);
    match log_dir {
        Some(dir) => settings.query_log.directory = dir.to_path_buf(),
        None => settings.query_log.enabled = false,
    }
    LoadedConfig {
        settings,
        agents: demo_agents(),
        rules: demo_rules(),
    }
}

fn orchestrator(log_dir: Option<&std::path::Path>) -> Orchestrator {
    Orchestrator::from_config(loaded_config(log_dir), Arc::new(BuiltinCatalog::default())).unwrap()
}

async fn run(orchestrator: &Orchestrator, envelope: RequestEnvelope) -> ResponseEnvelope {
    let query_id = QueryId::new();
    let sink = EventSink::discard(query_id.to_string());
    orchestrator
        .process(query_id, envelope, None, &sink)
        .await
        .expect("pipeline result")
}

#[tokio::test]
async fn single_agent_calculation() {
    let orch = orchestrator(None);
    let envelope = RequestEnvelope::new("calculate 15 + 27")
        .with_field("operation", json!("add"))
        .with_field("operands", json!([15, 27]));
    let response = run(&orch, envelope).await;

    assert!(response.success);
    assert_eq!(response.data["calculator"]["result"], json!(42.0));
    assert_eq!(response.metadata.agent_trail, vec!["calculator"]);
    let method = response.metadata.reasoning_method.unwrap().to_string();
    assert!(
        ["rule", "hybrid_rule", "rule_multi"].contains(&method.as_str()),
        "unexpected method {}",
        method
    );
    assert!(response.errors.is_empty());
}

#[tokio::test]
async fn multi_intent_parallel() {
    let orch = orchestrator(None);
    let envelope =
        RequestEnvelope::new("current weather of London, UK and add the digits 5,8");
    let response = run(&orch, envelope).await;

    assert!(response.success);
    assert_eq!(response.data["calculator"]["result"], json!(13.0));
    assert!(response.data.contains_key("weather"));
    assert_eq!(response.data["weather"]["location"], json!("London, UK"));
    assert!(response.metadata.agent_trail.contains(&"calculator".to_string()));
    assert!(response.metadata.agent_trail.contains(&"weather".to_string()));
    assert_eq!(
        response.metadata.reasoning_method.unwrap().to_string(),
        "rule_multi"
    );
}

#[tokio::test]
async fn search_filters_low_relevance() {
    let orch = orchestrator(None);
    let response = run(&orch, RequestEnvelope::new("search for machine learning")).await;

    assert!(response.success);
    let results = response.data["search"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    for result in results {
        assert!(result["relevance"].as_f64().unwrap() >= 0.10);
    }
}

#[tokio::test]
async fn fallback_after_remote_failure() {
    let orch = orchestrator(None);
    let response = run(&orch, RequestEnvelope::new("latest news please")).await;

    assert!(response.success, "errors: {:?}", response.errors);
    assert_eq!(
        response.metadata.agent_trail,
        vec!["tavily_search".to_string(), "search".to_string()]
    );
    assert!(response.data.contains_key("search"));
}

#[tokio::test]
async fn validation_retry_on_division_by_zero() {
    let dir = tempfile::tempdir().unwrap();
    let orch = orchestrator(Some(dir.path()));
    let query_id = QueryId::new();
    let sink = EventSink::discard(query_id.to_string());
    let envelope = RequestEnvelope::new("divide 10 by 0")
        .with_field("operation", json!("divide"))
        .with_field("operands", json!([10, 0]));
    let response = orch
        .process(query_id, envelope, None, &sink)
        .await
        .expect("pipeline result");

    assert!(!response.success);
    assert_eq!(response.errors[0].error_kind, "AgentFailure");
    assert!(response.errors[0].message.contains("division by zero"));
    assert!(response.metadata.validation_warning.is_some());

    // The envelope never leaks validation internals.
    let serialized = serde_json::to_string(&response).unwrap();
    assert!(!serialized.contains("confidence_score"));

    // Exactly one log record with one retry entry per re-execution.
    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    let record: QueryRecord =
        serde_json::from_str(&std::fs::read_to_string(&entries[0]).unwrap()).unwrap();
    assert_eq!(record.retries.len(), 2);
    assert!(record.retries.iter().all(|r| !r.reason.is_empty()));
    assert_eq!(record.outcome, "failed");
    assert_eq!(record.agent_calls.len(), 3);
    assert_eq!(orch.metrics().snapshot().validation_retries, 2);
}

#[tokio::test]
async fn empty_query_is_invalid() {
    let orch = orchestrator(None);
    let query_id = QueryId::new();
    let sink = EventSink::discard(query_id.to_string());
    let err = orch
        .process(query_id, RequestEnvelope::new("   "), None, &sink)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "InvalidRequest");
}

#[tokio::test]
async fn hostile_input_is_rejected() {
    let orch = orchestrator(None);
    for query in [
        "DROP TABLE users",
        "calculate 1; rm -rf /",
        "read ../../etc/passwd and summarize",
    ] {
        let query_id = QueryId::new();
        let sink = EventSink::discard(query_id.to_string());
        let err = orch
            .process(query_id, RequestEnvelope::new(query), None, &sink)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SecurityError", "query: {}", query);
    }
}

#[tokio::test]
async fn unmatched_query_yields_no_agents() {
    let orch = orchestrator(None);
    let query_id = QueryId::new();
    let sink = EventSink::discard(query_id.to_string());
    let err = orch
        .process(query_id, RequestEnvelope::new("write me a poem"), None, &sink)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NoAgents");
}

#[tokio::test]
async fn open_circuit_without_fallback_yields_no_agents() {
    let orch = orchestrator(None);
    // Breaker threshold is 5; each failed request burns three attempts
    // (initial + two validation retries).
    for _ in 0..2 {
        let envelope = RequestEnvelope::new("divide 10 by 0")
            .with_field("operation", json!("divide"))
            .with_field("operands", json!([10, 0]));
        let _ = run(&orch, envelope).await;
    }
    assert!(orch
        .breakers()
        .open_circuits()
        .contains(&"calculator".to_string()));

    let query_id = QueryId::new();
    let sink = EventSink::discard(query_id.to_string());
    let err = orch
        .process(
            query_id,
            RequestEnvelope::new("calculate 1 plus 2"),
            None,
            &sink,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NoAgents");
}

#[tokio::test]
async fn session_counts_requests() {
    let orch = orchestrator(None);
    let first = run(
        &orch,
        RequestEnvelope {
            session_id: Some("s-42".into()),
            ..RequestEnvelope::new("calculate 1 plus 2")
        },
    )
    .await;
    let second = run(
        &orch,
        RequestEnvelope {
            session_id: Some("s-42".into()),
            ..RequestEnvelope::new("calculate 2 plus 3")
        },
    )
    .await;
    assert_eq!(first.metadata.session_request_count, Some(1));
    assert_eq!(second.metadata.session_request_count, Some(2));
    assert_eq!(second.metadata.session_id.as_deref(), Some("s-42"));
}

#[tokio::test]
async fn streaming_emits_ordered_events_with_single_terminal() {
    let orch = Arc::new(orchestrator(None));
    let query_id = QueryId::new();
    let (sink, mut rx) = EventSink::streaming(query_id.to_string(), 64);

    let task = {
        let orch = orch.clone();
        let envelope = RequestEnvelope::new("calculate 15 + 27")
            .with_field("operation", json!("add"))
            .with_field("operands", json!([15, 27]));
        tokio::spawn(async move { orch.process(query_id, envelope, None, &sink).await })
    };

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    task.await.unwrap().unwrap();

    assert_eq!(events.first().unwrap().event, StreamEventKind::Started);
    let terminal_count = events.iter().filter(|e| e.event.is_terminal()).count();
    assert_eq!(terminal_count, 1);
    assert_eq!(events.last().unwrap().event, StreamEventKind::Completed);

    for window in events.windows(2) {
        assert!(window[1].seq > window[0].seq);
    }
    let kinds: Vec<StreamEventKind> = events.iter().map(|e| e.event).collect();
    for expected in [
        StreamEventKind::ReasoningStarted,
        StreamEventKind::ReasoningComplete,
        StreamEventKind::AgentsExecuting,
        StreamEventKind::AgentStarted,
        StreamEventKind::AgentComplete,
        StreamEventKind::ValidationStarted,
        StreamEventKind::ValidationComplete,
    ] {
        assert!(kinds.contains(&expected), "missing {:?}", expected);
    }
    for event in &events {
        assert_eq!(event.request_id, query_id.to_string());
    }
}

#[tokio::test]
async fn disconnected_stream_cancels_pipeline() {
    let orch = Arc::new(orchestrator(None));
    let query_id = QueryId::new();
    let (sink, rx) = EventSink::streaming(query_id.to_string(), 4);
    drop(rx);

    let err = orch
        .process(
            query_id,
            RequestEnvelope::new("calculate 15 + 27"),
            None,
            &sink,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "Cancelled");
    assert_eq!(orch.metrics().snapshot().cancelled, 1);
}

#[tokio::test]
async fn caller_deadline_cancels_pipeline() {
    use futures::FutureExt;

    // A catalog with one deliberately slow agent, so the request is
    // mid-execution when the caller deadline expires.
    let mut catalog = BuiltinCatalog::default();
    catalog.register(
        "slowpoke",
        Arc::new(|_| {
            async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!({"done": true}))
            }
            .boxed()
        }),
    );
    let mut config = loaded_config(None);
    config.agents.push(agent("slowpoke", &["slow"]));
    config
        .rules
        .push(contains_rule("slow", 200, "slow", &["slowpoke"], 0.9));
    let orch = Orchestrator::from_config(config, Arc::new(catalog)).unwrap();

    let query_id = QueryId::new();
    let sink = EventSink::discard(query_id.to_string());
    let started = std::time::Instant::now();
    let result = orch
        .process(
            query_id,
            RequestEnvelope::new("run the slow job"),
            Some(Duration::from_millis(100)),
            &sink,
        )
        .await;

    // The 30 s agent sleep must not hold the request past its deadline.
    // Depending on which timer fires first the caller sees either the
    // cancellation or a best-effort envelope whose only failures are
    // timeouts; both respect the budget.
    assert!(started.elapsed() < Duration::from_secs(5));
    match result {
        Err(err) => assert_eq!(err.kind(), "Cancelled"),
        Ok(envelope) => {
            assert!(!envelope.success);
            assert!(envelope
                .errors
                .iter()
                .all(|e| e.message.contains("timeout")));
        }
    }
}

#[tokio::test]
async fn stats_reflect_processed_requests() {
    let orch = orchestrator(None);
    let _ = run(
        &orch,
        RequestEnvelope::new("calculate 15 + 27").with_field("operands", json!([15, 27])),
    )
    .await;
    let snapshot = orch.metrics().snapshot();
    assert_eq!(snapshot.requests_total, 1);
    assert_eq!(snapshot.requests_success, 1);
    assert_eq!(snapshot.per_agent["calculator"].calls, 1);
}
