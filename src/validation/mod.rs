//! Response validation
//!
//! Scores the aggregated agent outputs against the original request: basic
//! output sanity, cross-agent consistency, hallucination heuristics, and an
//! optional gateway relevance check. The validator reads agent outputs by
//! shape (a `result` number, a `results` list) and never mutates them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ValidationConfig;
use crate::executor::RetryExecutor;
use crate::gateway::GatewayClient;
use crate::metrics::Metrics;
use crate::types::{
    AgentResponse, ReasoningDecision, RequestEnvelope, ValidationIssue, ValidationResult,
};

const WEIGHT_BASIC: f64 = 0.35;
const WEIGHT_CONSISTENCY: f64 = 0.25;
const WEIGHT_HALLUCINATION: f64 = 0.25;
const WEIGHT_AI: f64 = 0.15;

/// Lexical-overlap floor for search-shaped outputs.
const OVERLAP_FLOOR: f64 = 0.10;

/// Numeric agreement tolerance across agents.
const NUMERIC_TOLERANCE: f64 = 1e-6;

/// Queries shorter than this skip the gateway relevance check.
const TRIVIAL_QUERY_WORDS: usize = 4;

const VALIDATOR_SYSTEM_PROMPT: &str = "You review the outputs of an agent dispatch service. \
Given the user request and the combined agent outputs, reply with a single JSON object \
{\"relevance\": 0.0-1.0, \"contradictions\": true|false}.";

/// The response validator.
pub struct ResponseValidator {
    config: ValidationConfig,
    gateway: Option<Arc<GatewayClient>>,
    executor: Arc<RetryExecutor>,
    metrics: Arc<Metrics>,
}

struct CheckOutcome {
    score: f64,
    passed: bool,
}

impl ResponseValidator {
    pub fn new(
        config: ValidationConfig,
        gateway: Option<Arc<GatewayClient>>,
        executor: Arc<RetryExecutor>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            gateway,
            executor,
            metrics,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Validate one aggregation attempt.
    pub async fn validate(
        &self,
        envelope: &RequestEnvelope,
        decision: &ReasoningDecision,
        responses: &[AgentResponse],
    ) -> ValidationResult {
        let mut issues = Vec::new();
        let mut per_check = HashMap::new();
        let mut suspect: Option<String> = None;

        let basic = self.check_basic(responses, &mut issues, &mut suspect);
        per_check.insert("basic".to_string(), basic.score);

        let consistency = self.check_consistency(decision, responses, &mut issues, &mut suspect);
        per_check.insert("consistency".to_string(), consistency.score);

        let hallucination = self.check_hallucination(envelope, responses, &mut issues);
        per_check.insert("hallucination".to_string(), hallucination.score);
        let hallucination_flag = !hallucination.passed;
        if hallucination_flag {
            self.metrics.record_hallucination();
        }

        let mut weighted = basic.score * WEIGHT_BASIC
            + consistency.score * WEIGHT_CONSISTENCY
            + hallucination.score * WEIGHT_HALLUCINATION;
        let mut weight_total = WEIGHT_BASIC + WEIGHT_CONSISTENCY + WEIGHT_HALLUCINATION;

        if let Some(ai_score) = self.check_ai(envelope, responses, &mut issues).await {
            per_check.insert("ai".to_string(), ai_score);
            weighted += ai_score * WEIGHT_AI;
            weight_total += WEIGHT_AI;
        }

        let confidence_score = (weighted / weight_total).clamp(0.0, 1.0);
        self.metrics.record_confidence(confidence_score);

        let is_valid = basic.passed
            && consistency.passed
            && !hallucination_flag
            && confidence_score >= self.config.confidence_floor;

        ValidationResult {
            is_valid,
            confidence_score,
            hallucination_flag,
            issues,
            per_check,
            suspect_agent: suspect,
        }
    }

    /// Every selected successful agent produced non-empty data with only
    /// finite numbers; at least one agent succeeded at all.
    fn check_basic(
        &self,
        responses: &[AgentResponse],
        issues: &mut Vec<ValidationIssue>,
        suspect: &mut Option<String>,
    ) -> CheckOutcome {
        let successes: Vec<&AgentResponse> = responses.iter().filter(|r| r.success).collect();
        if successes.is_empty() {
            issues.push(ValidationIssue::new(
                "no_successful_agents",
                "every selected agent failed",
            ));
            if responses.len() == 1 {
                *suspect = Some(responses[0].agent_name.clone());
            }
            return CheckOutcome {
                score: 0.0,
                passed: false,
            };
        }

        let mut passed = 0usize;
        for response in &successes {
            let data = response.data.as_ref();
            let ok = match data {
                None => false,
                Some(value) => !is_empty_value(value) && all_numbers_finite(value),
            };
            if ok {
                passed += 1;
            } else {
                issues.push(ValidationIssue::new(
                    "empty_data",
                    format!("agent '{}' returned empty or non-finite data", response.agent_name),
                ));
                suspect.get_or_insert_with(|| response.agent_name.clone());
            }
        }

        let score = passed as f64 / successes.len() as f64;
        CheckOutcome {
            score,
            passed: passed == successes.len(),
        }
    }

    /// Shared numeric fields must agree across agents; sequential chains
    /// must not silently shrink list data unless the later step reduces.
    fn check_consistency(
        &self,
        decision: &ReasoningDecision,
        responses: &[AgentResponse],
        issues: &mut Vec<ValidationIssue>,
        suspect: &mut Option<String>,
    ) -> CheckOutcome {
        let successes: Vec<&AgentResponse> = responses.iter().filter(|r| r.success).collect();
        let mut failures = 0usize;

        // Shared numeric keys across agents.
        let mut by_key: HashMap<&str, Vec<(&str, f64)>> = HashMap::new();
        for response in &successes {
            if let Some(serde_json::Value::Object(map)) = response.data.as_ref() {
                for (key, value) in map {
                    if let Some(number) = value.as_f64() {
                        by_key
                            .entry(key.as_str())
                            .or_default()
                            .push((response.agent_name.as_str(), number));
                    }
                }
            }
        }
        for (key, observations) in &by_key {
            if observations.len() < 2 {
                continue;
            }
            let min = observations.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
            let max = observations
                .iter()
                .map(|(_, v)| *v)
                .fold(f64::NEG_INFINITY, f64::max);
            let scale = max.abs().max(min.abs()).max(1.0);
            if (max - min) / scale > NUMERIC_TOLERANCE {
                failures += 1;
                issues.push(ValidationIssue::new(
                    "numeric_disagreement",
                    format!("agents disagree on '{}': {} vs {}", key, min, max),
                ));
                suspect.get_or_insert_with(|| observations[1].0.to_string());
            }
        }

        // Sequential pipelines must not lose data.
        if !decision.parallel && successes.len() >= 2 {
            for window in successes.windows(2) {
                let earlier = list_len(window[0].data.as_ref());
                let later = list_len(window[1].data.as_ref());
                if let (Some(n_in), Some(n_out)) = (earlier, later) {
                    if n_out < n_in && !is_reducer(window[1].data.as_ref()) {
                        failures += 1;
                        issues.push(ValidationIssue::new(
                            "data_loss",
                            format!(
                                "agent '{}' emitted {} items from {} inputs",
                                window[1].agent_name, n_out, n_in
                            ),
                        ));
                        suspect.get_or_insert_with(|| window[1].agent_name.to_string());
                    }
                }
            }
        }

        CheckOutcome {
            score: if failures == 0 { 1.0 } else { 0.0 },
            passed: failures == 0,
        }
    }

    /// Heuristics for fabricated content.
    fn check_hallucination(
        &self,
        envelope: &RequestEnvelope,
        responses: &[AgentResponse],
        issues: &mut Vec<ValidationIssue>,
    ) -> CheckOutcome {
        let mut flags = 0usize;

        for response in responses.iter().filter(|r| r.success) {
            let Some(data) = response.data.as_ref() else {
                continue;
            };

            // Calculator-shaped: the result must be a finite number.
            if let Some(result) = data.get("result") {
                if !result.is_null() && result.as_f64().map(|v| !v.is_finite()).unwrap_or(false) {
                    flags += 1;
                    issues.push(ValidationIssue::new(
                        "non_finite_result",
                        format!("agent '{}' produced a non-finite result", response.agent_name),
                    ));
                }
            }

            // Search-shaped: returned text must overlap the query.
            if let Some(results) = data.get("results").and_then(|v| v.as_array()) {
                if !results.is_empty() {
                    let corpus = results
                        .iter()
                        .map(|r| r.to_string())
                        .collect::<Vec<_>>()
                        .join(" ");
                    if lexical_overlap(&envelope.query, &corpus) < OVERLAP_FLOOR {
                        flags += 1;
                        issues.push(ValidationIssue::new(
                            "irrelevant_results",
                            format!(
                                "agent '{}' results share too little vocabulary with the query",
                                response.agent_name
                            ),
                        ));
                    }
                }
            }
        }

        // Declared operation must match the query intent.
        if let Some(operation) = envelope.fields.get("operation").and_then(|v| v.as_str()) {
            if !envelope.query.is_empty() && !operation_matches_query(operation, &envelope.query) {
                flags += 1;
                issues.push(ValidationIssue::new(
                    "operation_mismatch",
                    format!("declared operation '{}' not reflected in the query", operation),
                ));
            }
        }

        CheckOutcome {
            score: if flags == 0 { 1.0 } else { 0.0 },
            passed: flags == 0,
        }
    }

    /// Gateway relevance check; `None` when skipped.
    async fn check_ai(
        &self,
        envelope: &RequestEnvelope,
        responses: &[AgentResponse],
        issues: &mut Vec<ValidationIssue>,
    ) -> Option<f64> {
        if !self.config.ai_check {
            return None;
        }
        let gateway = self.gateway.as_ref()?;
        if envelope.query.split_whitespace().count() < TRIVIAL_QUERY_WORDS {
            return None;
        }

        let outputs: Vec<String> = responses
            .iter()
            .filter(|r| r.success)
            .filter_map(|r| {
                r.data
                    .as_ref()
                    .map(|d| format!("{}: {}", r.agent_name, d))
            })
            .collect();
        if outputs.is_empty() {
            return None;
        }

        let user = format!(
            "Request: {}\nAgent outputs:\n{}",
            envelope.query,
            outputs.join("\n")
        );
        match self
            .executor
            .gateway_json(gateway, VALIDATOR_SYSTEM_PROMPT, &user)
            .await
        {
            Ok(value) => {
                let relevance = value
                    .get("relevance")
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.5)
                    .clamp(0.0, 1.0);
                if value
                    .get("contradictions")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false)
                {
                    issues.push(ValidationIssue::new(
                        "ai_contradiction",
                        "the gateway flagged contradictory outputs",
                    ));
                }
                Some(relevance)
            }
            Err(err) => {
                // Gateway down: degrade to the heuristic checks.
                tracing::warn!("AI validation check skipped: {}", err);
                None
            }
        }
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn all_numbers_finite(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Number(n) => n.as_f64().map(|v| v.is_finite()).unwrap_or(true),
        serde_json::Value::Array(items) => items.iter().all(all_numbers_finite),
        serde_json::Value::Object(map) => map.values().all(all_numbers_finite),
        _ => true,
    }
}

fn list_len(data: Option<&serde_json::Value>) -> Option<usize> {
    let map = data?.as_object()?;
    map.values().find_map(|v| v.as_array().map(|a| a.len()))
}

/// A reducing step declares itself through its `operation` field.
fn is_reducer(data: Option<&serde_json::Value>) -> bool {
    matches!(
        data.and_then(|d| d.get("operation")).and_then(|v| v.as_str()),
        Some("count") | Some("sum") | Some("average") | Some("min") | Some("max")
    )
}

fn tokens(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

/// Share of query tokens that appear in `corpus`.
fn lexical_overlap(query: &str, corpus: &str) -> f64 {
    let query_tokens = tokens(query);
    if query_tokens.is_empty() {
        return 1.0;
    }
    let corpus_tokens = tokens(corpus);
    let hits = query_tokens
        .iter()
        .filter(|t| corpus_tokens.contains(t))
        .count();
    hits as f64 / query_tokens.len() as f64
}

fn operation_matches_query(operation: &str, query: &str) -> bool {
    let q = query.to_lowercase();
    if q.contains(&operation.to_lowercase()) {
        return true;
    }
    let keywords: &[&str] = match operation {
        "add" => &["add", "plus", "sum", "total", "+"],
        "subtract" => &["subtract", "minus", "difference", "-"],
        "multiply" => &["multiply", "times", "product", "*"],
        "divide" => &["divide", "divided", "over", "/"],
        "count" => &["count", "how many"],
        "average" => &["average", "mean"],
        _ => return true,
    };
    keywords.iter().any(|k| q.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ExecutionConfig};
    use crate::health::BreakerTable;
    use crate::types::{AgentError, ReasoningMethod};
    use serde_json::json;
    use std::time::Duration;

    fn validator() -> ResponseValidator {
        let metrics = Arc::new(Metrics::default());
        let executor = Arc::new(RetryExecutor::new(
            Arc::new(BreakerTable::new(BreakerConfig::default())),
            metrics.clone(),
            ExecutionConfig::default(),
        ));
        ResponseValidator::new(ValidationConfig::default(), None, executor, metrics)
    }

    fn decision(parallel: bool) -> ReasoningDecision {
        ReasoningDecision {
            selected_agents: vec!["calculator".into()],
            parallel,
            per_agent_params: Default::default(),
            method: ReasoningMethod::Rule,
            confidence: 0.9,
            explanation: String::new(),
            optional_agents: vec![],
        }
    }

    fn ok(agent: &str, data: serde_json::Value) -> AgentResponse {
        AgentResponse::ok(agent, data, Duration::from_millis(5), 1)
    }

    #[tokio::test]
    async fn test_valid_single_result() {
        let v = validator();
        let envelope = RequestEnvelope::new("calculate 15 + 27")
            .with_field("operation", json!("add"));
        let responses = vec![ok(
            "calculator",
            json!({"operation": "add", "operands": [15.0, 27.0], "result": 42.0}),
        )];
        let result = v.validate(&envelope, &decision(false), &responses).await;
        assert!(result.is_valid, "issues: {:?}", result.issues);
        assert!(!result.hallucination_flag);
        assert!(result.confidence_score >= 0.7);
    }

    #[tokio::test]
    async fn test_all_agents_failed() {
        let v = validator();
        let envelope = RequestEnvelope::new("divide 10 by 0");
        let responses = vec![AgentResponse::failed(
            "calculator",
            AgentError::permanent("division by zero"),
            Duration::from_millis(1),
            1,
        )];
        let result = v.validate(&envelope, &decision(false), &responses).await;
        assert!(!result.is_valid);
        assert_eq!(result.suspect_agent.as_deref(), Some("calculator"));
        assert!(result.issues.iter().any(|i| i.code == "no_successful_agents"));
    }

    #[tokio::test]
    async fn test_empty_data_fails_basic() {
        let v = validator();
        let envelope = RequestEnvelope::new("search for things in the corpus");
        let responses = vec![ok("search", json!({}))];
        let result = v.validate(&envelope, &decision(false), &responses).await;
        assert!(!result.is_valid);
        assert!(result.issues.iter().any(|i| i.code == "empty_data"));
    }

    #[tokio::test]
    async fn test_numeric_disagreement() {
        let v = validator();
        let envelope = RequestEnvelope::new("compute the total");
        let responses = vec![
            ok("calculator", json!({"result": 10.0})),
            ok("data_processor", json!({"result": 11.0})),
        ];
        let result = v.validate(&envelope, &decision(true), &responses).await;
        assert!(!result.is_valid);
        assert!(result.issues.iter().any(|i| i.code == "numeric_disagreement"));
        assert_eq!(result.suspect_agent.as_deref(), Some("data_processor"));
    }

    #[tokio::test]
    async fn test_irrelevant_search_results_flagged() {
        let v = validator();
        let envelope = RequestEnvelope::new("search for machine learning papers");
        let responses = vec![ok(
            "search",
            json!({"results": [{"title": "Sourdough", "snippet": "bread and ovens"}], "count": 1}),
        )];
        let result = v.validate(&envelope, &decision(false), &responses).await;
        assert!(result.hallucination_flag);
        assert!(result.issues.iter().any(|i| i.code == "irrelevant_results"));
    }

    #[tokio::test]
    async fn test_operation_mismatch_flagged() {
        let v = validator();
        let envelope = RequestEnvelope::new("what is the weather in Oslo")
            .with_field("operation", json!("multiply"));
        let responses = vec![ok("weather", json!({"location": "Oslo", "temperature_c": 12}))];
        let result = v.validate(&envelope, &decision(false), &responses).await;
        assert!(result.hallucination_flag);
        assert!(result.issues.iter().any(|i| i.code == "operation_mismatch"));
    }

    #[tokio::test]
    async fn test_sequential_data_loss() {
        let v = validator();
        let envelope = RequestEnvelope::new("collect and relay the items");
        let responses = vec![
            ok("collector", json!({"items": [1, 2, 3, 4]})),
            ok("relay", json!({"items": [1]})),
        ];
        let result = v.validate(&envelope, &decision(false), &responses).await;
        assert!(!result.is_valid);
        assert!(result.issues.iter().any(|i| i.code == "data_loss"));
    }

    #[tokio::test]
    async fn test_reducer_may_shrink() {
        let v = validator();
        let envelope = RequestEnvelope::new("count the collected items");
        let responses = vec![
            ok("collector", json!({"items": [1, 2, 3, 4]})),
            ok(
                "data_processor",
                json!({"operation": "count", "count": 4, "result": 4.0, "items": []}),
            ),
        ];
        let result = v.validate(&envelope, &decision(false), &responses).await;
        assert!(
            !result.issues.iter().any(|i| i.code == "data_loss"),
            "issues: {:?}",
            result.issues
        );
    }

    #[test]
    fn test_lexical_overlap() {
        assert!(lexical_overlap("machine learning", "machine learning studies") > 0.9);
        assert!(lexical_overlap("machine learning", "sourdough bread") < 0.1);
        assert_eq!(lexical_overlap("", "anything"), 1.0);
    }
}
