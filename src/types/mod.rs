//! Core types and data structures for the dispatch pipeline

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub mod error;

pub use error::*;

/// A JSON object, the lingua franca between the envelope and the agents.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Unique identifier for one pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short prefix used in query-log file names.
    pub fn prefix(&self) -> String {
        self.0.to_string().chars().take(8).collect()
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for QueryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The request envelope received at the system boundary.
///
/// Beyond `query` the envelope carries arbitrary typed fields (`operation`,
/// `operands`, `data`, `location`, ...) which are captured verbatim and kept
/// immutable for the lifetime of the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// The natural-language query. Must be non-empty.
    #[serde(default)]
    pub query: String,
    /// Caller-correlated session, minted server-side when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// All remaining envelope fields, untouched.
    #[serde(flatten)]
    pub fields: JsonMap,
}

impl RequestEnvelope {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            session_id: None,
            fields: JsonMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Resolve a dotted field path against the envelope.
    ///
    /// `"query"` resolves to the query string; anything else descends into
    /// the extra fields (`"data.items"` → `fields["data"]["items"]`).
    pub fn lookup(&self, path: &str) -> Option<serde_json::Value> {
        if path == "query" {
            return Some(serde_json::Value::String(self.query.clone()));
        }
        if path == "session_id" {
            return self
                .session_id
                .as_ref()
                .map(|s| serde_json::Value::String(s.clone()));
        }
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?.clone();
        for part in parts {
            current = current.get(part)?.clone();
        }
        Some(current)
    }

    /// All envelope fields as one flat map, `query` included. This is the
    /// view the input filter works on.
    pub fn as_map(&self) -> JsonMap {
        let mut map = self.fields.clone();
        map.insert(
            "query".to_string(),
            serde_json::Value::String(self.query.clone()),
        );
        map
    }
}

/// How an agent is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// A function bound in-process.
    InProcess,
    /// A named tool on an external tool server.
    RemoteTool,
}

/// Descriptor for a registered agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique name within the registry.
    pub name: String,
    /// What this agent can do, e.g. `math`, `web-search`.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// One-line description, surfaced to the AI reasoner prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub transport: TransportKind,
    /// Tool-server URL for `remote_tool` transports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Tool name on the server; defaults to the agent name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Input fields passed through. Empty means all fields.
    #[serde(default)]
    pub allow_fields: Vec<String>,
    /// Input fields that fail the call with `InputRejected` when present.
    #[serde(default)]
    pub deny_fields: Vec<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-call timeout.
    #[serde(default = "default_agent_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Agent substituted when this one fails terminally or its circuit is open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Optional agents do not count toward the critical set during aggregation.
    #[serde(default)]
    pub optional: bool,
}

fn default_max_retries() -> u32 {
    2
}

fn default_agent_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_true() -> bool {
    true
}

/// The response of a single agent call, after retries and fallback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    /// The agent that actually produced this response (the fallback's name
    /// when `fellback` is set).
    pub agent_name: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<AgentErrorKind>,
    /// End-to-end wall time across all attempts, in milliseconds.
    pub execution_time_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fellback: bool,
}

impl AgentResponse {
    pub fn ok(
        agent_name: impl Into<String>,
        data: serde_json::Value,
        elapsed: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            success: true,
            data: Some(data),
            error: None,
            error_kind: None,
            execution_time_ms: elapsed.as_millis() as u64,
            attempts,
            fellback: false,
        }
    }

    pub fn failed(
        agent_name: impl Into<String>,
        error: AgentError,
        elapsed: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            agent_name: agent_name.into(),
            success: false,
            data: None,
            error: Some(error.message),
            error_kind: Some(error.kind),
            execution_time_ms: elapsed.as_millis() as u64,
            attempts,
            fellback: false,
        }
    }
}

/// How a reasoning decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMethod {
    Rule,
    Ai,
    HybridRule,
    HybridAi,
    RuleMulti,
    /// Hybrid strategy with both legs exhausted; always an empty decision.
    Hybrid,
}

impl std::fmt::Display for ReasoningMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReasoningMethod::Rule => "rule",
            ReasoningMethod::Ai => "ai",
            ReasoningMethod::HybridRule => "hybrid_rule",
            ReasoningMethod::HybridAi => "hybrid_ai",
            ReasoningMethod::RuleMulti => "rule_multi",
            ReasoningMethod::Hybrid => "hybrid",
        };
        write!(f, "{}", s)
    }
}

/// The output of a reasoner: which agents to run and how.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningDecision {
    /// Ordered agent names; empty means the reasoner declined the request.
    pub selected_agents: Vec<String>,
    pub parallel: bool,
    /// Extra parameters merged into the named agent's input.
    #[serde(default)]
    pub per_agent_params: HashMap<String, JsonMap>,
    pub method: ReasoningMethod,
    /// In `[0, 1]`.
    pub confidence: f64,
    pub explanation: String,
    /// Agents excluded from the critical set during aggregation.
    #[serde(default)]
    pub optional_agents: Vec<String>,
}

impl ReasoningDecision {
    /// An empty decision: no agents, zero confidence.
    pub fn empty(method: ReasoningMethod, explanation: impl Into<String>) -> Self {
        Self {
            selected_agents: Vec::new(),
            parallel: false,
            per_agent_params: HashMap::new(),
            method,
            confidence: 0.0,
            explanation: explanation.into(),
            optional_agents: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.selected_agents.is_empty()
    }
}

/// One problem found by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
}

impl ValidationIssue {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Outcome of validating the aggregated agent outputs.
///
/// `confidence_score` is recorded in the query log and never crosses the
/// service boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub confidence_score: f64,
    pub hallucination_flag: bool,
    pub issues: Vec<ValidationIssue>,
    /// Per-check scores in `[0, 1]`, keyed by check name.
    pub per_check: HashMap<String, f64>,
    /// The agent most likely responsible for the failure, when identifiable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspect_agent: Option<String>,
}

/// Lightweight per-session state used by the response-wrapping layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub request_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_topic: Option<String>,
    pub last_update: chrono::DateTime<chrono::Utc>,
}

/// One entry in the user-visible `errors[]` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub agent: String,
    /// Always `"AgentFailure"` for agent-level failures; the specific kind
    /// is folded into the message.
    pub error_kind: String,
    pub message: String,
}

/// Warning attached to a best-effort response after validation retries
/// are exhausted. Carries issue codes only, never scores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub message: String,
    pub issues: Vec<String>,
}

/// Metadata block of the response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMetadata {
    /// Number of agents invoked.
    pub count: usize,
    pub successful: usize,
    pub failed: usize,
    /// Agents in invocation order; fallbacks appear after the agent they
    /// substituted for.
    pub agent_trail: Vec<String>,
    pub total_execution_time_ms: u64,
    /// Absent when the pipeline failed before reasoning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_method: Option<ReasoningMethod>,
    pub request_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_request_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_warning: Option<ValidationWarning>,
}

/// The user-visible response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub success: bool,
    /// `agent_name → data` for every successful agent.
    pub data: JsonMap,
    #[serde(default)]
    pub errors: Vec<ErrorEntry>,
    #[serde(rename = "_metadata")]
    pub metadata: ResponseMetadata,
}
