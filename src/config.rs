//! Configuration for the orchestrator
//!
//! Two YAML files are loaded at startup and at each reload: the agents file
//! (a list of agent descriptors) and the rules file (dispatch rules plus the
//! orchestrator-wide settings). Environment variables override the file
//! values for deployment-specific knobs.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::reasoner::rules::Rule;
use crate::types::AgentDescriptor;

/// Configuration errors.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to parse {path}: {reason}")]
    ParseError { path: String, reason: String },

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Duplicate agent name: {name}")]
    DuplicateAgent { name: String },

    #[error("Agent '{agent}' names unknown fallback '{fallback}'")]
    UnknownFallback { agent: String, fallback: String },
}

/// Reasoning strategy selected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    Rule,
    Ai,
    #[default]
    Hybrid,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind(),
            port: default_port(),
            enable_cors: true,
        }
    }
}

/// Reasoner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningConfig {
    #[serde(default)]
    pub mode: ReasoningMode,
    /// Rule-confidence threshold τ: rule decisions at or above it are
    /// accepted outright by the hybrid strategy, and multi-rule unions
    /// require every participant to clear it.
    #[serde(default = "default_rule_threshold")]
    pub rule_confidence_threshold: f64,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            mode: ReasoningMode::default(),
            rule_confidence_threshold: default_rule_threshold(),
        }
    }
}

/// Retry executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel_agents: usize,
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_cap", with = "humantime_serde")]
    pub backoff_cap: Duration,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel(),
            backoff_base: default_backoff_base(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

/// Circuit breaker settings shared by all agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cool_down", with = "humantime_serde")]
    pub cool_down: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cool_down: default_cool_down(),
        }
    }
}

/// Response validator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Overall confidence floor θ.
    #[serde(default = "default_confidence_floor")]
    pub confidence_floor: f64,
    /// Pipeline re-executions triggered by a failed validation.
    #[serde(default = "default_validation_retries")]
    pub max_validation_retries: u32,
    /// Consult the model gateway for the relevance check when available.
    #[serde(default = "default_true")]
    pub ai_check: bool,
    /// Reuse cached outputs of agents not implicated by the failed check
    /// instead of re-executing the full set.
    #[serde(default)]
    pub reuse_agent_outputs: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            confidence_floor: default_confidence_floor(),
            max_validation_retries: default_validation_retries(),
            ai_check: true,
            reuse_agent_outputs: false,
        }
    }
}

/// Pipeline-wide settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on one request, caller deadlines are clipped to it.
    #[serde(default = "default_pipeline_budget", with = "humantime_serde")]
    pub budget: Duration,
    /// Streaming event channel capacity.
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    /// Grace period for draining in-flight requests at shutdown.
    #[serde(default = "default_drain_grace", with = "humantime_serde")]
    pub drain_grace: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            budget: default_pipeline_budget(),
            stream_buffer: default_stream_buffer(),
            drain_grace: default_drain_grace(),
        }
    }
}

/// Session table settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle TTL after which a session is evicted.
    #[serde(default = "default_session_ttl", with = "humantime_serde")]
    pub idle_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_ttl: default_session_ttl(),
        }
    }
}

/// Query log settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryLogConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directory receiving one JSON file per query.
    #[serde(default = "default_log_dir")]
    pub directory: PathBuf,
}

impl Default for QueryLogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_log_dir(),
        }
    }
}

/// Model gateway settings. The URL and credentials usually come from the
/// environment; the file only carries defaults for local development.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default = "default_gateway_model")]
    pub model: String,
    #[serde(default = "default_gateway_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_gateway_retries")]
    pub max_retries: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: None,
            model: default_gateway_model(),
            timeout: default_gateway_timeout(),
            max_retries: default_gateway_retries(),
        }
    }
}

/// Orchestrator-wide settings, the `settings:` block of the rules file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub query_log: QueryLogConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl OrchestratorConfig {
    /// Apply environment overrides. Called once after file load.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(bind) = env::var("CONDUCTOR_BIND") {
            self.server.bind_address = bind;
        }
        if let Ok(port) = env::var("CONDUCTOR_PORT") {
            self.server.port = port.parse().map_err(|_| ConfigError::InvalidValue {
                key: "CONDUCTOR_PORT".into(),
                reason: format!("not a port number: {}", port),
            })?;
        }
        if let Ok(dir) = env::var("CONDUCTOR_LOG_DIR") {
            self.query_log.directory = PathBuf::from(dir);
        }
        if let Ok(url) = env::var("CONDUCTOR_GATEWAY_URL") {
            self.gateway.url = Some(url);
        }
        Ok(())
    }

    /// Sanity-check ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            (
                "reasoning.rule_confidence_threshold",
                self.reasoning.rule_confidence_threshold,
            ),
            ("validation.confidence_floor", self.validation.confidence_floor),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.into(),
                    reason: format!("{} is outside [0, 1]", value),
                });
            }
        }
        if self.execution.max_parallel_agents == 0 {
            return Err(ConfigError::InvalidValue {
                key: "execution.max_parallel_agents".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// The agents file: a list of descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentsFile {
    #[serde(default)]
    pub agents: Vec<AgentDescriptor>,
}

/// The rules file: dispatch rules plus orchestrator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub settings: OrchestratorConfig,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Everything loaded from disk.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub settings: OrchestratorConfig,
    pub agents: Vec<AgentDescriptor>,
    pub rules: Vec<Rule>,
}

/// Load and cross-validate both configuration files.
pub fn load(agents_path: &Path, rules_path: &Path) -> Result<LoadedConfig, ConfigError> {
    let agents_file: AgentsFile = read_yaml(agents_path)?;
    let rules_file: RulesFile = read_yaml(rules_path)?;

    validate_agents(&agents_file.agents)?;

    let mut settings = rules_file.settings;
    settings.apply_env()?;
    settings.validate()?;

    tracing::info!(
        "Loaded {} agents from {} and {} rules from {}",
        agents_file.agents.len(),
        agents_path.display(),
        rules_file.rules.len(),
        rules_path.display(),
    );

    Ok(LoadedConfig {
        settings,
        agents: agents_file.agents,
        rules: rules_file.rules,
    })
}

/// Re-read only the agents file, for the reload endpoint.
pub fn load_agents(agents_path: &Path) -> Result<Vec<AgentDescriptor>, ConfigError> {
    let agents_file: AgentsFile = read_yaml(agents_path)?;
    validate_agents(&agents_file.agents)?;
    Ok(agents_file.agents)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.display().to_string(),
    })?;
    serde_yaml::from_str(&raw).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

fn validate_agents(agents: &[AgentDescriptor]) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for agent in agents {
        if agent.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "agents[].name".into(),
                reason: "agent name cannot be empty".into(),
            });
        }
        if !seen.insert(agent.name.as_str()) {
            return Err(ConfigError::DuplicateAgent {
                name: agent.name.clone(),
            });
        }
        if agent.transport == crate::types::TransportKind::RemoteTool && agent.endpoint.is_none() {
            return Err(ConfigError::InvalidValue {
                key: format!("agents.{}.endpoint", agent.name),
                reason: "remote_tool transport requires an endpoint".into(),
            });
        }
    }
    for agent in agents {
        if let Some(ref fb) = agent.fallback {
            if !agents.iter().any(|a| &a.name == fb) {
                return Err(ConfigError::UnknownFallback {
                    agent: agent.name.clone(),
                    fallback: fb.clone(),
                });
            }
        }
    }
    Ok(())
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_rule_threshold() -> f64 {
    0.70
}

fn default_max_parallel() -> usize {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(100)
}

fn default_backoff_cap() -> Duration {
    Duration::from_secs(5)
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cool_down() -> Duration {
    Duration::from_secs(30)
}

fn default_confidence_floor() -> f64 {
    0.70
}

fn default_validation_retries() -> u32 {
    2
}

fn default_pipeline_budget() -> Duration {
    Duration::from_secs(120)
}

fn default_stream_buffer() -> usize {
    64
}

fn default_drain_grace() -> Duration {
    Duration::from_secs(30)
}

fn default_session_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./query_logs")
}

fn default_gateway_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_gateway_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_gateway_retries() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    const AGENTS_YAML: &str = r#"
agents:
  - name: calculator
    transport: in_process
    capabilities: [math]
  - name: tavily_search
    transport: remote_tool
    endpoint: http://localhost:9000/tools
    capabilities: [web-search]
    fallback: search
  - name: search
    transport: in_process
    capabilities: [search]
"#;

    const RULES_YAML: &str = r#"
settings:
  reasoning:
    mode: rule
  execution:
    max_parallel_agents: 4
rules:
  - name: math
    priority: 100
    combinator: or
    conditions:
      - field_path: query
        operator: contains
        value: calculate
        case_sensitive: false
    target_agents: [calculator]
    base_confidence: 0.9
"#;

    #[test]
    fn test_load_both_files() {
        let agents = write_temp(AGENTS_YAML);
        let rules = write_temp(RULES_YAML);
        let loaded = load(agents.path(), rules.path()).unwrap();
        assert_eq!(loaded.agents.len(), 3);
        assert_eq!(loaded.rules.len(), 1);
        assert_eq!(loaded.settings.reasoning.mode, ReasoningMode::Rule);
        assert_eq!(loaded.settings.execution.max_parallel_agents, 4);
        // Untouched sections keep their defaults.
        assert_eq!(loaded.settings.breaker.failure_threshold, 5);
        assert_eq!(loaded.settings.pipeline.budget, Duration::from_secs(120));
    }

    #[test]
    fn test_duplicate_agent_rejected() {
        let agents = write_temp(
            "agents:\n  - name: a\n    transport: in_process\n  - name: a\n    transport: in_process\n",
        );
        let err = load_agents(agents.path()).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAgent { .. }));
    }

    #[test]
    fn test_unknown_fallback_rejected() {
        let agents = write_temp(
            "agents:\n  - name: a\n    transport: in_process\n    fallback: ghost\n",
        );
        let err = load_agents(agents.path()).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownFallback { .. }));
    }

    #[test]
    fn test_remote_requires_endpoint() {
        let agents = write_temp("agents:\n  - name: r\n    transport: remote_tool\n");
        assert!(load_agents(agents.path()).is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = load_agents(Path::new("/nonexistent/agents.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_threshold_range_validated() {
        let mut cfg = OrchestratorConfig::default();
        cfg.validation.confidence_floor = 1.5;
        assert!(cfg.validate().is_err());
    }
}
