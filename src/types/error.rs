//! Error taxonomy for the orchestrator
//!
//! Agent-level failures carry an [`AgentErrorKind`] that drives the retry
//! executor (retriable vs. terminal); everything else rolls up into
//! [`OrchestratorError`] at the pipeline boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Classification of a single agent call failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentErrorKind {
    /// The call exceeded its deadline.
    Timeout,
    /// A transient fault (connection refused, 5xx, ...). Worth retrying.
    Transient,
    /// A permanent fault in the agent or its input. Not retried.
    Permanent,
    /// The input filter rejected one or more fields before invocation.
    InputRejected,
    /// The agent returned something the adapter could not interpret.
    InvalidResponse,
    /// The circuit breaker short-circuited the call.
    CircuitOpen,
    /// The agent or its backend rate-limited us.
    RateLimited,
}

impl AgentErrorKind {
    /// Whether the retry executor may re-attempt a call that failed this way.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            AgentErrorKind::Timeout | AgentErrorKind::Transient | AgentErrorKind::RateLimited
        )
    }
}

impl std::fmt::Display for AgentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentErrorKind::Timeout => "timeout",
            AgentErrorKind::Transient => "transient",
            AgentErrorKind::Permanent => "permanent",
            AgentErrorKind::InputRejected => "input_rejected",
            AgentErrorKind::InvalidResponse => "invalid_response",
            AgentErrorKind::CircuitOpen => "circuit_open",
            AgentErrorKind::RateLimited => "rate_limited",
        };
        write!(f, "{}", s)
    }
}

/// A single agent call failure.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct AgentError {
    pub kind: AgentErrorKind,
    pub message: String,
}

impl AgentError {
    pub fn new(kind: AgentErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Timeout, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::Permanent, message)
    }

    pub fn input_rejected(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::InputRejected, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::InvalidResponse, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(AgentErrorKind::CircuitOpen, message)
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

/// Top-level orchestrator error.
///
/// Variants map one-to-one onto the HTTP status classes surfaced by the API
/// layer: `InvalidRequest`/`Security`/`NoAgents` are client errors,
/// `Gateway` and `Internal` are server errors, `Cancelled` is terminal.
#[derive(Debug, Clone, Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error("No agents available for this request: {0}")]
    NoAgents(String),

    #[error("Agent '{agent}' failed: {error}")]
    AgentFailure { agent: String, error: AgentError },

    #[error("Validation failed after {attempts} attempt(s)")]
    ValidationFailed { attempts: u32 },

    #[error("Model gateway error: {0}")]
    Gateway(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// Stable machine-readable error kind for envelopes and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidRequest(_) => "InvalidRequest",
            OrchestratorError::Security(_) => "SecurityError",
            OrchestratorError::NoAgents(_) => "NoAgents",
            OrchestratorError::AgentFailure { .. } => "AgentFailure",
            OrchestratorError::ValidationFailed { .. } => "ValidationFailed",
            OrchestratorError::Gateway(_) => "GatewayError",
            OrchestratorError::Cancelled(_) => "Cancelled",
            OrchestratorError::Config(_) => "ConfigError",
            OrchestratorError::Internal(_) => "Internal",
        }
    }
}

/// Result alias used throughout the crate.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
