//! Conductor: an agent orchestration service
//!
//! Given a request envelope, conductor selects capability-bearing agents
//! (rules, AI planning, or a hybrid of both), executes them under retry,
//! timeout, fallback and circuit-breaker discipline, validates the merged
//! response for relevance and hallucination, and returns one consolidated
//! envelope or a stream of progress events.

pub mod adapters;
pub mod api;
pub mod config;
pub mod executor;
pub mod gateway;
pub mod health;
pub mod metrics;
pub mod pipeline;
pub mod reasoner;
pub mod registry;
pub mod session;
pub mod types;
pub mod validation;

// Re-export the types most callers touch.
pub use adapters::{AdapterFactory, AgentAdapter, BuiltinCatalog};
pub use config::{LoadedConfig, OrchestratorConfig, ReasoningMode};
pub use executor::RetryExecutor;
pub use gateway::GatewayClient;
pub use health::{BreakerTable, CircuitState};
pub use metrics::{Metrics, MetricsSnapshot};
pub use pipeline::{EventSink, Orchestrator, Sanitizer, StreamEvent, StreamEventKind};
pub use reasoner::{Reasoner, Rule, RuleSet};
pub use registry::{AgentRegistry, RegistrySnapshot, ReloadReport};
pub use session::{QueryLogWriter, SessionStore};
pub use types::{
    AgentDescriptor, AgentError, AgentErrorKind, AgentResponse, OrchestratorError, QueryId,
    ReasoningDecision, ReasoningMethod, RequestEnvelope, ResponseEnvelope, ValidationResult,
};
