//! Reasoning strategies
//!
//! Three strategies behind one decision trait, chosen at construction and
//! never swapped at runtime: pure rules, gateway-backed AI planning, and a
//! hybrid that runs rules first and falls back to the AI.

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ReasoningMode;
use crate::executor::RetryExecutor;
use crate::gateway::GatewayClient;
use crate::registry::RegistrySnapshot;
use crate::types::{OrchestratorError, ReasoningDecision, RequestEnvelope};

pub mod ai;
pub mod hybrid;
pub mod rules;

pub use ai::AiReasoner;
pub use hybrid::HybridReasoner;
pub use rules::{Combinator, Condition, ConditionOp, Rule, RuleReasoner, RuleSet};

/// The single decision entry point every strategy implements.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn decide(
        &self,
        envelope: &RequestEnvelope,
        snapshot: &RegistrySnapshot,
    ) -> Result<ReasoningDecision, OrchestratorError>;
}

#[async_trait]
impl Reasoner for RuleReasoner {
    async fn decide(
        &self,
        envelope: &RequestEnvelope,
        snapshot: &RegistrySnapshot,
    ) -> Result<ReasoningDecision, OrchestratorError> {
        Ok(RuleReasoner::decide(self, envelope, snapshot))
    }
}

#[async_trait]
impl Reasoner for AiReasoner {
    async fn decide(
        &self,
        envelope: &RequestEnvelope,
        snapshot: &RegistrySnapshot,
    ) -> Result<ReasoningDecision, OrchestratorError> {
        AiReasoner::decide(self, envelope, snapshot).await
    }
}

#[async_trait]
impl Reasoner for HybridReasoner {
    async fn decide(
        &self,
        envelope: &RequestEnvelope,
        snapshot: &RegistrySnapshot,
    ) -> Result<ReasoningDecision, OrchestratorError> {
        HybridReasoner::decide(self, envelope, snapshot).await
    }
}

/// Build the configured strategy.
///
/// `ai` mode without a gateway is a hard configuration problem and will
/// surface as `GatewayError` on every request; `hybrid` degrades to rules.
pub fn build_reasoner(
    mode: ReasoningMode,
    rules: RuleSet,
    threshold: f64,
    gateway: Option<Arc<GatewayClient>>,
    executor: Arc<RetryExecutor>,
) -> Arc<dyn Reasoner> {
    let ai = gateway.map(|gw| Arc::new(AiReasoner::new(gw, executor)));
    match mode {
        ReasoningMode::Rule => Arc::new(RuleReasoner::new(rules, threshold)),
        ReasoningMode::Ai => match ai {
            Some(ai) => ai,
            None => {
                tracing::warn!("reasoning mode is 'ai' but no gateway is configured");
                Arc::new(UnavailableAiReasoner)
            }
        },
        ReasoningMode::Hybrid => Arc::new(HybridReasoner::new(
            RuleReasoner::new(rules, threshold),
            ai,
            threshold,
        )),
    }
}

/// Stand-in for `ai` mode with no gateway: every request fails with
/// `GatewayError`.
struct UnavailableAiReasoner;

#[async_trait]
impl Reasoner for UnavailableAiReasoner {
    async fn decide(
        &self,
        _envelope: &RequestEnvelope,
        _snapshot: &RegistrySnapshot,
    ) -> Result<ReasoningDecision, OrchestratorError> {
        Err(OrchestratorError::Gateway(
            "reasoning mode is 'ai' but no model gateway is configured".into(),
        ))
    }
}
