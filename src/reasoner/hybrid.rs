//! Hybrid reasoning: rules first, AI as backstop

use std::sync::Arc;

use super::ai::AiReasoner;
use super::rules::RuleReasoner;
use crate::registry::RegistrySnapshot;
use crate::types::{OrchestratorError, ReasoningDecision, ReasoningMethod, RequestEnvelope};

/// Rules first; confident rule decisions are accepted (multi-rule unions
/// optionally AI-validated), everything else falls through to the AI
/// strategy, and a failed AI leg degrades back to whatever the rules said.
pub struct HybridReasoner {
    rules: RuleReasoner,
    ai: Option<Arc<AiReasoner>>,
    threshold: f64,
}

impl HybridReasoner {
    pub fn new(rules: RuleReasoner, ai: Option<Arc<AiReasoner>>, threshold: f64) -> Self {
        Self {
            rules,
            ai,
            threshold,
        }
    }

    pub async fn decide(
        &self,
        envelope: &RequestEnvelope,
        snapshot: &RegistrySnapshot,
    ) -> Result<ReasoningDecision, OrchestratorError> {
        let mut rule_decision = self.rules.decide(envelope, snapshot);

        if !rule_decision.is_empty() && rule_decision.confidence >= self.threshold {
            if rule_decision.method == ReasoningMethod::RuleMulti {
                // Validation may only downgrade confidence, never grow the
                // agent set.
                if let Some(ref ai) = self.ai {
                    if let Some(downgrade) = ai.validate_selection(envelope, &rule_decision).await {
                        tracing::info!(
                            "AI rejected multi-rule selection, downgrading confidence {} -> {}",
                            rule_decision.confidence,
                            rule_decision.confidence * downgrade,
                        );
                        rule_decision.confidence *= downgrade;
                    }
                }
            } else {
                rule_decision.method = ReasoningMethod::HybridRule;
            }
            return Ok(rule_decision);
        }

        if let Some(ref ai) = self.ai {
            match ai.decide(envelope, snapshot).await {
                Ok(mut decision) => {
                    decision.method = ReasoningMethod::HybridAi;
                    return Ok(decision);
                }
                Err(err) => {
                    tracing::warn!("AI reasoning failed, degrading to rules: {}", err);
                }
            }
        }

        // Gateway missing or failed: the rule decision, however weak, beats
        // nothing at all.
        if !rule_decision.is_empty() {
            rule_decision.method = ReasoningMethod::HybridRule;
            return Ok(rule_decision);
        }
        Ok(ReasoningDecision::empty(
            ReasoningMethod::Hybrid,
            "no rule matched and the AI strategy was unavailable",
        ))
    }
}
