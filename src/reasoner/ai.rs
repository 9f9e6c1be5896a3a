//! AI-based reasoning via the model gateway

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::rules::finalize_against_registry;
use crate::executor::RetryExecutor;
use crate::gateway::GatewayClient;
use crate::registry::RegistrySnapshot;
use crate::types::{
    JsonMap, OrchestratorError, ReasoningDecision, ReasoningMethod, RequestEnvelope,
};

const PLANNER_SYSTEM_PROMPT: &str = "You plan agent dispatch for an orchestration service. \
Given a user request and the list of available agents, reply with a single JSON object: \
{\"agents\": [\"name\", ...], \"reasoning\": \"...\", \"confidence\": 0.0-1.0, \
\"parallel\": true|false, \"parameters\": {\"agent\": {...}}}. \
Select only from the listed agents. Prefer the smallest set that covers the request.";

const SELECTION_REVIEW_SYSTEM_PROMPT: &str = "You review a planned agent selection for an \
orchestration service. Given the user request and the planned agents, reply with a single \
JSON object: {\"approve\": true|false, \"confidence\": 0.0-1.0}. Approve when the selection \
covers the request without unnecessary agents.";

/// What the gateway is expected to return.
#[derive(Debug, Deserialize)]
struct PlannerReply {
    #[serde(default)]
    agents: Vec<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    parallel: Option<bool>,
    #[serde(default)]
    parameters: HashMap<String, JsonMap>,
}

/// The AI strategy: ask the gateway which agents to run.
pub struct AiReasoner {
    gateway: Arc<GatewayClient>,
    executor: Arc<RetryExecutor>,
}

impl AiReasoner {
    pub fn new(gateway: Arc<GatewayClient>, executor: Arc<RetryExecutor>) -> Self {
        Self { gateway, executor }
    }

    fn build_prompt(envelope: &RequestEnvelope, snapshot: &RegistrySnapshot) -> String {
        let mut prompt = String::from("Available agents:\n");
        for entry in snapshot.list_enabled() {
            let descriptor = &entry.descriptor;
            prompt.push_str(&format!(
                "- {} (capabilities: {}){}\n",
                descriptor.name,
                descriptor.capabilities.join(", "),
                descriptor
                    .description
                    .as_deref()
                    .map(|d| format!(": {}", d))
                    .unwrap_or_default(),
            ));
        }
        prompt.push_str(&format!("\nRequest query: {}\n", envelope.query));
        if !envelope.fields.is_empty() {
            prompt.push_str(&format!(
                "Request fields: {}\n",
                serde_json::Value::Object(envelope.fields.clone())
            ));
        }
        prompt
    }

    /// One planning round trip, validated against the registry.
    pub async fn decide(
        &self,
        envelope: &RequestEnvelope,
        snapshot: &RegistrySnapshot,
    ) -> Result<ReasoningDecision, OrchestratorError> {
        let user = Self::build_prompt(envelope, snapshot);
        let value = self
            .executor
            .gateway_json(&self.gateway, PLANNER_SYSTEM_PROMPT, &user)
            .await
            .map_err(|e| OrchestratorError::Gateway(e.to_string()))?;

        let reply: PlannerReply = serde_json::from_value(value)
            .map_err(|e| OrchestratorError::Gateway(format!("unusable planner reply: {}", e)))?;

        let parallel = reply.parallel.unwrap_or(reply.agents.len() > 1);
        let mut decision = ReasoningDecision {
            selected_agents: reply.agents,
            parallel,
            per_agent_params: reply.parameters,
            method: ReasoningMethod::Ai,
            confidence: reply.confidence.clamp(0.0, 1.0),
            explanation: reply.reasoning,
            optional_agents: Vec::new(),
        };

        decision = finalize_against_registry(decision, snapshot);
        if decision.is_empty() {
            return Err(OrchestratorError::Gateway(
                "planner selected no usable agents".into(),
            ));
        }
        let selected = decision.selected_agents.clone();
        decision
            .per_agent_params
            .retain(|agent, _| selected.contains(agent));
        Ok(decision)
    }

    /// Ask the gateway to double-check a multi-rule selection. Returns a
    /// confidence multiplier in `[0, 1]`; errors degrade to acceptance.
    pub async fn validate_selection(
        &self,
        envelope: &RequestEnvelope,
        decision: &ReasoningDecision,
    ) -> Option<f64> {
        let user = format!(
            "Request: {}\nPlanned agents: {}",
            envelope.query,
            decision.selected_agents.join(", "),
        );
        let value = self
            .executor
            .gateway_json(&self.gateway, SELECTION_REVIEW_SYSTEM_PROMPT, &user)
            .await
            .ok()?;
        let approve = value.get("approve").and_then(|v| v.as_bool()).unwrap_or(true);
        let confidence = value
            .get("confidence")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
            .clamp(0.0, 1.0);
        if approve {
            None
        } else {
            Some(confidence)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_planner_reply_parsing() {
        let reply: PlannerReply = serde_json::from_str(
            r#"{"agents": ["calculator"], "reasoning": "math", "confidence": 1.4,
                "parameters": {"calculator": {"operation": "add"}}}"#,
        )
        .unwrap();
        assert_eq!(reply.agents, vec!["calculator"]);
        assert!(reply.parallel.is_none());
        assert_eq!(reply.parameters["calculator"]["operation"], "add");
        // Clamping happens in decide(), not at parse time.
        assert!(reply.confidence > 1.0);
    }

    #[test]
    fn test_prompt_lists_agents_and_fields() {
        use crate::adapters::{AdapterFactory, BuiltinCatalog};
        use crate::registry::AgentRegistry;
        use crate::types::{AgentDescriptor, TransportKind};
        use std::time::Duration;

        let registry = AgentRegistry::new(
            vec![AgentDescriptor {
                name: "calculator".into(),
                capabilities: vec!["math".into()],
                description: Some("arithmetic over operands".into()),
                transport: TransportKind::InProcess,
                endpoint: None,
                tool: None,
                allow_fields: vec![],
                deny_fields: vec![],
                max_retries: 0,
                timeout: Duration::from_secs(1),
                fallback: None,
                enabled: true,
                optional: false,
            }],
            AdapterFactory::new(std::sync::Arc::new(BuiltinCatalog::default())),
        )
        .unwrap();

        let envelope = RequestEnvelope::new("calculate 1 + 2")
            .with_field("operation", serde_json::json!("add"));
        let prompt = AiReasoner::build_prompt(&envelope, &registry.snapshot());
        assert!(prompt.contains("calculator (capabilities: math): arithmetic over operands"));
        assert!(prompt.contains("calculate 1 + 2"));
        assert!(prompt.contains("\"operation\""));
    }
}
