//! Rule-based reasoning
//!
//! Rules are priority-weighted predicates over the request envelope. Every
//! enabled rule is evaluated; matches are ordered by priority, then base
//! confidence, then name, so the same request and rule set always produce
//! the same decision.

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::registry::RegistrySnapshot;
use crate::types::{ReasoningDecision, ReasoningMethod, RequestEnvelope};

/// How a rule's conditions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combinator {
    #[default]
    And,
    Or,
}

/// Condition operators over envelope fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    Contains,
    MatchesRegex,
    Exists,
    Gt,
    Lt,
    In,
}

/// One predicate over a dotted envelope field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field_path: String,
    pub operator: ConditionOp,
    #[serde(default)]
    pub value: serde_json::Value,
    #[serde(default = "default_true")]
    pub case_sensitive: bool,
}

/// A dispatch rule mapping matching requests to target agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    /// Higher wins.
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub combinator: Combinator,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    pub target_agents: Vec<String>,
    #[serde(default = "default_confidence")]
    pub base_confidence: f64,
    /// Run this rule's agents in parallel even on a single match.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.5
}

struct CompiledRule {
    rule: Rule,
    /// One slot per condition; `Some` only for `matches_regex`.
    regexes: Vec<Option<Regex>>,
}

/// A validated, regex-precompiled rule set.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile the rule set, validating every regex up front.
    pub fn new(rules: Vec<Rule>) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let mut regexes = Vec::with_capacity(rule.conditions.len());
            for condition in &rule.conditions {
                if condition.operator == ConditionOp::MatchesRegex {
                    let pattern = condition.value.as_str().ok_or_else(|| {
                        ConfigError::InvalidValue {
                            key: format!("rules.{}.conditions", rule.name),
                            reason: "matches_regex value must be a string".into(),
                        }
                    })?;
                    let built = if condition.case_sensitive {
                        Regex::new(pattern)
                    } else {
                        Regex::new(&format!("(?i){}", pattern))
                    };
                    let regex = built.map_err(|e| ConfigError::InvalidValue {
                        key: format!("rules.{}.conditions", rule.name),
                        reason: format!("invalid regex: {}", e),
                    })?;
                    regexes.push(Some(regex));
                } else {
                    regexes.push(None);
                }
            }
            compiled.push(CompiledRule { rule, regexes });
        }
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Enabled rules matching `envelope`, ordered by priority descending,
    /// then base confidence descending, then name ascending.
    fn matching(&self, envelope: &RequestEnvelope) -> Vec<&CompiledRule> {
        let mut matches: Vec<&CompiledRule> = self
            .rules
            .iter()
            .filter(|c| c.rule.enabled && c.matches(envelope))
            .collect();
        matches.sort_by(|a, b| {
            b.rule
                .priority
                .cmp(&a.rule.priority)
                .then_with(|| {
                    b.rule
                        .base_confidence
                        .partial_cmp(&a.rule.base_confidence)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.rule.name.cmp(&b.rule.name))
        });
        matches
    }
}

impl CompiledRule {
    fn matches(&self, envelope: &RequestEnvelope) -> bool {
        if self.rule.conditions.is_empty() {
            return false;
        }
        let mut results = self
            .rule
            .conditions
            .iter()
            .zip(&self.regexes)
            .map(|(condition, regex)| condition_matches(condition, regex.as_ref(), envelope));
        match self.rule.combinator {
            Combinator::And => results.all(|m| m),
            Combinator::Or => results.any(|m| m),
        }
    }
}

fn condition_matches(
    condition: &Condition,
    regex: Option<&Regex>,
    envelope: &RequestEnvelope,
) -> bool {
    let value = envelope.lookup(&condition.field_path);
    if condition.operator == ConditionOp::Exists {
        return value.is_some();
    }
    let Some(value) = value else {
        return false;
    };

    match condition.operator {
        ConditionOp::Exists => unreachable!("handled above"),
        ConditionOp::Equals => match (value.as_str(), condition.value.as_str()) {
            (Some(a), Some(b)) if !condition.case_sensitive => a.eq_ignore_ascii_case(b),
            _ => value == condition.value,
        },
        ConditionOp::Contains => match (value.as_str(), condition.value.as_str()) {
            (Some(haystack), Some(needle)) => {
                if condition.case_sensitive {
                    haystack.contains(needle)
                } else {
                    haystack.to_lowercase().contains(&needle.to_lowercase())
                }
            }
            _ => false,
        },
        ConditionOp::MatchesRegex => match (value.as_str(), regex) {
            (Some(text), Some(regex)) => regex.is_match(text),
            _ => false,
        },
        ConditionOp::Gt => matches!(
            (value.as_f64(), condition.value.as_f64()),
            (Some(a), Some(b)) if a > b
        ),
        ConditionOp::Lt => matches!(
            (value.as_f64(), condition.value.as_f64()),
            (Some(a), Some(b)) if a < b
        ),
        ConditionOp::In => match condition.value.as_array() {
            Some(candidates) => candidates.iter().any(|candidate| {
                match (value.as_str(), candidate.as_str()) {
                    (Some(a), Some(b)) if !condition.case_sensitive => a.eq_ignore_ascii_case(b),
                    _ => &value == candidate,
                }
            }),
            None => false,
        },
    }
}

/// The rule strategy.
pub struct RuleReasoner {
    rules: RuleSet,
    /// Multi-rule unions require every participant at or above this.
    threshold: f64,
}

impl RuleReasoner {
    pub fn new(rules: RuleSet, threshold: f64) -> Self {
        Self { rules, threshold }
    }

    /// Evaluate the rule set against one envelope.
    pub fn decide(
        &self,
        envelope: &RequestEnvelope,
        snapshot: &RegistrySnapshot,
    ) -> ReasoningDecision {
        let matches = self.rules.matching(envelope);
        if matches.is_empty() {
            return ReasoningDecision::empty(ReasoningMethod::Rule, "no rules matched");
        }

        let high: Vec<&CompiledRule> = matches
            .iter()
            .copied()
            .filter(|c| c.rule.base_confidence >= self.threshold)
            .collect();

        let decision = if high.len() >= 2 {
            // Union the high-confidence targets, first occurrence wins.
            let mut agents = Vec::new();
            for compiled in &high {
                for target in &compiled.rule.target_agents {
                    if !agents.contains(target) {
                        agents.push(target.clone());
                    }
                }
            }
            let confidence = high.iter().map(|c| c.rule.base_confidence).sum::<f64>()
                / high.len() as f64;
            let names: Vec<&str> = high.iter().map(|c| c.rule.name.as_str()).collect();
            ReasoningDecision {
                selected_agents: agents,
                parallel: true,
                per_agent_params: Default::default(),
                method: ReasoningMethod::RuleMulti,
                confidence,
                explanation: format!("rules {} matched", names.join(", ")),
                optional_agents: Vec::new(),
            }
        } else {
            let top = matches[0];
            ReasoningDecision {
                selected_agents: top.rule.target_agents.clone(),
                parallel: top.rule.parallel,
                per_agent_params: Default::default(),
                method: ReasoningMethod::Rule,
                confidence: top.rule.base_confidence,
                explanation: format!("rule '{}' matched", top.rule.name),
                optional_agents: Vec::new(),
            }
        };

        finalize_against_registry(decision, snapshot)
    }
}

/// Drop selected agents that are unknown or disabled and fill the optional
/// set from the surviving descriptors. An empty survivor list collapses the
/// decision to empty with confidence zero.
pub(crate) fn finalize_against_registry(
    mut decision: ReasoningDecision,
    snapshot: &RegistrySnapshot,
) -> ReasoningDecision {
    let before = decision.selected_agents.len();
    decision
        .selected_agents
        .retain(|name| snapshot.get_enabled(name).is_some());
    if decision.selected_agents.len() < before {
        tracing::warn!(
            "reasoner dropped {} unknown or disabled agent(s)",
            before - decision.selected_agents.len()
        );
    }
    if decision.selected_agents.is_empty() {
        return ReasoningDecision::empty(decision.method, "no selected agent is available");
    }
    decision.optional_agents = decision
        .selected_agents
        .iter()
        .filter(|name| {
            snapshot
                .get_enabled(name)
                .map(|e| e.descriptor.optional)
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    decision.confidence = decision.confidence.clamp(0.0, 1.0);
    decision
}
