//! Orchestrator pipeline
//!
//! Sequences one request through sanitization → reasoning → execution →
//! validation, loops execution on failed validation, aggregates the agent
//! outputs into the response envelope, and emits streaming progress events.
//! Every invocation finalizes exactly one query-log record, on success and
//! on every error path.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{LoadedConfig, PipelineConfig};
use crate::executor::RetryExecutor;
use crate::gateway::GatewayClient;
use crate::health::BreakerTable;
use crate::metrics::Metrics;
use crate::reasoner::{build_reasoner, Reasoner, RuleSet};
use crate::registry::{AgentRegistry, RegistrySnapshot};
use crate::session::{AgentCallRecord, QueryLogWriter, QueryRecord, SessionStore};
use crate::types::{
    AgentResponse, ErrorEntry, JsonMap, OrchestratorError, OrchestratorResult, QueryId,
    ReasoningDecision, RequestEnvelope, ResponseEnvelope, ResponseMetadata, ValidationResult,
    ValidationWarning,
};
use crate::validation::ResponseValidator;

pub mod events;
pub mod sanitize;

pub use events::{EventSink, StreamEvent, StreamEventKind};
pub use sanitize::Sanitizer;

/// The orchestrator: owns every pipeline collaborator for the process
/// lifetime.
pub struct Orchestrator {
    registry: Arc<AgentRegistry>,
    executor: Arc<RetryExecutor>,
    reasoner: Arc<dyn Reasoner>,
    validator: Arc<ResponseValidator>,
    sessions: Arc<SessionStore>,
    query_log: Arc<QueryLogWriter>,
    metrics: Arc<Metrics>,
    sanitizer: Sanitizer,
    config: PipelineConfig,
}

impl Orchestrator {
    /// Wire the full component graph from a loaded configuration.
    pub fn from_config(
        loaded: LoadedConfig,
        catalog: Arc<crate::adapters::BuiltinCatalog>,
    ) -> OrchestratorResult<Self> {
        let settings = loaded.settings;
        let metrics = Arc::new(Metrics::default());
        let breakers = Arc::new(BreakerTable::new(settings.breaker.clone()));
        let executor = Arc::new(RetryExecutor::new(
            breakers,
            metrics.clone(),
            settings.execution.clone(),
        ));

        let factory = crate::adapters::AdapterFactory::new(catalog);
        let registry = Arc::new(
            AgentRegistry::new(loaded.agents, factory)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?,
        );

        let gateway = GatewayClient::from_env(&settings.gateway).map(Arc::new);
        let rules = RuleSet::new(loaded.rules)?;
        let reasoner = build_reasoner(
            settings.reasoning.mode,
            rules,
            settings.reasoning.rule_confidence_threshold,
            gateway.clone(),
            executor.clone(),
        );
        let validator = Arc::new(ResponseValidator::new(
            settings.validation.clone(),
            gateway,
            executor.clone(),
            metrics.clone(),
        ));

        let query_log = Arc::new(
            QueryLogWriter::new(&settings.query_log)
                .map_err(|e| OrchestratorError::Internal(format!("query log: {}", e)))?,
        );
        let sessions = Arc::new(SessionStore::new(settings.session.clone()));

        Ok(Self {
            registry,
            executor,
            reasoner,
            validator,
            sessions,
            query_log,
            metrics,
            sanitizer: Sanitizer::default(),
            config: settings.pipeline,
        })
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        self.executor.breakers()
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Process one request end to end.
    ///
    /// The effective deadline is `min(caller_deadline, pipeline budget)`;
    /// deadline expiry and consumer disconnection both cancel in-flight
    /// work by dropping the pipeline future at the select. Exactly one
    /// terminal event is emitted and exactly one log record written.
    pub async fn process(
        &self,
        query_id: QueryId,
        envelope: RequestEnvelope,
        caller_deadline: Option<Duration>,
        sink: &EventSink,
    ) -> OrchestratorResult<ResponseEnvelope> {
        let started = Instant::now();
        let budget = caller_deadline
            .unwrap_or(self.config.budget)
            .min(self.config.budget);
        let deadline = started + budget;

        let mut record = QueryRecord::new(query_id, envelope.clone());

        let result = tokio::select! {
            result = self.run(query_id, &envelope, deadline, sink, &mut record) => result,
            _ = tokio::time::sleep(budget) => {
                Err(OrchestratorError::Cancelled("pipeline budget exhausted".into()))
            }
            _ = sink.closed() => {
                Err(OrchestratorError::Cancelled("client disconnected".into()))
            }
        };

        match &result {
            Ok(response) => {
                record.outcome = if response.success {
                    "success".to_string()
                } else {
                    "failed".to_string()
                };
                self.metrics.record_request(response.success);
            }
            Err(error) => {
                record.outcome = error.kind().to_string();
                record.record_error(error.kind(), error.to_string());
                self.metrics.record_request(false);
                if matches!(error, OrchestratorError::Cancelled(_)) {
                    self.metrics.record_cancelled();
                }
            }
        }
        record.total_time_ms = started.elapsed().as_millis() as u64;
        self.query_log.write(&record).await;

        match &result {
            Ok(response) => {
                let payload = serde_json::to_value(response).unwrap_or_else(|_| json!({}));
                sink.emit(StreamEventKind::Completed, payload).await;
            }
            Err(error) => {
                sink.emit(
                    StreamEventKind::Error,
                    json!({"kind": error.kind(), "message": error.to_string()}),
                )
                .await;
            }
        }
        result
    }

    async fn emit(
        &self,
        sink: &EventSink,
        kind: StreamEventKind,
        data: serde_json::Value,
    ) -> OrchestratorResult<()> {
        if sink.emit(kind, data).await {
            Ok(())
        } else {
            Err(OrchestratorError::Cancelled("client disconnected".into()))
        }
    }

    async fn run(
        &self,
        query_id: QueryId,
        envelope: &RequestEnvelope,
        deadline: Instant,
        sink: &EventSink,
        record: &mut QueryRecord,
    ) -> OrchestratorResult<ResponseEnvelope> {
        self.emit(sink, StreamEventKind::Started, json!({"query": envelope.query}))
            .await?;

        if envelope.query.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "query must not be empty".into(),
            ));
        }
        if let Err(reason) = self.sanitizer.check(envelope) {
            return Err(OrchestratorError::Security(reason));
        }

        let snapshot = self.registry.snapshot();

        self.emit(sink, StreamEventKind::ReasoningStarted, json!({})).await?;
        let decision = self.reasoner.decide(envelope, &snapshot).await?;
        record.decision = Some(decision.clone());
        self.emit(
            sink,
            StreamEventKind::ReasoningComplete,
            json!({
                "agents": decision.selected_agents,
                "method": decision.method,
                "parallel": decision.parallel,
            }),
        )
        .await?;

        if decision.is_empty() {
            return Err(OrchestratorError::NoAgents(decision.explanation.clone()));
        }
        self.ensure_some_agent_callable(&snapshot, &decision)?;

        let (responses, validation) = self
            .execute_with_validation(envelope, &decision, &snapshot, deadline, sink, record)
            .await?;

        let session = self.sessions.touch(
            envelope.session_id.as_deref(),
            decision.selected_agents.first().map(|s| s.as_str()),
        );

        Ok(self.aggregate(query_id, &decision, &responses, &validation, &session, record))
    }

    /// Every selected agent unreachable (open circuit, no usable fallback)
    /// means there is nothing to execute.
    fn ensure_some_agent_callable(
        &self,
        snapshot: &RegistrySnapshot,
        decision: &ReasoningDecision,
    ) -> OrchestratorResult<()> {
        let breakers = self.executor.breakers();
        let callable = decision.selected_agents.iter().any(|name| {
            if !breakers.is_open(name) {
                return true;
            }
            snapshot
                .get_enabled(name)
                .and_then(|entry| entry.descriptor.fallback.clone())
                .map(|fb| snapshot.get_enabled(&fb).is_some() && !breakers.is_open(&fb))
                .unwrap_or(false)
        });
        if callable {
            Ok(())
        } else {
            Err(OrchestratorError::NoAgents(
                "every selected agent has an open circuit and no usable fallback".into(),
            ))
        }
    }

    /// The execution ↔ validation loop.
    async fn execute_with_validation(
        &self,
        envelope: &RequestEnvelope,
        decision: &ReasoningDecision,
        snapshot: &RegistrySnapshot,
        deadline: Instant,
        sink: &EventSink,
        record: &mut QueryRecord,
    ) -> OrchestratorResult<(Vec<AgentResponse>, ValidationResult)> {
        let base_input = envelope.as_map();
        let make_input = |agent: &str| -> JsonMap {
            let mut input = base_input.clone();
            if let Some(params) = decision.per_agent_params.get(agent) {
                for (key, value) in params {
                    input.insert(key.clone(), value.clone());
                }
            }
            input
        };

        let all_agents = decision.selected_agents.clone();
        let mut to_run = all_agents.clone();
        let mut latest: HashMap<String, AgentResponse> = HashMap::new();
        let max_rounds = self.validator.config().max_validation_retries + 1;

        for round in 1..=max_rounds {
            self.emit(
                sink,
                StreamEventKind::AgentsExecuting,
                json!({"agents": to_run, "parallel": decision.parallel}),
            )
            .await?;
            for agent in &to_run {
                self.emit(sink, StreamEventKind::AgentStarted, json!({"agent": agent}))
                    .await?;
            }

            let pairs: Vec<(String, JsonMap)> = to_run
                .iter()
                .map(|agent| (agent.clone(), make_input(agent)))
                .collect();
            let responses = if decision.parallel {
                self.executor
                    .call_parallel(snapshot, pairs.clone(), deadline)
                    .await
            } else {
                self.executor
                    .call_sequential(snapshot, pairs.clone(), deadline, to_run.len() > 1)
                    .await
            };

            for ((agent, input), response) in pairs.into_iter().zip(responses) {
                self.emit(
                    sink,
                    StreamEventKind::AgentComplete,
                    json!({
                        "agent": agent,
                        "success": response.success,
                        "execution_time_ms": response.execution_time_ms,
                        "fellback": response.fellback,
                    }),
                )
                .await?;
                record.agent_calls.push(AgentCallRecord {
                    agent: agent.clone(),
                    input,
                    response: response.clone(),
                });
                latest.insert(agent, response);
            }

            let ordered: Vec<AgentResponse> = all_agents
                .iter()
                .filter_map(|agent| latest.get(agent).cloned())
                .collect();

            self.emit(sink, StreamEventKind::ValidationStarted, json!({})).await?;
            let validation = self.validator.validate(envelope, decision, &ordered).await;
            record.validations.push(validation.clone());
            let issue_codes: Vec<&str> =
                validation.issues.iter().map(|i| i.code.as_str()).collect();
            self.emit(
                sink,
                StreamEventKind::ValidationComplete,
                json!({"is_valid": validation.is_valid, "issues": issue_codes}),
            )
            .await?;

            if validation.is_valid || round == max_rounds {
                return Ok((ordered, validation));
            }

            let reason = if issue_codes.is_empty() {
                "confidence below floor".to_string()
            } else {
                issue_codes.join(", ")
            };
            record.record_retry(round, reason.clone());
            self.metrics.record_validation_retry();
            self.emit(
                sink,
                StreamEventKind::Retry,
                json!({"attempt": round, "reason": reason}),
            )
            .await?;

            // A single implicated agent is re-executed alone when the run
            // was serial (or output reuse is enabled); otherwise the whole
            // set runs again.
            to_run = match validation.suspect_agent {
                Some(ref suspect)
                    if all_agents.contains(suspect)
                        && (!decision.parallel
                            || self.validator.config().reuse_agent_outputs) =>
                {
                    vec![suspect.clone()]
                }
                _ => all_agents.clone(),
            };
        }
        unreachable!("the validation loop always returns by the last round")
    }

    fn aggregate(
        &self,
        query_id: QueryId,
        decision: &ReasoningDecision,
        responses: &[AgentResponse],
        validation: &ValidationResult,
        session: &crate::types::SessionState,
        record: &mut QueryRecord,
    ) -> ResponseEnvelope {
        let mut data = JsonMap::new();
        let mut errors = Vec::new();
        let mut agent_trail = Vec::new();
        let mut critical_ok = true;

        for (requested, response) in decision.selected_agents.iter().zip(responses) {
            agent_trail.push(requested.clone());
            if response.fellback && &response.agent_name != requested {
                agent_trail.push(response.agent_name.clone());
            }
            if response.success {
                if let Some(ref value) = response.data {
                    data.insert(response.agent_name.clone(), value.clone());
                }
            } else {
                let kind = response
                    .error_kind
                    .map(|k| k.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                errors.push(ErrorEntry {
                    agent: response.agent_name.clone(),
                    error_kind: "AgentFailure".to_string(),
                    message: format!(
                        "{}: {}",
                        kind,
                        response.error.as_deref().unwrap_or("agent call failed")
                    ),
                });
                if !decision.optional_agents.contains(requested) {
                    critical_ok = false;
                }
            }
        }

        let successful = responses.iter().filter(|r| r.success).count();
        let failed = responses.len() - successful;
        let success = successful > 0 && critical_ok;

        let validation_warning = if validation.is_valid {
            None
        } else {
            Some(ValidationWarning {
                message: "response could not be fully validated".to_string(),
                issues: validation.issues.iter().map(|i| i.code.clone()).collect(),
            })
        };

        record.session_id = Some(session.session_id.clone());

        ResponseEnvelope {
            success,
            data,
            errors,
            metadata: ResponseMetadata {
                count: responses.len(),
                successful,
                failed,
                agent_trail,
                total_execution_time_ms: responses.iter().map(|r| r.execution_time_ms).sum(),
                reasoning_method: Some(decision.method),
                request_id: query_id.to_string(),
                timestamp: chrono::Utc::now(),
                session_id: Some(session.session_id.clone()),
                session_request_count: Some(session.request_count),
                validation_warning,
            },
        }
    }
}
