//! Retry executor
//!
//! Wraps single agent calls with breaker checks, bounded retries,
//! exponential backoff with jitter, per-attempt timeouts and fallback
//! substitution; runs agent sets in parallel under a concurrency semaphore
//! or serialized with output injection.

use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::adapters::filter_input;
use crate::config::ExecutionConfig;
use crate::gateway::{GatewayClient, GATEWAY_BREAKER};
use crate::health::BreakerTable;
use crate::metrics::Metrics;
use crate::registry::{AgentEntry, RegistrySnapshot};
use crate::types::{AgentError, AgentErrorKind, AgentResponse, JsonMap};

/// Executes agent calls under the failure-handling policy.
pub struct RetryExecutor {
    breakers: Arc<BreakerTable>,
    metrics: Arc<Metrics>,
    config: ExecutionConfig,
}

impl RetryExecutor {
    pub fn new(breakers: Arc<BreakerTable>, metrics: Arc<Metrics>, config: ExecutionConfig) -> Self {
        Self {
            breakers,
            metrics,
            config,
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        &self.breakers
    }

    /// Backoff before retry `attempt` (1-based): `min(base·2^(n-1), cap)`
    /// scaled by a jitter factor in `[0.5, 1.5)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self
            .config
            .backoff_base
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.config.backoff_cap);
        capped.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
    }

    /// Call one agent with the full single-agent semantics: breaker check
    /// with fallback substitution, bounded retries, and a final fallback
    /// invocation on terminal failure.
    pub async fn call_agent(
        &self,
        snapshot: &RegistrySnapshot,
        name: &str,
        input: &JsonMap,
        pipeline_deadline: Instant,
    ) -> AgentResponse {
        let entry = match snapshot.get_enabled(name) {
            Some(entry) => entry,
            None => {
                return AgentResponse::failed(
                    name,
                    AgentError::permanent(format!("agent '{}' is unknown or disabled", name)),
                    Duration::ZERO,
                    0,
                );
            }
        };

        // Open circuit: substitute the fallback immediately when one is
        // configured and callable, otherwise short-circuit.
        if let Err(open) = self.breakers.check(name) {
            if let Some(fallback) = self.resolve_fallback(snapshot, &entry) {
                tracing::info!(
                    "circuit open for '{}', substituting fallback '{}'",
                    name,
                    fallback.descriptor.name
                );
                self.metrics.record_fallback();
                let mut response = self.call_with_retries(&fallback, input, pipeline_deadline).await;
                response.fellback = true;
                return response;
            }
            return AgentResponse::failed(
                name,
                AgentError::circuit_open(open.to_string()),
                Duration::ZERO,
                0,
            );
        }

        let response = self.call_with_retries(&entry, input, pipeline_deadline).await;
        if response.success {
            return response;
        }

        // Terminal failure: one fallback invocation, without further
        // fallbacks.
        if let Some(fallback) = self.resolve_fallback(snapshot, &entry) {
            tracing::info!(
                "agent '{}' failed terminally, invoking fallback '{}'",
                name,
                fallback.descriptor.name
            );
            self.metrics.record_fallback();
            let mut fb_response = self.call_with_retries(&fallback, input, pipeline_deadline).await;
            fb_response.fellback = true;
            return fb_response;
        }
        response
    }

    fn resolve_fallback(
        &self,
        snapshot: &RegistrySnapshot,
        entry: &AgentEntry,
    ) -> Option<Arc<AgentEntry>> {
        let name = entry.descriptor.fallback.as_deref()?;
        if self.breakers.is_open(name) {
            return None;
        }
        snapshot.get_enabled(name)
    }

    /// The retry loop for one agent, breaker already consulted.
    async fn call_with_retries(
        &self,
        entry: &AgentEntry,
        input: &JsonMap,
        pipeline_deadline: Instant,
    ) -> AgentResponse {
        let descriptor = &entry.descriptor;
        let name = descriptor.name.as_str();
        let start = Instant::now();

        let filtered = match filter_input(descriptor, input) {
            Ok(filtered) => filtered,
            Err(err) => {
                self.breakers.record_failure(name);
                self.metrics.record_agent_call(name, false);
                return AgentResponse::failed(name, err, start.elapsed(), 0);
            }
        };

        let max_attempts = descriptor.max_retries + 1;
        let mut attempt = 0;
        let terminal_error = loop {
            attempt += 1;
            let deadline = (Instant::now() + descriptor.timeout).min(pipeline_deadline);

            match entry.adapter.call(filtered.clone(), deadline).await {
                Ok(data) => {
                    self.breakers.record_success(name);
                    self.metrics.record_agent_call(name, true);
                    return AgentResponse::ok(name, data, start.elapsed(), attempt);
                }
                Err(err) => {
                    let retriable = err.is_retriable() && attempt < max_attempts;
                    tracing::debug!(
                        "agent '{}' attempt {}/{} failed ({}): {}",
                        name,
                        attempt,
                        max_attempts,
                        err.kind,
                        err.message
                    );
                    if !retriable {
                        break err;
                    }
                    self.metrics.record_agent_retry();
                    let delay = self.backoff_delay(attempt);
                    if Instant::now() + delay >= pipeline_deadline {
                        break AgentError::timeout(format!(
                            "pipeline budget exhausted while backing off for '{}'",
                            name
                        ));
                    }
                    tokio::time::sleep(delay).await;
                }
            }
        };

        if self.breakers.record_failure(name) {
            self.metrics.record_breaker_open();
        }
        self.metrics.record_agent_call(name, false);
        AgentResponse::failed(name, terminal_error, start.elapsed(), attempt)
    }

    /// Run `pairs` concurrently, at most `max_parallel_agents` in flight.
    ///
    /// Returns responses in input order once every pair has either
    /// succeeded or exhausted its retries; a failing peer never aborts the
    /// others.
    pub async fn call_parallel(
        &self,
        snapshot: &RegistrySnapshot,
        pairs: Vec<(String, JsonMap)>,
        pipeline_deadline: Instant,
    ) -> Vec<AgentResponse> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_agents));
        let calls = pairs.into_iter().map(|(name, input)| {
            let semaphore = semaphore.clone();
            async move {
                // A closed semaphore cannot happen here; treat it as cancel.
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return AgentResponse::failed(
                            &name,
                            AgentError::new(AgentErrorKind::Transient, "executor shutting down"),
                            Duration::ZERO,
                            0,
                        )
                    }
                };
                self.call_agent(snapshot, &name, &input, pipeline_deadline).await
            }
        });
        futures::future::join_all(calls).await
    }

    /// Run `pairs` one after another. With `inject_outputs`, each
    /// successful response is added to the inputs of the agents after it,
    /// keyed by the producing agent's name.
    pub async fn call_sequential(
        &self,
        snapshot: &RegistrySnapshot,
        pairs: Vec<(String, JsonMap)>,
        pipeline_deadline: Instant,
        inject_outputs: bool,
    ) -> Vec<AgentResponse> {
        let mut responses = Vec::with_capacity(pairs.len());
        let mut carried = JsonMap::new();
        for (name, mut input) in pairs {
            if inject_outputs {
                for (key, value) in &carried {
                    input.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            let response = self.call_agent(snapshot, &name, &input, pipeline_deadline).await;
            if inject_outputs && response.success {
                if let Some(ref data) = response.data {
                    carried.insert(response.agent_name.clone(), data.clone());
                }
            }
            responses.push(response);
        }
        responses
    }

    /// A gateway call under the dedicated `__gateway` breaker, with the
    /// same retry classification as agent calls.
    pub async fn gateway_json(
        &self,
        gateway: &GatewayClient,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, AgentError> {
        if let Err(open) = self.breakers.check(GATEWAY_BREAKER) {
            return Err(AgentError::circuit_open(open.to_string()));
        }

        let max_attempts = gateway.max_retries + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match gateway.completion_json(system, user).await {
                Ok(value) => {
                    self.breakers.record_success(GATEWAY_BREAKER);
                    self.metrics.record_agent_call(GATEWAY_BREAKER, true);
                    return Ok(value);
                }
                Err(err) => {
                    if err.is_retriable() && attempt < max_attempts {
                        self.metrics.record_agent_retry();
                        tokio::time::sleep(self.backoff_delay(attempt)).await;
                        continue;
                    }
                    if self.breakers.record_failure(GATEWAY_BREAKER) {
                        self.metrics.record_breaker_open();
                    }
                    self.metrics.record_agent_call(GATEWAY_BREAKER, false);
                    return Err(err);
                }
            }
        }
    }
}
