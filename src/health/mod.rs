//! Per-agent health tracking and circuit breaking
//!
//! Isolates failing agents with the standard Closed → Open → HalfOpen state
//! machine: the circuit opens after a run of consecutive failures, cools
//! down, then admits a single probe call before closing again.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

pub use crate::config::BreakerConfig;

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls flow through.
    Closed,
    /// Failure threshold reached, calls short-circuit until cool-down.
    Open { opened_at: Instant },
    /// Cool-down elapsed, exactly one probe call is admitted.
    HalfOpen,
}

/// Serializable view of a breaker state, for /health and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateView {
    Closed,
    Open,
    HalfOpen,
}

/// Error returned when a call is short-circuited.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit open for agent '{agent}' after {consecutive_failures} consecutive failures, retry in {retry_in:?}")]
pub struct CircuitOpenError {
    pub agent: String,
    pub consecutive_failures: u32,
    pub retry_in: Duration,
}

/// Circuit breaker for a single agent.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            probe_in_flight: false,
        }
    }

    /// Check whether a call may proceed.
    ///
    /// Transitions Open → HalfOpen once the cool-down has elapsed. In
    /// HalfOpen only the first caller gets through; the probe slot is
    /// released by the next `record_success` / `record_failure`.
    pub fn check(&mut self, agent: &str) -> Result<(), CircuitOpenError> {
        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cool_down {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    tracing::info!("circuit for '{}' half-open, admitting probe", agent);
                    Ok(())
                } else {
                    Err(CircuitOpenError {
                        agent: agent.to_string(),
                        consecutive_failures: self.consecutive_failures,
                        retry_in: self.config.cool_down - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(CircuitOpenError {
                        agent: agent.to_string(),
                        consecutive_failures: self.consecutive_failures,
                        retry_in: Duration::ZERO,
                    })
                } else {
                    self.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, agent: &str) {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
                self.probe_in_flight = false;
                tracing::info!("circuit for '{}' recovered, now closed", agent);
            }
            CircuitState::Open { .. } => {
                // A success can race an open circuit when the call started
                // before the trip; treat it as recovery.
                self.state = CircuitState::Closed;
                self.consecutive_failures = 0;
            }
        }
    }

    /// Record a failed call. Returns `true` when this failure tripped the
    /// circuit open.
    pub fn record_failure(&mut self, agent: &str) -> bool {
        match self.state {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        "circuit for '{}' tripped open after {} failures",
                        agent,
                        self.consecutive_failures
                    );
                    return true;
                }
                false
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                self.consecutive_failures += 1;
                self.probe_in_flight = false;
                tracing::warn!("circuit for '{}' probe failed, back to open", agent);
                true
            }
            CircuitState::Open { .. } => {
                self.consecutive_failures += 1;
                false
            }
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }

    pub fn state_view(&self) -> CircuitStateView {
        match self.state {
            CircuitState::Closed => CircuitStateView::Closed,
            CircuitState::Open { .. } => CircuitStateView::Open,
            CircuitState::HalfOpen => CircuitStateView::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Name-keyed table of circuit breakers, one per agent.
///
/// Breakers are created lazily on first use. Each entry holds its own small
/// lock, so contention is bounded to callers of the same agent.
pub struct BreakerTable {
    breakers: DashMap<String, Mutex<CircuitBreaker>>,
    default_config: BreakerConfig,
}

impl Default for BreakerTable {
    fn default() -> Self {
        Self::new(BreakerConfig::default())
    }
}

impl BreakerTable {
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
        }
    }

    fn with_breaker<T>(&self, agent: &str, f: impl FnOnce(&mut CircuitBreaker) -> T) -> T {
        let entry = self
            .breakers
            .entry(agent.to_string())
            .or_insert_with(|| Mutex::new(CircuitBreaker::new(self.default_config.clone())));
        let mut breaker = entry.lock();
        f(&mut breaker)
    }

    /// Check whether a call to `agent` may proceed.
    pub fn check(&self, agent: &str) -> Result<(), CircuitOpenError> {
        self.with_breaker(agent, |b| b.check(agent))
    }

    /// Whether `agent`'s circuit currently denies calls, without consuming
    /// the half-open probe slot.
    pub fn is_open(&self, agent: &str) -> bool {
        match self.breakers.get(agent) {
            Some(entry) => {
                let breaker = entry.lock();
                match breaker.state() {
                    CircuitState::Closed | CircuitState::HalfOpen => false,
                    CircuitState::Open { opened_at } => {
                        opened_at.elapsed() < breaker.config.cool_down
                    }
                }
            }
            None => false,
        }
    }

    pub fn record_success(&self, agent: &str) {
        self.with_breaker(agent, |b| b.record_success(agent));
    }

    /// Returns `true` when this failure tripped the circuit open.
    pub fn record_failure(&self, agent: &str) -> bool {
        self.with_breaker(agent, |b| b.record_failure(agent))
    }

    pub fn state(&self, agent: &str) -> Option<CircuitStateView> {
        self.breakers.get(agent).map(|e| e.lock().state_view())
    }

    /// Names of agents with a currently-open circuit.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| matches!(e.value().lock().state(), CircuitState::Open { .. }))
            .map(|e| e.key().clone())
            .collect();
        open.sort();
        open
    }
}
