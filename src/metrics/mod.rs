//! In-memory metrics
//!
//! Lock-free atomic counters for the /stats endpoint. Only the validation
//! confidence window takes a lock, held briefly for insertion or averaging.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Per-agent call counters.
#[derive(Default)]
struct AgentCounters {
    calls: AtomicU64,
    failures: AtomicU64,
}

struct ConfidenceWindow {
    scores: VecDeque<f64>,
    max_scores: usize,
}

/// Process-wide metrics. Lives for the process lifetime; shared by `Arc`.
pub struct Metrics {
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    agent_retries: AtomicU64,
    validation_retries: AtomicU64,
    hallucinations: AtomicU64,
    fallbacks: AtomicU64,
    breaker_opens: AtomicU64,
    cancelled: AtomicU64,
    per_agent: DashMap<String, AgentCounters>,
    confidence: Mutex<ConfidenceWindow>,
    started_at: Instant,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            requests_success: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            agent_retries: AtomicU64::new(0),
            validation_retries: AtomicU64::new(0),
            hallucinations: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            breaker_opens: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            per_agent: DashMap::new(),
            confidence: Mutex::new(ConfidenceWindow {
                scores: VecDeque::new(),
                max_scores: 1000,
            }),
            started_at: Instant::now(),
        }
    }
}

impl Metrics {
    pub fn record_request(&self, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.requests_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.requests_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_agent_call(&self, agent: &str, success: bool) {
        let counters = self.per_agent.entry(agent.to_string()).or_default();
        counters.calls.fetch_add(1, Ordering::Relaxed);
        if !success {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_agent_retry(&self) {
        self.agent_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_validation_retry(&self) {
        self.validation_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hallucination(&self) {
        self.hallucinations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_breaker_open(&self) {
        self.breaker_opens.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a validation confidence score (log-side only).
    pub fn record_confidence(&self, score: f64) {
        let mut window = self.confidence.lock();
        window.scores.push_back(score);
        if window.scores.len() > window.max_scores {
            window.scores.pop_front();
        }
    }

    pub fn average_confidence(&self) -> Option<f64> {
        let window = self.confidence.lock();
        if window.scores.is_empty() {
            None
        } else {
            Some(window.scores.iter().sum::<f64>() / window.scores.len() as f64)
        }
    }

    /// Point-in-time snapshot for /stats.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let total = self.requests_total.load(Ordering::Relaxed);
        let retries = self.agent_retries.load(Ordering::Relaxed);
        let hallucinations = self.hallucinations.load(Ordering::Relaxed);

        let per_agent = self
            .per_agent
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    AgentStats {
                        calls: entry.value().calls.load(Ordering::Relaxed),
                        failures: entry.value().failures.load(Ordering::Relaxed),
                    },
                )
            })
            .collect();

        MetricsSnapshot {
            uptime_seconds: self.started_at.elapsed().as_secs(),
            requests_total: total,
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            agent_retries: retries,
            validation_retries: self.validation_retries.load(Ordering::Relaxed),
            retry_rate: rate(retries, total),
            hallucinations,
            hallucination_rate: rate(hallucinations, total),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            breaker_opens: self.breaker_opens.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            average_confidence: self.average_confidence(),
            per_agent,
        }
    }
}

fn rate(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Per-agent slice of a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStats {
    pub calls: u64,
    pub failures: u64,
}

/// Serializable metrics snapshot returned by /stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_seconds: u64,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub agent_retries: u64,
    pub validation_retries: u64,
    pub retry_rate: f64,
    pub hallucinations: u64,
    pub hallucination_rate: f64,
    pub fallbacks: u64,
    pub breaker_opens: u64,
    pub cancelled: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub average_confidence: Option<f64>,
    /// Sorted map so snapshots serialize stably.
    pub per_agent: BTreeMap<String, AgentStats>,
}
