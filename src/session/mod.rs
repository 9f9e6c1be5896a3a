//! Session table and per-query audit log
//!
//! Sessions are lightweight, name-keyed, and evicted after an idle TTL;
//! entries are replaced rather than mutated so readers never observe a
//! half-updated state. The query log writes one JSON record per pipeline
//! invocation, atomically (temp file + rename), with secrets redacted
//! before anything reaches disk.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{QueryLogConfig, SessionConfig};
use crate::types::{
    AgentResponse, JsonMap, QueryId, ReasoningDecision, RequestEnvelope, SessionState,
    ValidationResult,
};

/// Striped, name-keyed session table.
pub struct SessionStore {
    sessions: DashMap<String, SessionState>,
    idle_ttl: Duration,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            idle_ttl: config.idle_ttl,
        }
    }

    /// Record one request against a session, minting an id when the caller
    /// supplied none. Returns the updated state.
    pub fn touch(&self, session_id: Option<&str>, topic: Option<&str>) -> SessionState {
        let id = session_id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let previous = self.sessions.get(&id).map(|entry| entry.clone());
        let state = SessionState {
            session_id: id.clone(),
            request_count: previous.as_ref().map(|p| p.request_count).unwrap_or(0) + 1,
            last_topic: topic
                .map(str::to_string)
                .or_else(|| previous.and_then(|p| p.last_topic)),
            last_update: Utc::now(),
        };
        self.sessions.insert(id, state.clone());
        state
    }

    pub fn get(&self, session_id: &str) -> Option<SessionState> {
        self.sessions.get(session_id).map(|entry| entry.clone())
    }

    /// Drop sessions idle past the TTL. Returns the number evicted.
    pub fn evict_idle(&self) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.idle_ttl).unwrap_or(chrono::Duration::hours(24));
        let before = self.sessions.len();
        self.sessions.retain(|_, state| state.last_update >= cutoff);
        before - self.sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    #[cfg(test)]
    fn backdate(&self, session_id: &str, age: Duration) {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.last_update =
                Utc::now() - chrono::Duration::from_std(age).unwrap();
        }
    }
}

/// One agent invocation as recorded in the query log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCallRecord {
    pub agent: String,
    pub input: JsonMap,
    pub response: AgentResponse,
}

/// One validation-triggered retry as recorded in the query log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryRecord {
    pub attempt: u32,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// One pipeline error as recorded in the query log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// The append-only audit record for one query. Built up during the
/// pipeline and written exactly once on exit, error paths included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: String,
    pub session_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub envelope: RequestEnvelope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReasoningDecision>,
    #[serde(default)]
    pub agent_calls: Vec<AgentCallRecord>,
    #[serde(default)]
    pub validations: Vec<ValidationResult>,
    #[serde(default)]
    pub retries: Vec<RetryRecord>,
    #[serde(default)]
    pub errors: Vec<ErrorRecord>,
    pub outcome: String,
    pub total_time_ms: u64,
}

impl QueryRecord {
    pub fn new(query_id: QueryId, envelope: RequestEnvelope) -> Self {
        Self {
            query_id: query_id.to_string(),
            session_id: envelope.session_id.clone(),
            received_at: Utc::now(),
            envelope,
            decision: None,
            agent_calls: Vec::new(),
            validations: Vec::new(),
            retries: Vec::new(),
            errors: Vec::new(),
            outcome: "pending".to_string(),
            total_time_ms: 0,
        }
    }

    pub fn record_retry(&mut self, attempt: u32, reason: impl Into<String>) {
        self.retries.push(RetryRecord {
            attempt,
            reason: reason.into(),
            at: Utc::now(),
        });
    }

    pub fn record_error(&mut self, kind: &str, message: impl Into<String>) {
        self.errors.push(ErrorRecord {
            kind: kind.to_string(),
            message: message.into(),
            at: Utc::now(),
        });
    }
}

/// Redacts credentials and high-entropy strings from serialized records.
struct Redactor {
    keyed: Regex,
    entropy: Regex,
}

impl Redactor {
    fn new() -> Self {
        Self {
            keyed: Regex::new(
                r#"(?i)(api[_-]?key|authorization|bearer|token|secret|password)(["']?\s*[:=]\s*["']?)[^"'\s,}]+"#,
            )
            .expect("keyed redaction regex"),
            entropy: Regex::new(r"\b[A-Za-z0-9+/_\-]{40,}\b").expect("entropy redaction regex"),
        }
    }

    fn redact(&self, text: &str) -> String {
        let pass1 = self.keyed.replace_all(text, "$1$2[REDACTED]");
        self.entropy.replace_all(&pass1, "[REDACTED]").into_owned()
    }
}

/// Writes one JSON file per query under the configured directory.
pub struct QueryLogWriter {
    directory: Option<PathBuf>,
    redactor: Redactor,
}

impl QueryLogWriter {
    pub fn new(config: &QueryLogConfig) -> std::io::Result<Self> {
        let directory = if config.enabled {
            std::fs::create_dir_all(&config.directory)?;
            Some(config.directory.clone())
        } else {
            None
        };
        Ok(Self {
            directory,
            redactor: Redactor::new(),
        })
    }

    /// A writer that drops every record, for tests and disabled logging.
    pub fn disabled() -> Self {
        Self {
            directory: None,
            redactor: Redactor::new(),
        }
    }

    fn file_name(record: &QueryRecord) -> String {
        let prefix: String = record.query_id.chars().take(8).collect();
        format!(
            "query_{}_{}.json",
            record.received_at.format("%Y-%m-%dT%H-%M-%S%.3fZ"),
            prefix
        )
    }

    /// Write one finished record atomically. Failures are logged, never
    /// surfaced to the caller: the audit trail must not fail the request.
    pub async fn write(&self, record: &QueryRecord) {
        let Some(ref directory) = self.directory else {
            return;
        };
        let path = directory.join(Self::file_name(record));
        let json = match serde_json::to_string_pretty(record) {
            Ok(json) => self.redactor.redact(&json),
            Err(e) => {
                tracing::warn!("failed to serialize query record {}: {}", record.query_id, e);
                return;
            }
        };

        let directory = directory.clone();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::Write;
            let mut tmp = tempfile::NamedTempFile::new_in(&directory)?;
            tmp.write_all(json.as_bytes())?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("failed to write query log: {}", e),
            Err(e) => tracing::warn!("query log writer task failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_store(ttl: Duration) -> SessionStore {
        SessionStore::new(SessionConfig { idle_ttl: ttl })
    }

    #[test]
    fn test_touch_counts_requests() {
        let store = session_store(Duration::from_secs(60));
        let first = store.touch(Some("s-1"), Some("math"));
        assert_eq!(first.request_count, 1);
        let second = store.touch(Some("s-1"), None);
        assert_eq!(second.request_count, 2);
        // Topic is sticky when a later request has none.
        assert_eq!(second.last_topic.as_deref(), Some("math"));
    }

    #[test]
    fn test_touch_mints_session_id() {
        let store = session_store(Duration::from_secs(60));
        let state = store.touch(None, None);
        assert!(!state.session_id.is_empty());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_idle_eviction() {
        let store = session_store(Duration::from_secs(30));
        store.touch(Some("fresh"), None);
        store.touch(Some("stale"), None);
        store.backdate("stale", Duration::from_secs(120));

        assert_eq!(store.evict_idle(), 1);
        assert!(store.get("fresh").is_some());
        assert!(store.get("stale").is_none());
    }

    #[test]
    fn test_redaction() {
        let redactor = Redactor::new();
        let text = r#"{"api_key": "sk-abc123", "query": "weather", "Authorization": "Bearer xyz"}"#;
        let redacted = redactor.redact(text);
        assert!(!redacted.contains("sk-abc123"));
        assert!(redacted.contains("[REDACTED]"));
        assert!(redacted.contains("weather"));
    }

    #[test]
    fn test_redaction_high_entropy() {
        let redactor = Redactor::new();
        let token = "A".repeat(48);
        let text = format!("prefix {} suffix", token);
        assert!(!redactor.redact(&text).contains(&token));
    }

    #[test]
    fn test_file_name_shape() {
        let record = QueryRecord::new(QueryId::new(), RequestEnvelope::new("q"));
        let name = QueryLogWriter::file_name(&record);
        assert!(name.starts_with("query_"));
        assert!(name.ends_with(".json"));
        assert!(!name.contains(':'));
    }

    #[tokio::test]
    async fn test_write_record() {
        let dir = tempfile::tempdir().unwrap();
        let writer = QueryLogWriter::new(&QueryLogConfig {
            enabled: true,
            directory: dir.path().to_path_buf(),
        })
        .unwrap();

        let mut record = QueryRecord::new(QueryId::new(), RequestEnvelope::new("calculate 1"));
        record.outcome = "success".to_string();
        record.record_retry(1, "validation failed: empty_data");
        writer.write(&record).await;

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let parsed: QueryRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed.outcome, "success");
        assert_eq!(parsed.retries.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_writer_writes_nothing() {
        let writer = QueryLogWriter::disabled();
        let record = QueryRecord::new(QueryId::new(), RequestEnvelope::new("q"));
        writer.write(&record).await;
    }
}
