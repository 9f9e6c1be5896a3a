//! Remote-tool adapter: invokes a named tool on an external tool server
//!
//! Wire format: `POST <endpoint>` with `{"tool": ..., "arguments": {...}}`;
//! the server answers `{"result": ...}` or `{"error": {"kind", "message"}}`.
//! Connection establishment shares the executor's backoff policy because
//! connect failures are classified `Transient` and therefore retried.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Instant;

use super::AgentAdapter;
use crate::types::{AgentError, AgentErrorKind, JsonMap};

/// Adapter over a named tool on a remote tool server. The `reqwest::Client`
/// is shared across adapters, so connections are pooled per host.
pub struct RemoteToolAdapter {
    client: reqwest::Client,
    endpoint: String,
    tool: String,
}

#[derive(Debug, Deserialize)]
struct ToolErrorBody {
    #[serde(default)]
    kind: Option<AgentErrorKind>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ToolResponseBody {
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<ToolErrorBody>,
}

impl RemoteToolAdapter {
    pub fn new(client: reqwest::Client, endpoint: String, tool: String) -> Self {
        Self {
            client,
            endpoint,
            tool,
        }
    }

    fn classify_transport(&self, err: &reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::timeout(format!("tool server '{}' timed out", self.endpoint))
        } else if err.is_connect() {
            AgentError::transient(format!(
                "connection to tool server '{}' failed: {}",
                self.endpoint, err
            ))
        } else {
            AgentError::transient(format!("tool server request failed: {}", err))
        }
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: &str) -> AgentError {
        let message = format!("tool server returned {}: {}", status, body);
        if status.as_u16() == 429 {
            AgentError::new(AgentErrorKind::RateLimited, message)
        } else if status.as_u16() == 408 {
            AgentError::timeout(message)
        } else if status.is_server_error() {
            AgentError::transient(message)
        } else {
            AgentError::permanent(message)
        }
    }
}

#[async_trait]
impl AgentAdapter for RemoteToolAdapter {
    async fn call(&self, input: JsonMap, deadline: Instant) -> Result<serde_json::Value, AgentError> {
        let body = serde_json::json!({
            "tool": self.tool,
            "arguments": serde_json::Value::Object(input),
        });

        let request = self.client.post(&self.endpoint).json(&body).send();
        let response =
            match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), request).await {
                Ok(Ok(response)) => response,
                Ok(Err(err)) => return Err(self.classify_transport(&err)),
                Err(_) => {
                    return Err(AgentError::timeout(format!(
                        "call to tool '{}' exceeded its deadline",
                        self.tool
                    )))
                }
            };

        let status = response.status();
        let text = match tokio::time::timeout_at(
            tokio::time::Instant::from_std(deadline),
            response.text(),
        )
        .await
        {
            Ok(Ok(text)) => text,
            Ok(Err(err)) => return Err(self.classify_transport(&err)),
            Err(_) => {
                return Err(AgentError::timeout(format!(
                    "reading tool '{}' response exceeded the deadline",
                    self.tool
                )))
            }
        };

        if !status.is_success() {
            return Err(self.classify_status(status, &text));
        }

        let parsed: ToolResponseBody = serde_json::from_str(&text).map_err(|e| {
            AgentError::invalid_response(format!("unparseable tool server response: {}", e))
        })?;

        if let Some(error) = parsed.error {
            let kind = error.kind.unwrap_or(AgentErrorKind::Permanent);
            return Err(AgentError::new(
                kind,
                error
                    .message
                    .unwrap_or_else(|| "tool reported an error".to_string()),
            ));
        }

        parsed.result.ok_or_else(|| {
            AgentError::invalid_response("tool server response had neither result nor error")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        // Nothing listens on this port.
        let adapter = RemoteToolAdapter::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1/tools".to_string(),
            "echo".to_string(),
        );
        let err = adapter
            .call(JsonMap::new(), Instant::now() + Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Transient);
    }

    #[test]
    fn test_status_classification() {
        let adapter = RemoteToolAdapter::new(
            reqwest::Client::new(),
            "http://localhost/tools".to_string(),
            "t".to_string(),
        );
        assert_eq!(
            adapter
                .classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "")
                .kind,
            AgentErrorKind::RateLimited
        );
        assert_eq!(
            adapter
                .classify_status(reqwest::StatusCode::BAD_GATEWAY, "")
                .kind,
            AgentErrorKind::Transient
        );
        assert_eq!(
            adapter
                .classify_status(reqwest::StatusCode::BAD_REQUEST, "")
                .kind,
            AgentErrorKind::Permanent
        );
    }

    #[test]
    fn test_response_body_parsing() {
        let ok: ToolResponseBody = serde_json::from_str(r#"{"result": {"x": 1}}"#).unwrap();
        assert!(ok.result.is_some());

        let err: ToolResponseBody =
            serde_json::from_str(r#"{"error": {"kind": "rate_limited", "message": "slow down"}}"#)
                .unwrap();
        let e = err.error.unwrap();
        assert_eq!(e.kind, Some(AgentErrorKind::RateLimited));
        assert_eq!(e.message.as_deref(), Some("slow down"));
    }
}
