//! HTTP API request and response types

use serde::{Deserialize, Serialize};

use crate::types::{
    ErrorEntry, OrchestratorError, QueryId, RequestEnvelope, ResponseEnvelope, ResponseMetadata,
};

/// Body of `POST /v1/query`: the request envelope plus transport options.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    /// Stream progress events over SSE instead of one JSON response.
    #[serde(default)]
    pub stream: bool,
    #[serde(flatten)]
    pub envelope: RequestEnvelope,
}

/// Body of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub registered_agents: usize,
    pub open_circuits: Vec<String>,
}

/// Uniform error envelope for failed requests. Mirrors the success
/// envelope's shape so clients parse one structure.
pub fn error_envelope(query_id: QueryId, error: &OrchestratorError) -> ResponseEnvelope {
    ResponseEnvelope {
        success: false,
        data: Default::default(),
        errors: vec![ErrorEntry {
            agent: "orchestrator".to_string(),
            error_kind: error.kind().to_string(),
            message: error.to_string(),
        }],
        metadata: ResponseMetadata {
            count: 0,
            successful: 0,
            failed: 0,
            agent_trail: Vec::new(),
            total_execution_time_ms: 0,
            reasoning_method: None,
            request_id: query_id.to_string(),
            timestamp: chrono::Utc::now(),
            session_id: None,
            session_request_count: None,
            validation_warning: None,
        },
    }
}

/// HTTP status for a pipeline error.
pub fn status_for(error: &OrchestratorError) -> axum::http::StatusCode {
    use axum::http::StatusCode;
    match error {
        OrchestratorError::InvalidRequest(_)
        | OrchestratorError::Security(_)
        | OrchestratorError::NoAgents(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Cancelled(_) => StatusCode::REQUEST_TIMEOUT,
        OrchestratorError::Gateway(_) => StatusCode::BAD_GATEWAY,
        OrchestratorError::AgentFailure { .. }
        | OrchestratorError::ValidationFailed { .. }
        | OrchestratorError::Config(_)
        | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_query_request_flattens_envelope() {
        let request: QueryRequest = serde_json::from_str(
            r#"{"query": "calculate 1 + 1", "stream": true, "operation": "add", "session_id": "s"}"#,
        )
        .unwrap();
        assert!(request.stream);
        assert_eq!(request.envelope.query, "calculate 1 + 1");
        assert_eq!(request.envelope.session_id.as_deref(), Some("s"));
        assert!(request.envelope.fields.contains_key("operation"));
    }

    #[test]
    fn test_error_envelope_shape() {
        let id = QueryId::new();
        let envelope = error_envelope(id, &OrchestratorError::Security("blocked".into()));
        assert!(!envelope.success);
        assert_eq!(envelope.errors[0].error_kind, "SecurityError");
        assert_eq!(envelope.metadata.request_id, id.to_string());
        // The serialized form never leaks internals.
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("confidence_score"));
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&OrchestratorError::InvalidRequest("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&OrchestratorError::Gateway("down".into())),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(&OrchestratorError::Cancelled("deadline".into())),
            StatusCode::REQUEST_TIMEOUT
        );
        assert_eq!(
            status_for(&OrchestratorError::Internal("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
