//! Model-gateway client
//!
//! Thin chat-completion client for the gateway sidecar that proxies LLM
//! calls for the AI reasoner and the validator's relevance check. The
//! gateway speaks the OpenAI-compatible `/chat/completions` shape. The
//! client classifies failures as [`AgentError`]s so calls can run through
//! the retry executor under the dedicated `__gateway` breaker.

use std::time::Duration;

use crate::config::GatewayConfig;
use crate::types::{AgentError, AgentErrorKind};

/// Breaker table key for gateway calls. The leading underscores keep it out
/// of any agent namespace.
pub const GATEWAY_BREAKER: &str = "__gateway";

/// Chat-completion client for the model gateway.
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    pub max_retries: u32,
}

impl GatewayClient {
    /// Build a client from config plus environment.
    ///
    /// The URL comes from `CONDUCTOR_GATEWAY_URL` or the config file; the
    /// credential from `CONDUCTOR_GATEWAY_API_KEY` (fallback
    /// `OPENAI_API_KEY`). Returns `None` when no URL is configured, which
    /// disables AI reasoning and the AI validation check.
    pub fn from_env(config: &GatewayConfig) -> Option<Self> {
        let base_url = std::env::var("CONDUCTOR_GATEWAY_URL")
            .ok()
            .or_else(|| config.url.clone())?;
        let api_key = std::env::var("CONDUCTOR_GATEWAY_API_KEY")
            .ok()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok());

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .ok()?;

        tracing::info!(
            "model gateway configured: url={} model={}",
            base_url,
            config.model
        );
        Some(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    /// Test constructor pointing at an explicit URL.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: model.into(),
            max_retries: 2,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One chat-completion round trip.
    pub async fn chat_completion(&self, system: &str, user: &str) -> Result<String, AgentError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user }
            ],
            "max_tokens": 1024,
            "temperature": 0.2
        });

        let start = std::time::Instant::now();

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::timeout(format!("gateway request timed out: {}", e))
            } else {
                AgentError::transient(format!("gateway request failed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            let message = format!("gateway returned {}: {}", status, text);
            return Err(if status.as_u16() == 429 {
                AgentError::new(AgentErrorKind::RateLimited, message)
            } else if status.is_server_error() {
                AgentError::transient(message)
            } else {
                AgentError::permanent(message)
            });
        }

        let resp_json: serde_json::Value = response.json().await.map_err(|e| {
            AgentError::invalid_response(format!("unparseable gateway response: {}", e))
        })?;

        if let Some(usage) = resp_json.get("usage") {
            tracing::info!(
                "gateway usage: model={} prompt_tokens={} completion_tokens={} latency={:?}",
                self.model,
                usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
                start.elapsed(),
            );
        }

        resp_json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| AgentError::invalid_response("no content in gateway response choices"))
    }

    /// Chat completion whose answer must contain one JSON object. The
    /// object is cut out of surrounding prose (models often wrap JSON in
    /// code fences) and parsed.
    pub async fn completion_json(
        &self,
        system: &str,
        user: &str,
    ) -> Result<serde_json::Value, AgentError> {
        let text = self.chat_completion(system, user).await?;
        extract_json_object(&text)
            .ok_or_else(|| AgentError::invalid_response("gateway response contained no JSON object"))
    }
}

/// Find and parse the outermost `{...}` in a text blob.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}
