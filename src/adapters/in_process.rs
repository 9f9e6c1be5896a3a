//! In-process adapter: invokes a bound async function

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Instant;

use super::AgentAdapter;
use crate::types::{AgentError, JsonMap};

/// A bound agent function: filtered input in, opaque JSON out.
pub type AgentFn =
    Arc<dyn Fn(JsonMap) -> BoxFuture<'static, Result<serde_json::Value, AgentError>> + Send + Sync>;

/// Adapter over a function bound in-process.
pub struct InProcessAdapter {
    name: String,
    func: AgentFn,
}

impl InProcessAdapter {
    pub fn new(name: &str, func: AgentFn) -> Self {
        Self {
            name: name.to_string(),
            func,
        }
    }
}

#[async_trait]
impl AgentAdapter for InProcessAdapter {
    async fn call(&self, input: JsonMap, deadline: Instant) -> Result<serde_json::Value, AgentError> {
        let fut = (self.func)(input);
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), fut).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::timeout(format!(
                "in-process agent '{}' exceeded its deadline",
                self.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentErrorKind;
    use futures::FutureExt;
    use serde_json::json;
    use std::time::Duration;

    fn echo_fn() -> AgentFn {
        Arc::new(|input: JsonMap| {
            async move { Ok(serde_json::Value::Object(input)) }.boxed()
        })
    }

    fn slow_fn(delay: Duration) -> AgentFn {
        Arc::new(move |_input: JsonMap| {
            async move {
                tokio::time::sleep(delay).await;
                Ok(json!({"done": true}))
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_call_passes_input_through() {
        let adapter = InProcessAdapter::new("echo", echo_fn());
        let mut input = JsonMap::new();
        input.insert("k".into(), json!("v"));
        let out = adapter
            .call(input, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out, json!({"k": "v"}));
    }

    #[tokio::test]
    async fn test_deadline_enforced() {
        let adapter = InProcessAdapter::new("slow", slow_fn(Duration::from_secs(5)));
        let err = adapter
            .call(JsonMap::new(), Instant::now() + Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::Timeout);
    }
}
