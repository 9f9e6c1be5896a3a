//! Agent adapters
//!
//! A uniform call contract over heterogeneous agent transports. Every call
//! goes through the descriptor's input filter first and is bounded by the
//! caller-supplied deadline.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::types::{AgentDescriptor, AgentError, JsonMap, TransportKind};

pub mod builtin;
pub mod in_process;
pub mod remote;

pub use builtin::BuiltinCatalog;
pub use in_process::InProcessAdapter;
pub use remote::RemoteToolAdapter;

/// The adapter contract: one filtered input in, one opaque result out.
///
/// Implementations enforce `deadline` themselves (a timed-out call returns
/// `AgentErrorKind::Timeout`) so the executor can treat every transport the
/// same way.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    async fn call(&self, input: JsonMap, deadline: Instant) -> Result<serde_json::Value, AgentError>;
}

/// Errors building an adapter from a descriptor.
#[derive(Debug, Clone, Error)]
pub enum AdapterBuildError {
    #[error("no in-process binding named '{0}'")]
    UnknownBinding(String),

    #[error("agent '{0}' has remote_tool transport but no endpoint")]
    MissingEndpoint(String),
}

/// Builds adapters for descriptors: in-process agents resolve against the
/// builtin catalog, remote agents share one pooled HTTP client.
#[derive(Clone)]
pub struct AdapterFactory {
    builtins: Arc<BuiltinCatalog>,
    http: reqwest::Client,
}

impl AdapterFactory {
    pub fn new(builtins: Arc<BuiltinCatalog>) -> Self {
        Self {
            builtins,
            http: reqwest::Client::new(),
        }
    }

    pub fn build(
        &self,
        descriptor: &AgentDescriptor,
    ) -> Result<Arc<dyn AgentAdapter>, AdapterBuildError> {
        match descriptor.transport {
            TransportKind::InProcess => {
                let func = self
                    .builtins
                    .get(&descriptor.name)
                    .ok_or_else(|| AdapterBuildError::UnknownBinding(descriptor.name.clone()))?;
                Ok(Arc::new(InProcessAdapter::new(&descriptor.name, func)))
            }
            TransportKind::RemoteTool => {
                let endpoint = descriptor
                    .endpoint
                    .clone()
                    .ok_or_else(|| AdapterBuildError::MissingEndpoint(descriptor.name.clone()))?;
                let tool = descriptor
                    .tool
                    .clone()
                    .unwrap_or_else(|| descriptor.name.clone());
                Ok(Arc::new(RemoteToolAdapter::new(
                    self.http.clone(),
                    endpoint,
                    tool,
                )))
            }
        }
    }
}

/// Apply the descriptor's allow/deny lists to the raw input.
///
/// A deny-list hit fails the call; a non-empty allow-list keeps only the
/// named fields. Per-agent parameters from the reasoning decision are merged
/// in afterwards, so they bypass neither list (they are merged by the caller
/// before filtering).
pub fn filter_input(
    descriptor: &AgentDescriptor,
    input: &JsonMap,
) -> Result<JsonMap, AgentError> {
    for denied in &descriptor.deny_fields {
        if input.contains_key(denied) {
            return Err(AgentError::input_rejected(format!(
                "field '{}' is denied for agent '{}'",
                denied, descriptor.name
            )));
        }
    }
    if descriptor.allow_fields.is_empty() {
        return Ok(input.clone());
    }
    Ok(input
        .iter()
        .filter(|(key, _)| descriptor.allow_fields.iter().any(|allowed| allowed == *key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentErrorKind;
    use serde_json::json;

    fn descriptor(allow: &[&str], deny: &[&str]) -> AgentDescriptor {
        AgentDescriptor {
            name: "test".into(),
            capabilities: vec![],
            description: None,
            transport: TransportKind::InProcess,
            endpoint: None,
            tool: None,
            allow_fields: allow.iter().map(|s| s.to_string()).collect(),
            deny_fields: deny.iter().map(|s| s.to_string()).collect(),
            max_retries: 0,
            timeout: std::time::Duration::from_secs(1),
            fallback: None,
            enabled: true,
            optional: false,
        }
    }

    fn input() -> JsonMap {
        let mut map = JsonMap::new();
        map.insert("query".into(), json!("q"));
        map.insert("operation".into(), json!("add"));
        map.insert("internal_token".into(), json!("x"));
        map
    }

    #[test]
    fn test_empty_allow_passes_all() {
        let filtered = filter_input(&descriptor(&[], &[]), &input()).unwrap();
        assert_eq!(filtered.len(), 3);
    }

    #[test]
    fn test_allow_list_keeps_only_named() {
        let filtered = filter_input(&descriptor(&["query"], &[]), &input()).unwrap();
        assert_eq!(filtered.len(), 1);
        assert!(filtered.contains_key("query"));
    }

    #[test]
    fn test_deny_hit_rejects() {
        let err = filter_input(&descriptor(&[], &["internal_token"]), &input()).unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::InputRejected);
    }

    #[test]
    fn test_deny_wins_over_allow() {
        let err =
            filter_input(&descriptor(&["internal_token"], &["internal_token"]), &input())
                .unwrap_err();
        assert_eq!(err.kind, AgentErrorKind::InputRejected);
    }

    #[test]
    fn test_factory_unknown_binding() {
        let factory = AdapterFactory::new(Arc::new(BuiltinCatalog::default()));
        let mut desc = descriptor(&[], &[]);
        desc.name = "no_such_agent".into();
        assert!(matches!(
            factory.build(&desc),
            Err(AdapterBuildError::UnknownBinding(_))
        ));
    }
}
