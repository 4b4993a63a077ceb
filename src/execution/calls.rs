//! Per-capability execution wrappers.
//!
//! Each wrapper specialises exactly two things over the base executor: how
//! the request params are built and how the response body is interpreted.
//! Provider targeting comes from the registries.

use std::sync::Arc;

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::protocol::{
    METHOD_COMPLETION_COMPLETE, METHOD_PING, METHOD_PROMPTS_GET, METHOD_RESOURCES_READ,
    METHOD_TOOLS_CALL,
};
use crate::registry::Registries;

use super::{ExecutionClient, OutgoingRequest};

/// Reference argument of `completion/complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompletionReference {
    #[serde(rename = "ref/prompt")]
    Prompt { name: String },
    #[serde(rename = "ref/resource")]
    Resource { uri: String },
}

/// Outcome of a ping round-trip. Failures are folded in rather than raised;
/// a ping that cannot complete is itself a meaningful measurement.
#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    pub success: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Executors {
    client: Arc<ExecutionClient>,
    registries: Arc<Registries>,
}

impl Executors {
    pub fn new(client: Arc<ExecutionClient>, registries: Arc<Registries>) -> Self {
        Self { client, registries }
    }

    pub fn client(&self) -> &Arc<ExecutionClient> {
        &self.client
    }

    /// Invoke a tool by its registry id. The provider sees the original
    /// tool name, not the suffixed id.
    pub async fn call_tool(&self, id: &str, arguments: Value) -> Result<Value> {
        let entry = self
            .registries
            .tools
            .get_info(id)
            .ok_or_else(|| Error::UnknownCapability(id.to_string()))?;
        let params = json!({ "name": entry.capability.name, "arguments": arguments });
        let outcome = self
            .client
            .execute(
                OutgoingRequest::new(METHOD_TOOLS_CALL, params, entry.provider)
                    .server(entry.server_id),
            )
            .await?;
        Ok(outcome.body)
    }

    /// Read a resource by URI. Concrete registrations win; otherwise the
    /// URI is matched against templates by placeholder-stripped prefix.
    pub async fn read_resource(&self, uri: &str, arguments: Option<Value>) -> Result<Value> {
        let (provider, server_id) = self
            .resolve_resource_target(uri)
            .ok_or_else(|| Error::UnknownCapability(uri.to_string()))?;
        let mut params = json!({ "uri": uri });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        let outcome = self
            .client
            .execute(OutgoingRequest::new(METHOD_RESOURCES_READ, params, provider).server(server_id))
            .await?;
        Ok(outcome.body)
    }

    pub async fn get_prompt(&self, id: &str, arguments: Value) -> Result<Value> {
        let entry = self
            .registries
            .prompts
            .get_info(id)
            .ok_or_else(|| Error::UnknownCapability(id.to_string()))?;
        let params = json!({ "name": entry.capability.name, "arguments": arguments });
        let outcome = self
            .client
            .execute(
                OutgoingRequest::new(METHOD_PROMPTS_GET, params, entry.provider)
                    .server(entry.server_id),
            )
            .await?;
        Ok(outcome.body)
    }

    /// Argument completion against the provider owning the referenced
    /// prompt or resource. Rejected when the target server has not
    /// announced the completions capability.
    pub async fn complete(
        &self,
        reference: CompletionReference,
        argument: Value,
    ) -> Result<Value> {
        // Prompt references arrive under the registry id; the provider only
        // knows the name it announced, so rewrite before sending.
        let (provider, server_id, reference) = match reference {
            CompletionReference::Prompt { name } => {
                let entry = self
                    .registries
                    .prompts
                    .get_info(&name)
                    .ok_or_else(|| Error::UnknownCapability(name.clone()))?;
                (
                    entry.provider,
                    entry.server_id,
                    CompletionReference::Prompt {
                        name: entry.capability.name,
                    },
                )
            }
            CompletionReference::Resource { uri } => {
                let (provider, server_id) = self
                    .resolve_resource_target(&uri)
                    .ok_or_else(|| Error::UnknownCapability(uri.clone()))?;
                (provider, server_id, CompletionReference::Resource { uri })
            }
        };

        let server_id = match server_id {
            Some(id) => Some(id),
            None => self
                .registries
                .servers
                .get_by_provider(&provider)
                .map(|s| s.server_id),
        };
        let supports = server_id
            .as_deref()
            .map(|id| self.registries.servers.supports_completions(id))
            .unwrap_or(false);
        if !supports {
            return Err(Error::Execution(
                "target server does not support completions".to_string(),
            ));
        }

        let params = json!({ "ref": reference, "argument": argument });
        let outcome = self
            .client
            .execute(
                OutgoingRequest::new(METHOD_COMPLETION_COMPLETE, params, provider)
                    .server(server_id),
            )
            .await?;
        Ok(outcome.body)
    }

    /// Round-trip a ping to a provider. Every completion is timed,
    /// including failures.
    pub async fn ping(&self, provider: PublicKey, server_id: Option<String>) -> PingResult {
        let started = std::time::Instant::now();
        let result = self
            .client
            .execute(OutgoingRequest::new(METHOD_PING, json!({}), provider).server(server_id))
            .await;
        match result {
            Ok(outcome) => PingResult {
                success: true,
                response_time_ms: outcome.elapsed.as_millis() as u64,
                error: None,
            },
            Err(e) => PingResult {
                success: false,
                response_time_ms: started.elapsed().as_millis() as u64,
                error: Some(e.to_string()),
            },
        }
    }

    fn resolve_resource_target(&self, uri: &str) -> Option<(PublicKey, Option<String>)> {
        for (_, entry) in self.registries.resources.list_with_ids() {
            if entry.capability.uri == uri {
                return Some((entry.provider, entry.server_id));
            }
        }
        for (_, entry) in self.registries.resource_templates.list_with_ids() {
            let prefix = template_prefix(&entry.capability.uri_template);
            if !prefix.is_empty() && uri.starts_with(&prefix) {
                return Some((entry.provider, entry.server_id));
            }
        }
        None
    }
}

/// The literal prefix of a URI template, up to its first `{var}`
/// placeholder.
fn template_prefix(template: &str) -> &str {
    match template.find('{') {
        Some(index) => &template[..index],
        None => template,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_prefix_strips_placeholders() {
        assert_eq!(
            template_prefix("file:///logs/{date}.log"),
            "file:///logs/"
        );
        assert_eq!(template_prefix("plain://fixed"), "plain://fixed");
        assert_eq!(template_prefix("{all}"), "");
    }

    #[test]
    fn completion_reference_serialises_with_type_tag() {
        let reference = CompletionReference::Prompt {
            name: "greet_ab12".to_string(),
        };
        let json = serde_json::to_value(&reference).unwrap();
        assert_eq!(json["type"], "ref/prompt");
        assert_eq!(json["name"], "greet_ab12");

        let parsed: CompletionReference =
            serde_json::from_value(json!({"type": "ref/resource", "uri": "file:///x"})).unwrap();
        assert!(matches!(parsed, CompletionReference::Resource { .. }));
    }
}
