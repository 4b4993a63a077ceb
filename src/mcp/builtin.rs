//! Built-in tools, registered when interactive mode is enabled.
//!
//! These are local-only: they answer from (and mutate) the registries
//! directly, or run an ad-hoc relay query, and never touch the executor
//! path.

use std::collections::HashSet;
use std::sync::Arc;

use nostr_sdk::prelude::*;
use regex::Regex;
use serde_json::{json, Value};

use crate::discovery::DiscoveryService;
use crate::error::{Error, Result};
use crate::registry::Registries;
use crate::relay::RelayPool;

const TOOL_LIST_TOOLS: &str = "list_tools";
const TOOL_REMOVE_TOOL: &str = "remove_tool";
const TOOL_DISCOVER: &str = "discover";

pub struct BuiltinTools {
    registries: Arc<Registries>,
    whitelist: HashSet<PublicKey>,
}

impl BuiltinTools {
    pub fn new(registries: Arc<Registries>, whitelist: HashSet<PublicKey>) -> Self {
        Self {
            registries,
            whitelist,
        }
    }

    /// Tool definitions surfaced in `tools/list`.
    pub fn definitions(&self) -> Vec<Value> {
        vec![
            json!({
                "name": TOOL_LIST_TOOLS,
                "description": "List every aggregated tool with its id, provider, and description",
                "inputSchema": { "type": "object", "properties": {} },
            }),
            json!({
                "name": TOOL_REMOVE_TOOL,
                "description": "Remove aggregated tools by id or by regex pattern",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "id": { "type": "string" },
                        "pattern": { "type": "string" },
                    },
                },
            }),
            json!({
                "name": TOOL_DISCOVER,
                "description": "Query a relay for provider announcements, score them against keywords, and optionally integrate the matches",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "relay": { "type": "string" },
                        "keywords": { "type": "array", "items": { "type": "string" } },
                        "integrate": { "type": "boolean" },
                    },
                    "required": ["relay"],
                },
            }),
        ]
    }

    /// Handle a call if `name` is one of ours; `None` lets the endpoint
    /// fall through to the remote executors.
    pub async fn call(&self, name: &str, arguments: &Value) -> Option<Result<Value>> {
        match name {
            TOOL_LIST_TOOLS => Some(self.list_tools()),
            TOOL_REMOVE_TOOL => Some(self.remove_tool(arguments)),
            TOOL_DISCOVER => Some(self.discover(arguments).await),
            _ => None,
        }
    }

    fn list_tools(&self) -> Result<Value> {
        let tools: Vec<Value> = self
            .registries
            .tools
            .list_with_ids()
            .into_iter()
            .map(|(id, entry)| {
                json!({
                    "id": id,
                    "name": entry.capability.name,
                    "description": entry.capability.description,
                    "provider": entry.provider.to_hex(),
                    "serverId": entry.server_id,
                })
            })
            .collect();
        Ok(text_result(&serde_json::to_string_pretty(&tools)?))
    }

    fn remove_tool(&self, arguments: &Value) -> Result<Value> {
        let removed: Vec<String> = if let Some(id) = arguments.get("id").and_then(Value::as_str) {
            if self.registries.tools.remove(id) {
                vec![id.to_string()]
            } else {
                vec![]
            }
        } else if let Some(pattern) = arguments.get("pattern").and_then(Value::as_str) {
            let regex = Regex::new(pattern)
                .map_err(|e| Error::Validation(format!("bad pattern: {e}")))?;
            self.registries.tools.remove_by_pattern(&regex)
        } else {
            return Err(Error::Validation(
                "remove_tool needs an id or a pattern".to_string(),
            ));
        };

        Ok(text_result(&format!(
            "removed {} tool(s): {}",
            removed.len(),
            removed.join(", ")
        )))
    }

    /// Ad-hoc discovery against one relay with keyword scoring.
    async fn discover(&self, arguments: &Value) -> Result<Value> {
        let relay = arguments
            .get("relay")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("discover needs a relay URL".to_string()))?;
        let keywords: Vec<String> = arguments
            .get("keywords")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|s| s.to_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        let integrate = arguments
            .get("integrate")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let pool = Arc::new(RelayPool::new(&[relay.to_string()]).await?);
        pool.connect().await;
        let discovery = DiscoveryService::new(
            pool.clone(),
            self.registries.clone(),
            self.whitelist.clone(),
            None,
        );

        let scored = if integrate {
            discovery.discover().await?;
            self.score_registered(&keywords)
        } else {
            // Peek without touching the shared registries.
            let staging = Arc::new(Registries::new());
            let peek = DiscoveryService::new(
                pool.clone(),
                staging.clone(),
                self.whitelist.clone(),
                None,
            );
            peek.discover().await?;
            score_tools(&staging, &keywords)
        };
        pool.close().await;

        Ok(text_result(&serde_json::to_string_pretty(&json!({
            "relay": relay,
            "integrated": integrate,
            "matches": scored,
        }))?))
    }

    fn score_registered(&self, keywords: &[String]) -> Vec<Value> {
        score_tools(&self.registries, keywords)
    }
}

fn score_tools(registries: &Registries, keywords: &[String]) -> Vec<Value> {
    let mut scored: Vec<(usize, Value)> = registries
        .tools
        .list_with_ids()
        .into_iter()
        .map(|(id, entry)| {
            let haystack = format!(
                "{} {}",
                entry.capability.name.to_lowercase(),
                entry
                    .capability
                    .description
                    .as_deref()
                    .unwrap_or("")
                    .to_lowercase()
            );
            let score = keywords
                .iter()
                .filter(|keyword| haystack.contains(keyword.as_str()))
                .count();
            (
                score,
                json!({
                    "id": id,
                    "name": entry.capability.name,
                    "description": entry.capability.description,
                    "provider": entry.provider.to_hex(),
                    "score": score,
                }),
            )
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, value)| value).collect()
}

fn text_result(text: &str) -> Value {
    json!({ "content": [ { "type": "text", "text": text } ] })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{capability_id, ToolDef};

    fn registries_with_tool(name: &str, description: &str) -> (Arc<Registries>, PublicKey) {
        let registries = Arc::new(Registries::new());
        let pk = Keys::generate().public_key();
        registries.tools.register(
            capability_id(name, &pk),
            ToolDef {
                name: name.to_string(),
                description: Some(description.to_string()),
                input_schema: Value::Null,
            },
            pk,
            None,
        );
        (registries, pk)
    }

    #[tokio::test]
    async fn list_tools_reports_ids() {
        let (registries, pk) = registries_with_tool("echo", "Echo test tool");
        let builtin = BuiltinTools::new(registries, HashSet::new());

        let result = builtin.call(TOOL_LIST_TOOLS, &json!({})).await.unwrap().unwrap();
        let text = result["content"][0]["text"].as_str().unwrap();
        assert!(text.contains(&capability_id("echo", &pk)));
        assert!(text.contains("Echo test tool"));
    }

    #[tokio::test]
    async fn remove_tool_by_pattern() {
        let (registries, _) = registries_with_tool("echo", "Echo test tool");
        let builtin = BuiltinTools::new(registries.clone(), HashSet::new());

        let result = builtin
            .call(TOOL_REMOVE_TOOL, &json!({ "pattern": "^echo" }))
            .await
            .unwrap()
            .unwrap();
        assert!(result["content"][0]["text"]
            .as_str()
            .unwrap()
            .starts_with("removed 1"));
        assert!(registries.tools.is_empty());
    }

    #[tokio::test]
    async fn unknown_tool_falls_through() {
        let (registries, _) = registries_with_tool("echo", "Echo test tool");
        let builtin = BuiltinTools::new(registries, HashSet::new());
        assert!(builtin.call("somebody_else", &json!({})).await.is_none());
    }

    #[test]
    fn scoring_orders_by_keyword_hits() {
        let registries = Arc::new(Registries::new());
        let pk = Keys::generate().public_key();
        for (name, description) in [
            ("weather", "current weather forecast"),
            ("translate", "translate text"),
        ] {
            registries.tools.register(
                capability_id(name, &pk),
                ToolDef {
                    name: name.to_string(),
                    description: Some(description.to_string()),
                    input_schema: Value::Null,
                },
                pk,
                None,
            );
        }
        let scored = score_tools(&registries, &["weather".to_string()]);
        assert_eq!(scored[0]["name"], "weather");
        assert_eq!(scored[0]["score"], 1);
        assert_eq!(scored[1]["score"], 0);
    }
}
