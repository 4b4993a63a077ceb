//! The JSON-RPC server surface spoken to a single host application.
//!
//! Every aggregated capability is listed from registry snapshots; calls are
//! routed to the matching executor. Executor failures on tool calls come
//! back as `isError` tool results with a text description, so hosts see
//! tool errors rather than transport faults. Registry mutations stream out
//! as `list_changed` notifications.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::execution::{CompletionReference, Executors};
use crate::protocol::{
    METHOD_COMPLETION_COMPLETE, METHOD_INITIALIZE, METHOD_NOTIFICATION_INITIALIZED, METHOD_PING,
    METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ,
    METHOD_RESOURCES_TEMPLATES_LIST, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION,
};
use crate::registry::{Registries, RegistryEvent, RegistryKind};

use super::BuiltinTools;

/// How the endpoint identifies itself to hosts.
#[derive(Debug, Clone)]
pub struct EndpointInfo {
    pub name: String,
    pub version: String,
    pub about: String,
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
}

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const INTERNAL_ERROR: i64 = -32603;
const PARSE_ERROR: i64 = -32700;

pub struct McpEndpoint {
    info: EndpointInfo,
    registries: Arc<Registries>,
    executors: Arc<Executors>,
    builtin: Option<BuiltinTools>,
}

impl McpEndpoint {
    pub fn new(
        info: EndpointInfo,
        registries: Arc<Registries>,
        executors: Arc<Executors>,
        builtin: Option<BuiltinTools>,
    ) -> Self {
        Self {
            info,
            registries,
            executors,
            builtin,
        }
    }

    /// Serve a single host over the given byte stream until EOF.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        let mut registry_rx = self.registries.subscribe();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.map_err(|e| Error::Endpoint(format!("read: {e}")))?;
                    let Some(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    if let Some(frame) = self.handle_line(&line).await {
                        write_frame(&mut writer, &frame).await?;
                    }
                }
                event = registry_rx.recv() => match event {
                    Ok(event) => {
                        if let Some(frame) = notification_frame(event) {
                            write_frame(&mut writer, &frame).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        Ok(())
    }

    async fn handle_line(&self, line: &str) -> Option<String> {
        let request: RpcRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                return Some(error_frame(
                    Value::Null,
                    PARSE_ERROR,
                    &format!("unparseable frame: {e}"),
                ));
            }
        };

        // Host-to-gateway notifications get no reply.
        let Some(id) = request.id else {
            if request.method != METHOD_NOTIFICATION_INITIALIZED {
                log::debug!("ignoring host notification {}", request.method);
            }
            return None;
        };

        match self.dispatch(&request.method, request.params).await {
            Ok(result) => Some(result_frame(id, result)),
            Err((code, message)) => Some(error_frame(id, code, &message)),
        }
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, (i64, String)> {
        match method {
            METHOD_INITIALIZE => Ok(self.initialize_result()),
            METHOD_TOOLS_LIST => Ok(json!({ "tools": self.list_tools() })),
            METHOD_TOOLS_CALL => self.call_tool(params).await,
            METHOD_RESOURCES_LIST => {
                let resources: Vec<Value> = self
                    .registries
                    .resources
                    .list_with_ids()
                    .into_iter()
                    .map(|(_, entry)| serde_json::to_value(entry.capability).unwrap_or_default())
                    .collect();
                Ok(json!({ "resources": resources }))
            }
            METHOD_RESOURCES_TEMPLATES_LIST => {
                let templates: Vec<Value> = self
                    .registries
                    .resource_templates
                    .list_with_ids()
                    .into_iter()
                    .map(|(_, entry)| serde_json::to_value(entry.capability).unwrap_or_default())
                    .collect();
                Ok(json!({ "resourceTemplates": templates }))
            }
            METHOD_RESOURCES_READ => {
                let uri = params
                    .get("uri")
                    .and_then(Value::as_str)
                    .ok_or((INVALID_PARAMS, "missing uri".to_string()))?;
                let arguments = params.get("arguments").cloned();
                self.executors
                    .read_resource(uri, arguments)
                    .await
                    .map_err(internal)
            }
            METHOD_PROMPTS_LIST => {
                let prompts: Vec<Value> = self
                    .registries
                    .prompts
                    .list_with_ids()
                    .into_iter()
                    .map(|(id, entry)| {
                        let mut value =
                            serde_json::to_value(entry.capability).unwrap_or_default();
                        value["name"] = Value::String(id);
                        value
                    })
                    .collect();
                Ok(json!({ "prompts": prompts }))
            }
            METHOD_PROMPTS_GET => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or((INVALID_PARAMS, "missing name".to_string()))?;
                let arguments = params.get("arguments").cloned().unwrap_or(json!({}));
                self.executors
                    .get_prompt(name, arguments)
                    .await
                    .map_err(internal)
            }
            METHOD_COMPLETION_COMPLETE => {
                let reference: CompletionReference =
                    serde_json::from_value(params.get("ref").cloned().unwrap_or_default())
                        .map_err(|e| (INVALID_PARAMS, format!("bad ref: {e}")))?;
                let argument = params.get("argument").cloned().unwrap_or(json!({}));
                self.executors
                    .complete(reference, argument)
                    .await
                    .map_err(internal)
            }
            METHOD_PING => self.ping(params).await,
            other => Err((METHOD_NOT_FOUND, format!("unknown method: {other}"))),
        }
    }

    fn initialize_result(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": true },
                "resources": { "listChanged": true },
                "prompts": { "listChanged": true },
                "completions": {},
            },
            "serverInfo": { "name": self.info.name, "version": self.info.version },
            "instructions": self.info.about,
        })
    }

    /// Aggregated tools, listed under their registry ids so same-named
    /// tools from different providers stay distinct.
    fn list_tools(&self) -> Vec<Value> {
        let mut tools: Vec<Value> = self
            .builtin
            .as_ref()
            .map(BuiltinTools::definitions)
            .unwrap_or_default();
        for (id, entry) in self.registries.tools.list_with_ids() {
            tools.push(json!({
                "name": id,
                "description": entry.capability.description,
                "inputSchema": entry.capability.input_schema,
            }));
        }
        tools
    }

    async fn call_tool(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or((INVALID_PARAMS, "missing name".to_string()))?;
        let arguments = params.get("arguments").cloned().unwrap_or(json!({}));

        if let Some(builtin) = &self.builtin {
            if let Some(result) = builtin.call(name, &arguments).await {
                return Ok(match result {
                    Ok(value) => value,
                    Err(e) => tool_error_result(&e.to_string()),
                });
            }
        }

        match self.executors.call_tool(name, arguments).await {
            Ok(body) => Ok(body),
            // Executor failures surface as tool errors, not protocol faults.
            Err(e) => Ok(tool_error_result(&e.to_string())),
        }
    }

    async fn ping(&self, params: Value) -> std::result::Result<Value, (i64, String)> {
        let server_id = params.get("serverId").and_then(Value::as_str);
        let Some(server_id) = server_id else {
            // Host-level liveness probe; nothing to forward.
            return Ok(json!({}));
        };
        let info = self
            .registries
            .servers
            .get(server_id)
            .ok_or((INVALID_PARAMS, format!("unknown server: {server_id}")))?;
        let result = self
            .executors
            .ping(info.provider, Some(server_id.to_string()))
            .await;
        serde_json::to_value(result).map_err(|e| (INTERNAL_ERROR, e.to_string()))
    }
}

fn internal(e: Error) -> (i64, String) {
    (INTERNAL_ERROR, e.to_string())
}

fn tool_error_result(message: &str) -> Value {
    json!({
        "content": [ { "type": "text", "text": message } ],
        "isError": true,
    })
}

fn result_frame(id: Value, result: Value) -> String {
    json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string()
}

fn error_frame(id: Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": RpcError { code, message: message.to_string() },
    })
    .to_string()
}

fn notification_frame(event: RegistryEvent) -> Option<String> {
    let RegistryEvent::ListChanged(kind) = event;
    let method = match kind {
        RegistryKind::Tools => "notifications/tools/list_changed",
        RegistryKind::Resources | RegistryKind::ResourceTemplates => {
            "notifications/resources/list_changed"
        }
        RegistryKind::Prompts => "notifications/prompts/list_changed",
        RegistryKind::Servers => return None,
    };
    Some(json!({ "jsonrpc": "2.0", "method": method }).to_string())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &str) -> Result<()> {
    writer
        .write_all(frame.as_bytes())
        .await
        .map_err(|e| Error::Endpoint(format!("write: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| Error::Endpoint(format!("write: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::Endpoint(format!("flush: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_frames_map_registry_kinds() {
        let frame = notification_frame(RegistryEvent::ListChanged(RegistryKind::Tools)).unwrap();
        assert!(frame.contains("notifications/tools/list_changed"));
        let frame =
            notification_frame(RegistryEvent::ListChanged(RegistryKind::ResourceTemplates))
                .unwrap();
        assert!(frame.contains("notifications/resources/list_changed"));
        assert!(notification_frame(RegistryEvent::ListChanged(RegistryKind::Servers)).is_none());
    }

    #[test]
    fn tool_error_results_are_not_faults() {
        let result = tool_error_result("execution timed out");
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["type"], "text");
        assert_eq!(result["content"][0]["text"], "execution timed out");
    }
}
