//! Test fixtures: announcement builders and a scripted in-process provider
//! that answers capability requests over a relay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::crypto::{EncryptionEngine, EncryptionMode};
use crate::error::{Error, Result};
use crate::payment::InvoicePayer;
use crate::protocol::{
    tag_value, RequestBody, KIND_NOTIFICATION, KIND_REQUEST, KIND_RESPONSE,
    KIND_SERVER_ANNOUNCEMENT, KIND_TOOLS_LIST, METHOD_COMPLETION_COMPLETE, METHOD_INITIALIZE,
    METHOD_PING, METHOD_PROMPTS_GET, METHOD_PROMPTS_LIST, METHOD_RESOURCES_LIST,
    METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST, PROTOCOL_VERSION, STATUS_ERROR,
    TAG_INVOICE, TAG_STATUS, TAG_SUPPORT_ENCRYPTION,
};

/// Scenario tool used across the test suite.
pub fn echo_tool_json() -> Value {
    json!({
        "name": "test-echo",
        "description": "Echo test tool",
        "inputSchema": {
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"],
        },
    })
}

/// Build a signed server announcement (kind 31316).
pub fn server_announcement_event(
    keys: &Keys,
    server_id: &str,
    supports_encryption: bool,
) -> Event {
    let content = json!({
        "protocolVersion": PROTOCOL_VERSION,
        "serverInfo": { "name": server_id, "version": "1.0.0" },
        "capabilities": {
            "tools": { "listChanged": true },
            "completions": {},
        },
    });
    let mut tags = vec![Tag::identifier(server_id)];
    if supports_encryption {
        tags.push(
            Tag::parse([TAG_SUPPORT_ENCRYPTION, "true"]).expect("static tag"),
        );
    }
    EventBuilder::new(KIND_SERVER_ANNOUNCEMENT, content.to_string())
        .tags(tags)
        .sign_with_keys(keys)
        .expect("sign announcement")
}

/// Build a signed tools list (kind 31317) referencing `server_id`.
pub fn tools_list_event(keys: &Keys, server_id: &str, tools: Vec<Value>) -> Event {
    let content = json!({ "tools": tools });
    EventBuilder::new(KIND_TOOLS_LIST, content.to_string())
        .tags(vec![
            Tag::identifier(format!("{server_id}/tools/list")),
            Tag::parse(["s", server_id]).expect("static tag"),
        ])
        .sign_with_keys(keys)
        .expect("sign tools list")
}

/// Build a signed resources or resource-templates list (kind 31318).
pub fn resources_list_event(
    keys: &Keys,
    server_id: &str,
    content: Value,
    templates: bool,
) -> Event {
    let d_tag = if templates {
        format!("{server_id}/resources/templates/list")
    } else {
        format!("{server_id}/resources/list")
    };
    EventBuilder::new(crate::protocol::KIND_RESOURCES_LIST, content.to_string())
        .tags(vec![
            Tag::identifier(d_tag),
            Tag::parse(["s", server_id]).expect("static tag"),
        ])
        .sign_with_keys(keys)
        .expect("sign resources list")
}

/// Build a signed prompts list (kind 31319).
pub fn prompts_list_event(keys: &Keys, server_id: &str, prompts: Vec<Value>) -> Event {
    EventBuilder::new(crate::protocol::KIND_PROMPTS_LIST, json!({ "prompts": prompts }).to_string())
        .tags(vec![
            Tag::identifier(format!("{server_id}/prompts/list")),
            Tag::parse(["s", server_id]).expect("static tag"),
        ])
        .sign_with_keys(keys)
        .expect("sign prompts list")
}

/// An [`InvoicePayer`] that counts invocations instead of paying.
#[derive(Default)]
pub struct CountingPayer {
    calls: AtomicUsize,
    pub fail: bool,
}

impl CountingPayer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            fail: true,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InvoicePayer for CountingPayer {
    async fn pay(&self, _invoice: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(Error::Payment("test payer refuses".to_string()))
        } else {
            Ok("preimage".to_string())
        }
    }
}

/// How the scripted provider behaves.
#[derive(Debug, Clone)]
pub struct ProviderBehavior {
    pub server_id: String,
    /// Mirror-encrypt replies to encrypted requests.
    pub supports_encryption: bool,
    /// Demand this invoice before answering a tool call.
    pub payment_invoice: Option<String>,
    /// Answer tool calls with an error notification instead of a result.
    pub notify_error: bool,
    /// Never answer anything (timeout scenarios).
    pub silent: bool,
    /// Delay before each reply.
    pub response_delay: Duration,
}

impl Default for ProviderBehavior {
    fn default() -> Self {
        Self {
            server_id: "srv1".to_string(),
            supports_encryption: false,
            payment_invoice: None,
            notify_error: false,
            silent: false,
            response_delay: Duration::ZERO,
        }
    }
}

/// A scripted provider answering requests on one relay. Stops when
/// dropped or aborted.
pub struct TestProvider {
    pub keys: Keys,
    handle: JoinHandle<()>,
}

impl TestProvider {
    pub async fn spawn(relay_url: &str, keys: Keys, behavior: ProviderBehavior) -> Self {
        let client = Client::new(keys.clone());
        client.add_relay(relay_url).await.expect("add relay");
        client.connect().await;

        let filter = Filter::new()
            .kinds([KIND_REQUEST, Kind::GiftWrap])
            .since(Timestamp::now());
        client
            .subscribe(vec![filter], None)
            .await
            .expect("subscribe");

        let task_keys = keys.clone();
        let handle = tokio::spawn(async move {
            run_provider(client, task_keys, behavior).await;
        });

        Self { keys, handle }
    }

    pub fn stop(self) {
        self.handle.abort();
    }
}

impl Drop for TestProvider {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run_provider(client: Client, keys: Keys, behavior: ProviderBehavior) {
    let crypto = EncryptionEngine::new(EncryptionMode::Optional);
    let mut notifications = client.notifications();

    while let Ok(notification) = notifications.recv().await {
        let RelayPoolNotification::Event { event, .. } = notification else {
            continue;
        };

        // A provider without encryption support cannot unwrap gift wraps.
        if event.kind == Kind::GiftWrap && !behavior.supports_encryption {
            continue;
        }

        let (request_id, sender, body, encrypted) = match classify(&crypto, &keys, &event) {
            Some(parts) => parts,
            None => continue,
        };
        if behavior.silent {
            continue;
        }
        if behavior.response_delay > Duration::ZERO {
            tokio::time::sleep(behavior.response_delay).await;
        }

        if behavior.notify_error && body.method == METHOD_TOOLS_CALL {
            let tags = vec![
                Tag::event(request_id),
                Tag::public_key(sender),
                Tag::parse([TAG_STATUS, STATUS_ERROR]).expect("static tag"),
            ];
            send_reply(
                &client,
                &crypto,
                &keys,
                sender,
                encrypted && behavior.supports_encryption,
                KIND_NOTIFICATION,
                tags,
                json!({ "error": "provider exploded" }),
            )
            .await;
            continue;
        }

        if behavior.payment_invoice.is_some() && body.method == METHOD_TOOLS_CALL {
            let invoice = behavior.payment_invoice.clone().unwrap_or_default();
            let notification_tags = vec![
                Tag::event(request_id),
                Tag::public_key(sender),
                Tag::parse([TAG_STATUS, "payment-required"]).expect("static tag"),
                Tag::parse([TAG_INVOICE, invoice.as_str()]).expect("invoice tag"),
            ];
            send_reply(
                &client,
                &crypto,
                &keys,
                sender,
                encrypted && behavior.supports_encryption,
                KIND_NOTIFICATION,
                notification_tags,
                json!({ "status": "payment-required" }),
            )
            .await;
            // Pretend the payment settles, then deliver the real result.
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let Some(result) = respond_to(&body, &behavior) else {
            continue;
        };
        let mut tags = vec![Tag::event(request_id), Tag::public_key(sender)];
        // Initialize replies carry the server identity and, when the
        // provider is capable, the encryption flag.
        if body.method == METHOD_INITIALIZE {
            tags.push(Tag::identifier(behavior.server_id.clone()));
            if behavior.supports_encryption {
                tags.push(Tag::parse([TAG_SUPPORT_ENCRYPTION, "true"]).expect("static tag"));
            }
        }
        send_reply(
            &client,
            &crypto,
            &keys,
            sender,
            encrypted && behavior.supports_encryption,
            KIND_RESPONSE,
            tags,
            result,
        )
        .await;
    }
}

/// Extract `(request_id, sender, body, was_encrypted)` from a candidate
/// request event, transparently unwrapping gift wraps.
fn classify(
    crypto: &EncryptionEngine,
    keys: &Keys,
    event: &Event,
) -> Option<(EventId, PublicKey, RequestBody, bool)> {
    if event.kind == Kind::GiftWrap {
        let unwrapped = crypto.unwrap(keys, event)?;
        if unwrapped.inner.kind != KIND_REQUEST {
            return None;
        }
        let body: RequestBody = serde_json::from_str(&unwrapped.inner.content).ok()?;
        let id = unwrapped.inner.id?;
        return Some((id, unwrapped.sender, body, true));
    }
    if event.kind != KIND_REQUEST {
        return None;
    }
    let body: RequestBody = serde_json::from_str(&event.content).ok()?;
    Some((event.id, event.pubkey, body, false))
}

fn respond_to(body: &RequestBody, behavior: &ProviderBehavior) -> Option<Value> {
    match body.method.as_str() {
        METHOD_INITIALIZE => Some(json!({
            "protocolVersion": PROTOCOL_VERSION,
            "serverInfo": { "name": behavior.server_id, "version": "1.0.0" },
            "capabilities": { "tools": { "listChanged": true }, "completions": {} },
        })),
        METHOD_TOOLS_LIST => Some(json!({ "tools": [echo_tool_json()] })),
        METHOD_RESOURCES_LIST => Some(json!({ "resources": [] })),
        METHOD_PROMPTS_LIST => Some(json!({ "prompts": [] })),
        METHOD_PING => Some(json!({})),
        METHOD_RESOURCES_READ => {
            let uri = body.params.get("uri").and_then(Value::as_str)?;
            Some(json!({
                "contents": [
                    { "uri": uri, "mimeType": "text/plain", "text": format!("contents of {uri}") }
                ],
            }))
        }
        METHOD_PROMPTS_GET => {
            let name = body.params.get("name").and_then(Value::as_str)?;
            Some(json!({
                "description": format!("prompt {name}"),
                "messages": [
                    { "role": "user", "content": { "type": "text", "text": format!("run {name}") } }
                ],
            }))
        }
        METHOD_COMPLETION_COMPLETE => {
            // Completions derive from the referenced name, so tests can
            // assert what actually crossed the wire.
            let target = body.params["ref"]
                .get("name")
                .or_else(|| body.params["ref"].get("uri"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(json!({
                "completion": {
                    "values": [format!("{target}-alpha"), format!("{target}-beta")],
                    "total": 2,
                    "hasMore": false,
                },
            }))
        }
        METHOD_TOOLS_CALL => {
            let name = body.params.get("name").and_then(Value::as_str)?;
            if name != "test-echo" {
                return Some(json!({
                    "content": [ { "type": "text", "text": format!("unknown tool: {name}") } ],
                    "isError": true,
                }));
            }
            let text = body.params["arguments"]
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            Some(json!({
                "content": [ { "type": "text", "text": format!("[test] {text}") } ],
            }))
        }
        _ => None,
    }
}

#[allow(clippy::too_many_arguments)]
async fn send_reply(
    client: &Client,
    crypto: &EncryptionEngine,
    keys: &Keys,
    recipient: PublicKey,
    encrypted: bool,
    kind: Kind,
    tags: Vec<Tag>,
    content: Value,
) {
    let template = EventBuilder::new(kind, content.to_string())
        .tags(tags)
        .build(keys.public_key());

    let result = if encrypted {
        match crypto.wrap(keys, &recipient, template) {
            Ok(wrapped) => client.send_event(wrapped).await.map(|_| ()),
            Err(e) => {
                log::error!("test provider wrap failed: {e}");
                return;
            }
        }
    } else {
        match template.sign_with_keys(keys) {
            Ok(event) => client.send_event(event).await.map(|_| ()),
            Err(e) => {
                log::error!("test provider signing failed: {e}");
                return;
            }
        }
    };
    if let Err(e) = result {
        log::error!("test provider reply failed: {e}");
    }
}

/// Extract the `e` tag target of an event, for wire-level assertions.
pub fn correlated_request(event: &Event) -> Option<String> {
    let tags: Vec<Tag> = event.tags.iter().cloned().collect();
    tag_value(&tags, "e").map(str::to_string)
}
