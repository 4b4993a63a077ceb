//! Wire constants and payload types shared by discovery, execution, and the
//! local MCP endpoint.
//!
//! Capability announcements travel as addressable Nostr events (one kind per
//! list), requests and responses as ephemeral events correlated by `e` tag.
//! Content payloads mirror the MCP JSON shapes (camelCase on the wire).

use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Event kinds
// ---------------------------------------------------------------------------

/// Server announcement (addressable, latest per `(pubkey, d)` wins).
pub const KIND_SERVER_ANNOUNCEMENT: Kind = Kind::Custom(31316);

/// Tools list (addressable).
pub const KIND_TOOLS_LIST: Kind = Kind::Custom(31317);

/// Resources list (addressable). Also carries resource-template lists,
/// distinguished by the `d` tag.
pub const KIND_RESOURCES_LIST: Kind = Kind::Custom(31318);

/// Prompts list (addressable).
pub const KIND_PROMPTS_LIST: Kind = Kind::Custom(31319);

/// Capability request (ephemeral).
pub const KIND_REQUEST: Kind = Kind::Custom(25910);

/// Capability response (ephemeral).
pub const KIND_RESPONSE: Kind = Kind::Custom(26910);

/// Out-of-band notification, e.g. payment-required (ephemeral).
pub const KIND_NOTIFICATION: Kind = Kind::Custom(21316);

// ---------------------------------------------------------------------------
// Tag names
// ---------------------------------------------------------------------------

pub const TAG_METHOD: &str = "method";
pub const TAG_SERVER: &str = "s";
pub const TAG_CAPABILITY: &str = "cap";
pub const TAG_STATUS: &str = "status";
pub const TAG_INVOICE: &str = "invoice";
pub const TAG_AMOUNT: &str = "amount";
pub const TAG_ACCEPTED_KIND: &str = "k";
pub const TAG_SUPPORT_ENCRYPTION: &str = "support_encryption";

// ---------------------------------------------------------------------------
// Methods
// ---------------------------------------------------------------------------

pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_NOTIFICATION_INITIALIZED: &str = "notifications/initialized";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";
pub const METHOD_RESOURCES_TEMPLATES_LIST: &str = "resources/templates/list";
pub const METHOD_PROMPTS_LIST: &str = "prompts/list";
pub const METHOD_PROMPTS_GET: &str = "prompts/get";
pub const METHOD_COMPLETION_COMPLETE: &str = "completion/complete";
pub const METHOD_PING: &str = "ping";

/// Notification status value demanding an invoice be paid before the
/// provider continues.
pub const STATUS_PAYMENT_REQUIRED: &str = "payment-required";
pub const STATUS_ERROR: &str = "error";

/// MCP protocol version the gateway speaks to hosts and providers.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ---------------------------------------------------------------------------
// Capability payloads
// ---------------------------------------------------------------------------

/// A tool definition as announced by a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// A concrete resource (fixed URI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDef {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A resource template (`{var}` placeholders in the URI).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplateDef {
    pub uri_template: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A prompt argument descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

/// A prompt definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// Content of a tools-list event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsListPayload {
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

/// Content of a resources-list event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcesListPayload {
    #[serde(default)]
    pub resources: Vec<ResourceDef>,
}

/// Content of a resource-templates-list event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTemplatesListPayload {
    #[serde(default)]
    pub resource_templates: Vec<ResourceTemplateDef>,
}

/// Content of a prompts-list event.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptsListPayload {
    #[serde(default)]
    pub prompts: Vec<PromptDef>,
}

// ---------------------------------------------------------------------------
// Request / response envelopes
// ---------------------------------------------------------------------------

/// Body serialised into the content of a kind-25910 request event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestBody {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl RequestBody {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Stable registry id for a capability: `<name>_<first-4-hex-of-pubkey>`.
///
/// Same-named capabilities from distinct providers coexist under different
/// suffixes; a provider republishing the same name overwrites its own entry.
pub fn capability_id(name: &str, provider: &PublicKey) -> String {
    let hex = provider.to_hex();
    format!("{}_{}", name, &hex[..4])
}

/// First value of the first tag whose name matches, e.g. `tag_value(tags, "e")`.
pub fn tag_value<'a>(tags: &'a [Tag], name: &str) -> Option<&'a str> {
    tags.iter().find_map(|t| {
        let parts = t.as_slice();
        if parts.len() >= 2 && parts[0] == name {
            Some(parts[1].as_str())
        } else {
            None
        }
    })
}

/// True if any tag equals `[name, value]`.
pub fn has_tag(tags: &[Tag], name: &str, value: &str) -> bool {
    tags.iter().any(|t| {
        let parts = t.as_slice();
        parts.len() >= 2 && parts[0] == name && parts[1] == value
    })
}
