//! Private server handshake.
//!
//! Servers configured under `discovery.privateServers` are not picked up
//! from public announcements; instead the gateway initiates an MCP
//! `initialize` exchange with each one, negotiates encryption, and fetches
//! its capability lists directly. Each server's handshake is independent; a
//! timeout collapses that server only.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use nostr_sdk::prelude::*;
use serde_json::{json, Value};

use crate::crypto::{EncryptionEngine, EncryptionMode};
use crate::error::{Error, Result};
use crate::execution::{ExecutionClient, OutgoingRequest};
use crate::protocol::{
    tag_value, METHOD_INITIALIZE, METHOD_NOTIFICATION_INITIALIZED, METHOD_PROMPTS_LIST,
    METHOD_RESOURCES_LIST, METHOD_TOOLS_LIST, PROTOCOL_VERSION, TAG_METHOD, TAG_SERVER,
    TAG_SUPPORT_ENCRYPTION,
};
use crate::publisher::{EventPublisher, PublishOptions};
use crate::registry::Registries;

use super::{register_prompts, register_resources, register_tools};

/// Bound on each handshake step (initialize, every list fetch).
pub const HANDSHAKE_STEP_TIMEOUT: Duration = Duration::from_secs(2);

/// A private server to handshake with.
#[derive(Debug, Clone)]
pub struct PrivateServer {
    pub provider: PublicKey,
    pub server_id: Option<String>,
    pub supports_encryption: Option<bool>,
}

/// Result of one server's handshake, for logging and tests.
#[derive(Debug)]
pub struct HandshakeOutcome {
    pub provider: PublicKey,
    pub server_id: Option<String>,
    pub result: Result<()>,
}

pub struct Handshake {
    client: Arc<ExecutionClient>,
    publisher: Arc<EventPublisher>,
    registries: Arc<Registries>,
    crypto: Arc<EncryptionEngine>,
    client_name: String,
    client_version: String,
}

impl Handshake {
    pub fn new(
        client: Arc<ExecutionClient>,
        publisher: Arc<EventPublisher>,
        registries: Arc<Registries>,
        crypto: Arc<EncryptionEngine>,
        client_name: String,
        client_version: String,
    ) -> Self {
        Self {
            client,
            publisher,
            registries,
            crypto,
            client_name,
            client_version,
        }
    }

    /// Handshake with every configured server concurrently. A failed
    /// sibling never aborts the others.
    pub async fn run_all(&self, servers: &[PrivateServer]) -> Vec<HandshakeOutcome> {
        let outcomes = join_all(servers.iter().map(|server| async {
            let result = self.run_one(server).await;
            if let Err(e) = &result {
                log::warn!("handshake with {} failed: {e}", server.provider);
            }
            HandshakeOutcome {
                provider: server.provider,
                server_id: server.server_id.clone(),
                result,
            }
        }))
        .await;
        outcomes
    }

    async fn run_one(&self, server: &PrivateServer) -> Result<()> {
        // Initialize, possibly falling back from encrypted to plaintext.
        let (init_body, init_response, used_encryption) = self.initialize(server).await?;

        let server_id = match &server.server_id {
            Some(id) => id.clone(),
            None => tag_value(&init_response.tags, "d")
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Protocol("initialize response carries no server id".to_string())
                })?,
        };
        let supports_encryption = match tag_value(&init_response.tags, TAG_SUPPORT_ENCRYPTION) {
            Some(value) => value == "true",
            None => used_encryption,
        };

        self.registries.servers.register(
            server_id.clone(),
            server.provider,
            init_body,
            supports_encryption,
            Timestamp::now(),
        );

        self.send_initialized(server, &server_id, supports_encryption && used_encryption)
            .await?;

        // Fetch the capability lists concurrently, each with its own
        // correlation id and the negotiated encryption setting.
        let encryption_override = Some(supports_encryption);
        let (tools, resources, prompts) = tokio::join!(
            self.fetch_list(server, &server_id, METHOD_TOOLS_LIST, encryption_override),
            self.fetch_list(server, &server_id, METHOD_RESOURCES_LIST, encryption_override),
            self.fetch_list(server, &server_id, METHOD_PROMPTS_LIST, encryption_override),
        );

        match tools {
            Ok(body) => {
                register_tools(
                    &self.registries,
                    server.provider,
                    &server_id,
                    serde_json::from_value(body)?,
                );
            }
            Err(e) => log::warn!("tools/list from {server_id} failed: {e}"),
        }
        match resources {
            Ok(body) => {
                register_resources(
                    &self.registries,
                    server.provider,
                    &server_id,
                    serde_json::from_value(body)?,
                );
            }
            Err(e) => log::warn!("resources/list from {server_id} failed: {e}"),
        }
        match prompts {
            Ok(body) => {
                register_prompts(
                    &self.registries,
                    server.provider,
                    &server_id,
                    serde_json::from_value(body)?,
                );
            }
            Err(e) => log::warn!("prompts/list from {server_id} failed: {e}"),
        }

        log::info!("handshake with {server_id} complete");
        Ok(())
    }

    /// Step 1–3: send `initialize` and await the result. In `Optional`
    /// mode an unanswered encrypted attempt is retried plaintext; in
    /// `Required` mode there is no fallback.
    async fn initialize(
        &self,
        server: &PrivateServer,
    ) -> Result<(Value, crate::execution::ResponseEvent, bool)> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": self.client_name, "version": self.client_version },
        });

        let attempt = |encrypted: bool| {
            let request =
                OutgoingRequest::new(METHOD_INITIALIZE, params.clone(), server.provider)
                    .server(server.server_id.clone())
                    .timeout(HANDSHAKE_STEP_TIMEOUT)
                    .encryption_override(Some(encrypted))
                    .force_plaintext(!encrypted);
            self.client.execute(request)
        };

        match self.crypto.mode() {
            EncryptionMode::Disabled => {
                let outcome = attempt(false).await?;
                Ok((outcome.body, outcome.response, false))
            }
            EncryptionMode::Required => {
                if server.supports_encryption == Some(false) {
                    return Err(Error::EncryptionUnsupported);
                }
                let outcome = attempt(true).await?;
                Ok((outcome.body, outcome.response, true))
            }
            EncryptionMode::Optional => {
                let try_encrypted = server.supports_encryption.unwrap_or(true);
                if try_encrypted {
                    match attempt(true).await {
                        Ok(outcome) => return Ok((outcome.body, outcome.response, true)),
                        Err(Error::ExecutionTimeout) => {
                            log::debug!(
                                "encrypted initialize to {} unanswered, retrying plaintext",
                                server.provider
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
                let outcome = attempt(false).await?;
                Ok((outcome.body, outcome.response, false))
            }
        }
    }

    /// Step 4: fire the `notifications/initialized` event.
    async fn send_initialized(
        &self,
        server: &PrivateServer,
        server_id: &str,
        encrypted: bool,
    ) -> Result<()> {
        let content = json!({ "method": METHOD_NOTIFICATION_INITIALIZED });
        let template = EventBuilder::new(
            crate::protocol::KIND_NOTIFICATION,
            serde_json::to_string(&content)?,
        )
        .tags(vec![
            Tag::public_key(server.provider),
            Tag::custom(
                TagKind::custom(TAG_METHOD),
                vec![METHOD_NOTIFICATION_INITIALIZED.to_string()],
            ),
            Tag::custom(TagKind::custom(TAG_SERVER), vec![server_id.to_string()]),
        ])
        .build(self.publisher_pubkey());

        self.publisher
            .publish(
                template,
                PublishOptions {
                    encrypt: encrypted,
                    recipient: Some(server.provider),
                },
            )
            .await?;
        Ok(())
    }

    async fn fetch_list(
        &self,
        server: &PrivateServer,
        server_id: &str,
        method: &str,
        encryption_override: Option<bool>,
    ) -> Result<Value> {
        let request = OutgoingRequest::new(method, json!({}), server.provider)
            .server(Some(server_id.to_string()))
            .timeout(HANDSHAKE_STEP_TIMEOUT)
            .encryption_override(encryption_override)
            .force_plaintext(encryption_override == Some(false));
        let outcome = self.client.execute(request).await?;
        Ok(outcome.body)
    }

    fn publisher_pubkey(&self) -> PublicKey {
        self.client.public_key()
    }
}
