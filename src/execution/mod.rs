//! Remote execution: correlates a signed request to its response over the
//! relay substrate, with transparent decryption, a single wall-clock
//! timeout, payment retries, and idempotent cleanup.

mod calls;

pub use calls::{CompletionReference, Executors, PingResult};

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nostr_sdk::prelude::*;
use serde_json::Value;

use crate::crypto::EncryptionEngine;
use crate::crypto::EncryptionMode;
use crate::error::{Error, Result};
use crate::keys::KeyManager;
use crate::payment::InvoicePayer;
use crate::protocol::{
    tag_value, RequestBody, KIND_NOTIFICATION, KIND_REQUEST, KIND_RESPONSE, STATUS_ERROR,
    STATUS_PAYMENT_REQUIRED, TAG_INVOICE, TAG_METHOD, TAG_SERVER, TAG_STATUS,
};
use crate::registry::Registries;
use crate::relay::{PoolSubscription, RelayPool, SubscriptionItem};

/// Wall-clock bound for one remote invocation. Payment notifications do not
/// reset it.
pub const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// One remote invocation to build, send, and await.
#[derive(Debug, Clone)]
pub struct OutgoingRequest {
    pub method: String,
    pub params: Value,
    pub provider: PublicKey,
    pub server_id: Option<String>,
    pub timeout: Duration,
    /// Skip the wrapped path even when policy would allow it (used for the
    /// plaintext retry after an unanswered encrypted handshake attempt).
    pub force_plaintext: bool,
    /// Caller knowledge of the target's encryption support, overriding the
    /// server registry (private servers configured ahead of discovery).
    pub encryption_override: Option<bool>,
}

impl OutgoingRequest {
    pub fn new(method: impl Into<String>, params: Value, provider: PublicKey) -> Self {
        Self {
            method: method.into(),
            params,
            provider,
            server_id: None,
            timeout: EXECUTE_TIMEOUT,
            force_plaintext: false,
            encryption_override: None,
        }
    }

    pub fn server(mut self, server_id: Option<String>) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn force_plaintext(mut self, force: bool) -> Self {
        self.force_plaintext = force;
        self
    }

    pub fn encryption_override(mut self, supported: Option<bool>) -> Self {
        self.encryption_override = supported;
        self
    }
}

/// A response or notification normalised from either a plaintext event or
/// an unwrapped gift wrap.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub kind: Kind,
    pub pubkey: PublicKey,
    pub tags: Vec<Tag>,
    pub content: String,
    pub was_encrypted: bool,
}

impl ResponseEvent {
    fn from_event(event: &Event) -> Self {
        Self {
            kind: event.kind,
            pubkey: event.pubkey,
            tags: event.tags.iter().cloned().collect(),
            content: event.content.clone(),
            was_encrypted: false,
        }
    }

    fn from_unwrapped(inner: UnsignedEvent, sender: PublicKey) -> Self {
        Self {
            kind: inner.kind,
            pubkey: sender,
            tags: inner.tags.iter().cloned().collect(),
            content: inner.content,
            was_encrypted: true,
        }
    }
}

/// A completed invocation.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    /// Parsed content JSON of the final response.
    pub body: Value,
    pub response: ResponseEvent,
    pub elapsed: Duration,
}

enum Step {
    Complete(Value),
    KeepWaiting,
}

pub struct ExecutionClient {
    keys: Arc<KeyManager>,
    pool: Arc<RelayPool>,
    crypto: Arc<EncryptionEngine>,
    registries: Arc<Registries>,
    payer: Option<Arc<dyn InvoicePayer>>,
    pending: Mutex<HashMap<EventId, Instant>>,
}

impl ExecutionClient {
    pub fn new(
        keys: Arc<KeyManager>,
        pool: Arc<RelayPool>,
        crypto: Arc<EncryptionEngine>,
        registries: Arc<Registries>,
        payer: Option<Arc<dyn InvoicePayer>>,
    ) -> Self {
        Self {
            keys,
            pool,
            crypto,
            registries,
            payer,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// In-flight executions; empty once every call has terminated.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sign, dispatch, and await one remote invocation.
    ///
    /// Exactly one of resolve / protocol error / timeout terminates the
    /// call; cleanup (pending entry, subscription) runs on every path
    /// including cancellation.
    pub async fn execute(&self, request: OutgoingRequest) -> Result<CallOutcome> {
        let body = RequestBody::new(request.method.clone(), request.params.clone());
        let mut tags = vec![
            Tag::public_key(request.provider),
            Tag::custom(TagKind::custom(TAG_METHOD), vec![request.method.clone()]),
        ];
        if let Some(server_id) = &request.server_id {
            tags.push(Tag::custom(
                TagKind::custom(TAG_SERVER),
                vec![server_id.clone()],
            ));
        }
        let template = EventBuilder::new(KIND_REQUEST, serde_json::to_string(&body)?)
            .tags(tags)
            .build(self.keys.public_key());
        let signed = self.keys.sign(template.clone())?;
        let execution_id = signed.id;

        let wire_event = self.select_wire_event(&request, template, signed)?;

        // Subscribe before publishing so the response cannot race the
        // subscription setup.
        let filter = Filter::new()
            .kinds([KIND_RESPONSE, KIND_NOTIFICATION, Kind::GiftWrap])
            .since(Timestamp::now());
        let mut sub = self.pool.subscribe(vec![filter]).await?;

        let started = Instant::now();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(execution_id, started);
        let _guard = PendingGuard {
            map: &self.pending,
            id: execution_id,
        };

        self.pool.publish(wire_event).await?;

        let deadline = tokio::time::Instant::now() + request.timeout;
        let outcome = match tokio::time::timeout_at(
            deadline,
            self.await_response(&mut sub, execution_id, &request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ExecutionTimeout),
        };
        sub.close().await;

        outcome.map(|(body, response)| CallOutcome {
            body,
            response,
            elapsed: started.elapsed(),
        })
    }

    /// Decide plaintext vs. wrapped for the outgoing request.
    fn select_wire_event(
        &self,
        request: &OutgoingRequest,
        template: UnsignedEvent,
        signed: Event,
    ) -> Result<Event> {
        let supported = request
            .encryption_override
            .unwrap_or_else(|| self.target_supports_encryption(request));

        match self.crypto.mode() {
            EncryptionMode::Required if !supported => Err(Error::EncryptionUnsupported),
            EncryptionMode::Required => {
                self.crypto.wrap(self.keys.keys(), &request.provider, template)
            }
            EncryptionMode::Optional if supported && !request.force_plaintext => {
                match self.crypto.wrap(self.keys.keys(), &request.provider, template) {
                    Ok(wrapped) => Ok(wrapped),
                    Err(e) => {
                        log::warn!("wrap failed, sending request plaintext: {e}");
                        Ok(signed)
                    }
                }
            }
            _ => Ok(signed),
        }
    }

    fn target_supports_encryption(&self, request: &OutgoingRequest) -> bool {
        if let Some(server_id) = &request.server_id {
            if self.registries.servers.get(server_id).is_some() {
                return self.registries.servers.supports_encryption(server_id);
            }
        }
        self.registries
            .servers
            .provider_supports_encryption(&request.provider)
    }

    async fn await_response(
        &self,
        sub: &mut PoolSubscription,
        execution_id: EventId,
        request: &OutgoingRequest,
    ) -> Result<(Value, ResponseEvent)> {
        let mut seen_inner: HashSet<EventId> = HashSet::new();
        let mut paid_invoices: HashSet<String> = HashSet::new();

        while let Some(item) = sub.next().await {
            let SubscriptionItem::Event(event) = item else {
                continue;
            };
            let Some(response) = self.match_candidate(&event, execution_id, &mut seen_inner)
            else {
                continue;
            };
            match self.process(&response, &mut paid_invoices).await? {
                Step::Complete(body) => return Ok((body, response)),
                Step::KeepWaiting => {}
            }
        }
        Err(Error::Relay(format!(
            "subscription closed while awaiting a response to {}",
            request.method
        )))
    }

    /// Is this relay event a response to `execution_id`? Non-matching and
    /// undecryptable candidates are dropped silently; most of them belong
    /// to somebody else.
    fn match_candidate(
        &self,
        event: &Event,
        execution_id: EventId,
        seen_inner: &mut HashSet<EventId>,
    ) -> Option<ResponseEvent> {
        let execution_hex = execution_id.to_hex();

        if event.kind == Kind::GiftWrap {
            let unwrapped = self.crypto.unwrap(self.keys.keys(), event)?;
            // First-received wins across duplicate wraps of one inner event.
            if let Some(inner_id) = unwrapped.inner.id {
                if !seen_inner.insert(inner_id) {
                    return None;
                }
            }
            let tags: Vec<Tag> = unwrapped.inner.tags.iter().cloned().collect();
            if tag_value(&tags, "e") != Some(execution_hex.as_str()) {
                return None;
            }
            return Some(ResponseEvent::from_unwrapped(
                unwrapped.inner,
                unwrapped.sender,
            ));
        }

        if event.kind != KIND_RESPONSE && event.kind != KIND_NOTIFICATION {
            return None;
        }
        let tags: Vec<Tag> = event.tags.iter().cloned().collect();
        if tag_value(&tags, "e") != Some(execution_hex.as_str()) {
            return None;
        }
        if !self.crypto.accept_plaintext() {
            log::debug!(
                "dropping plaintext {} response for {execution_hex} (encryption required)",
                event.kind
            );
            return None;
        }
        Some(ResponseEvent::from_event(event))
    }

    async fn process(
        &self,
        response: &ResponseEvent,
        paid_invoices: &mut HashSet<String>,
    ) -> Result<Step> {
        if response.kind == KIND_RESPONSE {
            let body: Value = serde_json::from_str(&response.content)?;
            if let Some(error) = body.get("error") {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified provider error");
                return Err(Error::Protocol(message.to_string()));
            }
            if body.get("isError").and_then(Value::as_bool) == Some(true) {
                return Err(Error::Execution(response.content.clone()));
            }
            return Ok(Step::Complete(body));
        }

        // Notification
        let status = tag_value(&response.tags, TAG_STATUS)
            .or_else(|| tag_value(&response.tags, TAG_METHOD));
        match status {
            Some(STATUS_ERROR) => Err(Error::Notification(response.content.clone())),
            Some(STATUS_PAYMENT_REQUIRED) => {
                let invoice = tag_value(&response.tags, TAG_INVOICE).ok_or_else(|| {
                    Error::Payment("payment-required notification without invoice".to_string())
                })?;
                if !paid_invoices.insert(invoice.to_string()) {
                    return Ok(Step::KeepWaiting);
                }
                let payer = self.payer.as_ref().ok_or_else(|| {
                    Error::Payment("provider demands payment but no wallet is configured".to_string())
                })?;
                log::info!("paying invoice demanded by {}", response.pubkey);
                payer.pay(invoice).await?;
                // Payment extends the effective wait but never the deadline;
                // keep listening for the final response.
                Ok(Step::KeepWaiting)
            }
            _ => Ok(Step::KeepWaiting),
        }
    }
}

struct PendingGuard<'a> {
    map: &'a Mutex<HashMap<EventId, Instant>>,
    id: EventId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}
