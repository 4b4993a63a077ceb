//! Thin publishing facade: routes one outgoing event either plaintext or
//! through the encryption engine before it reaches the relay pool.

use std::sync::Arc;

use nostr_sdk::prelude::*;

use crate::crypto::{EncryptionEngine, EncryptionMode};
use crate::error::Result;
use crate::keys::KeyManager;
use crate::relay::RelayPool;

/// Per-publish options.
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    pub encrypt: bool,
    pub recipient: Option<PublicKey>,
}

pub struct EventPublisher {
    keys: Arc<KeyManager>,
    pool: Arc<RelayPool>,
    crypto: Arc<EncryptionEngine>,
}

impl EventPublisher {
    pub fn new(keys: Arc<KeyManager>, pool: Arc<RelayPool>, crypto: Arc<EncryptionEngine>) -> Self {
        Self { keys, pool, crypto }
    }

    /// Sign and publish a template, optionally wrapped for a recipient.
    ///
    /// Wrap failures are fatal only in `Required` mode; in `Optional` mode
    /// the event falls back to plaintext with a warning.
    pub async fn publish(
        &self,
        template: UnsignedEvent,
        options: PublishOptions,
    ) -> Result<EventId> {
        let wrap_requested =
            options.encrypt && options.recipient.is_some() && self.crypto.is_enabled();

        if wrap_requested {
            let recipient = options.recipient.as_ref().unwrap_or(&template.pubkey);
            match self.crypto.wrap(self.keys.keys(), recipient, template.clone()) {
                Ok(wrapped) => return self.pool.publish(wrapped).await,
                Err(e) if self.crypto.mode() == EncryptionMode::Required => return Err(e),
                Err(e) => {
                    log::warn!("wrap failed, publishing plaintext: {e}");
                }
            }
        }

        let event = self.keys.sign(template)?;
        self.pool.publish(event).await
    }
}
