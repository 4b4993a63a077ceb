//! Identity key management.
//!
//! The [`KeyManager`] exclusively owns the process identity secret. Event
//! templates come out unsigned; [`KeyManager::sign`] finalises them (id
//! computation plus signature) synchronously.

use nostr_sdk::prelude::*;

use crate::error::{Error, Result};

pub struct KeyManager {
    keys: Keys,
}

impl KeyManager {
    /// Construct from a hex-encoded 32-byte secret.
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        if secret_hex.len() != 64 {
            return Err(Error::InvalidKey);
        }
        let bytes = hex::decode(secret_hex).map_err(|_| Error::InvalidKey)?;
        let secret = SecretKey::from_slice(&bytes).map_err(|_| Error::InvalidKey)?;
        Ok(Self {
            keys: Keys::new(secret),
        })
    }

    /// Ephemeral identity, used by tests and ad-hoc discovery.
    pub fn generate() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    /// A fresh unsigned template of the given kind: our pubkey, current
    /// timestamp, no tags, empty content.
    pub fn template(&self, kind: Kind) -> UnsignedEvent {
        EventBuilder::new(kind, "").build(self.keys.public_key())
    }

    /// Finalise a template into a signed event.
    pub fn sign(&self, template: UnsignedEvent) -> Result<Event> {
        template
            .sign_with_keys(&self.keys)
            .map_err(|e| Error::Protocol(format!("signing failed: {e}")))
    }

    /// Access to the underlying keypair for components that encrypt.
    pub fn keys(&self) -> &Keys {
        &self.keys
    }
}
