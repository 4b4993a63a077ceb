//! Two-layer payload encryption (seal + gift wrap).
//!
//! An outgoing payload is an unsigned rumor sealed under an ephemeral key
//! (kind 13) and wrapped under a second ephemeral key (kind 1059) addressed
//! to the recipient. Neither on-wire signer correlates with the sender's
//! long-term identity; the rumor's `pubkey` proves origin only after unwrap.

use nostr_sdk::nips::nip44;
use nostr_sdk::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Engine policy. Governs whether unsolicited sends are wrapped, whether
/// replies mirror the inbound encryption, and whether plaintext inbound
/// traffic is accepted at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionMode {
    Disabled,
    #[default]
    Optional,
    Required,
}

/// Result of unwrapping a gift wrap: the effective inner event plus the
/// authenticated sender.
#[derive(Debug, Clone)]
pub struct Unwrapped {
    pub inner: UnsignedEvent,
    pub sender: PublicKey,
}

#[derive(Debug, Clone)]
pub struct EncryptionEngine {
    mode: EncryptionMode,
}

impl EncryptionEngine {
    pub fn new(mode: EncryptionMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.mode != EncryptionMode::Disabled
    }

    /// Encrypt outgoing unsolicited events?
    pub fn encrypt_outgoing(&self) -> bool {
        self.mode == EncryptionMode::Required
    }

    /// Mirror-encrypt a reply to an encrypted incoming event?
    pub fn mirror_encrypt(&self) -> bool {
        self.mode != EncryptionMode::Disabled
    }

    /// Accept unencrypted incoming events?
    pub fn accept_plaintext(&self) -> bool {
        self.mode != EncryptionMode::Required
    }

    /// Wrap an unsigned template for `recipient`.
    ///
    /// The rumor's `pubkey` is forced to the sender identity; both the seal
    /// and the wrap are signed by freshly generated ephemeral keys.
    pub fn wrap(
        &self,
        sender: &Keys,
        recipient: &PublicKey,
        mut rumor: UnsignedEvent,
    ) -> Result<Event> {
        rumor.pubkey = sender.public_key();
        rumor.ensure_id();

        let seal_keys = Keys::generate();
        let sealed = nip44::encrypt(
            seal_keys.secret_key(),
            recipient,
            rumor.as_json(),
            nip44::Version::V2,
        )
        .map_err(|e| Error::Encryption(format!("seal: {e}")))?;
        let seal = EventBuilder::new(Kind::Seal, sealed)
            .sign_with_keys(&seal_keys)
            .map_err(|e| Error::Encryption(format!("seal signing: {e}")))?;

        let wrap_keys = Keys::generate();
        let wrapped = nip44::encrypt(
            wrap_keys.secret_key(),
            recipient,
            seal.as_json(),
            nip44::Version::V2,
        )
        .map_err(|e| Error::Encryption(format!("wrap: {e}")))?;
        EventBuilder::new(Kind::GiftWrap, wrapped)
            .tags(vec![Tag::public_key(*recipient)])
            .sign_with_keys(&wrap_keys)
            .map_err(|e| Error::Encryption(format!("wrap signing: {e}")))
    }

    /// Unwrap a gift wrap addressed to `recipient`.
    ///
    /// Returns `None` on any decode or decrypt failure; the common case is a
    /// wrap addressed to somebody else, which is not an error worth logging.
    pub fn unwrap(&self, recipient: &Keys, wrap: &Event) -> Option<Unwrapped> {
        if wrap.kind != Kind::GiftWrap {
            return None;
        }

        let seal_json =
            nip44::decrypt(recipient.secret_key(), &wrap.pubkey, &wrap.content).ok()?;
        let seal = Event::from_json(&seal_json).ok()?;
        if seal.kind != Kind::Seal {
            return None;
        }

        let rumor_json =
            nip44::decrypt(recipient.secret_key(), &seal.pubkey, &seal.content).ok()?;
        let mut rumor = UnsignedEvent::from_json(&rumor_json).ok()?;
        rumor.ensure_id();
        let sender = rumor.pubkey;

        // A kind-14 rumor is a private envelope whose content is itself a
        // JSON-encoded protocol event.
        let inner = if rumor.kind == Kind::PrivateDirectMessage {
            let mut nested = UnsignedEvent::from_json(&rumor.content).ok()?;
            nested.ensure_id();
            nested
        } else {
            rumor
        };

        Some(Unwrapped { inner, sender })
    }
}
