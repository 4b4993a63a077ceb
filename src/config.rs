//! Gateway configuration.
//!
//! Loaded from a YAML file with camelCase keys; every section has a default
//! so a minimal file only needs `nostr.privateKey`. CLI flags may override
//! individual fields after loading.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::crypto::EncryptionMode;
use crate::error::{Error, Result};

/// Fallback relay used when `nostr.relayUrls` is absent.
pub const DEFAULT_RELAY: &str = "wss://relay.damus.io";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub nostr: NostrConfig,
    pub mcp: McpConfig,
    pub nwc: NwcConfig,
    pub whitelist: WhitelistConfig,
    pub discovery: DiscoveryConfig,
    #[serde(rename = "featureFlags")]
    pub feature_flags: FeatureFlags,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NostrConfig {
    /// Identity secret, 64 hex characters. Required.
    #[serde(rename = "privateKey")]
    pub private_key: String,
    #[serde(rename = "relayUrls")]
    pub relay_urls: Vec<String>,
}

impl Default for NostrConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            relay_urls: vec![DEFAULT_RELAY.to_string()],
        }
    }
}

/// How the local endpoint identifies itself to hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub name: String,
    pub version: String,
    pub about: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            name: "capgate".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            about: "MCP capability gateway over Nostr relays".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NwcConfig {
    /// Nostr Wallet Connect URI. Enables payment-required handling.
    #[serde(rename = "connectionString")]
    pub connection_string: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WhitelistConfig {
    /// If non-empty, announcements from any other provider are dropped.
    #[serde(rename = "allowedDVMs")]
    pub allowed_dvms: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Caps the announcement query size.
    pub limit: Option<usize>,
    /// Servers reached via the private handshake instead of public discovery.
    #[serde(rename = "privateServers")]
    pub private_servers: Vec<PrivateServerEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivateServerEntry {
    #[serde(rename = "providerPubkey")]
    pub provider_pubkey: String,
    #[serde(rename = "serverId", default)]
    pub server_id: Option<String>,
    #[serde(rename = "supportsEncryption", default)]
    pub supports_encryption: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureFlags {
    /// Registers the built-in tools; allows an empty relay set.
    pub interactive: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub mode: EncryptionMode,
}

impl Config {
    /// Load and validate a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Config = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants that would otherwise only fail deep in startup.
    pub fn validate(&self) -> Result<()> {
        if self.nostr.private_key.len() != 64
            || hex::decode(&self.nostr.private_key).is_err()
        {
            return Err(Error::Config(
                "nostr.privateKey must be 64 hex characters".to_string(),
            ));
        }
        for url in &self.nostr.relay_urls {
            if !url.starts_with("ws://") && !url.starts_with("wss://") {
                return Err(Error::Config(format!(
                    "relay URL must start with ws:// or wss://: {url}"
                )));
            }
        }
        if self.nostr.relay_urls.is_empty() && !self.feature_flags.interactive {
            return Err(Error::Config(
                "nostr.relayUrls must not be empty outside interactive mode".to_string(),
            ));
        }
        for entry in &self.whitelist.allowed_dvms {
            if nostr_sdk::PublicKey::from_hex(entry).is_err() {
                return Err(Error::Config(format!(
                    "whitelist.allowedDVMs entry is not a valid pubkey: {entry}"
                )));
            }
        }
        for server in &self.discovery.private_servers {
            if nostr_sdk::PublicKey::from_hex(&server.provider_pubkey).is_err() {
                return Err(Error::Config(format!(
                    "discovery.privateServers providerPubkey is invalid: {}",
                    server.provider_pubkey
                )));
            }
        }
        Ok(())
    }
}
