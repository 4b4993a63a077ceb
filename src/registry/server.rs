use std::collections::HashMap;
use std::sync::Mutex;

use nostr_sdk::prelude::*;
use serde_json::Value;
use tokio::sync::broadcast;

use super::{RegistryEvent, RegistryKind};

/// A known provider server and its announced capabilities.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    pub server_id: String,
    pub provider: PublicKey,
    /// Raw announcement content JSON.
    pub announcement: Value,
    /// The announcement's `capabilities` object, parsed once on
    /// registration.
    pub capabilities: Value,
    pub supports_encryption: bool,
    /// Timestamp of the announcement this entry came from. Replays of older
    /// addressable events never roll an entry back.
    pub announced_at: Timestamp,
}

pub struct ServerRegistry {
    entries: Mutex<HashMap<String, ServerInfo>>,
    tx: broadcast::Sender<RegistryEvent>,
}

impl ServerRegistry {
    pub(super) fn new(tx: broadcast::Sender<RegistryEvent>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            tx,
        }
    }

    /// Upsert a server from an announcement. Returns `false` when the
    /// registry already holds a newer announcement for this id.
    pub fn register(
        &self,
        server_id: String,
        provider: PublicKey,
        announcement: Value,
        supports_encryption: bool,
        announced_at: Timestamp,
    ) -> bool {
        let inserted = {
            let mut entries = self.lock();
            if let Some(existing) = entries.get(&server_id) {
                if existing.announced_at > announced_at {
                    return false;
                }
            }
            let capabilities = announcement
                .get("capabilities")
                .cloned()
                .unwrap_or(Value::Null);
            entries.insert(
                server_id.clone(),
                ServerInfo {
                    server_id,
                    provider,
                    announcement,
                    capabilities,
                    supports_encryption,
                    announced_at,
                },
            );
            true
        };
        if inserted {
            self.notify();
        }
        inserted
    }

    pub fn get(&self, server_id: &str) -> Option<ServerInfo> {
        self.lock().get(server_id).cloned()
    }

    /// First server registered by `provider`, if any. Executors resolve the
    /// encryption capability of a target through this when only the `p` tag
    /// is known.
    pub fn get_by_provider(&self, provider: &PublicKey) -> Option<ServerInfo> {
        self.lock()
            .values()
            .find(|s| s.provider == *provider)
            .cloned()
    }

    pub fn list_servers_with_ids(&self) -> Vec<(String, ServerInfo)> {
        let mut items: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    pub fn supports_completions(&self, server_id: &str) -> bool {
        self.lock()
            .get(server_id)
            .map(|s| s.capabilities.get("completions").is_some())
            .unwrap_or(false)
    }

    pub fn supports_encryption(&self, server_id: &str) -> bool {
        self.lock()
            .get(server_id)
            .map(|s| s.supports_encryption)
            .unwrap_or(false)
    }

    /// Encryption support for a provider, across any of its servers.
    pub fn provider_supports_encryption(&self, provider: &PublicKey) -> bool {
        self.lock()
            .values()
            .any(|s| s.provider == *provider && s.supports_encryption)
    }

    /// Record encryption support learned after registration (e.g. from a
    /// handshake response).
    pub fn set_encryption_support(&self, server_id: &str, supported: bool) {
        let mut entries = self.lock();
        if let Some(info) = entries.get_mut(server_id) {
            info.supports_encryption = supported;
        }
    }

    pub fn remove(&self, server_id: &str) -> bool {
        let removed = self.lock().remove(server_id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    pub fn remove_by_provider(&self, provider: &PublicKey) -> Vec<String> {
        let removed = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, s)| s.provider == *provider)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                entries.remove(id);
            }
            ids
        };
        if !removed.is_empty() {
            self.notify();
        }
        removed
    }

    pub fn clear(&self) {
        let had_entries = {
            let mut entries = self.lock();
            let had = !entries.is_empty();
            entries.clear();
            had
        };
        if had_entries {
            self.notify();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ServerInfo>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        let _ = self.tx.send(RegistryEvent::ListChanged(RegistryKind::Servers));
    }
}
