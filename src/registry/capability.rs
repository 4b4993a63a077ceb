use std::collections::HashMap;
use std::sync::Mutex;

use nostr_sdk::prelude::*;
use regex::Regex;
use tokio::sync::broadcast;

use super::{RegistryEvent, RegistryKind};

/// A registered capability with its provider metadata.
#[derive(Debug, Clone)]
pub struct CapabilityEntry<T> {
    pub capability: T,
    pub provider: PublicKey,
    pub server_id: Option<String>,
}

/// Keyed store for one capability kind. Ids are unique; re-registration of
/// the same id overwrites, which also refreshes the surfaced listing (the
/// endpoint lists from snapshots, so description/schema changes propagate
/// on the next `list_changed`).
pub struct CapabilityRegistry<T> {
    kind: RegistryKind,
    entries: Mutex<HashMap<String, CapabilityEntry<T>>>,
    tx: broadcast::Sender<RegistryEvent>,
}

impl<T: Clone> CapabilityRegistry<T> {
    pub(super) fn new(kind: RegistryKind, tx: broadcast::Sender<RegistryEvent>) -> Self {
        Self {
            kind,
            entries: Mutex::new(HashMap::new()),
            tx,
        }
    }

    pub fn kind(&self) -> RegistryKind {
        self.kind
    }

    /// Upsert a capability under `id`.
    pub fn register(
        &self,
        id: String,
        capability: T,
        provider: PublicKey,
        server_id: Option<String>,
    ) {
        {
            let mut entries = self.lock();
            entries.insert(
                id,
                CapabilityEntry {
                    capability,
                    provider,
                    server_id,
                },
            );
        }
        self.notify();
    }

    pub fn get(&self, id: &str) -> Option<T> {
        self.lock().get(id).map(|e| e.capability.clone())
    }

    pub fn get_info(&self, id: &str) -> Option<CapabilityEntry<T>> {
        self.lock().get(id).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        self.lock().values().map(|e| e.capability.clone()).collect()
    }

    pub fn list_with_ids(&self) -> Vec<(String, CapabilityEntry<T>)> {
        let mut items: Vec<_> = self
            .lock()
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items
    }

    pub fn remove(&self, id: &str) -> bool {
        let removed = self.lock().remove(id).is_some();
        if removed {
            self.notify();
        }
        removed
    }

    /// Remove everything registered by `provider`; returns the removed ids.
    pub fn remove_by_provider(&self, provider: &PublicKey) -> Vec<String> {
        let removed = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.provider == *provider)
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

    /// Remove every id matching the pattern; returns the removed ids.
    pub fn remove_by_pattern(&self, pattern: &Regex) -> Vec<String> {
        let removed = {
            let mut entries = self.lock();
            let ids: Vec<String> = entries
                .keys()
                .filter(|id| pattern.is_match(id))
                .cloned()
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

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CapabilityEntry<T>>> {
        // A poisoned registry mutex means a panic mid-mutation; the map
        // itself is always left in a consistent state by our critical
        // sections, so recover the guard.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        let _ = self.tx.send(RegistryEvent::ListChanged(self.kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{capability_id, ToolDef};

    fn registry() -> CapabilityRegistry<ToolDef> {
        let (tx, _rx) = broadcast::channel(16);
        CapabilityRegistry::new(RegistryKind::Tools, tx)
    }

    fn tool(name: &str) -> ToolDef {
        ToolDef {
            name: name.to_string(),
            description: Some(format!("{name} description")),
            input_schema: serde_json::Value::Null,
        }
    }

    #[test]
    fn same_name_distinct_providers_coexist() {
        let reg = registry();
        let a = Keys::generate().public_key();
        let b = Keys::generate().public_key();

        reg.register(capability_id("echo", &a), tool("echo"), a, None);
        reg.register(capability_id("echo", &b), tool("echo"), b, None);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn reregistration_overwrites() {
        let reg = registry();
        let pk = Keys::generate().public_key();
        let id = capability_id("echo", &pk);

        reg.register(id.clone(), tool("echo"), pk, None);
        let mut updated = tool("echo");
        updated.description = Some("changed".to_string());
        reg.register(id.clone(), updated, pk, Some("srv".to_string()));

        assert_eq!(reg.len(), 1);
        let info = reg.get_info(&id).unwrap();
        assert_eq!(info.capability.description.as_deref(), Some("changed"));
        assert_eq!(info.server_id.as_deref(), Some("srv"));
    }

    #[test]
    fn remove_then_register_equals_register() {
        let reg = registry();
        let pk = Keys::generate().public_key();
        let id = capability_id("echo", &pk);

        reg.register(id.clone(), tool("echo"), pk, None);
        assert!(reg.remove(&id));
        reg.register(id.clone(), tool("echo"), pk, None);

        assert_eq!(reg.len(), 1);
        assert!(reg.get(&id).is_some());
    }

    #[test]
    fn remove_by_pattern() {
        let reg = registry();
        let pk = Keys::generate().public_key();
        reg.register("alpha_aaaa".to_string(), tool("alpha"), pk, None);
        reg.register("beta_aaaa".to_string(), tool("beta"), pk, None);

        let removed = reg.remove_by_pattern(&Regex::new("^alpha").unwrap());
        assert_eq!(removed, vec!["alpha_aaaa".to_string()]);
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_missing_id_is_false_and_silent() {
        let reg = registry();
        assert!(!reg.remove("nothing"));
    }
}
