//! Typed capability registries.
//!
//! One registry per capability kind plus the server registry. All mutations
//! go through an internal mutex (single writer, many readers) and fan out
//! change notifications over a shared broadcast channel, which the local
//! endpoint turns into `list_changed` notifications.

mod capability;
mod server;

pub use capability::{CapabilityEntry, CapabilityRegistry};
pub use server::{ServerInfo, ServerRegistry};

use nostr_sdk::prelude::*;
use tokio::sync::broadcast;

use crate::protocol::{PromptDef, ResourceDef, ResourceTemplateDef, ToolDef};

/// Which capability list changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryKind {
    Tools,
    Resources,
    ResourceTemplates,
    Prompts,
    Servers,
}

/// Broadcast on every observable registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryEvent {
    ListChanged(RegistryKind),
}

/// The full registry set shared across discovery, execution, and the local
/// endpoint.
pub struct Registries {
    pub tools: CapabilityRegistry<ToolDef>,
    pub resources: CapabilityRegistry<ResourceDef>,
    pub resource_templates: CapabilityRegistry<ResourceTemplateDef>,
    pub prompts: CapabilityRegistry<PromptDef>,
    pub servers: ServerRegistry,
    tx: broadcast::Sender<RegistryEvent>,
}

impl Registries {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tools: CapabilityRegistry::new(RegistryKind::Tools, tx.clone()),
            resources: CapabilityRegistry::new(RegistryKind::Resources, tx.clone()),
            resource_templates: CapabilityRegistry::new(RegistryKind::ResourceTemplates, tx.clone()),
            prompts: CapabilityRegistry::new(RegistryKind::Prompts, tx.clone()),
            servers: ServerRegistry::new(tx.clone()),
            tx,
        }
    }

    /// Receiver for change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.tx.subscribe()
    }

    /// Drop every capability and server registered by `provider`.
    pub fn remove_provider(&self, provider: &PublicKey) -> usize {
        let mut removed = 0;
        removed += self.tools.remove_by_provider(provider).len();
        removed += self.resources.remove_by_provider(provider).len();
        removed += self.resource_templates.remove_by_provider(provider).len();
        removed += self.prompts.remove_by_provider(provider).len();
        removed += self.servers.remove_by_provider(provider).len();
        removed
    }

    /// Remove all surfaces and entries everywhere.
    pub fn clear_all(&self) {
        self.tools.clear();
        self.resources.clear();
        self.resource_templates.clear();
        self.prompts.clear();
        self.servers.clear();
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::new()
    }
}
