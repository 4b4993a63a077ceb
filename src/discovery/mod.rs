//! Provider discovery: queries announcement kinds, classifies events, and
//! populates the registries in dependency order (servers before the
//! capability lists that reference them).

pub mod handshake;

use std::collections::HashSet;
use std::sync::Arc;

use nostr_sdk::prelude::*;
use serde_json::Value;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::{
    capability_id, tag_value, PromptsListPayload, ResourceTemplatesListPayload,
    ResourcesListPayload, ToolsListPayload, KIND_PROMPTS_LIST, KIND_RESOURCES_LIST,
    KIND_SERVER_ANNOUNCEMENT, KIND_TOOLS_LIST, TAG_SUPPORT_ENCRYPTION,
};
use crate::registry::Registries;
use crate::relay::{PoolEvent, RelayPool, SubscriptionItem};

/// `d`-tag marker distinguishing a resource-template list from a plain
/// resources list.
const TEMPLATE_LIST_MARKER: &str = "resources/templates/list";

/// Counters for one discovery pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryStats {
    pub servers: usize,
    pub tools: usize,
    pub resources: usize,
    pub resource_templates: usize,
    pub prompts: usize,
    pub skipped: usize,
}

impl std::fmt::Display for DiscoveryStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "servers={}, tools={}, resources={}, templates={}, prompts={}, skipped={}",
            self.servers,
            self.tools,
            self.resources,
            self.resource_templates,
            self.prompts,
            self.skipped
        )
    }
}

pub struct DiscoveryService {
    pool: Arc<RelayPool>,
    registries: Arc<Registries>,
    /// Empty set means every provider is allowed.
    whitelist: HashSet<PublicKey>,
    limit: Option<usize>,
}

impl DiscoveryService {
    pub fn new(
        pool: Arc<RelayPool>,
        registries: Arc<Registries>,
        whitelist: HashSet<PublicKey>,
        limit: Option<usize>,
    ) -> Self {
        Self {
            pool,
            registries,
            whitelist,
            limit,
        }
    }

    fn announcement_filter(&self) -> Filter {
        let mut filter = Filter::new().kinds([
            KIND_SERVER_ANNOUNCEMENT,
            KIND_TOOLS_LIST,
            KIND_RESOURCES_LIST,
            KIND_PROMPTS_LIST,
        ]);
        if let Some(limit) = self.limit {
            filter = filter.limit(limit);
        }
        filter
    }

    /// One-shot discovery: fetch the current announcement snapshot and
    /// register everything, servers first.
    pub async fn discover(&self) -> Result<DiscoveryStats> {
        let events = self.pool.query(vec![self.announcement_filter()]).await?;

        let mut servers = Vec::new();
        let mut tools = Vec::new();
        let mut resources = Vec::new();
        let mut prompts = Vec::new();
        for event in events {
            match event.kind {
                k if k == KIND_SERVER_ANNOUNCEMENT => servers.push(event),
                k if k == KIND_TOOLS_LIST => tools.push(event),
                k if k == KIND_RESOURCES_LIST => resources.push(event),
                k if k == KIND_PROMPTS_LIST => prompts.push(event),
                _ => {}
            }
        }

        let mut stats = DiscoveryStats::default();
        // Lists reference their server through the `s` tag; servers must be
        // registered first so the originating server is resolvable.
        for event in servers
            .iter()
            .chain(tools.iter())
            .chain(resources.iter())
            .chain(prompts.iter())
        {
            self.ingest(event, &mut stats);
        }

        log::info!("discovery complete: {stats}");
        Ok(stats)
    }

    /// Keep discovering: subscribe to the announcement kinds and feed every
    /// arriving event through the classifier. Re-subscribes whenever the
    /// pool reports a new or reconnected relay.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut pool_events = self.pool.events();
            loop {
                let mut sub = match self.pool.subscribe(vec![self.announcement_filter()]).await {
                    Ok(sub) => sub,
                    Err(e) => {
                        log::error!("discovery subscription failed: {e}");
                        return;
                    }
                };
                loop {
                    tokio::select! {
                        item = sub.next() => match item {
                            Some(SubscriptionItem::Event(event)) => {
                                let mut stats = DiscoveryStats::default();
                                self.ingest(&event, &mut stats);
                            }
                            Some(SubscriptionItem::EndOfStored) => {}
                            None => return,
                        },
                        pool_event = pool_events.recv() => match pool_event {
                            Ok(PoolEvent::RelayAdded(url)) | Ok(PoolEvent::Reconnected(url)) => {
                                log::debug!("re-subscribing discovery after relay change: {url}");
                                sub.close().await;
                                break;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                        },
                    }
                }
            }
        })
    }

    /// Classify one announcement event and register its payload. Malformed
    /// events are logged and skipped; they never abort the batch.
    pub fn ingest(&self, event: &Event, stats: &mut DiscoveryStats) {
        if !self.whitelist.is_empty() && !self.whitelist.contains(&event.pubkey) {
            log::debug!("dropping announcement from non-whitelisted {}", event.pubkey);
            stats.skipped += 1;
            return;
        }

        let tags: Vec<Tag> = event.tags.iter().cloned().collect();
        match event.kind {
            k if k == KIND_SERVER_ANNOUNCEMENT => self.ingest_server(event, &tags, stats),
            k if k == KIND_TOOLS_LIST => self.ingest_tools(event, &tags, stats),
            k if k == KIND_RESOURCES_LIST => self.ingest_resources(event, &tags, stats),
            k if k == KIND_PROMPTS_LIST => self.ingest_prompts(event, &tags, stats),
            _ => {}
        }
    }

    fn ingest_server(&self, event: &Event, tags: &[Tag], stats: &mut DiscoveryStats) {
        let Some(server_id) = tag_value(tags, "d") else {
            log::warn!("server announcement {} missing d tag, skipping", event.id);
            stats.skipped += 1;
            return;
        };
        let announcement: Value = match serde_json::from_str(&event.content) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("unparseable server announcement {}: {e}", event.id);
                stats.skipped += 1;
                return;
            }
        };
        let supports_encryption = tag_value(tags, TAG_SUPPORT_ENCRYPTION) == Some("true");
        if self.registries.servers.register(
            server_id.to_string(),
            event.pubkey,
            announcement,
            supports_encryption,
            event.created_at,
        ) {
            stats.servers += 1;
        }
    }

    fn ingest_tools(&self, event: &Event, tags: &[Tag], stats: &mut DiscoveryStats) {
        let Some(server_id) = tag_value(tags, "s") else {
            log::warn!("tools list {} missing s tag, skipping", event.id);
            stats.skipped += 1;
            return;
        };
        let payload: ToolsListPayload = match serde_json::from_str(&event.content) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("unparseable tools list {}: {e}", event.id);
                stats.skipped += 1;
                return;
            }
        };
        stats.tools += register_tools(&self.registries, event.pubkey, server_id, payload);
    }

    fn ingest_resources(&self, event: &Event, tags: &[Tag], stats: &mut DiscoveryStats) {
        let Some(server_id) = tag_value(tags, "s") else {
            log::warn!("resources list {} missing s tag, skipping", event.id);
            stats.skipped += 1;
            return;
        };

        // Template lists ride the same kind, discriminated by the d tag.
        let is_template_list = tag_value(tags, "d")
            .map(|d| d.contains(TEMPLATE_LIST_MARKER))
            .unwrap_or(false);

        if is_template_list {
            let payload: ResourceTemplatesListPayload = match serde_json::from_str(&event.content)
            {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("unparseable resource templates list {}: {e}", event.id);
                    stats.skipped += 1;
                    return;
                }
            };
            stats.resource_templates +=
                register_resource_templates(&self.registries, event.pubkey, server_id, payload);
        } else {
            let payload: ResourcesListPayload = match serde_json::from_str(&event.content) {
                Ok(payload) => payload,
                Err(e) => {
                    log::warn!("unparseable resources list {}: {e}", event.id);
                    stats.skipped += 1;
                    return;
                }
            };
            stats.resources +=
                register_resources(&self.registries, event.pubkey, server_id, payload);
        }
    }

    fn ingest_prompts(&self, event: &Event, tags: &[Tag], stats: &mut DiscoveryStats) {
        let Some(server_id) = tag_value(tags, "s") else {
            log::warn!("prompts list {} missing s tag, skipping", event.id);
            stats.skipped += 1;
            return;
        };
        let payload: PromptsListPayload = match serde_json::from_str(&event.content) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("unparseable prompts list {}: {e}", event.id);
                stats.skipped += 1;
                return;
            }
        };
        stats.prompts += register_prompts(&self.registries, event.pubkey, server_id, payload);
    }
}

// Registration helpers shared with the private handshake path.

pub(crate) fn register_tools(
    registries: &Registries,
    provider: PublicKey,
    server_id: &str,
    payload: ToolsListPayload,
) -> usize {
    let mut registered = 0;
    for tool in payload.tools {
        if tool.name.is_empty() {
            log::warn!("dropping unnamed tool from {provider}");
            continue;
        }
        let id = capability_id(&tool.name, &provider);
        registries
            .tools
            .register(id, tool, provider, Some(server_id.to_string()));
        registered += 1;
    }
    registered
}

pub(crate) fn register_resources(
    registries: &Registries,
    provider: PublicKey,
    server_id: &str,
    payload: ResourcesListPayload,
) -> usize {
    let mut registered = 0;
    for resource in payload.resources {
        if resource.uri.is_empty() {
            log::warn!("dropping resource without uri from {provider}");
            continue;
        }
        let name = if resource.name.is_empty() {
            resource.uri.clone()
        } else {
            resource.name.clone()
        };
        let id = capability_id(&name, &provider);
        registries
            .resources
            .register(id, resource, provider, Some(server_id.to_string()));
        registered += 1;
    }
    registered
}

pub(crate) fn register_resource_templates(
    registries: &Registries,
    provider: PublicKey,
    server_id: &str,
    payload: ResourceTemplatesListPayload,
) -> usize {
    let mut registered = 0;
    for template in payload.resource_templates {
        if template.uri_template.is_empty() {
            log::warn!("dropping resource template without uriTemplate from {provider}");
            continue;
        }
        let name = if template.name.is_empty() {
            template.uri_template.clone()
        } else {
            template.name.clone()
        };
        let id = capability_id(&name, &provider);
        registries
            .resource_templates
            .register(id, template, provider, Some(server_id.to_string()));
        registered += 1;
    }
    registered
}

pub(crate) fn register_prompts(
    registries: &Registries,
    provider: PublicKey,
    server_id: &str,
    payload: PromptsListPayload,
) -> usize {
    let mut registered = 0;
    for prompt in payload.prompts {
        if prompt.name.is_empty() {
            log::warn!("dropping unnamed prompt from {provider}");
            continue;
        }
        let id = capability_id(&prompt.name, &provider);
        registries
            .prompts
            .register(id, prompt, provider, Some(server_id.to_string()));
        registered += 1;
    }
    registered
}
