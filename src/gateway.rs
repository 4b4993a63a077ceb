//! Gateway coordinator: wires keys, relay pool, encryption, registries,
//! discovery, handshakes, executors, and the local endpoint into one
//! process-lifetime object.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use nostr_sdk::prelude::*;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::crypto::EncryptionEngine;
use crate::discovery::handshake::{Handshake, PrivateServer};
use crate::discovery::{DiscoveryService, DiscoveryStats};
use crate::error::{Error, Result};
use crate::execution::{ExecutionClient, Executors};
use crate::keys::KeyManager;
use crate::mcp::{BuiltinTools, EndpointInfo, McpEndpoint};
use crate::payment::{InvoicePayer, NwcPayer};
use crate::publisher::EventPublisher;
use crate::registry::Registries;
use crate::relay::RelayPool;

pub struct Gateway {
    config: Config,
    keys: Arc<KeyManager>,
    pool: Arc<RelayPool>,
    crypto: Arc<EncryptionEngine>,
    registries: Arc<Registries>,
    execution: Arc<ExecutionClient>,
    executors: Arc<Executors>,
    publisher: Arc<EventPublisher>,
    discovery: Arc<DiscoveryService>,
    live_discovery: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Construct every component from a validated config. Does not touch
    /// the network yet.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let keys = Arc::new(KeyManager::from_hex(&config.nostr.private_key)?);
        let pool = Arc::new(RelayPool::new(&config.nostr.relay_urls).await?);
        let crypto = Arc::new(EncryptionEngine::new(config.encryption.mode));
        let registries = Arc::new(Registries::new());

        let payer: Option<Arc<dyn InvoicePayer>> = match &config.nwc.connection_string {
            Some(uri) => Some(Arc::new(NwcPayer::from_connection_string(uri)?)),
            None => None,
        };

        let execution = Arc::new(ExecutionClient::new(
            keys.clone(),
            pool.clone(),
            crypto.clone(),
            registries.clone(),
            payer,
        ));
        let executors = Arc::new(Executors::new(execution.clone(), registries.clone()));
        let publisher = Arc::new(EventPublisher::new(
            keys.clone(),
            pool.clone(),
            crypto.clone(),
        ));
        let discovery = Arc::new(DiscoveryService::new(
            pool.clone(),
            registries.clone(),
            whitelist_set(&config)?,
            config.discovery.limit,
        ));

        Ok(Self {
            config,
            keys,
            pool,
            crypto,
            registries,
            execution,
            executors,
            publisher,
            discovery,
            live_discovery: Mutex::new(None),
        })
    }

    pub fn public_key(&self) -> PublicKey {
        self.keys.public_key()
    }

    pub fn registries(&self) -> &Arc<Registries> {
        &self.registries
    }

    pub fn executors(&self) -> &Arc<Executors> {
        &self.executors
    }

    pub fn execution(&self) -> &Arc<ExecutionClient> {
        &self.execution
    }

    /// Connect, run the discovery snapshot and the private handshakes, then
    /// keep discovering live.
    pub async fn bootstrap(&self) -> Result<DiscoveryStats> {
        let mut stats = DiscoveryStats::default();
        if self.config.nostr.relay_urls.is_empty() {
            log::info!("no relays configured, skipping discovery");
            return Ok(stats);
        }

        self.pool.connect().await;

        // Discovery tolerates partial relay failure; a dead network only
        // means an empty snapshot.
        match self.discovery.discover().await {
            Ok(s) => stats = s,
            Err(e) => log::warn!("initial discovery failed: {e}"),
        }

        let private_servers = self.private_servers()?;
        if !private_servers.is_empty() {
            let handshake = Handshake::new(
                self.execution.clone(),
                self.publisher.clone(),
                self.registries.clone(),
                self.crypto.clone(),
                self.config.mcp.name.clone(),
                self.config.mcp.version.clone(),
            );
            handshake.run_all(&private_servers).await;
        }

        let handle = self.discovery.clone().start();
        if let Ok(mut guard) = self.live_discovery.lock() {
            *guard = Some(handle);
        }

        Ok(stats)
    }

    /// Serve the local endpoint over stdio until the host hangs up.
    pub async fn serve_stdio(&self) -> Result<()> {
        let endpoint = self.endpoint()?;
        endpoint
            .serve(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Build the endpoint for an arbitrary byte stream (tests drive this
    /// with an in-memory duplex).
    pub fn endpoint(&self) -> Result<McpEndpoint> {
        let builtin = if self.config.feature_flags.interactive {
            Some(BuiltinTools::new(
                self.registries.clone(),
                whitelist_set(&self.config)?,
            ))
        } else {
            None
        };
        Ok(McpEndpoint::new(
            EndpointInfo {
                name: self.config.mcp.name.clone(),
                version: self.config.mcp.version.clone(),
                about: self.config.mcp.about.clone(),
            },
            self.registries.clone(),
            self.executors.clone(),
            builtin,
        ))
    }

    /// Bootstrap, serve, and tear down.
    pub async fn run(&self) -> Result<()> {
        self.bootstrap().await?;
        let served = self.serve_stdio().await;
        self.shutdown().await;
        served
    }

    pub async fn shutdown(&self) {
        let handle = self.live_discovery.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        self.pool.close().await;
        log::info!("gateway shut down");
    }

    fn private_servers(&self) -> Result<Vec<PrivateServer>> {
        self.config
            .discovery
            .private_servers
            .iter()
            .map(|entry| {
                let provider = PublicKey::from_hex(&entry.provider_pubkey).map_err(|_| {
                    Error::Config(format!(
                        "invalid private server pubkey: {}",
                        entry.provider_pubkey
                    ))
                })?;
                Ok(PrivateServer {
                    provider,
                    server_id: entry.server_id.clone(),
                    supports_encryption: entry.supports_encryption,
                })
            })
            .collect()
    }
}

fn whitelist_set(config: &Config) -> Result<HashSet<PublicKey>> {
    config
        .whitelist
        .allowed_dvms
        .iter()
        .map(|entry| {
            PublicKey::from_hex(entry)
                .map_err(|_| Error::Config(format!("invalid whitelist pubkey: {entry}")))
        })
        .collect()
}
