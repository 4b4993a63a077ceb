//! MCP capability gateway over Nostr relays.
//!
//! Providers announce tool, resource, and prompt capabilities as Nostr
//! events; the gateway discovers them, aggregates them into local
//! registries, and exposes the combined set to a host application as an
//! MCP server over stdio. Invocations are forwarded as signed (optionally
//! gift-wrapped) request events and correlated with their responses across
//! the relay pool.

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod execution;
pub mod gateway;
pub mod keys;
pub mod mcp;
pub mod payment;
pub mod protocol;
pub mod publisher;
pub mod registry;
pub mod relay;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::Config;
pub use crypto::{EncryptionEngine, EncryptionMode, Unwrapped};
pub use discovery::handshake::{Handshake, PrivateServer, HANDSHAKE_STEP_TIMEOUT};
pub use discovery::{DiscoveryService, DiscoveryStats};
pub use error::{Error, Result};
pub use execution::{
    CallOutcome, CompletionReference, ExecutionClient, Executors, OutgoingRequest, PingResult,
    ResponseEvent, EXECUTE_TIMEOUT,
};
pub use gateway::Gateway;
pub use keys::KeyManager;
pub use mcp::{BuiltinTools, EndpointInfo, McpEndpoint};
pub use payment::{InvoicePayer, NwcPayer, PAYMENT_TIMEOUT};
pub use publisher::{EventPublisher, PublishOptions};
pub use registry::{
    CapabilityEntry, CapabilityRegistry, Registries, RegistryEvent, RegistryKind, ServerInfo,
    ServerRegistry,
};
pub use relay::{PoolEvent, PoolSubscription, RelayPool, SubscriptionItem};
