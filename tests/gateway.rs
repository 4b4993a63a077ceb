use std::time::Duration;

use capgate::config::{
    Config, DiscoveryConfig, NostrConfig, PrivateServerEntry, WhitelistConfig,
};
use capgate::testing::{echo_tool_json, server_announcement_event, tools_list_event, ProviderBehavior, TestProvider};
use capgate::Gateway;
use nostr_relay_builder::prelude::*;
use nostr_sdk::prelude::*;

fn base_config(mock_url: &str) -> Config {
    Config {
        nostr: NostrConfig {
            private_key: Keys::generate().secret_key().to_secret_hex(),
            relay_urls: vec![mock_url.to_string()],
        },
        ..Default::default()
    }
}

#[tokio::test]
async fn bootstrap_discovers_public_and_private_servers() {
    let mock = MockRelay::run().await.unwrap();

    // A public provider, announced ahead of time.
    let public_provider = Keys::generate();
    let seeder = Client::new(public_provider.clone());
    seeder.add_relay(mock.url()).await.unwrap();
    seeder.connect().await;
    seeder
        .send_event(server_announcement_event(&public_provider, "public-1", false))
        .await
        .unwrap();
    seeder
        .send_event(tools_list_event(
            &public_provider,
            "public-1",
            vec![echo_tool_json()],
        ))
        .await
        .unwrap();

    // A private provider, reachable only through the handshake.
    let private_provider = TestProvider::spawn(
        &mock.url(),
        Keys::generate(),
        ProviderBehavior {
            server_id: "private-1".to_string(),
            ..Default::default()
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut config = base_config(&mock.url());
    config.encryption.mode = capgate::EncryptionMode::Disabled;
    config.discovery = DiscoveryConfig {
        limit: None,
        private_servers: vec![PrivateServerEntry {
            provider_pubkey: private_provider.keys.public_key().to_hex(),
            server_id: None,
            supports_encryption: Some(false),
        }],
    };

    let gateway = Gateway::new(config).await.unwrap();
    gateway.bootstrap().await.unwrap();

    let servers = gateway.registries().servers.list_servers_with_ids();
    let ids: Vec<&str> = servers.iter().map(|(id, _)| id.as_str()).collect();
    assert!(ids.contains(&"public-1"), "public server missing: {ids:?}");
    assert!(ids.contains(&"private-1"), "private server missing: {ids:?}");

    // One echo tool per provider, distinguished by pubkey suffix.
    assert_eq!(gateway.registries().tools.len(), 2);
    assert_eq!(gateway.execution().pending_count(), 0);

    gateway.shutdown().await;
}

#[tokio::test]
async fn bootstrap_applies_whitelist() {
    let mock = MockRelay::run().await.unwrap();

    let outsider = Keys::generate();
    let seeder = Client::new(outsider.clone());
    seeder.add_relay(mock.url()).await.unwrap();
    seeder.connect().await;
    seeder
        .send_event(server_announcement_event(&outsider, "evil", false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut config = base_config(&mock.url());
    config.whitelist = WhitelistConfig {
        allowed_dvms: vec![Keys::generate().public_key().to_hex()],
    };

    let gateway = Gateway::new(config).await.unwrap();
    gateway.bootstrap().await.unwrap();

    assert!(gateway.registries().servers.is_empty());
    gateway.shutdown().await;
}

#[tokio::test]
async fn invalid_private_key_fails_construction() {
    let config = Config {
        nostr: NostrConfig {
            private_key: "tooshort".to_string(),
            relay_urls: vec!["wss://relay.example".to_string()],
        },
        ..Default::default()
    };
    assert!(Gateway::new(config).await.is_err());
}
