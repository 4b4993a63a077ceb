use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use capgate::protocol::capability_id;
use capgate::testing::{
    echo_tool_json, prompts_list_event, resources_list_event, server_announcement_event,
    tools_list_event,
};
use capgate::{DiscoveryService, Registries, RelayPool};
use nostr_relay_builder::prelude::*;
use nostr_sdk::prelude::*;
use serde_json::json;

async fn setup(
    mock_url: &str,
    whitelist: HashSet<PublicKey>,
) -> (Arc<RelayPool>, Arc<Registries>, DiscoveryService) {
    let pool = Arc::new(RelayPool::new(&[mock_url.to_string()]).await.unwrap());
    pool.connect().await;
    let registries = Arc::new(Registries::new());
    let service = DiscoveryService::new(pool.clone(), registries.clone(), whitelist, None);
    (pool, registries, service)
}

async fn publisher(mock_url: &str, keys: &Keys) -> Client {
    let client = Client::new(keys.clone());
    client.add_relay(mock_url).await.unwrap();
    client.connect().await;
    client
}

#[tokio::test]
async fn discover_then_echo_registers_tool() {
    let mock = MockRelay::run().await.unwrap();
    let (pool, registries, service) = setup(&mock.url(), HashSet::new()).await;

    let provider = Keys::generate();
    let client = publisher(&mock.url(), &provider).await;
    client
        .send_event(server_announcement_event(&provider, "srv1", false))
        .await
        .unwrap();
    client
        .send_event(tools_list_event(&provider, "srv1", vec![echo_tool_json()]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = service.discover().await.unwrap();
    assert_eq!(stats.servers, 1);
    assert_eq!(stats.tools, 1);

    let expected_id = capability_id("test-echo", &provider.public_key());
    let tools = registries.tools.list_with_ids();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].0, expected_id);
    assert_eq!(
        tools[0].1.capability.description.as_deref(),
        Some("Echo test tool")
    );
    assert_eq!(tools[0].1.server_id.as_deref(), Some("srv1"));

    // The announcement's capabilities object is parsed and cached.
    assert!(registries.servers.supports_completions("srv1"));

    pool.close().await;
}

#[tokio::test]
async fn whitelist_drops_unlisted_provider() {
    let mock = MockRelay::run().await.unwrap();

    let allowed = Keys::generate();
    let outsider = Keys::generate();
    let whitelist: HashSet<PublicKey> = [allowed.public_key()].into_iter().collect();
    let (pool, registries, service) = setup(&mock.url(), whitelist).await;

    let client = publisher(&mock.url(), &outsider).await;
    client
        .send_event(server_announcement_event(&outsider, "evil", false))
        .await
        .unwrap();
    client
        .send_event(tools_list_event(&outsider, "evil", vec![echo_tool_json()]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = service.discover().await.unwrap();
    assert_eq!(stats.servers, 0);
    assert_eq!(stats.tools, 0);
    assert!(registries.tools.is_empty());
    assert!(registries.servers.is_empty());

    pool.close().await;
}

#[tokio::test]
async fn template_lists_route_to_template_registry() {
    let mock = MockRelay::run().await.unwrap();
    let (pool, registries, service) = setup(&mock.url(), HashSet::new()).await;

    let provider = Keys::generate();
    let client = publisher(&mock.url(), &provider).await;
    client
        .send_event(server_announcement_event(&provider, "srv1", false))
        .await
        .unwrap();
    client
        .send_event(resources_list_event(
            &provider,
            "srv1",
            json!({ "resources": [ { "uri": "file:///readme", "name": "readme" } ] }),
            false,
        ))
        .await
        .unwrap();
    client
        .send_event(resources_list_event(
            &provider,
            "srv1",
            json!({ "resourceTemplates": [ { "uriTemplate": "file:///logs/{date}", "name": "logs" } ] }),
            true,
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = service.discover().await.unwrap();
    assert_eq!(stats.resources, 1);
    assert_eq!(stats.resource_templates, 1);
    assert_eq!(registries.resources.len(), 1);
    assert_eq!(registries.resource_templates.len(), 1);

    pool.close().await;
}

#[tokio::test]
async fn malformed_events_are_skipped_without_aborting() {
    let mock = MockRelay::run().await.unwrap();
    let (pool, registries, service) = setup(&mock.url(), HashSet::new()).await;

    let provider = Keys::generate();
    let client = publisher(&mock.url(), &provider).await;

    client
        .send_event(server_announcement_event(&provider, "srv1", false))
        .await
        .unwrap();
    // Garbage content on a valid kind.
    client
        .send_event(
            EventBuilder::new(capgate::protocol::KIND_TOOLS_LIST, "not json at all")
                .tags(vec![
                    Tag::identifier("srv1/tools/list-bad"),
                    Tag::parse(["s", "srv1"]).unwrap(),
                ])
                .sign_with_keys(&provider)
                .unwrap(),
        )
        .await
        .unwrap();
    // A tools list without an s tag.
    client
        .send_event(
            EventBuilder::new(
                capgate::protocol::KIND_TOOLS_LIST,
                json!({ "tools": [echo_tool_json()] }).to_string(),
            )
            .tags(vec![Tag::identifier("srv1/tools/list-untagged")])
            .sign_with_keys(&provider)
            .unwrap(),
        )
        .await
        .unwrap();
    // And finally a valid one; the batch must get this far.
    client
        .send_event(tools_list_event(&provider, "srv1", vec![echo_tool_json()]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let stats = service.discover().await.unwrap();
    assert_eq!(stats.tools, 1);
    assert_eq!(stats.skipped, 2);
    assert_eq!(registries.tools.len(), 1);

    pool.close().await;
}

#[tokio::test]
async fn repeated_discovery_is_idempotent() {
    let mock = MockRelay::run().await.unwrap();
    let (pool, registries, service) = setup(&mock.url(), HashSet::new()).await;

    let provider = Keys::generate();
    let client = publisher(&mock.url(), &provider).await;
    client
        .send_event(server_announcement_event(&provider, "srv1", false))
        .await
        .unwrap();
    client
        .send_event(tools_list_event(&provider, "srv1", vec![echo_tool_json()]))
        .await
        .unwrap();
    client
        .send_event(prompts_list_event(
            &provider,
            "srv1",
            vec![json!({ "name": "greet", "description": "Say hello" })],
        ))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    service.discover().await.unwrap();
    let first = (
        registries.tools.len(),
        registries.prompts.len(),
        registries.servers.len(),
    );
    service.discover().await.unwrap();
    let second = (
        registries.tools.len(),
        registries.prompts.len(),
        registries.servers.len(),
    );
    assert_eq!(first, second);
    assert_eq!(first, (1, 1, 1));

    pool.close().await;
}

#[tokio::test]
async fn live_subscription_feeds_classifier() {
    let mock = MockRelay::run().await.unwrap();
    let (pool, registries, service) = setup(&mock.url(), HashSet::new()).await;
    let service = Arc::new(service);

    let mut registry_events = registries.subscribe();
    let handle = service.clone().start();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let provider = Keys::generate();
    let client = publisher(&mock.url(), &provider).await;
    client
        .send_event(server_announcement_event(&provider, "srv-live", false))
        .await
        .unwrap();
    client
        .send_event(tools_list_event(&provider, "srv-live", vec![echo_tool_json()]))
        .await
        .unwrap();

    // Wait until the tool registration lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        tokio::select! {
            event = registry_events.recv() => {
                if event.is_ok() && !registries.tools.is_empty() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => panic!("live discovery never registered the tool"),
        }
    }

    assert_eq!(registries.tools.len(), 1);
    handle.abort();
    pool.close().await;
}
