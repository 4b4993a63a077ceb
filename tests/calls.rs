//! Per-capability executor coverage: resources, prompts, completion, and
//! the error-notification path.

use std::sync::Arc;
use std::time::Duration;

use capgate::protocol::{
    capability_id, PromptArgument, PromptDef, ResourceDef, ResourceTemplateDef,
};
use capgate::testing::{ProviderBehavior, TestProvider};
use capgate::{
    CompletionReference, EncryptionEngine, EncryptionMode, Error, ExecutionClient, Executors,
    KeyManager, Registries, RelayPool,
};
use nostr_relay_builder::prelude::*;
use nostr_sdk::prelude::*;
use serde_json::json;

struct Stack {
    pool: Arc<RelayPool>,
    registries: Arc<Registries>,
    executors: Executors,
}

async fn setup(mock_url: &str) -> Stack {
    let keys = Arc::new(KeyManager::generate());
    let pool = Arc::new(RelayPool::new(&[mock_url.to_string()]).await.unwrap());
    pool.connect().await;
    let crypto = Arc::new(EncryptionEngine::new(EncryptionMode::Optional));
    let registries = Arc::new(Registries::new());
    let client = Arc::new(ExecutionClient::new(
        keys,
        pool.clone(),
        crypto,
        registries.clone(),
        None,
    ));
    let executors = Executors::new(client, registries.clone());
    Stack {
        pool,
        registries,
        executors,
    }
}

fn register_server(stack: &Stack, provider: &PublicKey, server_id: &str, completions: bool) {
    let mut capabilities = json!({ "tools": {} });
    if completions {
        capabilities["completions"] = json!({});
    }
    stack.registries.servers.register(
        server_id.to_string(),
        *provider,
        json!({ "capabilities": capabilities }),
        false,
        Timestamp::now(),
    );
}

#[tokio::test]
async fn read_concrete_resource() {
    let mock = MockRelay::run().await.unwrap();
    let stack = setup(&mock.url()).await;

    let provider =
        TestProvider::spawn(&mock.url(), Keys::generate(), ProviderBehavior::default()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    stack.registries.resources.register(
        capability_id("readme", &provider.keys.public_key()),
        ResourceDef {
            uri: "file:///readme".to_string(),
            name: "readme".to_string(),
            description: None,
            mime_type: Some("text/plain".to_string()),
        },
        provider.keys.public_key(),
        Some("srv1".to_string()),
    );

    let result = stack
        .executors
        .read_resource("file:///readme", None)
        .await
        .unwrap();
    assert_eq!(result["contents"][0]["uri"], "file:///readme");
    assert_eq!(result["contents"][0]["text"], "contents of file:///readme");

    stack.pool.close().await;
}

#[tokio::test]
async fn read_resource_through_template_prefix() {
    let mock = MockRelay::run().await.unwrap();
    let stack = setup(&mock.url()).await;

    let provider =
        TestProvider::spawn(&mock.url(), Keys::generate(), ProviderBehavior::default()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    stack.registries.resource_templates.register(
        capability_id("logs", &provider.keys.public_key()),
        ResourceTemplateDef {
            uri_template: "file:///logs/{date}.log".to_string(),
            name: "logs".to_string(),
            description: None,
            mime_type: None,
        },
        provider.keys.public_key(),
        Some("srv1".to_string()),
    );

    // No concrete registration matches; the template's prefix does.
    let result = stack
        .executors
        .read_resource("file:///logs/2026-08-01.log", None)
        .await
        .unwrap();
    assert_eq!(
        result["contents"][0]["text"],
        "contents of file:///logs/2026-08-01.log"
    );

    stack.pool.close().await;
}

#[tokio::test]
async fn unknown_resource_uri_is_rejected_locally() {
    let mock = MockRelay::run().await.unwrap();
    let stack = setup(&mock.url()).await;

    let result = stack.executors.read_resource("file:///nowhere", None).await;
    assert!(matches!(result, Err(Error::UnknownCapability(_))));
    stack.pool.close().await;
}

#[tokio::test]
async fn get_prompt_round_trips() {
    let mock = MockRelay::run().await.unwrap();
    let stack = setup(&mock.url()).await;

    let provider =
        TestProvider::spawn(&mock.url(), Keys::generate(), ProviderBehavior::default()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let id = capability_id("greet", &provider.keys.public_key());
    stack.registries.prompts.register(
        id.clone(),
        PromptDef {
            name: "greet".to_string(),
            description: Some("Say hello".to_string()),
            arguments: vec![PromptArgument {
                name: "who".to_string(),
                description: None,
                required: Some(true),
            }],
        },
        provider.keys.public_key(),
        Some("srv1".to_string()),
    );

    let result = stack
        .executors
        .get_prompt(&id, json!({ "who": "world" }))
        .await
        .unwrap();
    assert_eq!(result["description"], "prompt greet");
    assert_eq!(result["messages"][0]["role"], "user");

    stack.pool.close().await;
}

#[tokio::test]
async fn completion_requires_server_capability() {
    let mock = MockRelay::run().await.unwrap();
    let stack = setup(&mock.url()).await;

    let provider =
        TestProvider::spawn(&mock.url(), Keys::generate(), ProviderBehavior::default()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let id = capability_id("greet", &provider.keys.public_key());
    stack.registries.prompts.register(
        id.clone(),
        PromptDef {
            name: "greet".to_string(),
            description: None,
            arguments: vec![],
        },
        provider.keys.public_key(),
        Some("srv1".to_string()),
    );

    // Server without the completions capability: rejected before the wire.
    register_server(&stack, &provider.keys.public_key(), "srv1", false);
    let result = stack
        .executors
        .complete(
            CompletionReference::Prompt { name: id.clone() },
            json!({ "name": "who", "value": "wo" }),
        )
        .await;
    assert!(matches!(result, Err(Error::Execution(_))));

    // Re-announce with completions: the call goes through, and the wire
    // reference carries the announced prompt name, not the registry id.
    register_server(&stack, &provider.keys.public_key(), "srv1", true);
    let result = stack
        .executors
        .complete(
            CompletionReference::Prompt { name: id },
            json!({ "name": "who", "value": "wo" }),
        )
        .await
        .unwrap();
    assert_eq!(result["completion"]["values"][0], "greet-alpha");

    stack.pool.close().await;
}

#[tokio::test]
async fn error_notification_fails_the_call() {
    let mock = MockRelay::run().await.unwrap();
    let stack = setup(&mock.url()).await;

    let provider = TestProvider::spawn(
        &mock.url(),
        Keys::generate(),
        ProviderBehavior {
            notify_error: true,
            ..Default::default()
        },
    )
    .await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let id = capability_id("test-echo", &provider.keys.public_key());
    stack.registries.tools.register(
        id.clone(),
        capgate::protocol::ToolDef {
            name: "test-echo".to_string(),
            description: None,
            input_schema: json!({ "type": "object" }),
        },
        provider.keys.public_key(),
        Some("srv1".to_string()),
    );

    let result = stack.executors.call_tool(&id, json!({ "text": "x" })).await;
    assert!(matches!(result, Err(Error::Notification(_))));

    stack.pool.close().await;
}

#[tokio::test]
async fn provider_tool_error_surfaces_as_execution_error() {
    let mock = MockRelay::run().await.unwrap();
    let stack = setup(&mock.url()).await;

    let provider =
        TestProvider::spawn(&mock.url(), Keys::generate(), ProviderBehavior::default()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Registered locally under a name the provider does not serve; the
    // provider answers with isError=true.
    let id = capability_id("bogus", &provider.keys.public_key());
    stack.registries.tools.register(
        id.clone(),
        capgate::protocol::ToolDef {
            name: "bogus".to_string(),
            description: None,
            input_schema: json!({ "type": "object" }),
        },
        provider.keys.public_key(),
        Some("srv1".to_string()),
    );

    let result = stack.executors.call_tool(&id, json!({})).await;
    assert!(matches!(result, Err(Error::Execution(_))));

    stack.pool.close().await;
}
