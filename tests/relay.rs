use std::time::Duration;

use capgate::protocol::KIND_SERVER_ANNOUNCEMENT;
use capgate::testing::server_announcement_event;
use capgate::{Error, PoolEvent, RelayPool, SubscriptionItem};
use nostr_relay_builder::prelude::*;
use nostr_sdk::prelude::*;

#[tokio::test]
async fn publish_without_relays_fails() {
    let pool = RelayPool::new(&[]).await.unwrap();
    pool.connect().await;

    let keys = Keys::generate();
    let event = server_announcement_event(&keys, "srv1", false);
    let result = pool.publish(event).await;
    assert!(matches!(result, Err(Error::NoRelayAcknowledged)));

    pool.close().await;
}

#[tokio::test]
async fn publish_and_query_round_trip() {
    let mock = MockRelay::run().await.unwrap();
    let pool = RelayPool::new(&[mock.url()]).await.unwrap();
    pool.connect().await;

    let keys = Keys::generate();
    pool.publish(server_announcement_event(&keys, "srv1", false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let events = pool
        .query(vec![Filter::new().kind(KIND_SERVER_ANNOUNCEMENT)])
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].pubkey, keys.public_key());

    pool.close().await;
}

#[tokio::test]
async fn subscription_deduplicates_across_relays() {
    let mock_a = MockRelay::run().await.unwrap();
    let mock_b = MockRelay::run().await.unwrap();
    let pool = RelayPool::new(&[mock_a.url(), mock_b.url()]).await.unwrap();
    pool.connect().await;

    let mut sub = pool
        .subscribe(vec![Filter::new()
            .kind(KIND_SERVER_ANNOUNCEMENT)
            .since(Timestamp::now())])
        .await
        .unwrap();

    // Publish the same signed event to both relays.
    let keys = Keys::generate();
    let event = server_announcement_event(&keys, "srv1", false);
    let publisher = Client::new(keys.clone());
    publisher.add_relay(mock_a.url()).await.unwrap();
    publisher.add_relay(mock_b.url()).await.unwrap();
    publisher.connect().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    publisher.send_event(event.clone()).await.unwrap();

    let mut received = 0;
    loop {
        match tokio::time::timeout(Duration::from_millis(1500), sub.next()).await {
            Ok(Some(SubscriptionItem::Event(incoming))) => {
                assert_eq!(incoming.id, event.id);
                received += 1;
            }
            Ok(Some(SubscriptionItem::EndOfStored)) => {}
            _ => break,
        }
    }
    assert_eq!(received, 1, "the same event must be delivered once");

    sub.close().await;
    pool.close().await;
}

#[tokio::test]
async fn subscription_signals_end_of_stored_backlog() {
    let mock = MockRelay::run().await.unwrap();
    let pool = RelayPool::new(&[mock.url()]).await.unwrap();
    pool.connect().await;

    let keys = Keys::generate();
    pool.publish(server_announcement_event(&keys, "srv1", false))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut sub = pool
        .subscribe(vec![Filter::new().kind(KIND_SERVER_ANNOUNCEMENT)])
        .await
        .unwrap();

    let mut saw_event = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), sub.next())
            .await
            .expect("subscription stalled")
        {
            Some(SubscriptionItem::Event(_)) => saw_event = true,
            Some(SubscriptionItem::EndOfStored) => break,
            None => panic!("subscription closed early"),
        }
    }
    assert!(saw_event, "stored backlog should arrive before EOSE");

    sub.close().await;
    pool.close().await;
}

#[tokio::test]
async fn add_relay_is_idempotent_and_broadcasts() {
    let mock_a = MockRelay::run().await.unwrap();
    let mock_b = MockRelay::run().await.unwrap();
    let pool = RelayPool::new(&[mock_a.url()]).await.unwrap();
    pool.connect().await;
    let mut events = pool.events();

    pool.add_relay(&mock_b.url()).await.unwrap();
    match events.recv().await.unwrap() {
        PoolEvent::RelayAdded(url) => assert!(url.contains(&mock_b.url())),
        other => panic!("expected RelayAdded, got {other:?}"),
    }

    // Re-adding the same URL changes nothing and emits nothing.
    pool.add_relay(&mock_b.url()).await.unwrap();
    assert!(events.try_recv().is_err());

    let statuses = pool.relay_statuses().await;
    assert_eq!(statuses.len(), 2);

    pool.close().await;
}
