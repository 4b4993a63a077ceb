//! Relay pool: best-effort connections to N relays with publish fan-out,
//! multiplexed subscriptions, and a background reconnect monitor.
//!
//! The pool owns the underlying [`nostr_sdk::Client`]; everything else in
//! the gateway goes through this API. Pool-level happenings (reconnects,
//! relay additions) are fanned out over a broadcast channel so long-lived
//! subscribers can re-establish their views.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use nostr_sdk::prelude::*;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Interval between reconnect sweeps.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Per-relay dial timeout.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace timeout for one-shot queries.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Pool-level happenings surfaced to subscribers.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    /// A previously dead relay connection was re-established.
    Reconnected(String),
    /// A new relay joined the pool; existing subscriptions should re-assert
    /// their filters to cover it.
    RelayAdded(String),
}

pub struct RelayPool {
    client: Client,
    tx: broadcast::Sender<PoolEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RelayPool {
    /// Build a pool over the given relay URLs. Does not connect yet.
    pub async fn new(urls: &[String]) -> Result<Self> {
        let client = Client::default();
        for url in urls {
            client.add_relay(url.as_str()).await?;
        }
        let (tx, _rx) = broadcast::channel(64);
        Ok(Self {
            client,
            tx,
            monitor: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Dial every configured relay and start the reconnect monitor.
    pub async fn connect(&self) {
        self.client.connect_with_timeout(DIAL_TIMEOUT).await;
        let handle = tokio::spawn(run_reconnect_monitor(
            self.client.clone(),
            self.tx.clone(),
        ));
        if let Ok(mut guard) = self.monitor.lock() {
            *guard = Some(handle);
        }
    }

    /// Receiver for pool-level events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.tx.subscribe()
    }

    /// Publish to all live relays. Succeeds iff at least one acknowledges.
    pub async fn publish(&self, event: Event) -> Result<EventId> {
        let output = self
            .client
            .send_event(event)
            .await
            .map_err(|_| Error::NoRelayAcknowledged)?;
        if output.success.is_empty() {
            return Err(Error::NoRelayAcknowledged);
        }
        Ok(*output.id())
    }

    /// Open a multiplexed subscription across all relays.
    pub async fn subscribe(&self, filters: Vec<Filter>) -> Result<PoolSubscription> {
        let id = SubscriptionId::generate();
        let rx = self.client.notifications();
        let relay_count = self.client.relays().await.len().max(1);
        self.client
            .subscribe_with_id(id.clone(), filters, None)
            .await?;
        Ok(PoolSubscription {
            id,
            client: self.client.clone(),
            rx,
            seen: HashSet::new(),
            eose_pending: relay_count,
            eose_sent: false,
            closed: false,
        })
    }

    /// One-shot query: collect matching events until EOSE on every relay or
    /// the grace timeout, de-duplicated by event id.
    pub async fn query(&self, filters: Vec<Filter>) -> Result<Vec<Event>> {
        let events = self.client.fetch_events(filters, QUERY_TIMEOUT).await?;
        Ok(events.into_iter().collect())
    }

    /// Idempotently add a relay URL. New URLs are dialled immediately and a
    /// [`PoolEvent::RelayAdded`] is broadcast so subscribers re-assert their
    /// filters.
    pub async fn add_relay(&self, url: &str) -> Result<()> {
        let added = self.client.add_relay(url).await?;
        if !added {
            return Ok(());
        }
        if let Err(e) = self.client.connect_relay(url).await {
            log::warn!("dial failed for newly added relay {url}: {e}");
        }
        let _ = self.tx.send(PoolEvent::RelayAdded(url.to_string()));
        Ok(())
    }

    /// Per-relay liveness: `(url, connected)`.
    pub async fn relay_statuses(&self) -> Vec<(String, bool)> {
        self.client
            .relays()
            .await
            .into_iter()
            .map(|(url, relay)| (url.to_string(), relay.status() == RelayStatus::Connected))
            .collect()
    }

    /// Tear down all connections and subscriptions.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.monitor.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            handle.abort();
        }
        if let Err(e) = self.client.disconnect().await {
            log::debug!("disconnect during close: {e}");
        }
    }

    /// Direct access for components that need raw client features.
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Items yielded by a [`PoolSubscription`].
#[derive(Debug)]
pub enum SubscriptionItem {
    Event(Box<Event>),
    /// Every relay has drained its stored backlog.
    EndOfStored,
}

/// A live subscription over the pool. De-duplicates by event id across
/// relays. Owned by whoever opened it; dropped or closed by the same.
pub struct PoolSubscription {
    id: SubscriptionId,
    client: Client,
    rx: broadcast::Receiver<RelayPoolNotification>,
    seen: HashSet<EventId>,
    eose_pending: usize,
    eose_sent: bool,
    closed: bool,
}

impl PoolSubscription {
    /// Next item, or `None` once the pool shuts down.
    pub async fn next(&mut self) -> Option<SubscriptionItem> {
        loop {
            match self.rx.recv().await {
                Ok(RelayPoolNotification::Event {
                    subscription_id,
                    event,
                    ..
                }) if subscription_id == self.id => {
                    if self.seen.insert(event.id) {
                        return Some(SubscriptionItem::Event(event));
                    }
                }
                Ok(RelayPoolNotification::Message { message, .. }) => {
                    if let RelayMessage::EndOfStoredEvents(sid) = message {
                        if sid == self.id && !self.eose_sent {
                            self.eose_pending = self.eose_pending.saturating_sub(1);
                            if self.eose_pending == 0 {
                                self.eose_sent = true;
                                return Some(SubscriptionItem::EndOfStored);
                            }
                        }
                    }
                }
                Ok(RelayPoolNotification::Shutdown) => return None,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("subscription {} lagged, skipped {skipped} notifications", self.id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Close the subscription on every relay.
    pub async fn close(mut self) {
        self.closed = true;
        self.client.unsubscribe(self.id.clone()).await;
    }
}

impl Drop for PoolSubscription {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let client = self.client.clone();
        let id = self.id.clone();
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(async move {
                client.unsubscribe(id).await;
            });
        }
    }
}

/// Wakes every [`RECONNECT_INTERVAL`]; re-dials any relay that is not
/// connected and broadcasts [`PoolEvent::Reconnected`] on success.
async fn run_reconnect_monitor(client: Client, tx: broadcast::Sender<PoolEvent>) {
    let mut tick = tokio::time::interval(RECONNECT_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; skip it so the initial connect settles.
    tick.tick().await;
    loop {
        tick.tick().await;
        for (url, relay) in client.relays().await {
            if relay.status() == RelayStatus::Connected {
                continue;
            }
            let dial = tokio::time::timeout(DIAL_TIMEOUT, client.connect_relay(url.to_string()));
            match dial.await {
                Ok(Ok(())) => {
                    if relay.status() == RelayStatus::Connected {
                        log::info!("relay reconnected: {url}");
                        let _ = tx.send(PoolEvent::Reconnected(url.to_string()));
                    }
                }
                Ok(Err(e)) => log::debug!("re-dial {url} failed: {e}"),
                Err(_) => log::debug!("re-dial {url} timed out"),
            }
        }
    }
}
