//! Relay transport seam.
//!
//! The bus never touches a websocket directly; it goes through
//! [`RelayTransport`]. [`SdkTransport`] is the production implementation on a
//! single `nostr_sdk::Client` (one connection per relay, reconnects handled by
//! the SDK pool).

use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::Error;

/// What a subscription delivers, tagged with the relay it came from.
#[derive(Debug, Clone)]
pub enum RelayNotice {
    Event { relay: String, event: Box<Event> },
    Eose { relay: String },
    Closed { relay: String, reason: String },
}

#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Relay URLs in configuration order.
    fn relays(&self) -> Vec<String>;

    /// Open a subscription across all relays. The receiver ends when the
    /// transport drops the subscription, which the caller treats as a
    /// reconnect trigger.
    async fn subscribe(&self, filter: Filter) -> Result<mpsc::UnboundedReceiver<RelayNotice>, Error>;

    /// Publish to exactly one relay. `Ok` means the relay accepted the event.
    async fn publish(&self, relay: &str, event: &Event) -> Result<(), Error>;

    /// Stored events from one relay, returning at end-of-stored-events or
    /// after `timeout`.
    async fn fetch(&self, relay: &str, filter: Filter, timeout: Duration) -> Result<Vec<Event>, Error>;

    async fn close(&self);
}

#[derive(Clone)]
pub struct SdkTransport {
    client: Client,
    relays: Vec<String>,
}

impl SdkTransport {
    pub async fn connect(keys: Keys, relays: &[String]) -> Result<Self, Error> {
        let client = Client::builder().signer(keys).build();

        let mut added = Vec::with_capacity(relays.len());
        for relay in relays {
            match client.add_relay(relay).await {
                Ok(_) => added.push(relay.clone()),
                Err(err) => warn!(relay = %relay, error = %err, "Skipping relay"),
            }
        }
        if added.is_empty() {
            return Err(Error::Config("no usable relay URLs".to_string()));
        }

        client.connect().await;
        info!(relays = added.len(), "Connected nostr relay pool");
        Ok(Self {
            client,
            relays: added,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Forward pool notifications for one subscription until the pool shuts
/// down or the receiving side goes away.
async fn forward_notices(
    notifications: &mut broadcast::Receiver<RelayPoolNotification>,
    subscription_id: &SubscriptionId,
    tx: &mpsc::UnboundedSender<RelayNotice>,
) {
    loop {
        let notice = match notifications.recv().await {
            Ok(RelayPoolNotification::Event {
                relay_url,
                subscription_id: sub,
                event,
            }) if sub == *subscription_id => RelayNotice::Event {
                relay: relay_url.to_string(),
                event,
            },
            Ok(RelayPoolNotification::Message { relay_url, message }) => match message {
                RelayMessage::EndOfStoredEvents(sub) if *sub == *subscription_id => {
                    RelayNotice::Eose {
                        relay: relay_url.to_string(),
                    }
                }
                RelayMessage::Closed {
                    subscription_id: sub,
                    message,
                } if *sub == *subscription_id => RelayNotice::Closed {
                    relay: relay_url.to_string(),
                    reason: message.to_string(),
                },
                _ => continue,
            },
            Ok(RelayPoolNotification::Shutdown) => return,
            Ok(_) => continue,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Relay notifications lagged");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        if tx.send(notice).is_err() {
            return;
        }
    }
}

#[async_trait]
impl RelayTransport for SdkTransport {
    fn relays(&self) -> Vec<String> {
        self.relays.clone()
    }

    async fn subscribe(&self, filter: Filter) -> Result<mpsc::UnboundedReceiver<RelayNotice>, Error> {
        // Take the receiver before subscribing so no early event is missed.
        let mut notifications = self.client.notifications();
        let output = self.client.subscribe(filter, None).await?;
        let subscription_id = output.val;
        debug!(subscription = %subscription_id, "Subscribed");

        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.client.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = forward_notices(&mut notifications, &subscription_id, &tx) => {}
                _ = tx.closed() => {}
            }
            client.unsubscribe(&subscription_id).await;
            debug!(subscription = %subscription_id, "Unsubscribed");
        });

        Ok(rx)
    }

    async fn publish(&self, relay: &str, event: &Event) -> Result<(), Error> {
        let output = self.client.send_event_to([relay], event).await?;
        if !output.success.is_empty() {
            return Ok(());
        }
        let reason = output
            .failed
            .values()
            .next()
            .cloned()
            .unwrap_or_else(|| "no acknowledgement".to_string());
        Err(Error::RelayRejected {
            relay: relay.to_string(),
            reason,
        })
    }

    async fn fetch(&self, relay: &str, filter: Filter, timeout: Duration) -> Result<Vec<Event>, Error> {
        let events = self.client.fetch_events_from([relay], filter, timeout).await?;
        Ok(events.into_iter().collect())
    }

    async fn close(&self) {
        let _ = self.client.disconnect().await;
    }
}
