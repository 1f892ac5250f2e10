//! Transport capability consumed by the client: relay connections, signed publication and a
//! streaming subscription. Implementations live outside this crate (see `memory` for tests).

use async_trait::async_trait;
use bridge_core::{InboundEvent, SigningKey, SubscriptionFilter, UnsignedEvent};
use tokio::sync::mpsc;

/// Handle naming one subscription on the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

/// Live subscription: events matching the filter arrive on `events` until unsubscribe or
/// disconnect closes the channel. Delivery may duplicate, reorder or include unrelated events.
pub struct Subscription {
    pub id: SubscriptionId,
    pub events: mpsc::UnboundedReceiver<InboundEvent>,
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open connections to `relays`. Succeeds if at least one relay is reachable.
    async fn connect(&self, relays: &[String]) -> Result<(), TransportError>;

    /// Sign `event` with `signing_key` and publish it to the connected relays.
    /// Returns the published event id.
    async fn publish(
        &self,
        event: UnsignedEvent,
        signing_key: &SigningKey,
    ) -> Result<String, TransportError>;

    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Relays with an open connection right now.
    fn connected_relays(&self) -> Vec<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("transport closed")]
    Closed,
}
