//! In-process transport: records every call, hands published requests to the test, and injects
//! inbound events into every open subscription without filtering (a noisy relay).
//! Switches simulate failed connects/subscribes/publishes, a connect held open until released,
//! and a publish whose relay acknowledgement never arrives.

use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bridge_core::{
    InboundEvent, ServerKey, SigningKey, SubscriptionFilter, UnsignedEvent, RESPONSE_KIND,
};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

use crate::transport::{Subscription, SubscriptionId, Transport, TransportError};

/// One call made against the transport, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Connect(Vec<String>),
    Publish(u16),
    Subscribe(SubscriptionFilter),
    Unsubscribe(SubscriptionId),
    Disconnect,
}

#[derive(Default)]
struct State {
    calls: Vec<TransportCall>,
    connected: Vec<String>,
    published: Vec<UnsignedEvent>,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<InboundEvent>)>,
    fail_connect: Option<TransportError>,
    fail_publish: Option<TransportError>,
    fail_subscribe: Option<TransportError>,
    stall_publish: bool,
    hold_connect: bool,
    next_id: u64,
}

pub struct MemoryTransport {
    state: Mutex<State>,
    published_tx: mpsc::UnboundedSender<UnsignedEvent>,
    published_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<UnsignedEvent>>,
    connect_gate: Notify,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (published_tx, published_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(State::default()),
            published_tx,
            published_rx: tokio::sync::Mutex::new(published_rx),
            connect_gate: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.clone()
    }

    pub fn published(&self) -> Vec<UnsignedEvent> {
        self.lock().published.clone()
    }

    /// Wait for the next successfully published event.
    pub async fn next_published(&self) -> Option<UnsignedEvent> {
        self.published_rx.lock().await.recv().await
    }

    /// Push `event` to every open subscription. Returns how many received it.
    pub fn inject(&self, event: InboundEvent) -> usize {
        let state = self.lock();
        state
            .subscribers
            .iter()
            .filter(|(_, tx)| tx.send(event.clone()).is_ok())
            .count()
    }

    pub fn fail_connect(&self, err: Option<TransportError>) {
        self.lock().fail_connect = err;
    }

    pub fn fail_publish(&self, err: Option<TransportError>) {
        self.lock().fail_publish = err;
    }

    pub fn fail_subscribe(&self, err: Option<TransportError>) {
        self.lock().fail_subscribe = err;
    }

    /// Published events are still recorded and delivered to `next_published`, but `publish`
    /// itself never returns.
    pub fn stall_publish(&self, stall: bool) {
        self.lock().stall_publish = stall;
    }

    /// Make `connect` wait until `release_connect` is called.
    pub fn hold_connect(&self, hold: bool) {
        self.lock().hold_connect = hold;
    }

    pub fn release_connect(&self) {
        self.connect_gate.notify_one();
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, relays: &[String]) -> Result<(), TransportError> {
        let held = {
            let mut state = self.lock();
            state.calls.push(TransportCall::Connect(relays.to_vec()));
            state.hold_connect
        };
        if held {
            self.connect_gate.notified().await;
        }
        let mut state = self.lock();
        if let Some(err) = state.fail_connect.clone() {
            return Err(err);
        }
        state.connected = relays.to_vec();
        Ok(())
    }

    async fn publish(
        &self,
        event: UnsignedEvent,
        _signing_key: &SigningKey,
    ) -> Result<String, TransportError> {
        let (id, stall) = {
            let mut state = self.lock();
            state.calls.push(TransportCall::Publish(event.kind));
            if let Some(err) = state.fail_publish.clone() {
                return Err(err);
            }
            if state.connected.is_empty() {
                return Err(TransportError::Closed);
            }
            state.next_id += 1;
            state.published.push(event.clone());
            (format!("mem-{}", state.next_id), state.stall_publish)
        };
        let _ = self.published_tx.send(event);
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(id)
    }

    async fn subscribe(&self, filter: SubscriptionFilter) -> Result<Subscription, TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Subscribe(filter));
        if let Some(err) = state.fail_subscribe.clone() {
            return Err(err);
        }
        if state.connected.is_empty() {
            return Err(TransportError::Subscribe("no connected relays".into()));
        }
        state.next_id += 1;
        let id = SubscriptionId(format!("sub-{}", state.next_id));
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscribers.push((id.clone(), tx));
        Ok(Subscription { id, events: rx })
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Unsubscribe(id.clone()));
        state.subscribers.retain(|(sid, _)| sid != id);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.calls.push(TransportCall::Disconnect);
        state.subscribers.clear();
        state.connected.clear();
        Ok(())
    }

    fn connected_relays(&self) -> Vec<String> {
        self.lock().connected.clone()
    }
}

/// Build the response a server would publish for `request`: the request's id in both the `req`
/// tag and the body, authored by `server`.
pub fn response_to(request: &UnsignedEvent, server: &ServerKey, body: Value) -> InboundEvent {
    let req = request.tag_value("req").unwrap_or_default().to_owned();
    let mut body = body;
    if let Value::Object(map) = &mut body {
        map.insert("req".into(), Value::String(req.clone()));
    }
    InboundEvent {
        id: format!("resp-{req}"),
        pubkey: server.to_hex(),
        created_at: 0,
        kind: RESPONSE_KIND,
        tags: vec![vec!["req".into(), req]],
        content: body.to_string(),
        sig: String::new(),
    }
}
