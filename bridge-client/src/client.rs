//! Protocol client: pairing/connect lifecycle, correlated request/response calls, delivery loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bridge_core::{
    body_correlation_id, decode_response, encode_request, Balance, BroadcastResult,
    CorrelationId, EnvelopeError, FeeEstimates, InboundEvent, NoiseFilter, OperationType,
    PairingDescriptor, ResultVariant, ServerKey, SigningKey, SubscriptionFilter, Utxo, Verdict,
};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::pending::PendingCalls;
use crate::transport::{SubscriptionId, Transport};

/// Default deadline for one request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default cap on addresses in one balance or UTXO request.
pub const DEFAULT_MAX_ADDRESSES: usize = 20;

/// Per-client tunables. Built from `Config` by the binary; tests construct it directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    pub request_timeout: Duration,
    pub max_addresses_per_request: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_addresses_per_request: DEFAULT_MAX_ADDRESSES,
        }
    }
}

/// Lifecycle. `Disconnected` is terminal; pair again with a new client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

/// Snapshot of the session as seen by callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub connected: bool,
    pub server_key: Option<ServerKey>,
    pub relays: Vec<String>,
    pub connected_relays: Vec<String>,
    /// Unix seconds of the last connect, publish or resolved response.
    pub last_activity: Option<u64>,
}

/// Counters for what the delivery loop did with inbound events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub resolved: u64,
    /// Right server and kind, but no live id: unrelated or duplicate.
    pub unmatched: u64,
    /// Wrong kind or author, oversized, or no id at all.
    pub noise: u64,
    pub malformed: u64,
    pub server_errors: u64,
}

#[derive(Default)]
struct DeliveryCounters {
    resolved: AtomicU64,
    unmatched: AtomicU64,
    noise: AtomicU64,
    malformed: AtomicU64,
    server_errors: AtomicU64,
}

impl DeliveryCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DeliveryStats {
        DeliveryStats {
            resolved: self.resolved.load(Ordering::Relaxed),
            unmatched: self.unmatched.load(Ordering::Relaxed),
            noise: self.noise.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// State shared between the client and its delivery loop task.
struct Shared {
    pending: PendingCalls,
    state: Mutex<ClientState>,
    session: Mutex<SessionState>,
    stats: DeliveryCounters,
}

impl Shared {
    fn touch(&self) {
        lock(&self.session).last_activity = Some(unix_now());
    }

    /// Route one inbound event. Never fails: anything that is not a usable response for a live
    /// id is counted and dropped.
    fn deliver(&self, filter: &NoiseFilter, event: &InboundEvent) {
        let id = match filter.check(event, |id| self.pending.is_live(id)) {
            Verdict::Matched(id) => id,
            Verdict::Untagged => match body_correlation_id(&event.content) {
                Some(id) if self.pending.is_live(id.as_str()) => id,
                Some(_) => {
                    DeliveryCounters::bump(&self.stats.unmatched);
                    tracing::trace!(event = %event.id, "untagged response for unknown id");
                    return;
                }
                None => {
                    DeliveryCounters::bump(&self.stats.noise);
                    return;
                }
            },
            Verdict::Drop(reason) => {
                if reason.is_unmatched() {
                    DeliveryCounters::bump(&self.stats.unmatched);
                } else {
                    DeliveryCounters::bump(&self.stats.noise);
                }
                tracing::trace!(event = %event.id, ?reason, "dropped relay event");
                return;
            }
        };

        // Resolved or expired between the filter and here.
        let Some(operation) = self.pending.operation_of(id.as_str()) else {
            DeliveryCounters::bump(&self.stats.unmatched);
            return;
        };

        match decode_response(operation, &event.content) {
            Ok(variant) => {
                if self.pending.resolve(id.as_str(), Ok(variant)) {
                    DeliveryCounters::bump(&self.stats.resolved);
                    self.touch();
                    tracing::debug!(req = %id, %operation, "response resolved");
                } else {
                    DeliveryCounters::bump(&self.stats.unmatched);
                }
            }
            Err(EnvelopeError::Server(msg)) => {
                tracing::warn!(req = %id, %operation, error = %msg, "server reported failure");
                if self
                    .pending
                    .resolve(id.as_str(), Err(ClientError::ServerError(msg)))
                {
                    DeliveryCounters::bump(&self.stats.server_errors);
                    self.touch();
                }
            }
            Err(e) => {
                // Leave the call pending: another relay's copy may still parse.
                DeliveryCounters::bump(&self.stats.malformed);
                tracing::warn!(req = %id, %operation, error = %e, "dropping malformed response");
            }
        }
    }
}

async fn delivery_loop(
    shared: Arc<Shared>,
    filter: NoiseFilter,
    mut events: mpsc::UnboundedReceiver<InboundEvent>,
) {
    while let Some(event) = events.recv().await {
        shared.deliver(&filter, &event);
    }
    tracing::debug!("response subscription closed");
}

struct Delivery {
    subscription: SubscriptionId,
    task: JoinHandle<()>,
}

/// One paired session with a BalanceBridge server. Owned value; create one per session.
pub struct ProtocolClient<T: Transport> {
    transport: Arc<T>,
    options: ClientOptions,
    shared: Arc<Shared>,
    delivery: Mutex<Option<Delivery>>,
}

impl<T: Transport> ProtocolClient<T> {
    pub fn new(transport: Arc<T>, options: ClientOptions) -> Self {
        Self {
            transport,
            options,
            shared: Arc::new(Shared {
                pending: PendingCalls::new(),
                state: Mutex::new(ClientState::Uninitialized),
                session: Mutex::new(SessionState::default()),
                stats: DeliveryCounters::default(),
            }),
            delivery: Mutex::new(None),
        }
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn state(&self) -> ClientState {
        *lock(&self.shared.state)
    }

    pub fn session(&self) -> SessionState {
        lock(&self.shared.session).clone()
    }

    /// Requests awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Deadline timers not yet released.
    pub fn live_timers(&self) -> usize {
        self.shared.pending.live_timers()
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.shared.stats.snapshot()
    }

    /// Validate the pairing descriptor, connect to its relays and open the single response
    /// subscription. Validation failures return `InvalidPairing` with no transport activity.
    pub async fn initialize(&self, descriptor: &PairingDescriptor) -> Result<(), ClientError> {
        let server = {
            let mut state = lock(&self.shared.state);
            if *state != ClientState::Uninitialized {
                return Err(ClientError::InvalidState(format!(
                    "initialize called while {:?}",
                    *state
                )));
            }
            let server = descriptor.validate()?;
            *state = ClientState::Connecting;
            server
        };
        tracing::info!(
            server = %server.fingerprint(),
            relays = descriptor.relays.len(),
            "connecting to relays"
        );

        if let Err(e) = self.transport.connect(&descriptor.relays).await {
            tracing::warn!(error = %e, "relay connect failed");
            *lock(&self.shared.state) = ClientState::Disconnected;
            return Err(e.into());
        }
        let subscription = match self
            .transport
            .subscribe(SubscriptionFilter::responses_from(&server))
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "response subscription failed");
                *lock(&self.shared.state) = ClientState::Disconnected;
                if let Err(e) = self.transport.disconnect().await {
                    tracing::debug!(error = %e, "transport disconnect after failed subscribe");
                }
                return Err(e.into());
            }
        };

        let task = tokio::spawn(delivery_loop(
            Arc::clone(&self.shared),
            NoiseFilter::new(&server),
            subscription.events,
        ));
        let connected_relays = self.transport.connected_relays();
        let raced = {
            let mut state = lock(&self.shared.state);
            if *state == ClientState::Connecting {
                *lock(&self.delivery) = Some(Delivery {
                    subscription: subscription.id,
                    task,
                });
                *lock(&self.shared.session) = SessionState {
                    connected: true,
                    server_key: Some(server.clone()),
                    relays: descriptor.relays.clone(),
                    connected_relays: connected_relays.clone(),
                    last_activity: Some(unix_now()),
                };
                *state = ClientState::Connected;
                None
            } else {
                Some((subscription.id, task))
            }
        };
        if let Some((subscription, task)) = raced {
            // disconnect() ran while we were connecting.
            task.abort();
            if let Err(e) = self.transport.unsubscribe(&subscription).await {
                tracing::warn!(error = %e, "unsubscribe failed after disconnect during connect");
            }
            if let Err(e) = self.transport.disconnect().await {
                tracing::warn!(error = %e, "transport disconnect failed after disconnect during connect");
            }
            tracing::info!(server = %server.fingerprint(), "disconnected while connecting");
            return Err(ClientError::NotConnected);
        }
        tracing::info!(
            server = %server.fingerprint(),
            connected = connected_relays.len(),
            "session connected"
        );
        Ok(())
    }

    fn connected_server(&self) -> Result<ServerKey, ClientError> {
        if self.state() != ClientState::Connected {
            return Err(ClientError::NotConnected);
        }
        lock(&self.shared.session)
            .server_key
            .clone()
            .ok_or(ClientError::NotConnected)
    }

    /// Send one request and wait for its response, deadline, or disconnect.
    pub async fn send_request(
        &self,
        operation: OperationType,
        params: Map<String, Value>,
        signing_key: &SigningKey,
    ) -> Result<ResultVariant, ClientError> {
        let server = self.connected_server()?;
        let id = CorrelationId::generate();
        let event = encode_request(&id, &server, operation, params)?;
        let mut rx = self
            .shared
            .pending
            .register(id.clone(), operation, self.options.request_timeout)?;

        // The waiter settles on response, deadline or disconnect even while a relay is still
        // acknowledging the publish; the publish is dropped in that case.
        tokio::select! {
            outcome = &mut rx => return outcome.unwrap_or(Err(ClientError::NotConnected)),
            published = self.transport.publish(event, signing_key) => match published {
                Ok(event_id) => {
                    self.shared.touch();
                    tracing::debug!(req = %id, %operation, event = %event_id, "request published");
                }
                Err(e) => {
                    if self.shared.pending.cancel(id.as_str()) {
                        tracing::warn!(req = %id, %operation, error = %e, "publish failed");
                        return Err(e.into());
                    }
                    // A response or the deadline already settled this call; report that instead.
                }
            },
        }

        rx.await.unwrap_or(Err(ClientError::NotConnected))
    }

    /// Balance for one address or a bounded list. A single address is sent both as `address`
    /// and as a one-element `addresses`, so servers accepting either form understand it.
    pub async fn get_balance(
        &self,
        addresses: &[String],
        signing_key: &SigningKey,
    ) -> Result<Balance, ClientError> {
        let mut params = self.address_params(addresses)?;
        if let [single] = addresses {
            params.insert("address".into(), Value::String(single.clone()));
        }
        match self
            .send_request(OperationType::BalanceLookup, params, signing_key)
            .await?
        {
            ResultVariant::Balance(b) => Ok(b),
            other => Err(unexpected(OperationType::BalanceLookup, &other)),
        }
    }

    pub async fn get_utxos(
        &self,
        addresses: &[String],
        signing_key: &SigningKey,
    ) -> Result<Vec<Utxo>, ClientError> {
        let params = self.address_params(addresses)?;
        match self
            .send_request(OperationType::GetUtxos, params, signing_key)
            .await?
        {
            ResultVariant::UtxoSet(u) => Ok(u),
            other => Err(unexpected(OperationType::GetUtxos, &other)),
        }
    }

    /// Broadcast a signed raw transaction. A rejected transaction comes back as
    /// `BroadcastResult { success: false, .. }`, not as an error.
    pub async fn broadcast_transaction(
        &self,
        tx_hex: &str,
        signing_key: &SigningKey,
    ) -> Result<BroadcastResult, ClientError> {
        let tx_hex = tx_hex.trim();
        if tx_hex.is_empty() || tx_hex.len() % 2 != 0 || !tx_hex.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return Err(ClientError::InvalidRequest(
                "transaction must be non-empty, even-length hex".into(),
            ));
        }
        let mut params = Map::new();
        params.insert("txHex".into(), Value::String(tx_hex.to_owned()));
        match self
            .send_request(OperationType::BroadcastTx, params, signing_key)
            .await?
        {
            ResultVariant::Broadcast(b) => Ok(b),
            other => Err(unexpected(OperationType::BroadcastTx, &other)),
        }
    }

    pub async fn get_fee_estimates(
        &self,
        signing_key: &SigningKey,
    ) -> Result<FeeEstimates, ClientError> {
        match self
            .send_request(OperationType::GetFeeEstimates, Map::new(), signing_key)
            .await?
        {
            ResultVariant::FeeEstimate(f) => Ok(f),
            other => Err(unexpected(OperationType::GetFeeEstimates, &other)),
        }
    }

    fn address_params(&self, addresses: &[String]) -> Result<Map<String, Value>, ClientError> {
        if addresses.is_empty() {
            return Err(ClientError::InvalidRequest("no addresses given".into()));
        }
        if addresses.len() > self.options.max_addresses_per_request {
            return Err(ClientError::InvalidRequest(format!(
                "{} addresses exceeds the per-request limit of {}",
                addresses.len(),
                self.options.max_addresses_per_request
            )));
        }
        if addresses.iter().any(|a| a.trim().is_empty()) {
            return Err(ClientError::InvalidRequest("empty address".into()));
        }
        let mut params = Map::new();
        params.insert(
            "addresses".into(),
            Value::Array(addresses.iter().cloned().map(Value::String).collect()),
        );
        Ok(params)
    }

    /// End the session: every pending call fails with `NotConnected`, every deadline is
    /// cancelled, the response subscription and relay connections are closed. Idempotent.
    pub async fn disconnect(&self) {
        let previous = {
            let mut state = lock(&self.shared.state);
            std::mem::replace(&mut *state, ClientState::Disconnected)
        };
        if previous == ClientState::Disconnected {
            return;
        }
        let failed = self.shared.pending.close_all(ClientError::NotConnected);

        let delivery = lock(&self.delivery).take();
        if let Some(delivery) = delivery {
            delivery.task.abort();
            if let Err(e) = self.transport.unsubscribe(&delivery.subscription).await {
                tracing::warn!(error = %e, "unsubscribe failed during disconnect");
            }
        }
        if previous != ClientState::Uninitialized {
            if let Err(e) = self.transport.disconnect().await {
                tracing::warn!(error = %e, "transport disconnect failed");
            }
        }
        *lock(&self.shared.session) = SessionState::default();
        tracing::info!(failed_requests = failed, "session disconnected");
    }
}

impl<T: Transport> Drop for ProtocolClient<T> {
    fn drop(&mut self) {
        if let Some(delivery) = lock(&self.delivery).take() {
            delivery.task.abort();
        }
        self.shared.pending.close_all(ClientError::NotConnected);
    }
}

fn unexpected(operation: OperationType, got: &ResultVariant) -> ClientError {
    ClientError::InvalidResponse(format!(
        "{} returned a {} result",
        operation,
        got.operation()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{response_to, MemoryTransport, TransportCall};
    use bridge_core::{PairingError, APP_ID};
    use serde_json::json;

    const SERVER: &str = "7e7e9c42a91bfef19fa929e5fda1b72e0ebc1a4c1141673e2794234d86addf4e";

    fn descriptor() -> PairingDescriptor {
        PairingDescriptor {
            version: 1,
            app_id: APP_ID.into(),
            server_key: SERVER.into(),
            relays: vec!["wss://relay.one".into(), "wss://relay.two".into()],
        }
    }

    fn server() -> ServerKey {
        ServerKey::from_hex(SERVER).unwrap()
    }

    async fn connected() -> (Arc<MemoryTransport>, ProtocolClient<MemoryTransport>) {
        let transport = Arc::new(MemoryTransport::new());
        let client = ProtocolClient::new(Arc::clone(&transport), ClientOptions::default());
        client.initialize(&descriptor()).await.unwrap();
        (transport, client)
    }

    async fn settle<F: Fn() -> bool>(done: F) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn initialize_rejects_bad_pairing_before_connect() {
        let cases: Vec<(PairingDescriptor, PairingError)> = vec![
            (
                PairingDescriptor {
                    version: 2,
                    ..descriptor()
                },
                PairingError::UnsupportedVersion(2),
            ),
            (
                PairingDescriptor {
                    app_id: "otherapp".into(),
                    ..descriptor()
                },
                PairingError::WrongApp("otherapp".into()),
            ),
            (
                PairingDescriptor {
                    server_key: SERVER[..60].into(),
                    ..descriptor()
                },
                PairingError::BadServerKey,
            ),
            (
                PairingDescriptor {
                    relays: vec![],
                    ..descriptor()
                },
                PairingError::NoRelays,
            ),
        ];
        for (bad, expected) in cases {
            let transport = Arc::new(MemoryTransport::new());
            let client = ProtocolClient::new(Arc::clone(&transport), ClientOptions::default());
            assert_eq!(
                client.initialize(&bad).await,
                Err(ClientError::InvalidPairing(expected))
            );
            assert!(transport.calls().is_empty());
            assert_eq!(client.state(), ClientState::Uninitialized);
        }
    }

    #[tokio::test]
    async fn initialize_connects_and_subscribes_once() {
        let (transport, client) = connected().await;
        assert_eq!(client.state(), ClientState::Connected);
        let session = client.session();
        assert!(session.connected);
        assert_eq!(session.server_key, Some(server()));
        assert_eq!(session.relays, descriptor().relays);
        assert_eq!(session.connected_relays, descriptor().relays);
        assert!(session.last_activity.is_some());

        let key = SigningKey::generate();
        for fast in [5, 7] {
            let (res, _) = tokio::join!(client.get_fee_estimates(&key), async {
                let req = transport.next_published().await.unwrap();
                transport.inject(response_to(
                    &req,
                    &server(),
                    json!({"fast": fast, "medium": 2, "slow": 1}),
                ));
            });
            assert_eq!(res.unwrap().fast, fast as f64);
        }

        let subscribes: Vec<_> = transport
            .calls()
            .into_iter()
            .filter(|c| matches!(c, TransportCall::Subscribe(_)))
            .collect();
        assert_eq!(
            subscribes,
            vec![TransportCall::Subscribe(SubscriptionFilter {
                kinds: vec![30079],
                authors: vec![SERVER.into()],
            })]
        );
        assert!(matches!(
            transport.calls().first(),
            Some(TransportCall::Connect(r)) if *r == descriptor().relays
        ));
    }

    #[tokio::test]
    async fn second_initialize_is_refused() {
        let (_transport, client) = connected().await;
        assert!(matches!(
            client.initialize(&descriptor()).await,
            Err(ClientError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn connect_failure_is_network_error_and_terminal() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_connect(Some(crate::transport::TransportError::Connect(
            "no relay reachable".into(),
        )));
        let client = ProtocolClient::new(Arc::clone(&transport), ClientOptions::default());
        assert!(matches!(
            client.initialize(&descriptor()).await,
            Err(ClientError::NetworkError(_))
        ));
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.session().connected);
    }

    #[tokio::test]
    async fn balance_lookup_resolves_with_total() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let addr = vec!["bc1qxy2kgdygjrsqtzq2n0yrf2493p83kkfjhx0wlh".to_string()];
        let (res, req) = tokio::join!(client.get_balance(&addr, &key), async {
            let req = transport.next_published().await.unwrap();
            transport.inject(response_to(
                &req,
                &server(),
                json!({"confirmedBalance": 50000, "unconfirmedBalance": 0, "transactions": []}),
            ));
            req
        });
        let balance = res.unwrap();
        assert_eq!(balance.confirmed, 50000);
        assert_eq!(balance.unconfirmed, 0);
        assert_eq!(balance.total, 50000);

        assert_eq!(req.kind, 30078);
        assert_eq!(req.tag_value("p"), Some(SERVER));
        let body: Value = serde_json::from_str(&req.content).unwrap();
        assert_eq!(body["type"], "bitcoin_lookup");
        assert_eq!(body["address"], addr[0].as_str());
        assert_eq!(body["addresses"], json!(addr));
        assert_eq!(body["req"].as_str(), req.tag_value("req"));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.delivery_stats().resolved, 1);
    }

    #[tokio::test]
    async fn multi_address_lookup_sends_list_only() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let addrs = vec!["bc1qa".to_string(), "bc1qb".to_string()];
        let (res, req) = tokio::join!(client.get_utxos(&addrs, &key), async {
            let req = transport.next_published().await.unwrap();
            transport.inject(response_to(
                &req,
                &server(),
                json!({"utxos": [{"txid": "aa", "vout": 1, "value": 700, "confirmations": 2}]}),
            ));
            req
        });
        assert_eq!(res.unwrap()[0].value, 700);
        let body: Value = serde_json::from_str(&req.content).unwrap();
        assert_eq!(body["type"], "get_utxos");
        assert_eq!(body["addresses"], json!(addrs));
        assert!(body.get("address").is_none());
    }

    #[tokio::test]
    async fn fee_estimates_resolve_with_exact_numbers() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let (res, _) = tokio::join!(client.get_fee_estimates(&key), async {
            let req = transport.next_published().await.unwrap();
            transport.inject(response_to(
                &req,
                &server(),
                json!({"fast": 6, "medium": 3, "slow": 1}),
            ));
        });
        assert_eq!(
            res.unwrap(),
            FeeEstimates {
                fast: 6.0,
                medium: 3.0,
                slow: 1.0
            }
        );
    }

    #[tokio::test]
    async fn failed_broadcast_resolves_not_rejects() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let (res, req) = tokio::join!(client.broadcast_transaction("0200abcd", &key), async {
            let req = transport.next_published().await.unwrap();
            transport.inject(response_to(
                &req,
                &server(),
                json!({"success": false, "error": "dust output"}),
            ));
            req
        });
        let result = res.unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("dust output"));
        let body: Value = serde_json::from_str(&req.content).unwrap();
        assert_eq!(body["type"], "broadcast_tx");
        assert_eq!(body["txHex"], "0200abcd");
    }

    #[tokio::test]
    async fn duplicate_deliveries_resolve_once() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let (res, response) = tokio::join!(client.get_fee_estimates(&key), async {
            let req = transport.next_published().await.unwrap();
            let ev = response_to(&req, &server(), json!({"fast": 6, "medium": 3, "slow": 1}));
            // Same response relayed by three relays.
            transport.inject(ev.clone());
            transport.inject(ev.clone());
            transport.inject(ev.clone());
            ev
        });
        assert!(res.is_ok());
        settle(|| client.delivery_stats().unmatched == 2).await;
        let stats = client.delivery_stats();
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.unmatched, 2);
        // A late duplicate after everything settled is still a no-op.
        transport.inject(response);
        settle(|| client.delivery_stats().unmatched == 3).await;
        assert_eq!(client.delivery_stats().resolved, 1);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn noise_never_touches_pending_requests() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let (res, _) = tokio::join!(client.get_fee_estimates(&key), async {
            let req = transport.next_published().await.unwrap();
            let good = response_to(&req, &server(), json!({"fast": 6, "medium": 3, "slow": 1}));

            let mut foreign = good.clone();
            foreign.pubkey = ServerKey::from_bytes([9u8; 32]).to_hex();
            transport.inject(foreign);

            let mut wrong_kind = good.clone();
            wrong_kind.kind = 1;
            transport.inject(wrong_kind);

            let mut no_id = good.clone();
            no_id.tags.clear();
            no_id.content = r#"{"fast":1,"medium":1,"slow":1}"#.into();
            transport.inject(no_id);

            let unknown = response_to(
                &bridge_core::encode_request(
                    &CorrelationId::from("someone-else"),
                    &server(),
                    OperationType::GetFeeEstimates,
                    Map::new(),
                )
                .unwrap(),
                &server(),
                json!({"fast": 99, "medium": 99, "slow": 99}),
            );
            transport.inject(unknown);

            settle(|| {
                let s = client.delivery_stats();
                s.noise == 3 && s.unmatched == 1
            })
            .await;
            assert_eq!(client.pending_count(), 1);
            transport.inject(good);
        });
        assert_eq!(res.unwrap().fast, 6.0);
        let stats = client.delivery_stats();
        assert_eq!(stats.noise, 3);
        assert_eq!(stats.unmatched, 1);
        assert_eq!(stats.resolved, 1);
    }

    #[tokio::test]
    async fn malformed_body_is_dropped_and_call_stays_pending() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let (res, _) = tokio::join!(client.get_fee_estimates(&key), async {
            let req = transport.next_published().await.unwrap();
            let mut broken = response_to(&req, &server(), json!({}));
            broken.content = "{\"fast\": \"soon\"".into();
            transport.inject(broken);
            settle(|| client.delivery_stats().malformed == 1).await;
            assert_eq!(client.pending_count(), 1);
            transport.inject(response_to(
                &req,
                &server(),
                json!({"fast": 4, "medium": 2, "slow": 1}),
            ));
        });
        assert_eq!(res.unwrap().fast, 4.0);
        assert_eq!(client.delivery_stats().malformed, 1);
    }

    #[tokio::test]
    async fn body_only_correlation_id_resolves() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let (res, _) = tokio::join!(client.get_fee_estimates(&key), async {
            let req = transport.next_published().await.unwrap();
            let mut ev = response_to(&req, &server(), json!({"fast": 2, "medium": 2, "slow": 2}));
            ev.tags.clear();
            transport.inject(ev);
        });
        assert_eq!(res.unwrap().slow, 2.0);
    }

    #[tokio::test]
    async fn server_error_body_rejects_with_server_error() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let addrs = ["bc1qa".to_string()];
        let (res, _) = tokio::join!(client.get_utxos(&addrs, &key), async {
            let req = transport.next_published().await.unwrap();
            transport.inject(response_to(
                &req,
                &server(),
                json!({"error": "electrum backend offline"}),
            ));
        });
        assert_eq!(
            res,
            Err(ClientError::ServerError("electrum backend offline".into()))
        );
        assert_eq!(client.delivery_stats().server_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let transport = Arc::new(MemoryTransport::new());
        let client = ProtocolClient::new(
            Arc::clone(&transport),
            ClientOptions {
                request_timeout: Duration::from_secs(45),
                ..ClientOptions::default()
            },
        );
        client.initialize(&descriptor()).await.unwrap();
        let key = SigningKey::generate();
        let started = tokio::time::Instant::now();
        let res = client.get_fee_estimates(&key).await;
        assert_eq!(
            res,
            Err(ClientError::Timeout {
                operation: OperationType::GetFeeEstimates,
                after: Duration::from_secs(45)
            })
        );
        assert!(started.elapsed() >= Duration::from_secs(45));
        assert_eq!(client.pending_count(), 0);
        settle(|| client.live_timers() == 0).await;
        assert_eq!(client.live_timers(), 0);
        // Late answer after the deadline is ignored.
        let req = transport.published().pop().unwrap();
        transport.inject(response_to(
            &req,
            &server(),
            json!({"fast": 1, "medium": 1, "slow": 1}),
        ));
        settle(|| client.delivery_stats().unmatched == 1).await;
        assert_eq!(client.delivery_stats().resolved, 0);
    }

    #[tokio::test]
    async fn disconnect_fails_all_pending_and_releases_timers() {
        let (transport, client) = connected().await;
        let client = Arc::new(client);
        let key = SigningKey::generate();
        let mut calls = Vec::new();
        for _ in 0..5 {
            let c = Arc::clone(&client);
            let k = key.clone();
            calls.push(tokio::spawn(async move { c.get_fee_estimates(&k).await }));
        }
        settle(|| client.pending_count() == 5).await;
        assert_eq!(client.pending_count(), 5);
        assert_eq!(client.live_timers(), 5);

        client.disconnect().await;
        for call in calls {
            assert_eq!(call.await.unwrap(), Err(ClientError::NotConnected));
        }
        assert_eq!(client.pending_count(), 0);
        settle(|| client.live_timers() == 0).await;
        assert_eq!(client.live_timers(), 0);
        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.session(), SessionState::default());
        assert!(transport
            .calls()
            .iter()
            .any(|c| matches!(c, TransportCall::Unsubscribe(_))));
        assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));

        // Terminal.
        assert_eq!(
            client.get_fee_estimates(&key).await,
            Err(ClientError::NotConnected)
        );
        assert!(matches!(
            client.initialize(&descriptor()).await,
            Err(ClientError::InvalidState(_))
        ));
        // Idempotent.
        client.disconnect().await;
    }

    #[tokio::test]
    async fn publish_failure_leaves_nothing_behind() {
        let (transport, client) = connected().await;
        transport.fail_publish(Some(crate::transport::TransportError::Publish(
            "all relays rejected".into(),
        )));
        let key = SigningKey::generate();
        let res = client.get_fee_estimates(&key).await;
        assert!(matches!(res, Err(ClientError::NetworkError(_))));
        assert_eq!(client.pending_count(), 0);
        settle(|| client.live_timers() == 0).await;
        assert_eq!(client.live_timers(), 0);
        // Transient: still connected, next call goes out.
        assert_eq!(client.state(), ClientState::Connected);
        transport.fail_publish(None);
        let (res, _) = tokio::join!(client.get_fee_estimates(&key), async {
            let req = transport.next_published().await.unwrap();
            transport.inject(response_to(
                &req,
                &server(),
                json!({"fast": 3, "medium": 2, "slow": 1}),
            ));
        });
        assert!(res.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_publish_still_times_out() {
        let (transport, client) = connected().await;
        transport.stall_publish(true);
        let key = SigningKey::generate();
        let started = tokio::time::Instant::now();
        assert_eq!(
            client.get_fee_estimates(&key).await,
            Err(ClientError::Timeout {
                operation: OperationType::GetFeeEstimates,
                after: DEFAULT_REQUEST_TIMEOUT
            })
        );
        assert!(started.elapsed() < DEFAULT_REQUEST_TIMEOUT * 2);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_releases_call_stuck_in_publish() {
        let (transport, client) = connected().await;
        transport.stall_publish(true);
        let client = Arc::new(client);
        let key = SigningKey::generate();
        let c = Arc::clone(&client);
        let call = tokio::spawn(async move { c.get_fee_estimates(&key).await });
        // Published, but the relay never acknowledges.
        transport.next_published().await.unwrap();
        assert_eq!(client.pending_count(), 1);

        client.disconnect().await;
        let outcome = tokio::time::timeout(Duration::from_secs(5), call)
            .await
            .expect("caller released by disconnect")
            .unwrap();
        assert_eq!(outcome, Err(ClientError::NotConnected));
        settle(|| client.live_timers() == 0).await;
        assert_eq!(client.live_timers(), 0);
    }

    #[tokio::test]
    async fn response_before_publish_ack_resolves() {
        let (transport, client) = connected().await;
        transport.stall_publish(true);
        let key = SigningKey::generate();
        let (res, _) = tokio::join!(client.get_fee_estimates(&key), async {
            let req = transport.next_published().await.unwrap();
            transport.inject(response_to(
                &req,
                &server(),
                json!({"fast": 9, "medium": 5, "slow": 2}),
            ));
        });
        assert_eq!(res.unwrap().fast, 9.0);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn subscribe_failure_is_network_error_and_disconnects() {
        let transport = Arc::new(MemoryTransport::new());
        transport.fail_subscribe(Some(crate::transport::TransportError::Subscribe(
            "relay refused filter".into(),
        )));
        let client = ProtocolClient::new(Arc::clone(&transport), ClientOptions::default());
        assert_eq!(
            client.initialize(&descriptor()).await,
            Err(ClientError::NetworkError(
                crate::transport::TransportError::Subscribe("relay refused filter".into())
            ))
        );
        assert_eq!(client.state(), ClientState::Disconnected);
        assert!(!client.session().connected);
        assert_eq!(transport.calls().last(), Some(&TransportCall::Disconnect));
        assert!(transport.connected_relays().is_empty());
    }

    #[tokio::test]
    async fn disconnect_during_connect_abandons_initialize() {
        let transport = Arc::new(MemoryTransport::new());
        transport.hold_connect(true);
        let client = Arc::new(ProtocolClient::new(
            Arc::clone(&transport),
            ClientOptions::default(),
        ));
        let c = Arc::clone(&client);
        let init = tokio::spawn(async move { c.initialize(&descriptor()).await });
        settle(|| client.state() == ClientState::Connecting).await;
        assert_eq!(client.state(), ClientState::Connecting);

        client.disconnect().await;
        transport.release_connect();
        assert_eq!(init.await.unwrap(), Err(ClientError::NotConnected));

        assert_eq!(client.state(), ClientState::Disconnected);
        assert_eq!(client.session(), SessionState::default());
        let calls = transport.calls();
        assert!(matches!(
            &calls[calls.len() - 2..],
            [TransportCall::Unsubscribe(_), TransportCall::Disconnect]
        ));
        // The response subscription is gone: nothing is routed any more.
        let stray = response_to(
            &bridge_core::encode_request(
                &CorrelationId::from("late"),
                &server(),
                OperationType::GetFeeEstimates,
                Map::new(),
            )
            .unwrap(),
            &server(),
            json!({"fast": 1, "medium": 1, "slow": 1}),
        );
        assert_eq!(transport.inject(stray), 0);
        assert_eq!(client.delivery_stats(), DeliveryStats::default());
    }

    #[tokio::test]
    async fn local_validation_sends_nothing() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        assert!(matches!(
            client.get_balance(&[], &key).await,
            Err(ClientError::InvalidRequest(_))
        ));
        let too_many: Vec<String> = (0..DEFAULT_MAX_ADDRESSES + 1)
            .map(|i| format!("bc1q{}", i))
            .collect();
        assert!(matches!(
            client.get_utxos(&too_many, &key).await,
            Err(ClientError::InvalidRequest(_))
        ));
        assert!(matches!(
            client.broadcast_transaction("abc", &key).await,
            Err(ClientError::InvalidRequest(_))
        ));
        assert!(matches!(
            client.broadcast_transaction("zz00", &key).await,
            Err(ClientError::InvalidRequest(_))
        ));
        assert!(transport.published().is_empty());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn requests_before_initialize_are_not_connected() {
        let transport = Arc::new(MemoryTransport::new());
        let client = ProtocolClient::new(Arc::clone(&transport), ClientOptions::default());
        let key = SigningKey::generate();
        assert_eq!(
            client.get_fee_estimates(&key).await,
            Err(ClientError::NotConnected)
        );
        assert!(transport.calls().is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_match_their_own_responses() {
        let (transport, client) = connected().await;
        let key = SigningKey::generate();
        let addrs = ["bc1qa".to_string()];
        let (a, b, _) = tokio::join!(
            client.get_balance(&addrs, &key),
            client.get_fee_estimates(&key),
            async {
                let first = transport.next_published().await.unwrap();
                let second = transport.next_published().await.unwrap();
                // Answer in reverse order.
                for req in [second, first] {
                    let body: Value = serde_json::from_str(&req.content).unwrap();
                    let reply = if body["type"] == "bitcoin_lookup" {
                        json!({"confirmedBalance": 10, "unconfirmedBalance": 5, "transactions": []})
                    } else {
                        json!({"fast": 8, "medium": 4, "slow": 2})
                    };
                    transport.inject(response_to(&req, &server(), reply));
                }
            }
        );
        assert_eq!(a.unwrap().total, 15);
        assert_eq!(b.unwrap().fast, 8.0);
    }

    #[tokio::test]
    async fn independent_clients_do_not_share_state() {
        let (t1, c1) = connected().await;
        let (_t2, c2) = connected().await;
        let key = SigningKey::generate();
        let (res, _) = tokio::join!(c1.get_fee_estimates(&key), async {
            let req = t1.next_published().await.unwrap();
            t1.inject(response_to(
                &req,
                &server(),
                json!({"fast": 1, "medium": 1, "slow": 1}),
            ));
        });
        assert!(res.is_ok());
        assert_eq!(c2.delivery_stats(), DeliveryStats::default());
        c2.disconnect().await;
        assert_eq!(c1.state(), ClientState::Connected);
    }
}
