//! Deriv streaming client
//!
//! One socket per account. A supervisor task owns the socket and runs a
//! single select loop: inbound frames are dispatched strictly in arrival
//! order, outbound requests are written from one queue, and keepalive plus
//! inactivity checks run on timers. On unexpected teardown every pending
//! request fails with `ConnectionLost`, the supervisor backs off (consulting
//! the circuit breaker), re-authenticates and replays subscriptions in
//! insertion order before flipping the state back to READY.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use super::broker::{BrokerApi, BrokerConnector, BrokerEvent};
use super::deriv_messages::{
    decode, keepalive_frame, FrameBody, InboundFrame, Outbound, SubscriptionKey, MALFORMED_RESPONSE,
};
use super::dispatch::{Dispatched, Dispatcher, StreamEvent};
use crate::config::ConnectionConfig;
use crate::coordination::{CircuitBreaker, ReconnectBackoff};
use crate::domain::{
    AccountInfo, BuyReceipt, ConnectionState, ContractUpdate, Credentials, OrderRequest, Tick,
};
use crate::error::RequestError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_QUEUE: usize = 256;
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Why a served connection ended
#[derive(Debug)]
enum Teardown {
    Shutdown,
    Closed,
    Failed(String),
}

struct ClientInner {
    config: ConnectionConfig,
    endpoint: String,
    credentials: Credentials,
    state: watch::Sender<ConnectionState>,
    dispatcher: Mutex<Dispatcher>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    account: RwLock<Option<AccountInfo>>,
    last_auth_error: Mutex<Option<RequestError>>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    shutdown: watch::Sender<bool>,
}

impl ClientInner {
    fn dispatcher(&self) -> MutexGuard<'_, Dispatcher> {
        self.dispatcher.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    fn set_outbound(&self, sender: Option<mpsc::Sender<String>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = sender;
    }

    fn outbound(&self) -> Option<mpsc::Sender<String>> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_account(&self, account: AccountInfo) {
        *self.account.write().unwrap_or_else(|e| e.into_inner()) = Some(account);
    }

    fn update_balance(&self, balance: Decimal) {
        if let Some(account) = self.account.write().unwrap_or_else(|e| e.into_inner()).as_mut() {
            account.balance = balance;
        }
    }

    fn emit(&self, event: BrokerEvent) {
        if self.events.send(event).is_err() {
            debug!("Broker event receiver dropped");
        }
    }

    /// Register, write and await one correlated request. Does not check READY.
    async fn send_request(
        &self,
        outbound: Outbound,
        request_timeout: Duration,
    ) -> Result<InboundFrame, RequestError> {
        let intent = outbound.intent();
        let (req_id, rx) = self
            .dispatcher()
            .pending
            .register(intent.clone(), request_timeout, 0);

        let payload = match outbound.encode(req_id) {
            Ok(payload) => payload,
            Err(e) => {
                self.dispatcher().pending.remove(req_id);
                return Err(RequestError::Transport(format!("encode {} failed: {}", intent, e)));
            }
        };

        let Some(sender) = self.outbound() else {
            self.dispatcher().pending.remove(req_id);
            return Err(RequestError::ConnectionLost);
        };
        if sender.send(payload).await.is_err() {
            self.dispatcher().pending.remove(req_id);
            return Err(RequestError::ConnectionLost);
        }

        let started = Instant::now();
        match timeout(request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => {
                self.dispatcher().pending.remove(req_id);
                Err(RequestError::Timeout {
                    intent: intent.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Decode and route one text frame
    fn handle_text(&self, text: &str) {
        let frame = match decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Undecodable WS message ({}): {}", e, preview(text, 200));
                return;
            }
        };

        let dispatched = self.dispatcher().dispatch(frame);
        match dispatched {
            Dispatched::Response {
                stream: Some(event),
                ..
            }
            | Dispatched::Stream(event) => self.forward(event),
            Dispatched::Keepalive => debug!("Pong received"),
            Dispatched::Response { .. } | Dispatched::Dropped(_) => {}
        }
    }

    fn forward(&self, event: StreamEvent) {
        if let StreamEvent::Balance { balance, .. } = &event {
            self.update_balance(*balance);
        }
        self.emit(event.into());
    }
}

/// First `max_chars` characters of a frame, for diagnostics
fn preview(text: &str, max_chars: usize) -> &str {
    text.char_indices()
        .nth(max_chars)
        .map_or(text, |(end, _)| &text[..end])
}

/// Streaming client for one account
pub struct DerivClient {
    inner: Arc<ClientInner>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl DerivClient {
    pub fn new(
        config: ConnectionConfig,
        endpoint: impl Into<String>,
        credentials: Credentials,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientInner {
                config,
                endpoint: endpoint.into(),
                credentials,
                state,
                dispatcher: Mutex::new(Dispatcher::new()),
                outbound: Mutex::new(None),
                account: RwLock::new(None),
                last_auth_error: Mutex::new(None),
                events,
                shutdown,
            }),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    /// DISCONNECTED -> CONNECTING -> AUTHENTICATING -> READY.
    ///
    /// Any previous socket is torn down first. Rejected credentials fail
    /// with `Auth` and leave the client TERMINATED.
    pub async fn connect(&self) -> Result<AccountInfo, RequestError> {
        self.stop_supervisor().await;

        if !self.inner.credentials.looks_valid() {
            warn!(
                "API token {} does not look like a broker token (expected 15-40 alphanumeric chars)",
                self.inner.credentials.masked()
            );
        }

        let (ws, account) = match establish(&self.inner).await {
            Ok(established) => established,
            Err(e) => {
                if e.is_auth() {
                    *self.inner.last_auth_error.lock().unwrap_or_else(|p| p.into_inner()) =
                        Some(e.clone());
                    self.inner.set_state(ConnectionState::Terminated);
                } else {
                    self.inner.set_state(ConnectionState::Disconnected);
                }
                return Err(e);
            }
        };

        info!(
            "Authorized {} account {} ({} {})",
            account.account_type(),
            account.login_id,
            account.balance,
            account.currency
        );
        self.inner.set_account(account.clone());
        self.inner.shutdown.send_replace(false);

        let handle = tokio::spawn(supervise(self.inner.clone(), ws));
        *self.supervisor.lock().await = Some(handle);

        self.wait_ready(Duration::from_secs(self.inner.config.auth_timeout_secs))
            .await?;

        if let Err(e) = self.subscribe_key(SubscriptionKey::Balance).await {
            warn!("Balance subscription failed: {}", e);
        }

        Ok(account)
    }

    /// Close the socket for good
    pub async fn close(&self) {
        self.stop_supervisor().await;
        self.inner.dispatcher().teardown();
        self.inner.set_state(ConnectionState::Terminated);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Correlated request, admitted only once the connection is READY
    pub async fn request(
        &self,
        outbound: Outbound,
        request_timeout: Duration,
    ) -> Result<InboundFrame, RequestError> {
        let started = Instant::now();
        self.wait_ready(request_timeout).await?;
        let remaining = request_timeout.saturating_sub(started.elapsed());
        self.inner.send_request(outbound, remaining).await
    }

    /// Current subscription keys in insertion order
    pub fn subscriptions(&self) -> Vec<SubscriptionKey> {
        self.inner.dispatcher().subscriptions.keys()
    }

    async fn subscribe_key(&self, key: SubscriptionKey) -> Result<(), RequestError> {
        if !self.inner.dispatcher().subscriptions.insert(key.clone()) {
            debug!("Already subscribed to {}", key);
            return Ok(());
        }

        let outcome = self
            .request(key.subscribe_request(), self.inner.config.request_timeout())
            .await;
        match outcome {
            Ok(_) => {
                debug!("Subscribed to {}", key);
                Ok(())
            }
            Err(RequestError::Rejected { code, .. }) if code == "AlreadySubscribed" => Ok(()),
            // Interest stays registered; replay will establish it
            Err(RequestError::ConnectionLost) => Err(RequestError::ConnectionLost),
            Err(e) => {
                self.inner.dispatcher().subscriptions.remove(&key);
                Err(e)
            }
        }
    }

    async fn unsubscribe_key(&self, key: SubscriptionKey) -> Result<(), RequestError> {
        let Some(subscription) = self.inner.dispatcher().subscriptions.remove(&key) else {
            return Ok(());
        };
        let Some(broker_id) = subscription.broker_id else {
            return Ok(());
        };

        let forget = Outbound::Forget {
            subscription_id: broker_id,
        };
        match self.request(forget, self.inner.config.request_timeout()).await {
            Ok(_) => debug!("Unsubscribed from {}", key),
            // Broker already ended the stream
            Err(e) => debug!("Forget for {} failed: {}", key, e),
        }
        Ok(())
    }

    async fn wait_ready(&self, wait: Duration) -> Result<(), RequestError> {
        let mut rx = self.inner.state.subscribe();
        let started = Instant::now();
        let result = timeout(
            wait,
            rx.wait_for(|s| s.accepts_requests() || s.is_terminal()),
        )
        .await
        .map(|r| r.map(|state| *state));

        match result {
            Ok(Ok(state)) if state.accepts_requests() => Ok(()),
            Ok(Ok(_)) => Err(self
                .inner
                .last_auth_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .unwrap_or(RequestError::ConnectionLost)),
            Ok(Err(_)) => Err(RequestError::ConnectionLost),
            Err(_) => Err(RequestError::Timeout {
                intent: "await connection".to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    async fn stop_supervisor(&self) {
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            self.inner.shutdown.send_replace(true);
            if let Err(e) = handle.await {
                warn!("Connection supervisor ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for DerivClient {
    fn drop(&mut self) {
        if self.supervisor.get_mut().is_some() {
            self.inner.shutdown.send_replace(true);
        }
    }
}

#[async_trait]
impl BrokerApi for DerivClient {
    fn account(&self) -> AccountInfo {
        self.inner
            .account
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_else(|| AccountInfo {
                login_id: String::new(),
                balance: Decimal::ZERO,
                currency: "USD".to_string(),
                is_virtual: true,
            })
    }

    fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    async fn buy(&self, order: &OrderRequest) -> Result<BuyReceipt, RequestError> {
        info!(
            "Buying {} {} | stake ${} | duration {}",
            order.direction,
            order.symbol,
            order.wire_amount(),
            order.duration
        );
        let frame = self
            .request(Outbound::Buy(order.clone()), self.inner.config.request_timeout())
            .await?;
        match frame.body {
            FrameBody::Buy(receipt) => Ok(receipt),
            other => Err(unexpected("buy", &other)),
        }
    }

    async fn subscribe(&self, key: SubscriptionKey) -> Result<(), RequestError> {
        self.subscribe_key(key).await
    }

    async fn unsubscribe(&self, key: SubscriptionKey) -> Result<(), RequestError> {
        self.unsubscribe_key(key).await
    }

    async fn tick_history(&self, symbol: &str, count: u32) -> Result<Vec<Tick>, RequestError> {
        let request = Outbound::TicksHistory {
            symbol: symbol.to_string(),
            count,
        };
        let frame = self
            .request(request, self.inner.config.request_timeout())
            .await?;
        match frame.body {
            FrameBody::History(ticks) => Ok(ticks),
            other => Err(unexpected("ticks_history", &other)),
        }
    }

    async fn contract_status(&self, contract_id: u64) -> Result<ContractUpdate, RequestError> {
        let request = Outbound::ContractStatus {
            contract_id,
            subscribe: false,
        };
        let frame = self
            .request(request, self.inner.config.request_timeout())
            .await?;
        match frame.body {
            FrameBody::Contract(update) => Ok(update),
            other => Err(unexpected("proposal_open_contract", &other)),
        }
    }

    async fn disconnect(&self) {
        self.close().await;
    }
}

fn unexpected(call: &str, body: &FrameBody) -> RequestError {
    RequestError::Rejected {
        code: "UnexpectedResponse".to_string(),
        message: format!("{} answered with {:?}", call, body),
    }
}

/// Opens [`DerivClient`] connections for the session manager
pub struct DerivConnector {
    config: ConnectionConfig,
    endpoint: String,
}

impl DerivConnector {
    pub fn new(config: ConnectionConfig, endpoint: impl Into<String>) -> Self {
        Self {
            config,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl BrokerConnector for DerivConnector {
    async fn connect(
        &self,
        credentials: Credentials,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<Arc<dyn BrokerApi>, RequestError> {
        let client = DerivClient::new(self.config.clone(), self.endpoint.clone(), credentials, events);
        client.connect().await?;
        Ok(Arc::new(client))
    }
}

// =============================================================================
// Connection tasks
// =============================================================================

/// Open the socket and authorize
async fn establish(inner: &ClientInner) -> Result<(WsStream, AccountInfo), RequestError> {
    let url = Url::parse(&inner.endpoint)
        .map_err(|e| RequestError::Transport(format!("Invalid WebSocket URL: {}", e)))?;

    inner.set_state(ConnectionState::Connecting);
    info!("Connecting to WebSocket: {}", url.host_str().unwrap_or_default());

    let connect_timeout = Duration::from_secs(inner.config.connect_timeout_secs);
    let (mut ws, _) = timeout(connect_timeout, connect_async(url.as_str()))
        .await
        .map_err(|_| RequestError::Transport(format!("connect timed out after {:?}", connect_timeout)))?
        .map_err(|e| RequestError::Transport(e.to_string()))?;

    inner.set_state(ConnectionState::Authenticating);
    let account = authenticate(inner, &mut ws).await?;
    Ok((ws, account))
}

async fn authenticate(inner: &ClientInner, ws: &mut WsStream) -> Result<AccountInfo, RequestError> {
    let req_id = inner.dispatcher().pending.next_id();
    let payload = Outbound::Authorize {
        token: inner.credentials.token().to_string(),
    }
    .encode(req_id)
    .map_err(|e| RequestError::Transport(e.to_string()))?;

    debug!("Authorizing with token {}", inner.credentials.masked());
    ws.send(Message::Text(payload))
        .await
        .map_err(|e| RequestError::Transport(e.to_string()))?;

    let auth_timeout = Duration::from_secs(inner.config.auth_timeout_secs);
    let handshake = async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let frame = match decode(&text) {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!("Undecodable frame during authorization: {}", e);
                            continue;
                        }
                    };
                    if frame.req_id != Some(req_id) {
                        debug!("Ignoring {} frame during authorization", frame.msg_type);
                        continue;
                    }
                    return match frame.body {
                        FrameBody::Authorize(account) => Ok(account),
                        FrameBody::Error(err) => {
                            let error = RequestError::from_broker(&err.code, &err.message);
                            if error.is_retryable() || err.code == MALFORMED_RESPONSE {
                                Err(RequestError::Transport(err.message))
                            } else {
                                error!("Authorization rejected ({}): {}", err.code, err.message);
                                Err(RequestError::Auth {
                                    code: err.code,
                                    message: err.message,
                                })
                            }
                        }
                        other => Err(unexpected("authorize", &other)),
                    };
                }
                Ok(Message::Ping(data)) => {
                    ws.send(Message::Pong(data))
                        .await
                        .map_err(|e| RequestError::Transport(e.to_string()))?;
                }
                Ok(Message::Close(_)) => {
                    return Err(RequestError::Transport("closed during authorization".into()))
                }
                Ok(_) => {}
                Err(e) => return Err(RequestError::Transport(e.to_string())),
            }
        }
        Err(RequestError::Transport("stream ended during authorization".into()))
    };

    timeout(auth_timeout, handshake)
        .await
        .map_err(|_| RequestError::Transport(format!("authorization timed out after {:?}", auth_timeout)))?
}

/// Owns the socket across reconnects until shutdown or terminal auth failure
async fn supervise(inner: Arc<ClientInner>, ws: WsStream) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut breaker = CircuitBreaker::new("deriv-ws", (&inner.config).into());
    let mut backoff = ReconnectBackoff::from_config(&inner.config);
    let mut next = Some(ws);

    while let Some(ws) = next.take() {
        let teardown = serve(inner.clone(), ws, shutdown.clone()).await;

        let failed = inner.dispatcher().teardown();
        inner.set_state(ConnectionState::Disconnected);
        if failed > 0 {
            warn!("{} pending requests failed: connection lost", failed);
        }

        match teardown {
            Teardown::Shutdown => {
                info!("WebSocket closed on request");
                return;
            }
            Teardown::Closed => info!("WebSocket closed by peer, reconnecting..."),
            Teardown::Failed(reason) => {
                warn!("WebSocket failed: {}", reason);
                breaker.record_failure(&reason);
            }
        }
        inner.emit(BrokerEvent::Connection(ConnectionState::Disconnected));

        next = reconnect(&inner, &mut breaker, &mut backoff, &mut shutdown).await;
    }
}

async fn reconnect(
    inner: &ClientInner,
    breaker: &mut CircuitBreaker,
    backoff: &mut ReconnectBackoff,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<WsStream> {
    loop {
        if let Some(until) = breaker.open_until() {
            warn!(
                "Circuit breaker is {}, deferring reconnect for {:?}",
                breaker.state(),
                until.saturating_duration_since(Instant::now())
            );
            if interrupted(sleep_until(until), shutdown).await {
                return None;
            }
        }
        if !breaker.should_allow() {
            continue;
        }

        let delay = backoff.next_delay();
        info!("Reconnecting in {:?} (attempt {})", delay, backoff.attempt());
        if interrupted(sleep(delay), shutdown).await {
            return None;
        }

        match establish(inner).await {
            Ok((ws, account)) => {
                breaker.record_success();
                backoff.reset();
                inner.set_account(account);
                info!("WebSocket reconnected");
                return Some(ws);
            }
            Err(RequestError::Auth { code, message }) => {
                error!("Re-authorization rejected ({}): {}; giving up", code, message);
                *inner.last_auth_error.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(RequestError::Auth {
                        code: code.clone(),
                        message: message.clone(),
                    });
                inner.set_state(ConnectionState::Terminated);
                inner.emit(BrokerEvent::AuthRevoked { code, message });
                return None;
            }
            Err(e) => {
                inner.set_state(ConnectionState::Disconnected);
                warn!("Reconnect attempt {} failed: {}", backoff.attempt(), e);
                breaker.record_failure(&e.to_string());
            }
        }
    }
}

/// Returns true if shutdown fired before `wait` completed
async fn interrupted<F>(wait: F, shutdown: &mut watch::Receiver<bool>) -> bool
where
    F: std::future::Future<Output = ()>,
{
    tokio::select! {
        _ = wait => false,
        _ = shutdown_requested(shutdown) => true,
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means the client is gone
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Re-establish every registered subscription, in order, on a fresh socket
async fn replay_subscriptions(inner: Arc<ClientInner>) {
    let keys = inner.dispatcher().subscriptions.keys();
    if keys.is_empty() {
        return;
    }

    info!("Replaying {} subscriptions", keys.len());
    for key in keys {
        match inner
            .send_request(key.subscribe_request(), inner.config.request_timeout())
            .await
        {
            Ok(_) => debug!("Replayed {}", key),
            Err(RequestError::Rejected { code, .. }) if code == "AlreadySubscribed" => {}
            Err(e) => warn!("Replay of {} failed: {}", key, e),
        }
    }
}

/// Run one connection until it ends
async fn serve(
    inner: Arc<ClientInner>,
    ws: WsStream,
    mut shutdown: watch::Receiver<bool>,
) -> Teardown {
    let (mut write, mut read) = ws.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
    inner.set_outbound(Some(out_tx));

    let replay = replay_subscriptions(inner.clone());
    tokio::pin!(replay);
    let mut replayed = false;

    let ping_period = Duration::from_secs(inner.config.ping_interval_secs.max(1));
    let inactivity = Duration::from_secs(inner.config.inactivity_timeout_secs);
    let mut ping_interval = interval_at(Instant::now() + ping_period, ping_period);
    let health_period = HEALTH_CHECK_INTERVAL
        .min(inactivity / 2)
        .max(Duration::from_millis(100));
    let mut health_interval = interval_at(Instant::now() + health_period, health_period);
    let mut last_activity = Instant::now();

    let teardown = loop {
        tokio::select! {
            _ = &mut replay, if !replayed => {
                replayed = true;
                inner.set_state(ConnectionState::Ready);
                inner.emit(BrokerEvent::Connection(ConnectionState::Ready));
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        inner.handle_text(&text);
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_activity = Instant::now();
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            break Teardown::Failed(e.to_string());
                        }
                    }
                    Some(Ok(Message::Pong(_))) => last_activity = Instant::now(),
                    Some(Ok(Message::Close(frame))) => {
                        info!("Received close frame: {:?}", frame);
                        break Teardown::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Teardown::Failed(e.to_string()),
                    None => break Teardown::Closed,
                }
            }
            Some(payload) = out_rx.recv() => {
                if let Err(e) = write.send(Message::Text(payload)).await {
                    break Teardown::Failed(e.to_string());
                }
            }
            _ = ping_interval.tick() => {
                if let Err(e) = write.send(Message::Text(keepalive_frame())).await {
                    break Teardown::Failed(e.to_string());
                }
                debug!("Sent ping");
            }
            _ = health_interval.tick() => {
                let expired = inner.dispatcher().pending.expire(Instant::now());
                if !expired.is_empty() {
                    debug!("Expired {} pending requests", expired.len());
                }
                if last_activity.elapsed() > inactivity {
                    break Teardown::Failed(format!(
                        "No inbound activity for {:?}; forcing reconnect",
                        inactivity
                    ));
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    break Teardown::Shutdown;
                }
            }
        }
    };

    inner.set_outbound(None);
    teardown
}
