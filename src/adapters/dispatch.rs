//! Inbound frame dispatch
//!
//! Every frame read from the socket ends up in exactly one of three places:
//! the [`PendingRequests`] entry whose id it echoes, the owning session via a
//! [`StreamEvent`] for a registered [`SubscriptionKey`], or the keepalive
//! path. Anything else is dropped with a diagnostic.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::deriv_messages::{FrameBody, InboundFrame, Intent, SubscriptionKey};
use crate::domain::{ContractUpdate, Tick};
use crate::error::RequestError;
use rust_decimal::Decimal;

/// What a request resolves to
pub type RequestOutcome = Result<InboundFrame, RequestError>;

/// A request awaiting its response
#[derive(Debug)]
pub struct PendingRequest {
    pub req_id: u64,
    pub intent: Intent,
    pub issued_at: Instant,
    pub deadline: Instant,
    pub retries: u32,
    responder: oneshot::Sender<RequestOutcome>,
}

impl PendingRequest {
    fn complete(self, outcome: RequestOutcome) {
        // Receiver may have given up already
        let _ = self.responder.send(outcome);
    }
}

/// Correlation table keyed by request id.
///
/// Ids are allocated from a counter that only grows, so an id is never
/// reused while the table lives.
#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: u64,
    entries: HashMap<u64, PendingRequest>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id without registering a responder
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn register(
        &mut self,
        intent: Intent,
        timeout: Duration,
        retries: u32,
    ) -> (u64, oneshot::Receiver<RequestOutcome>) {
        let req_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.entries.insert(
            req_id,
            PendingRequest {
                req_id,
                intent,
                issued_at: now,
                deadline: now + timeout,
                retries,
                responder: tx,
            },
        );
        (req_id, rx)
    }

    pub fn contains(&self, req_id: u64) -> bool {
        self.entries.contains_key(&req_id)
    }

    pub fn intent(&self, req_id: u64) -> Option<&Intent> {
        self.entries.get(&req_id).map(|p| &p.intent)
    }

    /// Drop an entry without completing it (caller timed out)
    pub fn remove(&mut self, req_id: u64) -> Option<PendingRequest> {
        self.entries.remove(&req_id)
    }

    /// Complete an entry with a result. Returns false for unknown ids.
    pub fn resolve(&mut self, req_id: u64, outcome: RequestOutcome) -> bool {
        match self.entries.remove(&req_id) {
            Some(pending) => {
                pending.complete(outcome);
                true
            }
            None => false,
        }
    }

    /// Fail everything outstanding. Used at connection teardown.
    pub fn fail_all(&mut self, error: RequestError) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            pending.complete(Err(error.clone()));
        }
        count
    }

    /// Fail entries whose deadline has passed. Returns their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = self
            .entries
            .values()
            .filter(|p| p.deadline <= now)
            .map(|p| p.req_id)
            .collect();

        for req_id in &expired {
            if let Some(pending) = self.entries.remove(req_id) {
                let elapsed_ms = now.saturating_duration_since(pending.issued_at).as_millis() as u64;
                let intent = pending.intent.to_string();
                pending.complete(Err(RequestError::Timeout { intent, elapsed_ms }));
            }
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub key: SubscriptionKey,
    /// Broker-assigned stream id on the current connection
    pub broker_id: Option<String>,
}

/// Standing stream interests in insertion order.
///
/// Interests survive reconnects; broker ids do not.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: Vec<Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the key was already registered (no-op)
    pub fn insert(&mut self, key: SubscriptionKey) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.entries.push(Subscription {
            key,
            broker_id: None,
        });
        true
    }

    pub fn remove(&mut self, key: &SubscriptionKey) -> Option<Subscription> {
        let idx = self.entries.iter().position(|s| &s.key == key)?;
        Some(self.entries.remove(idx))
    }

    pub fn contains(&self, key: &SubscriptionKey) -> bool {
        self.entries.iter().any(|s| &s.key == key)
    }

    pub fn get(&self, key: &SubscriptionKey) -> Option<&Subscription> {
        self.entries.iter().find(|s| &s.key == key)
    }

    pub fn set_broker_id(&mut self, key: &SubscriptionKey, broker_id: String) {
        if let Some(entry) = self.entries.iter_mut().find(|s| &s.key == key) {
            entry.broker_id = Some(broker_id);
        }
    }

    /// Forget broker-side state before a reconnect
    pub fn clear_broker_ids(&mut self) {
        for entry in &mut self.entries {
            entry.broker_id = None;
        }
    }

    /// Keys in original insertion order
    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.entries.iter().map(|s| s.key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Streamed data forwarded to the owning session
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Tick(Tick),
    Contract(ContractUpdate),
    Balance { balance: Decimal, currency: String },
}

impl StreamEvent {
    fn from_body(body: &FrameBody) -> Option<Self> {
        match body {
            FrameBody::Tick(tick) => Some(StreamEvent::Tick(tick.clone())),
            FrameBody::Contract(update) => Some(StreamEvent::Contract(update.clone())),
            FrameBody::Balance { balance, currency } => Some(StreamEvent::Balance {
                balance: *balance,
                currency: currency.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Echoes a request id nobody is waiting for
    UnknownRequest(u64),
    /// Streamed data for a key nobody subscribed to
    UnknownStream(SubscriptionKey),
    /// Neither correlated nor streamed
    Uncorrelated(String),
}

/// Where a frame went
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    /// Matched a pending request; may also carry the first streamed item
    Response {
        req_id: u64,
        stream: Option<StreamEvent>,
    },
    Stream(StreamEvent),
    Keepalive,
    Dropped(DropReason),
}

/// Pending requests plus subscriptions for one connection
#[derive(Debug, Default)]
pub struct Dispatcher {
    pub pending: PendingRequests,
    pub subscriptions: SubscriptionRegistry,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one decoded frame. Never panics on unexpected input.
    pub fn dispatch(&mut self, frame: InboundFrame) -> Dispatched {
        let stream = self.matching_stream(&frame);

        if let Some(req_id) = frame.req_id {
            if let Some(intent) = self.pending.intent(req_id).cloned() {
                self.record_subscription_result(&intent, &frame);

                let broker_error = match &frame.body {
                    FrameBody::Error(err) => Some(RequestError::from_broker(&err.code, &err.message)),
                    _ => None,
                };
                let outcome = match broker_error {
                    Some(err) => Err(err),
                    None => Ok(frame),
                };
                self.pending.resolve(req_id, outcome);
                return Dispatched::Response { req_id, stream };
            }
        }

        if let Some(event) = stream {
            return Dispatched::Stream(event);
        }

        if matches!(frame.body, FrameBody::Pong) {
            return Dispatched::Keepalive;
        }

        let reason = match (frame.req_id, frame.stream_key()) {
            (_, Some(key)) => DropReason::UnknownStream(key),
            (Some(req_id), None) => DropReason::UnknownRequest(req_id),
            (None, None) => DropReason::Uncorrelated(frame.msg_type.clone()),
        };
        warn!("Dropping inbound {} frame: {:?}", frame.msg_type, reason);
        Dispatched::Dropped(reason)
    }

    /// Teardown: fail all pending requests and forget broker stream ids
    pub fn teardown(&mut self) -> usize {
        self.subscriptions.clear_broker_ids();
        self.pending.fail_all(RequestError::ConnectionLost)
    }

    fn matching_stream(&self, frame: &InboundFrame) -> Option<StreamEvent> {
        let key = frame.stream_key()?;
        if self.subscriptions.contains(&key) {
            StreamEvent::from_body(&frame.body)
        } else {
            None
        }
    }

    fn record_subscription_result(&mut self, intent: &Intent, frame: &InboundFrame) {
        let Intent::Subscribe(key) = intent else {
            return;
        };
        match (&frame.body, &frame.subscription_id) {
            (FrameBody::Error(err), _) if err.code == "AlreadySubscribed" => {}
            (FrameBody::Error(err), _) => {
                debug!("Subscription {} refused ({}), dropping interest", key, err.code);
                self.subscriptions.remove(key);
            }
            (_, Some(id)) => self.subscriptions.set_broker_id(key, id.clone()),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::deriv_messages::decode;

    fn tick_frame(req_id: Option<u64>, symbol: &str) -> InboundFrame {
        let req = req_id.map(|id| format!(r#""req_id":{},"#, id)).unwrap_or_default();
        decode(&format!(
            r#"{{"msg_type":"tick",{}"subscription":{{"id":"s-{}"}},"tick":{{"symbol":"{}","quote":100.5,"epoch":1}}}}"#,
            req, symbol, symbol
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_response_resolves_pending() {
        let mut dispatcher = Dispatcher::new();
        let (req_id, rx) =
            dispatcher
                .pending
                .register(Intent::PlaceOrder, Duration::from_secs(5), 0);

        let frame = decode(&format!(
            r#"{{"msg_type":"buy","req_id":{},"buy":{{"contract_id":77,"buy_price":1.0,"payout":1.95,"balance_after":99.0}}}}"#,
            req_id
        ))
        .unwrap();

        assert_eq!(
            dispatcher.dispatch(frame),
            Dispatched::Response {
                req_id,
                stream: None
            }
        );
        let frame = rx.await.unwrap().unwrap();
        assert!(matches!(frame.body, FrameBody::Buy(ref r) if r.contract_id == 77));
        assert!(dispatcher.pending.is_empty());
    }

    #[tokio::test]
    async fn test_error_frame_fails_pending() {
        let mut dispatcher = Dispatcher::new();
        let (req_id, rx) =
            dispatcher
                .pending
                .register(Intent::PlaceOrder, Duration::from_secs(5), 0);

        let frame = decode(&format!(
            r#"{{"msg_type":"buy","req_id":{},"error":{{"code":"RateLimit","message":"too fast"}}}}"#,
            req_id
        ))
        .unwrap();
        dispatcher.dispatch(frame);

        let err = rx.await.unwrap().unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_unreadable_buy_reply_fails_without_retry() {
        let mut dispatcher = Dispatcher::new();
        let (req_id, rx) =
            dispatcher
                .pending
                .register(Intent::PlaceOrder, Duration::from_secs(5), 0);

        let frame = decode(&format!(
            r#"{{"msg_type":"buy","req_id":{},"buy":{{"contract_id":77}}}}"#,
            req_id
        ))
        .unwrap();
        assert_eq!(
            dispatcher.dispatch(frame),
            Dispatched::Response {
                req_id,
                stream: None
            }
        );

        let err = rx.await.unwrap().unwrap_err();
        assert!(matches!(err, RequestError::Rejected { ref code, .. } if code == "MalformedResponse"));
        assert!(!err.is_retryable());
        assert!(dispatcher.pending.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_request_id_is_dropped() {
        let mut dispatcher = Dispatcher::new();
        let (req_id, mut rx) =
            dispatcher
                .pending
                .register(Intent::PlaceOrder, Duration::from_secs(5), 0);

        let stray = decode(
            r#"{"msg_type":"buy","req_id":9999,"buy":{"contract_id":1,"buy_price":1.0}}"#,
        )
        .unwrap();
        assert_eq!(
            dispatcher.dispatch(stray),
            Dispatched::Dropped(DropReason::UnknownRequest(9999))
        );

        // The real request is untouched
        assert!(dispatcher.pending.contains(req_id));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_stream_routing() {
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .subscriptions
            .insert(SubscriptionKey::Ticks("R_100".into()));

        match dispatcher.dispatch(tick_frame(Some(3), "R_100")) {
            Dispatched::Stream(StreamEvent::Tick(tick)) => assert_eq!(tick.symbol, "R_100"),
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            dispatcher.dispatch(tick_frame(None, "R_50")),
            Dispatched::Dropped(DropReason::UnknownStream(SubscriptionKey::Ticks(
                "R_50".into()
            )))
        );
    }

    #[tokio::test]
    async fn test_subscribe_response_records_broker_id_and_streams() {
        let mut dispatcher = Dispatcher::new();
        let key = SubscriptionKey::Ticks("R_100".into());
        dispatcher.subscriptions.insert(key.clone());
        let (req_id, rx) = dispatcher.pending.register(
            Intent::Subscribe(key.clone()),
            Duration::from_secs(5),
            0,
        );

        match dispatcher.dispatch(tick_frame(Some(req_id), "R_100")) {
            Dispatched::Response {
                stream: Some(StreamEvent::Tick(_)),
                ..
            } => {}
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.await.unwrap().is_ok());
        assert_eq!(
            dispatcher.subscriptions.get(&key).unwrap().broker_id.as_deref(),
            Some("s-R_100")
        );
    }

    #[test]
    fn test_keepalive_and_garbage() {
        let mut dispatcher = Dispatcher::new();
        let pong = decode(r#"{"msg_type":"ping","ping":"pong"}"#).unwrap();
        assert_eq!(dispatcher.dispatch(pong), Dispatched::Keepalive);

        let unknown = decode(r#"{"msg_type":"website_status","website_status":{}}"#).unwrap();
        assert_eq!(
            dispatcher.dispatch(unknown),
            Dispatched::Dropped(DropReason::Uncorrelated("website_status".into()))
        );
    }

    #[tokio::test]
    async fn test_teardown_fails_everything() {
        let mut dispatcher = Dispatcher::new();
        let (_, rx1) = dispatcher
            .pending
            .register(Intent::PlaceOrder, Duration::from_secs(5), 0);
        let (_, rx2) = dispatcher
            .pending
            .register(Intent::TickHistory, Duration::from_secs(5), 0);
        let key = SubscriptionKey::Balance;
        dispatcher.subscriptions.insert(key.clone());
        dispatcher.subscriptions.set_broker_id(&key, "b-1".into());

        assert_eq!(dispatcher.teardown(), 2);
        assert_eq!(rx1.await.unwrap().unwrap_err(), RequestError::ConnectionLost);
        assert_eq!(rx2.await.unwrap().unwrap_err(), RequestError::ConnectionLost);
        assert!(dispatcher.subscriptions.get(&key).unwrap().broker_id.is_none());
        assert_eq!(dispatcher.subscriptions.keys(), vec![key]);
    }

    #[test]
    fn test_subscriptions_idempotent_and_ordered() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.insert(SubscriptionKey::Balance));
        assert!(registry.insert(SubscriptionKey::Ticks("R_100".into())));
        assert!(!registry.insert(SubscriptionKey::Balance));
        assert!(registry.insert(SubscriptionKey::Contract(5)));

        assert_eq!(
            registry.keys(),
            vec![
                SubscriptionKey::Balance,
                SubscriptionKey::Ticks("R_100".into()),
                SubscriptionKey::Contract(5),
            ]
        );
        registry.remove(&SubscriptionKey::Ticks("R_100".into()));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_times_out_stale_entries() {
        let mut pending = PendingRequests::new();
        let (id, rx) = pending.register(Intent::ContractStatus, Duration::from_secs(1), 0);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(pending.expire(Instant::now()), vec![id]);
        assert!(matches!(
            rx.await.unwrap(),
            Err(RequestError::Timeout { .. })
        ));
    }

    #[test]
    fn test_ids_are_unique() {
        let mut pending = PendingRequests::new();
        let (a, _) = pending.register(Intent::Ping, Duration::from_secs(1), 0);
        pending.remove(a);
        let (b, _) = pending.register(Intent::Ping, Duration::from_secs(1), 0);
        assert_ne!(a, b);
    }
}
