//! Session runner
//!
//! One task per session. Commands, broker events and timer fires all land in
//! the same select loop and mutate the session under its lock; broker calls
//! run outside the lock. Timers are spawned sleeps that post back into the
//! loop, so nothing touches session fields except through this task.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, error, info, warn};

use super::session::{
    ContractProgress, OrderFailure, OrderPlaced, SessionEvent, SessionStatus, StopRequest,
    TradingSession,
};
use super::signal::SignalSource;
use crate::adapters::{BrokerApi, BrokerEvent, SubscriptionKey};
use crate::coordination::NotificationThrottle;
use crate::domain::{BuyReceipt, ConnectionState, ContractUpdate, OrderRequest, SessionState, Signal};
use crate::error::{RequestError, Result, TickbotError};
use crate::persistence::RecoveryStore;

const COMMAND_QUEUE: usize = 64;

/// Front-end commands for a running session
#[derive(Debug)]
pub enum SessionCommand {
    Signal(Signal),
    Stop { reply: oneshot::Sender<StopRequest> },
    /// Snapshot and exit without stopping (process shutdown)
    Shutdown { reply: oneshot::Sender<()> },
}

/// Timer fires and background results
#[derive(Debug)]
enum Internal {
    OrderResult {
        seq: u64,
        result: std::result::Result<BuyReceipt, RequestError>,
    },
    RetryDue {
        seq: u64,
    },
    BuyTimeout {
        seq: u64,
    },
    SettlementCheck {
        contract_id: u64,
        polled: bool,
    },
    PollResult {
        contract_id: u64,
        result: std::result::Result<ContractUpdate, RequestError>,
    },
}

/// Handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    account_id: String,
    session: Arc<Mutex<TradingSession>>,
    commands: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub async fn status(&self) -> SessionStatus {
        self.session.lock().await.status()
    }

    pub async fn is_stopped(&self) -> bool {
        self.session.lock().await.is_stopped()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn push_signal(&self, signal: Signal) -> Result<()> {
        self.commands
            .send(SessionCommand::Signal(signal))
            .await
            .map_err(|_| TickbotError::SessionClosed(self.account_id.clone()))
    }

    pub async fn stop(&self) -> Result<StopRequest> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Stop { reply })
            .await
            .map_err(|_| TickbotError::SessionClosed(self.account_id.clone()))?;
        rx.await
            .map_err(|_| TickbotError::SessionClosed(self.account_id.clone()))
    }

    /// Snapshot and stop the runner task, leaving the session resumable
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Shutdown { reply })
            .await
            .map_err(|_| TickbotError::SessionClosed(self.account_id.clone()))?;
        rx.await
            .map_err(|_| TickbotError::SessionClosed(self.account_id.clone()))
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("account_id", &self.account_id)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct Timers {
    buy: Option<AbortHandle>,
    retry: Option<AbortHandle>,
    settle: Option<AbortHandle>,
}

impl Timers {
    fn cancel(slot: &mut Option<AbortHandle>) {
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        Self::cancel(&mut self.buy);
        Self::cancel(&mut self.retry);
        Self::cancel(&mut self.settle);
    }
}

/// Drives one [`TradingSession`] against a broker connection
pub struct SessionRunner {
    account_id: String,
    session: Arc<Mutex<TradingSession>>,
    broker: Arc<dyn BrokerApi>,
    signals: Option<Box<dyn SignalSource>>,
    recovery: RecoveryStore,
    events: broadcast::Sender<SessionEvent>,
    throttle: NotificationThrottle,
    commands: mpsc::Receiver<SessionCommand>,
    broker_events: mpsc::UnboundedReceiver<BrokerEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    timers: Timers,
}

impl SessionRunner {
    pub fn new(
        session: TradingSession,
        broker: Arc<dyn BrokerApi>,
        broker_events: mpsc::UnboundedReceiver<BrokerEvent>,
        signals: Option<Box<dyn SignalSource>>,
        recovery: RecoveryStore,
        events: broadcast::Sender<SessionEvent>,
    ) -> (Self, SessionHandle) {
        let account_id = session.account_id().to_string();
        let throttle = NotificationThrottle::per_minute(session.config().error_notifications_per_minute);
        let session = Arc::new(Mutex::new(session));
        let (command_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let handle = SessionHandle {
            account_id: account_id.clone(),
            session: session.clone(),
            commands: command_tx,
        };
        let runner = Self {
            account_id,
            session,
            broker,
            signals,
            recovery,
            events,
            throttle,
            commands,
            broker_events,
            internal_tx,
            internal_rx,
            timers: Timers::default(),
        };
        (runner, handle)
    }

    pub async fn run(mut self) {
        if self.session.lock().await.state() == SessionState::Idle {
            self.start().await;
        }

        let snapshot_period = {
            let session = self.session.lock().await;
            Duration::from_secs(session.config().snapshot_interval_secs.max(1))
        };
        let mut snapshot_interval = interval_at(Instant::now() + snapshot_period, snapshot_period);

        loop {
            if self.session.lock().await.is_stopped() {
                self.finish().await;
                return;
            }

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(SessionCommand::Signal(signal)) => self.evaluate(signal).await,
                        Some(SessionCommand::Stop { reply }) => {
                            let outcome = self.session.lock().await.request_stop();
                            self.publish().await;
                            let _ = reply.send(outcome);
                        }
                        Some(SessionCommand::Shutdown { reply }) => {
                            self.suspend().await;
                            let _ = reply.send(());
                            return;
                        }
                        None => {
                            self.suspend().await;
                            return;
                        }
                    }
                }
                Some(event) = self.broker_events.recv() => self.on_broker_event(event).await,
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal).await,
                _ = snapshot_interval.tick() => self.save_snapshot().await,
            }
        }
    }

    // ==================== Lifecycle ====================

    /// Subscribe, preload and leave IDLE. `run` does this itself when not
    /// called beforehand.
    pub async fn start(&mut self) {
        let (symbol, preload) = {
            let session = self.session.lock().await;
            (session.config().symbol.clone(), session.config().history_preload)
        };

        if let Err(e) = self.broker.subscribe(SubscriptionKey::Ticks(symbol.clone())).await {
            if e.is_auth() {
                self.session.lock().await.fail(e.to_string());
                self.publish().await;
                return;
            }
            warn!("{}: tick subscription for {} failed: {}", self.account_id, symbol, e);
        }

        let mut warm = false;
        if let Some(source) = self.signals.as_mut() {
            if preload > 0 {
                match self.broker.tick_history(&symbol, preload).await {
                    Ok(history) => {
                        warm = source.preload(&history);
                        info!(
                            "{}: preloaded {} ticks into {} (warm: {})",
                            self.account_id,
                            history.len(),
                            source.name(),
                            warm
                        );
                    }
                    Err(e) => warn!("{}: history preload failed, warming up live: {}", self.account_id, e),
                }
            }
        }

        let balance = self.broker.account().balance;
        self.session.lock().await.start(balance, warm);
        self.publish().await;
    }

    /// Terminal stop: release streams, drop the snapshot, close the connection
    async fn finish(&mut self) {
        self.timers.cancel_all();
        let (symbol, contract) = {
            let session = self.session.lock().await;
            (session.config().symbol.clone(), session.open_contract())
        };

        if self.broker.connection_state().accepts_requests() {
            if let Err(e) = self.broker.unsubscribe(SubscriptionKey::Ticks(symbol)).await {
                debug!("{}: tick unsubscribe failed: {}", self.account_id, e);
            }
            if let Some(contract_id) = contract {
                if let Err(e) = self.broker.unsubscribe(SubscriptionKey::Contract(contract_id)).await {
                    debug!("{}: contract unsubscribe failed: {}", self.account_id, e);
                }
            }
        }

        self.recovery.discard(&self.account_id).await;
        self.broker.disconnect().await;
        info!("{}: session runner finished", self.account_id);
    }

    /// Process shutdown: keep the session resumable
    async fn suspend(&mut self) {
        self.timers.cancel_all();
        self.save_snapshot().await;
        self.broker.disconnect().await;
        info!("{}: session suspended", self.account_id);
    }

    // ==================== Inputs ====================

    async fn evaluate(&mut self, signal: Signal) {
        let order = self.session.lock().await.on_signal(&signal, Utc::now());
        if let Some(order) = order {
            let buy_timeout = {
                let session = self.session.lock().await;
                Duration::from_secs(session.config().buy_timeout_secs)
            };
            Timers::cancel(&mut self.timers.buy);
            self.timers.buy = Some(self.schedule(buy_timeout, Internal::BuyTimeout { seq: order.seq }));
            self.place(order);
        }
        self.publish().await;
    }

    async fn on_broker_event(&mut self, event: BrokerEvent) {
        match event {
            BrokerEvent::Tick(tick) => {
                let signal = self.signals.as_mut().and_then(|source| source.on_tick(&tick));
                if let Some(signal) = signal {
                    self.evaluate(signal).await;
                }
            }
            BrokerEvent::Contract(update) => {
                let progress = self
                    .session
                    .lock()
                    .await
                    .on_contract_update(&update, Utc::now());
                self.on_progress(update.contract_id, progress).await;
            }
            BrokerEvent::Balance { balance, .. } => {
                self.session.lock().await.on_balance(balance);
            }
            BrokerEvent::Connection(state) => match state {
                ConnectionState::Ready => info!("{}: connection ready", self.account_id),
                other => warn!("{}: connection {}", self.account_id, other),
            },
            BrokerEvent::AuthRevoked { code, message } => {
                self.session
                    .lock()
                    .await
                    .fail(format!("authorization revoked ({}): {}", code, message));
                self.publish().await;
            }
        }
    }

    async fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::OrderResult { seq, result } => self.on_order_result(seq, result).await,
            Internal::RetryDue { seq } => {
                self.timers.retry = None;
                let order = self.session.lock().await.retry_order(seq);
                if let Some(order) = order {
                    self.place(order);
                }
            }
            Internal::BuyTimeout { seq } => {
                self.timers.buy = None;
                if self.session.lock().await.on_buy_timeout(seq) {
                    Timers::cancel(&mut self.timers.retry);
                }
                self.publish().await;
            }
            Internal::SettlementCheck { contract_id, polled } => {
                self.timers.settle = None;
                let still_open = {
                    let session = self.session.lock().await;
                    session.state() == SessionState::Open && session.open_contract() == Some(contract_id)
                };
                if !still_open {
                    return;
                }
                if polled {
                    let abandoned = self.session.lock().await.abandon_open_order(contract_id);
                    if abandoned {
                        self.release_contract(contract_id).await;
                        self.save_snapshot().await;
                    }
                    self.publish().await;
                } else {
                    warn!(
                        "{}: no settlement for contract {}, polling",
                        self.account_id, contract_id
                    );
                    self.poll(contract_id);
                }
            }
            Internal::PollResult { contract_id, result } => match result {
                Ok(update) => {
                    let progress = self
                        .session
                        .lock()
                        .await
                        .on_contract_update(&update, Utc::now());
                    let settled = matches!(progress, ContractProgress::Settled(_));
                    self.on_progress(contract_id, progress).await;
                    if !settled {
                        self.arm_settlement_check(contract_id, true).await;
                    }
                }
                Err(e) => {
                    warn!("{}: contract {} poll failed: {}", self.account_id, contract_id, e);
                    self.arm_settlement_check(contract_id, true).await;
                }
            },
        }
    }

    async fn on_order_result(&mut self, seq: u64, result: std::result::Result<BuyReceipt, RequestError>) {
        match result {
            Ok(receipt) => {
                let placed = self.session.lock().await.on_order_placed(seq, &receipt);
                match placed {
                    OrderPlaced::Opened { contract_id } => {
                        Timers::cancel(&mut self.timers.buy);
                        Timers::cancel(&mut self.timers.retry);
                        if let Err(e) = self.broker.subscribe(SubscriptionKey::Contract(contract_id)).await {
                            warn!(
                                "{}: contract {} subscription failed, relying on poll: {}",
                                self.account_id, contract_id, e
                            );
                        }
                        self.arm_settlement_check(contract_id, false).await;
                    }
                    OrderPlaced::Untracked { contract_id } => {
                        warn!("{}: contract {} left untracked", self.account_id, contract_id);
                    }
                }
            }
            Err(e) => {
                let failure = self.session.lock().await.on_order_failed(seq, &e);
                match failure {
                    OrderFailure::Retry { delay, .. } => {
                        Timers::cancel(&mut self.timers.retry);
                        self.timers.retry = Some(self.schedule(delay, Internal::RetryDue { seq }));
                    }
                    OrderFailure::GaveUp | OrderFailure::Fatal => {
                        Timers::cancel(&mut self.timers.buy);
                        Timers::cancel(&mut self.timers.retry);
                    }
                    OrderFailure::Stale => {}
                }
            }
        }
        self.publish().await;
    }

    async fn on_progress(&mut self, contract_id: u64, progress: ContractProgress) {
        match progress {
            ContractProgress::Settled(record) => {
                debug!(
                    "{}: contract {} settled {} ({})",
                    self.account_id, record.contract_id, record.outcome, record.profit
                );
                Timers::cancel(&mut self.timers.settle);
                self.release_contract(contract_id).await;
                self.save_snapshot().await;
                self.publish().await;
            }
            ContractProgress::Running { profit } => {
                debug!("{}: contract {} running P/L {}", self.account_id, contract_id, profit);
            }
            ContractProgress::Ignored => {}
        }
    }

    // ==================== Effects ====================

    fn place(&self, order: OrderRequest) {
        let broker = self.broker.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let seq = order.seq;
            let result = broker.buy(&order).await;
            let _ = tx.send(Internal::OrderResult { seq, result });
        });
    }

    fn poll(&self, contract_id: u64) {
        let broker = self.broker.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = broker.contract_status(contract_id).await;
            let _ = tx.send(Internal::PollResult { contract_id, result });
        });
    }

    fn schedule(&self, after: Duration, internal: Internal) -> AbortHandle {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            sleep(after).await;
            let _ = tx.send(internal);
        })
        .abort_handle()
    }

    async fn arm_settlement_check(&mut self, contract_id: u64, polled: bool) {
        let after = {
            let session = self.session.lock().await;
            Duration::from_secs(session.config().settlement_timeout_secs)
        };
        Timers::cancel(&mut self.timers.settle);
        self.timers.settle = Some(self.schedule(after, Internal::SettlementCheck { contract_id, polled }));
    }

    async fn release_contract(&self, contract_id: u64) {
        if let Err(e) = self.broker.unsubscribe(SubscriptionKey::Contract(contract_id)).await {
            debug!("{}: contract {} unsubscribe failed: {}", self.account_id, contract_id, e);
        }
    }

    async fn save_snapshot(&self) {
        let snapshot = {
            let session = self.session.lock().await;
            if matches!(session.state(), SessionState::Idle | SessionState::Stopped) {
                return;
            }
            session.snapshot(Utc::now())
        };
        if let Err(e) = self.recovery.snapshot(&snapshot).await {
            error!("{}: snapshot failed: {}", self.account_id, e);
        }
    }

    /// Forward queued session events, rate limiting non-fatal errors
    async fn publish(&self) {
        let events = self.session.lock().await.drain_events();
        for event in events {
            let event = match event {
                SessionEvent::Error {
                    account_id,
                    message,
                    fatal: false,
                } => {
                    if !self.throttle.allow() {
                        debug!("{}: error notification suppressed: {}", self.account_id, message);
                        continue;
                    }
                    let suppressed = self.throttle.take_suppressed();
                    let message = if suppressed > 0 {
                        format!("{} ({} similar suppressed)", message, suppressed)
                    } else {
                        message
                    };
                    SessionEvent::Error {
                        account_id,
                        message,
                        fatal: false,
                    }
                }
                other => other,
            };
            if self.events.send(event).is_err() {
                debug!("{}: no event subscribers", self.account_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockBrokerApi;
    use crate::config::{RiskConfig, SessionConfig};
    use crate::domain::{AccountInfo, ContractStatus, DurationSpec, SignalDirection, StopReason};
    use crate::persistence::MemorySnapshotStore;
    use crate::strategy::risk::RiskController;
    use crate::strategy::signal::TickTrendSignal;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn account() -> AccountInfo {
        AccountInfo {
            login_id: "VRTC1".into(),
            balance: dec!(1000),
            currency: "USD".into(),
            is_virtual: true,
        }
    }

    fn mock_broker() -> MockBrokerApi {
        let mut broker = MockBrokerApi::new();
        broker.expect_account().returning(account);
        broker
            .expect_connection_state()
            .returning(|| ConnectionState::Ready);
        broker.expect_subscribe().returning(|_| Ok(()));
        broker.expect_unsubscribe().returning(|_| Ok(()));
        broker.expect_tick_history().returning(|_, _| Ok(Vec::new()));
        broker.expect_disconnect().returning(|| ());
        broker
    }

    fn receipt(contract_id: u64, order: &OrderRequest) -> BuyReceipt {
        BuyReceipt {
            contract_id,
            buy_price: order.wire_amount(),
            payout: dec!(0.95),
            balance_after: dec!(999.50),
            purchased_at: Utc::now(),
        }
    }

    /// Accepts orders and never answers them
    #[derive(Default)]
    struct StalledBroker {
        buys: AtomicUsize,
    }

    #[async_trait]
    impl BrokerApi for StalledBroker {
        fn account(&self) -> AccountInfo {
            account()
        }

        fn connection_state(&self) -> ConnectionState {
            ConnectionState::Ready
        }

        async fn buy(&self, _order: &OrderRequest) -> std::result::Result<BuyReceipt, RequestError> {
            self.buys.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn subscribe(&self, _key: SubscriptionKey) -> std::result::Result<(), RequestError> {
            Ok(())
        }

        async fn unsubscribe(&self, _key: SubscriptionKey) -> std::result::Result<(), RequestError> {
            Ok(())
        }

        async fn tick_history(
            &self,
            _symbol: &str,
            _count: u32,
        ) -> std::result::Result<Vec<crate::domain::Tick>, RequestError> {
            Ok(Vec::new())
        }

        async fn contract_status(&self, _contract_id: u64) -> std::result::Result<ContractUpdate, RequestError> {
            Err(RequestError::ConnectionLost)
        }

        async fn disconnect(&self) {}
    }

    fn new_runner(
        broker: Arc<dyn BrokerApi>,
        signals: Option<Box<dyn SignalSource>>,
    ) -> (
        SessionRunner,
        SessionHandle,
        broadcast::Receiver<SessionEvent>,
        mpsc::UnboundedSender<BrokerEvent>,
    ) {
        let mut config = SessionConfig::new("R_100", dec!(0.50), DurationSpec::ticks(5));
        config.history_preload = 0;
        let session = TradingSession::new("VRTC1", "USD", config, RiskController::new(RiskConfig::default()));
        let recovery = RecoveryStore::new(
            Arc::new(MemorySnapshotStore::new()),
            Duration::from_secs(1800),
            RiskConfig::default(),
        );
        let (events_tx, events_rx) = broadcast::channel(64);
        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let (runner, handle) = SessionRunner::new(session, broker, broker_rx, signals, recovery, events_tx);
        (runner, handle, events_rx, broker_tx)
    }

    fn spawn_with(
        broker: Arc<dyn BrokerApi>,
    ) -> (
        SessionHandle,
        broadcast::Receiver<SessionEvent>,
        mpsc::UnboundedSender<BrokerEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        let (runner, handle, events_rx, broker_tx) = new_runner(broker, None);
        let task = tokio::spawn(runner.run());
        (handle, events_rx, broker_tx, task)
    }

    fn spawn_runner(
        broker: MockBrokerApi,
    ) -> (
        SessionHandle,
        broadcast::Receiver<SessionEvent>,
        mpsc::UnboundedSender<BrokerEvent>,
        tokio::task::JoinHandle<()>,
    ) {
        spawn_with(Arc::new(broker))
    }

    async fn next_event_within(rx: &mut broadcast::Receiver<SessionEvent>, within: Duration) -> SessionEvent {
        tokio::time::timeout(within, rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
        next_event_within(rx, Duration::from_secs(2)).await
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_runner_with_signal_source_is_spawnable() {
        let source: Box<dyn SignalSource> = Box::new(TickTrendSignal::new("R_100", 20, 3));
        let (runner, _handle, _events, _broker_tx) = new_runner(Arc::new(mock_broker()), Some(source));
        let run = runner.run();
        assert_send(&run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_buy_times_out_to_evaluating() {
        let broker = Arc::new(StalledBroker::default());
        let (handle, mut events, _broker_tx, _task) = spawn_with(broker.clone());

        handle
            .push_signal(Signal::new(SignalDirection::Buy, 0.9, "R_100"))
            .await
            .unwrap();
        match next_event_within(&mut events, Duration::from_secs(300)).await {
            SessionEvent::Error { fatal, message, .. } => {
                assert!(!fatal);
                assert!(message.contains("no buy result within 30s"));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let status = handle.status().await;
        assert_eq!(status.state, SessionState::Evaluating);
        assert_eq!(status.martingale_level, 0);
        assert_eq!(status.stake, dec!(0.50));
        assert_eq!(broker.buys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_then_fill_buys_twice() {
        let buys = Arc::new(AtomicUsize::new(0));
        let calls = buys.clone();
        let mut broker = mock_broker();
        broker.expect_buy().returning(move |order| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(RequestError::Timeout {
                    intent: "buy".into(),
                    elapsed_ms: 10_000,
                })
            } else {
                Ok(receipt(42, order))
            }
        });
        let (handle, mut events, _broker_tx, _task) = spawn_runner(broker);

        handle
            .push_signal(Signal::new(SignalDirection::Buy, 0.9, "R_100"))
            .await
            .unwrap();
        match next_event_within(&mut events, Duration::from_secs(300)).await {
            SessionEvent::OrderOpened { contract_id, stake, .. } => {
                assert_eq!(contract_id, 42);
                assert_eq!(stake, dec!(0.50));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(buys.load(Ordering::SeqCst), 2);

        // Buy timeout was cancelled by the fill
        sleep(Duration::from_secs(40)).await;
        assert_eq!(handle.status().await.state, SessionState::Open);
        assert_eq!(buys.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsettled_contract_is_polled_then_abandoned() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let mut broker = mock_broker();
        broker.expect_buy().returning(|order| Ok(receipt(42, order)));
        broker.expect_contract_status().returning(move |contract_id| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ContractUpdate {
                contract_id,
                status: ContractStatus::Open,
                is_sold: false,
                profit: dec!(0.10),
                buy_price: dec!(0.50),
                sell_price: None,
                exit_tick: None,
            })
        });
        let (handle, mut events, _broker_tx, _task) = spawn_runner(broker);

        handle
            .push_signal(Signal::new(SignalDirection::Buy, 0.9, "R_100"))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::OrderOpened { contract_id: 42, .. }
        ));

        match next_event_within(&mut events, Duration::from_secs(600)).await {
            SessionEvent::Error { fatal, message, .. } => {
                assert!(!fatal);
                assert!(message.contains("contract 42 did not settle"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(polls.load(Ordering::SeqCst), 1);

        let status = handle.status().await;
        assert_eq!(status.state, SessionState::Evaluating);
        assert_eq!(status.open_contract, None);
        assert_eq!(status.martingale_level, 0);
        assert_eq!(status.total_trades, 0);
    }

    #[tokio::test]
    async fn test_manual_stop_when_evaluating() {
        let (handle, mut events, _broker_tx, task) = spawn_runner(mock_broker());

        assert_eq!(handle.stop().await.unwrap(), StopRequest::Stopped);
        match next_event(&mut events).await {
            SessionEvent::SessionStopped { reason, summary, .. } => {
                assert_eq!(reason, StopReason::Manual);
                assert_eq!(summary.total_trades, 0);
            }
            other => panic!("unexpected event {:?}", other),
        }
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        assert!(handle.is_stopped().await);
    }

    #[tokio::test]
    async fn test_signal_to_settlement() {
        let mut broker = mock_broker();
        broker.expect_buy().returning(|order| Ok(receipt(42, order)));
        let (handle, mut events, broker_tx, _task) = spawn_runner(broker);

        handle
            .push_signal(Signal::new(SignalDirection::Buy, 0.9, "R_100"))
            .await
            .unwrap();
        match next_event(&mut events).await {
            SessionEvent::OrderOpened { contract_id, stake, .. } => {
                assert_eq!(contract_id, 42);
                assert_eq!(stake, dec!(0.50));
            }
            other => panic!("unexpected event {:?}", other),
        }

        broker_tx
            .send(BrokerEvent::Contract(ContractUpdate {
                contract_id: 42,
                status: ContractStatus::Lost,
                is_sold: true,
                profit: dec!(-0.50),
                buy_price: dec!(0.50),
                sell_price: Some(dec!(0)),
                exit_tick: None,
            }))
            .unwrap();
        match next_event(&mut events).await {
            SessionEvent::OrderClosed { outcome, pnl, .. } => {
                assert!(!outcome.is_win());
                assert_eq!(pnl, dec!(-0.50));
            }
            other => panic!("unexpected event {:?}", other),
        }

        let status = handle.status().await;
        assert_eq!(status.state, SessionState::Evaluating);
        assert_eq!(status.martingale_level, 1);
        assert_eq!(status.stake, dec!(1.05));
    }

    #[tokio::test]
    async fn test_rejected_buy_returns_to_evaluating() {
        let mut broker = mock_broker();
        broker.expect_buy().times(1).returning(|_| {
            Err(RequestError::Rejected {
                code: "InvalidContractProposal".into(),
                message: "bad duration".into(),
            })
        });
        let (handle, mut events, _broker_tx, _task) = spawn_runner(broker);

        handle
            .push_signal(Signal::new(SignalDirection::Sell, 0.9, "R_100"))
            .await
            .unwrap();
        match next_event(&mut events).await {
            SessionEvent::Error { fatal, message, .. } => {
                assert!(!fatal);
                assert!(message.contains("bad duration"));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(handle.status().await.state, SessionState::Evaluating);
    }

    #[tokio::test]
    async fn test_auth_revoked_stops_session() {
        let (handle, mut events, broker_tx, task) = spawn_runner(mock_broker());
        broker_tx
            .send(BrokerEvent::AuthRevoked {
                code: "InvalidToken".into(),
                message: "token revoked".into(),
            })
            .unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::Error { fatal: true, .. }
        ));
        assert!(matches!(
            next_event(&mut events).await,
            SessionEvent::SessionStopped {
                reason: StopReason::Fatal { .. },
                ..
            }
        ));
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();
        drop(handle);
    }
}
