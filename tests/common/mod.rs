//! In-process broker used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

use tickbot::adapters::{BrokerApi, BrokerConnector, BrokerEvent, SubscriptionKey};
use tickbot::domain::{
    AccountInfo, BuyReceipt, ConnectionState, ContractStatus, ContractUpdate, Credentials,
    OrderRequest, Tick,
};
use tickbot::error::RequestError;
use tickbot::strategy::SessionEvent;

pub const GOOD_TOKEN: &str = "abcdefghijklmnop1234";

pub fn demo_account() -> AccountInfo {
    AccountInfo {
        login_id: "VRTC100".into(),
        balance: dec!(1000),
        currency: "USD".into(),
        is_virtual: true,
    }
}

/// One accepted connection
pub struct FakeBroker {
    account: AccountInfo,
    events: mpsc::UnboundedSender<BrokerEvent>,
    next_contract: AtomicU64,
    connected: AtomicBool,
    pub buys: Mutex<Vec<OrderRequest>>,
    pub subscribed: Mutex<Vec<SubscriptionKey>>,
    pub unsubscribed: Mutex<Vec<SubscriptionKey>>,
}

impl FakeBroker {
    fn new(account: AccountInfo, events: mpsc::UnboundedSender<BrokerEvent>) -> Self {
        Self {
            account,
            events,
            next_contract: AtomicU64::new(1000),
            connected: AtomicBool::new(true),
            buys: Mutex::new(Vec::new()),
            subscribed: Mutex::new(Vec::new()),
            unsubscribed: Mutex::new(Vec::new()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn buy_count(&self) -> usize {
        self.buys.lock().unwrap().len()
    }

    pub fn was_unsubscribed(&self, key: &SubscriptionKey) -> bool {
        self.unsubscribed.lock().unwrap().contains(key)
    }

    /// Simulate credentials rejected during a reconnect
    pub fn revoke(&self) {
        self.events
            .send(BrokerEvent::AuthRevoked {
                code: "InvalidToken".into(),
                message: "Token revoked".into(),
            })
            .unwrap();
    }

    /// Push a sold contract update through the event stream
    pub fn settle(&self, contract_id: u64, stake: Decimal, won: bool) {
        let profit = if won { (stake * dec!(0.95)).round_dp(2) } else { -stake };
        let update = ContractUpdate {
            contract_id,
            status: if won { ContractStatus::Won } else { ContractStatus::Lost },
            is_sold: true,
            profit,
            buy_price: stake,
            sell_price: Some(stake + profit),
            exit_tick: None,
        };
        self.events.send(BrokerEvent::Contract(update)).unwrap();
    }
}

#[async_trait]
impl BrokerApi for FakeBroker {
    fn account(&self) -> AccountInfo {
        self.account.clone()
    }

    fn connection_state(&self) -> ConnectionState {
        if self.is_connected() {
            ConnectionState::Ready
        } else {
            ConnectionState::Terminated
        }
    }

    async fn buy(&self, order: &OrderRequest) -> Result<BuyReceipt, RequestError> {
        self.buys.lock().unwrap().push(order.clone());
        Ok(BuyReceipt {
            contract_id: self.next_contract.fetch_add(1, Ordering::SeqCst),
            buy_price: order.wire_amount(),
            payout: (order.wire_amount() * dec!(1.95)).round_dp(2),
            balance_after: self.account.balance - order.wire_amount(),
            purchased_at: Utc::now(),
        })
    }

    async fn subscribe(&self, key: SubscriptionKey) -> Result<(), RequestError> {
        self.subscribed.lock().unwrap().push(key);
        Ok(())
    }

    async fn unsubscribe(&self, key: SubscriptionKey) -> Result<(), RequestError> {
        self.unsubscribed.lock().unwrap().push(key);
        Ok(())
    }

    async fn tick_history(&self, _symbol: &str, _count: u32) -> Result<Vec<Tick>, RequestError> {
        Ok(Vec::new())
    }

    async fn contract_status(&self, _contract_id: u64) -> Result<ContractUpdate, RequestError> {
        Err(RequestError::ConnectionLost)
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Hands out [`FakeBroker`]s and keeps them for inspection
pub struct FakeConnector {
    account: AccountInfo,
    pub connections: Mutex<Vec<Arc<FakeBroker>>>,
}

impl FakeConnector {
    pub fn new(account: AccountInfo) -> Self {
        Self {
            account,
            connections: Mutex::new(Vec::new()),
        }
    }

    pub fn last(&self) -> Arc<FakeBroker> {
        self.connections.lock().unwrap().last().cloned().unwrap()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[async_trait]
impl BrokerConnector for FakeConnector {
    async fn connect(
        &self,
        credentials: Credentials,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<Arc<dyn BrokerApi>, RequestError> {
        if credentials.token() != GOOD_TOKEN {
            return Err(RequestError::Auth {
                code: "InvalidToken".into(),
                message: "The token is invalid.".into(),
            });
        }
        let broker = Arc::new(FakeBroker::new(self.account.clone(), events));
        self.connections.lock().unwrap().push(broker.clone());
        Ok(broker)
    }
}

/// Wait for the first event matching `pred`, skipping the rest
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event in time")
}

/// Poll until the condition holds
pub async fn eventually<F>(mut cond: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition in time")
}
