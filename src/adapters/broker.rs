//! Broker seam used by trading sessions.
//!
//! Sessions never touch the socket; they see the connection only through
//! [`BrokerApi`] calls and the [`BrokerEvent`] stream handed to the connector.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::deriv_messages::SubscriptionKey;
use super::dispatch::StreamEvent;
use crate::domain::{
    AccountInfo, BuyReceipt, ConnectionState, ContractUpdate, Credentials, OrderRequest, Tick,
};
use crate::error::RequestError;

/// Everything the connection pushes to its owning session
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Tick(Tick),
    Contract(ContractUpdate),
    Balance { balance: Decimal, currency: String },
    /// Connection lifecycle change (READY is sent only after replay)
    Connection(ConnectionState),
    /// Credentials rejected during a reconnect; the connection is gone for good
    AuthRevoked { code: String, message: String },
}

impl From<StreamEvent> for BrokerEvent {
    fn from(event: StreamEvent) -> Self {
        match event {
            StreamEvent::Tick(tick) => BrokerEvent::Tick(tick),
            StreamEvent::Contract(update) => BrokerEvent::Contract(update),
            StreamEvent::Balance { balance, currency } => BrokerEvent::Balance { balance, currency },
        }
    }
}

/// Calls a session can make on its connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BrokerApi: Send + Sync {
    /// Account details from the last successful authorization
    fn account(&self) -> AccountInfo;

    fn connection_state(&self) -> ConnectionState;

    async fn buy(&self, order: &OrderRequest) -> Result<BuyReceipt, RequestError>;

    /// Idempotent; replayed automatically after reconnect
    async fn subscribe(&self, key: SubscriptionKey) -> Result<(), RequestError>;

    async fn unsubscribe(&self, key: SubscriptionKey) -> Result<(), RequestError>;

    async fn tick_history(&self, symbol: &str, count: u32) -> Result<Vec<Tick>, RequestError>;

    /// One-off contract poll, no subscription
    async fn contract_status(&self, contract_id: u64) -> Result<ContractUpdate, RequestError>;

    async fn disconnect(&self);
}

/// Opens authenticated connections
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Connect and authorize. `AuthError` is terminal, `TransportError` retryable.
    async fn connect(
        &self,
        credentials: Credentials,
        events: mpsc::UnboundedSender<BrokerEvent>,
    ) -> Result<Arc<dyn BrokerApi>, RequestError>;
}
