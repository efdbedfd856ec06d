pub mod broker;
pub mod deriv_messages;
pub mod deriv_ws;
pub mod dispatch;

pub use broker::{BrokerApi, BrokerConnector, BrokerEvent};
pub use deriv_messages::{decode, FrameBody, InboundFrame, Intent, Outbound, SubscriptionKey};
pub use deriv_ws::{DerivClient, DerivConnector};
pub use dispatch::{Dispatched, Dispatcher, StreamEvent};

#[cfg(test)]
pub use broker::MockBrokerApi;
