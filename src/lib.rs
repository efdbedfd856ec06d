pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod strategy;

pub use adapters::{BrokerApi, BrokerConnector, BrokerEvent, DerivClient, DerivConnector};
pub use config::AppConfig;
pub use coordination::{CircuitBreaker, CircuitState, ReconnectBackoff};
pub use error::{RequestError, Result, TickbotError};
pub use persistence::{FileSnapshotStore, RecoveryStore, SessionSnapshot};
pub use strategy::{SessionEvent, SessionManager, SessionStatus, TradingSession};
