//! Trading sessions
//!
//! - `risk`: stake sizing and stop conditions
//! - `signal`: signal source boundary
//! - `session`: per-account state machine
//! - `runner`: async driver for one session
//! - `manager`: keyed session registry and front-end API

pub mod manager;
pub mod risk;
pub mod runner;
pub mod session;
pub mod signal;

pub use manager::{SessionManager, SignalFactory};
pub use risk::{MultiplierTier, RiskController, RiskSnapshot, StakeDecision};
pub use runner::{SessionCommand, SessionHandle, SessionRunner};
pub use session::{
    ContractProgress, OrderFailure, OrderPlaced, SessionEvent, SessionStatus, StopRequest,
    TradingSession,
};
pub use signal::{SignalSource, TickTrendSignal};
