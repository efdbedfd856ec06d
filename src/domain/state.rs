use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of the single streaming connection to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// Socket handshake in progress
    Connecting,
    /// Socket up, authorize request outstanding
    Authenticating,
    /// Authorized and subscriptions replayed; application traffic allowed
    Ready,
    /// Credentials rejected or connection closed for good
    Terminated,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Ready => "READY",
            ConnectionState::Terminated => "TERMINATED",
        }
    }

    pub fn accepts_requests(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Terminated)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Trading session state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// Created, not yet started
    Idle,
    /// Waiting for the signal source to have enough data
    Warmup,
    /// Steady state: each signal is considered for a trade
    Evaluating,
    /// Buy request sent, no contract yet
    PendingOrder,
    /// Contract bought, waiting for settlement
    Open,
    /// Settlement received, bookkeeping in progress
    Settling,
    /// Terminal
    Stopped,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::Warmup => "WARMUP",
            SessionState::Evaluating => "EVALUATING",
            SessionState::PendingOrder => "PENDING_ORDER",
            SessionState::Open => "OPEN",
            SessionState::Settling => "SETTLING",
            SessionState::Stopped => "STOPPED",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        use SessionState::*;

        match (self, target) {
            // From Idle
            (Idle, Warmup) => true,
            (Idle, Evaluating) => true, // Restored from snapshot
            (Idle, Stopped) => true,

            // From Warmup
            (Warmup, Evaluating) => true, // First signal available
            (Warmup, Stopped) => true,

            // From Evaluating
            (Evaluating, PendingOrder) => true,
            (Evaluating, Stopped) => true,

            // From PendingOrder
            (PendingOrder, Open) => true,       // Buy confirmed
            (PendingOrder, Evaluating) => true, // Retries exhausted / buy timeout
            (PendingOrder, Stopped) => true,    // Auth revoked

            // From Open
            (Open, Settling) => true,
            (Open, Evaluating) => true, // Settlement never arrived, order abandoned
            (Open, Stopped) => true,    // Auth revoked

            // From Settling
            (Settling, Evaluating) => true,
            (Settling, Stopped) => true,

            // All other transitions are invalid
            _ => false,
        }
    }

    /// Get valid next states from current state
    pub fn valid_transitions(&self) -> Vec<SessionState> {
        use SessionState::*;

        match self {
            Idle => vec![Warmup, Evaluating, Stopped],
            Warmup => vec![Evaluating, Stopped],
            Evaluating => vec![PendingOrder, Stopped],
            PendingOrder => vec![Open, Evaluating, Stopped],
            Open => vec![Settling, Evaluating, Stopped],
            Settling => vec![Evaluating, Stopped],
            Stopped => vec![],
        }
    }

    /// An order is outstanding; no new order may be placed
    pub fn has_order_in_flight(&self) -> bool {
        matches!(
            self,
            SessionState::PendingOrder | SessionState::Open | SessionState::Settling
        )
    }

    /// A manual stop here must wait for the order to settle
    pub fn defers_stop(&self) -> bool {
        matches!(self, SessionState::PendingOrder | SessionState::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for SessionState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "IDLE" => Ok(SessionState::Idle),
            "WARMUP" => Ok(SessionState::Warmup),
            "EVALUATING" => Ok(SessionState::Evaluating),
            "PENDING_ORDER" => Ok(SessionState::PendingOrder),
            "OPEN" => Ok(SessionState::Open),
            "SETTLING" => Ok(SessionState::Settling),
            "STOPPED" => Ok(SessionState::Stopped),
            _ => Err(format!("Unknown state: {}", s)),
        }
    }
}

/// State transition event (for logging/debugging)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: SessionState,
    pub to: SessionState,
    pub reason: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl StateTransition {
    pub fn new(from: SessionState, to: SessionState, reason: impl Into<String>) -> Self {
        Self {
            from,
            to,
            reason: reason.into(),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Which risk limit forced a halt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HaltReason {
    MaxConsecutiveLosses { count: u32 },
    SessionLossLimit { loss: Decimal, limit: Decimal },
    DailyLossLimit { loss: Decimal, limit: Decimal },
    InsufficientBalance { balance: Decimal, min_stake: Decimal },
    /// Even the broker minimum stake would breach the exposure ceiling
    ExposureCeiling { balance: Decimal },
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HaltReason::MaxConsecutiveLosses { count } => {
                write!(f, "max consecutive losses ({})", count)
            }
            HaltReason::SessionLossLimit { loss, limit } => {
                write!(f, "session loss ${} exceeds limit ${}", loss, limit)
            }
            HaltReason::DailyLossLimit { loss, limit } => {
                write!(f, "daily loss ${} exceeds limit ${}", loss, limit)
            }
            HaltReason::InsufficientBalance { balance, min_stake } => {
                write!(f, "balance ${} below minimum stake ${}", balance, min_stake)
            }
            HaltReason::ExposureCeiling { balance } => {
                write!(f, "minimum stake breaches exposure ceiling at balance ${}", balance)
            }
        }
    }
}

/// Why a session reached STOPPED
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StopReason {
    TargetReached { trades: u32 },
    RiskLimit(HaltReason),
    Manual,
    /// Unrecoverable connection or authentication failure
    Fatal { message: String },
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::TargetReached { .. } => "target_reached",
            StopReason::RiskLimit(_) => "risk_limit",
            StopReason::Manual => "manual",
            StopReason::Fatal { .. } => "fatal",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::TargetReached { trades } => write!(f, "target reached ({} trades)", trades),
            StopReason::RiskLimit(halt) => write!(f, "risk limit: {}", halt),
            StopReason::Manual => write!(f, "manual stop"),
            StopReason::Fatal { message } => write!(f, "fatal: {}", message),
        }
    }
}
