use thiserror::Error;

/// Main error type for the execution engine
#[derive(Error, Debug)]
pub enum TickbotError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Broker request failed: {0}")]
    Request(#[from] RequestError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // State machine errors
    #[error("Invalid state transition: from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    // Session registry errors
    #[error("Session already running for account {0}")]
    AlreadyRunning(String),

    #[error("No session for account {0}")]
    SessionNotFound(String),

    #[error("Session for account {0} has shut down")]
    SessionClosed(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for TickbotError
pub type Result<T> = std::result::Result<T, TickbotError>;

/// Outcome of a correlated broker request that did not produce a response.
///
/// Connection-level failures surface to sessions only through this type;
/// they never unwind into session logic any other way.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Socket could not be established or broke mid-write.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials rejected. Terminal, never retried.
    #[error("Authentication rejected ({code}): {message}")]
    Auth { code: String, message: String },

    #[error("{intent} timed out after {elapsed_ms}ms")]
    Timeout { intent: String, elapsed_ms: u64 },

    /// Connection tore down while the request was in flight.
    #[error("Connection lost")]
    ConnectionLost,

    /// The broker answered with an error frame.
    #[error("Rejected by broker ({code}): {message}")]
    Rejected { code: String, message: String },
}

/// Broker error codes that mean the credentials themselves are unusable.
pub const AUTH_ERROR_CODES: &[&str] = &[
    "InvalidToken",
    "InvalidAppID",
    "AuthorizationRequired",
    "DisabledClient",
    "AccountDisabled",
    "SelfExclusion",
];

/// Broker error codes worth retrying after a pause.
pub const RETRYABLE_ERROR_CODES: &[&str] = &["RateLimit", "ServiceUnavailable", "InternalServerError"];

impl RequestError {
    /// Classify a broker error frame by its machine-readable code.
    pub fn from_broker(code: &str, message: &str) -> Self {
        if AUTH_ERROR_CODES.contains(&code) {
            RequestError::Auth {
                code: code.to_string(),
                message: message.to_string(),
            }
        } else {
            RequestError::Rejected {
                code: code.to_string(),
                message: message.to_string(),
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            RequestError::Transport(_) | RequestError::Timeout { .. } | RequestError::ConnectionLost => true,
            RequestError::Rejected { code, .. } => RETRYABLE_ERROR_CODES.contains(&code.as_str()),
            RequestError::Auth { .. } => false,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, RequestError::Auth { .. })
    }

    /// Short label used in logs and notifications
    pub fn kind(&self) -> &'static str {
        match self {
            RequestError::Transport(_) => "transport",
            RequestError::Auth { .. } => "auth",
            RequestError::Timeout { .. } => "timeout",
            RequestError::ConnectionLost => "connection_lost",
            RequestError::Rejected { .. } => "rejected",
        }
    }
}
