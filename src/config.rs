use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{AccountType, Credentials, DurationSpec};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub risk: RiskConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// WebSocket endpoint without the app_id query
    pub ws_url: String,
    /// Registered application id
    pub app_id: String,
    #[serde(default)]
    pub demo_token: Option<String>,
    #[serde(default)]
    pub real_token: Option<String>,
}

impl BrokerConfig {
    /// Full endpoint including the app_id query parameter
    pub fn endpoint(&self) -> String {
        let separator = if self.ws_url.contains('?') { '&' } else { '?' };
        format!("{}{}app_id={}", self.ws_url, separator, self.app_id)
    }

    /// Token for the requested account type
    pub fn credentials(&self, account_type: AccountType) -> Option<Credentials> {
        let token = match account_type {
            AccountType::Demo => self.demo_token.as_ref(),
            AccountType::Real => self.real_token.as_ref(),
        }?;
        if token.trim().is_empty() {
            return None;
        }
        Some(Credentials::new(account_type, token.trim()))
    }
}

/// Protocol client timings
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Default correlated-request timeout
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// Forced teardown when nothing arrives for this long
    #[serde(default = "default_inactivity_timeout_secs")]
    pub inactivity_timeout_secs: u64,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Positive jitter as a fraction of the computed delay (e.g. 0.25)
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_window_secs")]
    pub breaker_window_secs: u64,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_auth_timeout_secs() -> u64 {
    30
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_inactivity_timeout_secs() -> u64 {
    120
}

fn default_reconnect_base_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_fraction() -> f64 {
    0.25
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_window_secs() -> u64 {
    300
}

fn default_breaker_cooldown_secs() -> u64 {
    120
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: default_request_timeout_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            auth_timeout_secs: default_auth_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            inactivity_timeout_secs: default_inactivity_timeout_secs(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            jitter_fraction: default_jitter_fraction(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_window_secs: default_breaker_window_secs(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl ConnectionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Per-session trading parameters
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Underlying symbol (e.g., "R_100")
    pub symbol: String,
    /// Stake at martingale level 0
    pub base_stake: Decimal,
    /// Contract length, "5t" style
    pub duration: DurationSpec,
    /// Stop after this many settled trades (0 = unlimited)
    #[serde(default)]
    pub target_trades: u32,
    /// Signals below this confidence are ignored
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Minimum gap between a settlement and the next order
    #[serde(default)]
    pub cooldown_secs: u64,
    /// Buy attempts per signal, including the first
    #[serde(default = "default_max_order_attempts")]
    pub max_order_attempts: u32,
    #[serde(default = "default_order_retry_base_ms")]
    pub order_retry_base_ms: u64,
    /// Hard ceiling on PENDING_ORDER, independent of retries
    #[serde(default = "default_buy_timeout_secs")]
    pub buy_timeout_secs: u64,
    /// Wait while OPEN before polling the contract
    #[serde(default = "default_settlement_timeout_secs")]
    pub settlement_timeout_secs: u64,
    /// Ticks of history requested on start (0 = live warmup only)
    #[serde(default = "default_history_preload")]
    pub history_preload: u32,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
    /// How long a stopped session stays visible to status queries
    #[serde(default = "default_retain_stopped_secs")]
    pub retain_stopped_secs: u64,
    #[serde(default = "default_error_notifications_per_minute")]
    pub error_notifications_per_minute: u32,
}

fn default_min_confidence() -> f64 {
    0.6
}

fn default_max_order_attempts() -> u32 {
    3
}

fn default_order_retry_base_ms() -> u64 {
    1_000
}

fn default_buy_timeout_secs() -> u64 {
    30
}

fn default_settlement_timeout_secs() -> u64 {
    120
}

fn default_history_preload() -> u32 {
    100
}

fn default_snapshot_interval_secs() -> u64 {
    60
}

fn default_retain_stopped_secs() -> u64 {
    300
}

fn default_error_notifications_per_minute() -> u32 {
    6
}

impl SessionConfig {
    pub fn new(symbol: impl Into<String>, base_stake: Decimal, duration: DurationSpec) -> Self {
        Self {
            symbol: symbol.into(),
            base_stake,
            duration,
            target_trades: 0,
            min_confidence: default_min_confidence(),
            cooldown_secs: 0,
            max_order_attempts: default_max_order_attempts(),
            order_retry_base_ms: default_order_retry_base_ms(),
            buy_timeout_secs: default_buy_timeout_secs(),
            settlement_timeout_secs: default_settlement_timeout_secs(),
            history_preload: default_history_preload(),
            snapshot_interval_secs: default_snapshot_interval_secs(),
            retain_stopped_secs: default_retain_stopped_secs(),
            error_notifications_per_minute: default_error_notifications_per_minute(),
        }
    }
}

/// Stake sizing and stop limits
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Broker minimum stake
    pub min_stake: Decimal,
    /// Martingale level cap; further losses keep the level here
    pub max_martingale_level: u32,
    #[serde(default = "default_multiplier_normal")]
    pub multiplier_normal: Decimal,
    #[serde(default = "default_multiplier_aggressive")]
    pub multiplier_aggressive: Decimal,
    #[serde(default = "default_multiplier_conservative")]
    pub multiplier_conservative: Decimal,
    /// Rolling win rate at or above which the aggressive tier applies
    #[serde(default = "default_aggressive_win_rate")]
    pub aggressive_win_rate: f64,
    /// Rolling win rate below which the conservative tier applies
    #[serde(default = "default_conservative_win_rate")]
    pub conservative_win_rate: f64,
    /// Fewer outcomes than this always use the normal tier
    #[serde(default = "default_tier_min_samples")]
    pub tier_min_samples: usize,
    /// Rolling outcome window
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    /// Exposure ceiling at martingale level 0 (fraction of balance)
    #[serde(default = "default_fresh_exposure_fraction")]
    pub fresh_exposure_fraction: Decimal,
    /// Exposure ceiling inside a loss sequence
    #[serde(default = "default_recovery_exposure_fraction")]
    pub recovery_exposure_fraction: Decimal,
    /// Max session loss as a fraction of baseline balance
    pub max_session_loss_fraction: Decimal,
    pub max_consecutive_losses: u32,
    /// Daily loss limit in account currency (absolute value)
    pub daily_loss_limit: Decimal,
}

fn default_multiplier_normal() -> Decimal {
    Decimal::new(21, 1)
}

fn default_multiplier_aggressive() -> Decimal {
    Decimal::new(25, 1)
}

fn default_multiplier_conservative() -> Decimal {
    Decimal::new(18, 1)
}

fn default_aggressive_win_rate() -> f64 {
    0.6
}

fn default_conservative_win_rate() -> f64 {
    0.4
}

fn default_tier_min_samples() -> usize {
    10
}

fn default_history_window() -> usize {
    20
}

fn default_fresh_exposure_fraction() -> Decimal {
    Decimal::new(25, 2)
}

fn default_recovery_exposure_fraction() -> Decimal {
    Decimal::new(50, 2)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_stake: Decimal::new(35, 2),
            max_martingale_level: 5,
            multiplier_normal: default_multiplier_normal(),
            multiplier_aggressive: default_multiplier_aggressive(),
            multiplier_conservative: default_multiplier_conservative(),
            aggressive_win_rate: default_aggressive_win_rate(),
            conservative_win_rate: default_conservative_win_rate(),
            tier_min_samples: default_tier_min_samples(),
            history_window: default_history_window(),
            fresh_exposure_fraction: default_fresh_exposure_fraction(),
            recovery_exposure_fraction: default_recovery_exposure_fraction(),
            max_session_loss_fraction: Decimal::new(30, 2),
            max_consecutive_losses: 5,
            daily_loss_limit: Decimal::from(100),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Snapshot directory (default: <data dir>/tickbot/sessions)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Snapshots older than this are discarded
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
}

fn default_freshness_secs() -> u64 {
    30 * 60
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            dir: None,
            freshness_secs: default_freshness_secs(),
        }
    }
}

impl RecoveryConfig {
    pub fn snapshot_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tickbot")
                .join("sessions")
        })
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Daily-rolling log file directory
    #[serde(default)]
    pub dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("broker.ws_url", "wss://ws.derivws.com/websockets/v3")?
            .set_default("broker.app_id", "1089")?
            .set_default("session.symbol", "R_100")?
            .set_default("session.base_stake", 0.5)?
            .set_default("session.duration", "5t")?
            .set_default("risk.min_stake", 0.35)?
            .set_default("risk.max_martingale_level", 5)?
            .set_default("risk.max_session_loss_fraction", 0.3)?
            .set_default("risk.max_consecutive_losses", 5)?
            .set_default("risk.daily_loss_limit", 100)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("TICKBOT_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (TICKBOT_BROKER__APP_ID, etc.)
            .add_source(
                Environment::with_prefix("TICKBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            // Broker-conventional variable names take precedence
            .set_override_option("broker.app_id", std::env::var("DERIV_APP_ID").ok())?
            .set_override_option("broker.demo_token", std::env::var("DERIV_TOKEN_DEMO").ok())?
            .set_override_option("broker.real_token", std::env::var("DERIV_TOKEN_REAL").ok())?;

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI usage
    pub fn default_config(symbol: &str) -> Self {
        use rust_decimal_macros::dec;

        Self {
            broker: BrokerConfig {
                ws_url: "wss://ws.derivws.com/websockets/v3".to_string(),
                app_id: std::env::var("DERIV_APP_ID").unwrap_or_else(|_| "1089".to_string()),
                demo_token: std::env::var("DERIV_TOKEN_DEMO").ok(),
                real_token: std::env::var("DERIV_TOKEN_REAL").ok(),
            },
            connection: ConnectionConfig::default(),
            session: SessionConfig::new(symbol, dec!(0.50), DurationSpec::ticks(5)),
            risk: RiskConfig::default(),
            recovery: RecoveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.broker.ws_url.starts_with("wss://") && !self.broker.ws_url.starts_with("ws://") {
            errors.push(format!("broker.ws_url is not a websocket url: {}", self.broker.ws_url));
        }
        if self.broker.app_id.trim().is_empty() {
            errors.push("broker.app_id must not be empty".to_string());
        }

        // Session params
        if self.session.symbol.trim().is_empty() {
            errors.push("session.symbol must not be empty".to_string());
        }
        if self.session.base_stake < self.risk.min_stake {
            errors.push(format!(
                "session.base_stake {} is below the broker minimum {}",
                self.session.base_stake, self.risk.min_stake
            ));
        }
        if !(0.0..=1.0).contains(&self.session.min_confidence) {
            errors.push("session.min_confidence must be between 0 and 1".to_string());
        }
        if self.session.max_order_attempts == 0 {
            errors.push("session.max_order_attempts must be at least 1".to_string());
        }
        if self.session.buy_timeout_secs == 0 || self.session.settlement_timeout_secs == 0 {
            errors.push("session buy/settlement timeouts must be positive".to_string());
        }

        // Risk params
        if self.risk.min_stake <= Decimal::ZERO {
            errors.push("risk.min_stake must be positive".to_string());
        }
        if self.risk.multiplier_conservative <= Decimal::ONE
            || self.risk.multiplier_normal < self.risk.multiplier_conservative
            || self.risk.multiplier_aggressive < self.risk.multiplier_normal
        {
            errors.push(
                "risk multipliers must satisfy 1 < conservative <= normal <= aggressive".to_string(),
            );
        }
        if self.risk.conservative_win_rate > self.risk.aggressive_win_rate {
            errors.push("risk.conservative_win_rate must not exceed aggressive_win_rate".to_string());
        }
        for (name, fraction) in [
            ("fresh_exposure_fraction", self.risk.fresh_exposure_fraction),
            ("recovery_exposure_fraction", self.risk.recovery_exposure_fraction),
            ("max_session_loss_fraction", self.risk.max_session_loss_fraction),
        ] {
            if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
                errors.push(format!("risk.{} must be in (0, 1]", name));
            }
        }
        if self.risk.history_window == 0 {
            errors.push("risk.history_window must be positive".to_string());
        }
        if self.risk.max_consecutive_losses == 0 {
            errors.push("risk.max_consecutive_losses must be positive".to_string());
        }
        if self.risk.daily_loss_limit <= Decimal::ZERO {
            errors.push("risk.daily_loss_limit must be positive".to_string());
        }

        // Connection params
        if self.connection.reconnect_base_delay_ms > self.connection.reconnect_max_delay_ms {
            errors.push("connection.reconnect_base_delay_ms exceeds reconnect_max_delay_ms".to_string());
        }
        if self.connection.inactivity_timeout_secs <= self.connection.ping_interval_secs {
            errors.push(
                "connection.inactivity_timeout_secs should be longer than ping_interval_secs"
                    .to_string(),
            );
        }
        if !(0.0..=1.0).contains(&self.connection.jitter_fraction) {
            errors.push("connection.jitter_fraction must be between 0 and 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
