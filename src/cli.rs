use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::adapters::DerivConnector;
use crate::config::{AppConfig, SessionConfig};
use crate::domain::{AccountType, DurationSpec};
use crate::error::{Result, TickbotError};
use crate::persistence::{FileSnapshotStore, RecoveryStore};
use crate::strategy::{SessionEvent, SessionManager, SessionStatus, SignalFactory, TickTrendSignal};

#[derive(Parser, Debug)]
#[command(name = "tickbot")]
#[command(version = "0.1.0")]
#[command(about = "Martingale execution engine for Deriv binary options", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one trading session until it stops or Ctrl-C
    Run {
        /// Account type (demo, real)
        #[arg(short, long, default_value = "demo")]
        account: AccountType,
        /// Underlying symbol (default from config)
        #[arg(short, long)]
        symbol: Option<String>,
        /// Base stake in account currency
        #[arg(long)]
        stake: Option<Decimal>,
        /// Contract duration, e.g. 5t, 30s, 1m
        #[arg(short, long)]
        duration: Option<DurationSpec>,
        /// Stop after this many settled trades (0 = unlimited)
        #[arg(short, long)]
        target: Option<u32>,
        /// Ticks considered by the trend signal
        #[arg(long, default_value = "20")]
        window: usize,
        /// Consecutive moves required for a signal
        #[arg(long, default_value = "3")]
        streak: usize,
        /// Configuration directory
        #[arg(long, default_value = "config", env = "TICKBOT_CONFIG_DIR")]
        config_dir: PathBuf,
    },
    /// Load and validate the configuration
    CheckConfig {
        #[arg(long, default_value = "config", env = "TICKBOT_CONFIG_DIR")]
        config_dir: PathBuf,
    },
}

/// Session parameters given on the command line
#[derive(Debug, Clone, Default)]
pub struct SessionOverrides {
    pub symbol: Option<String>,
    pub stake: Option<Decimal>,
    pub duration: Option<DurationSpec>,
    pub target: Option<u32>,
}

impl SessionOverrides {
    pub fn apply(&self, base: &SessionConfig) -> SessionConfig {
        let mut config = base.clone();
        if let Some(symbol) = &self.symbol {
            config.symbol = symbol.clone();
        }
        if let Some(stake) = self.stake {
            config.base_stake = stake;
        }
        if let Some(duration) = self.duration {
            config.duration = duration;
        }
        if let Some(target) = self.target {
            config.target_trades = target;
        }
        config
    }
}

/// Load configuration and fail with every validation problem listed
pub fn load_config(config_dir: &Path) -> Result<AppConfig> {
    let config = AppConfig::load_from(config_dir)?;
    config.validate().map_err(|errors| {
        for e in &errors {
            error!("Config: {}", e);
        }
        TickbotError::InvalidConfig(errors.join("; "))
    })?;
    Ok(config)
}

pub fn check_config(config_dir: &Path) -> Result<()> {
    let config = load_config(config_dir)?;

    println!("Configuration OK ({})", config_dir.display());
    println!("  endpoint:   {}", config.broker.ws_url);
    println!("  app_id:     {}", config.broker.app_id);
    for account_type in [AccountType::Demo, AccountType::Real] {
        match config.broker.credentials(account_type) {
            Some(creds) if creds.looks_valid() => {
                println!("  {} token: {}", account_type, creds.masked())
            }
            Some(creds) => println!("  {} token: {} (unexpected format)", account_type, creds.masked()),
            None => println!("  {} token: not set", account_type),
        }
    }
    println!(
        "  session:    {} stake {} duration {}",
        config.session.symbol, config.session.base_stake, config.session.duration
    );
    println!("  snapshots:  {}", config.recovery.snapshot_dir().display());
    Ok(())
}

/// Build a session manager wired to the live broker
pub fn build_manager(config: &AppConfig, window: usize, streak: usize) -> SessionManager {
    let store = FileSnapshotStore::new(config.recovery.snapshot_dir());
    let recovery = RecoveryStore::new(
        Arc::new(store),
        Duration::from_secs(config.recovery.freshness_secs),
        config.risk.clone(),
    );
    let connector = DerivConnector::new(config.connection.clone(), config.broker.endpoint());

    let factory: SignalFactory = Arc::new(move |session: &SessionConfig| {
        Box::new(TickTrendSignal::new(session.symbol.clone(), window, streak))
    });

    SessionManager::new(Arc::new(connector), recovery, config.risk.clone()).with_signal_factory(factory)
}

/// Run a single session in the foreground
pub async fn run_session(
    config: AppConfig,
    account: AccountType,
    overrides: SessionOverrides,
    window: usize,
    streak: usize,
) -> Result<()> {
    let credentials = config.broker.credentials(account).ok_or_else(|| {
        TickbotError::InvalidConfig(format!(
            "no {} token configured (set DERIV_TOKEN_{})",
            account,
            account.as_str().to_uppercase()
        ))
    })?;

    let session_config = overrides.apply(&config.session);
    if session_config.base_stake < config.risk.min_stake {
        return Err(TickbotError::InvalidConfig(format!(
            "stake {} is below the broker minimum {}",
            session_config.base_stake, config.risk.min_stake
        )));
    }

    let manager = build_manager(&config, window, streak);
    let mut events = manager.subscribe_events();

    let status = manager.start(credentials, session_config).await?;
    print_status(&status);
    let account_id = status.account_id.clone();

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, snapshotting sessions");
                manager.shutdown_all().await;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    let finished = matches!(
                        &event,
                        SessionEvent::SessionStopped { account_id: id, .. } if *id == account_id
                    );
                    log_event(&event);
                    if finished {
                        manager.shutdown_all().await;
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event stream lagged, {} event(s) dropped", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    Ok(())
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::OrderOpened { contract_id, direction, stake, level, .. } => {
            info!("Opened #{} {} stake {} (level {})", contract_id, direction, stake, level);
        }
        SessionEvent::OrderClosed { contract_id, outcome, pnl, next_stake, next_level, .. } => {
            info!(
                "Closed #{} {} pnl {} (next stake {}, level {})",
                contract_id,
                outcome,
                pnl,
                next_stake.round_dp(2),
                next_level
            );
        }
        SessionEvent::SessionStopped { reason, summary, .. } => {
            info!("Session stopped: {}", reason);
            print_status(summary);
        }
        SessionEvent::Error { message, fatal: true, .. } => error!("{}", message),
        SessionEvent::Error { message, .. } => warn!("{}", message),
    }
}

fn print_status(status: &SessionStatus) {
    println!(
        "[{}] {} {} | level {} stake {} | trades {} ({}W/{}L, {:.0}%) | pnl {} | balance {}",
        status.account_id,
        status.symbol,
        status.state,
        status.martingale_level,
        status.stake,
        status.total_trades,
        status.wins,
        status.losses,
        status.win_rate * 100.0,
        status.session_pnl,
        status.balance
    );
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::parse_from([
            "tickbot", "run", "--account", "real", "--symbol", "R_50", "--stake", "1.25",
            "--duration", "30s", "--target", "10",
        ]);
        match cli.command {
            Commands::Run { account, symbol, stake, duration, target, .. } => {
                assert_eq!(account, AccountType::Real);
                assert_eq!(symbol.as_deref(), Some("R_50"));
                assert_eq!(stake, Some(dec!(1.25)));
                assert_eq!(duration.map(|d| d.to_string()).as_deref(), Some("30s"));
                assert_eq!(target, Some(10));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_overrides_keep_unset_fields() {
        let base = SessionConfig::new("R_100", dec!(0.50), DurationSpec::ticks(5));
        let overrides = SessionOverrides {
            stake: Some(dec!(2)),
            ..Default::default()
        };
        let config = overrides.apply(&base);
        assert_eq!(config.symbol, "R_100");
        assert_eq!(config.base_stake, dec!(2));
        assert_eq!(config.duration, base.duration);
        assert_eq!(config.target_trades, 0);
    }
}
