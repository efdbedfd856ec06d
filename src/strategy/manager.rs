//! Session Manager
//!
//! Keyed store of trading sessions (account id -> running session):
//! - Start sessions (connect, restore, spawn runner)
//! - Stop sessions and route external signals
//! - Status queries and the front-end event channel
//! - Graceful shutdown that snapshots every live session

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::risk::RiskController;
use super::runner::{SessionHandle, SessionRunner};
use super::session::{SessionEvent, SessionStatus, StopRequest, TradingSession};
use super::signal::SignalSource;
use crate::adapters::BrokerConnector;
use crate::config::{RiskConfig, SessionConfig};
use crate::domain::{Credentials, Signal};
use crate::error::{Result, TickbotError};
use crate::persistence::RecoveryStore;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Builds the signal source for a new session
pub type SignalFactory = Arc<dyn Fn(&SessionConfig) -> Box<dyn SignalSource> + Send + Sync>;

/// A session with its runner task
struct ManagedSession {
    handle: SessionHandle,
    task: JoinHandle<()>,
    started_at: DateTime<Utc>,
    retain: Duration,
}

/// Owns every trading session in the process
pub struct SessionManager {
    connector: Arc<dyn BrokerConnector>,
    recovery: RecoveryStore,
    risk: RiskConfig,
    signal_factory: Option<SignalFactory>,
    sessions: RwLock<HashMap<String, ManagedSession>>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn BrokerConnector>, recovery: RecoveryStore, risk: RiskConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            connector,
            recovery,
            risk,
            signal_factory: None,
            sessions: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Sessions get a signal source from `factory`; without one they only
    /// act on pushed signals
    pub fn with_signal_factory(mut self, factory: SignalFactory) -> Self {
        self.signal_factory = Some(factory);
        self
    }

    /// Front-end notification channel
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Connect, restore any fresh snapshot, and start a session
    pub async fn start(&self, credentials: Credentials, config: SessionConfig) -> Result<SessionStatus> {
        self.prune_stopped(Utc::now()).await;

        let account_type = credentials.account_type;
        info!(
            "Starting {} session on {} (token {})",
            account_type,
            config.symbol,
            credentials.masked()
        );

        let (broker_tx, broker_rx) = mpsc::unbounded_channel();
        let broker = self.connector.connect(credentials, broker_tx).await?;
        let account = broker.account();
        let account_id = account.login_id.clone();

        if self.is_running(&account_id).await {
            warn!("Session for {} already running, closing new connection", account_id);
            broker.disconnect().await;
            return Err(TickbotError::AlreadyRunning(account_id));
        }

        let risk = RiskController::new(self.risk.clone());
        let session = match self.recovery.restore(&account_id).await {
            Some(snapshot) if snapshot.symbol == config.symbol => {
                TradingSession::from_snapshot(snapshot, account.currency.clone(), config.clone(), risk)
            }
            Some(snapshot) => {
                info!(
                    "Snapshot for {} traded {}, not {}; starting fresh",
                    account_id, snapshot.symbol, config.symbol
                );
                self.recovery.discard(&account_id).await;
                TradingSession::new(account_id.clone(), account.currency.clone(), config.clone(), risk)
            }
            None => TradingSession::new(account_id.clone(), account.currency.clone(), config.clone(), risk),
        };

        let signals = self.signal_factory.as_ref().map(|factory| factory(&config));
        let (mut runner, handle) = SessionRunner::new(
            session,
            broker,
            broker_rx,
            signals,
            self.recovery.clone(),
            self.events.clone(),
        );
        runner.start().await;
        let task = tokio::spawn(runner.run());

        let mut sessions = self.sessions.write().await;
        if sessions.get(&account_id).map(|s| !s.task.is_finished()).unwrap_or(false) {
            // Lost a race with a concurrent start for the same account
            task.abort();
            return Err(TickbotError::AlreadyRunning(account_id));
        }
        sessions.insert(
            account_id.clone(),
            ManagedSession {
                handle: handle.clone(),
                task,
                started_at: Utc::now(),
                retain: Duration::from_secs(config.retain_stopped_secs),
            },
        );
        drop(sessions);

        info!("Session {} started", account_id);
        Ok(handle.status().await)
    }

    /// Manual stop; deferred while an order is outstanding
    pub async fn stop(&self, account_id: &str) -> Result<StopRequest> {
        let handle = self.handle(account_id).await?;
        let outcome = handle.stop().await?;
        info!("Stop for {}: {:?}", account_id, outcome);
        Ok(outcome)
    }

    pub async fn status(&self, account_id: &str) -> Result<SessionStatus> {
        self.prune_stopped(Utc::now()).await;
        let handle = self.handle(account_id).await?;
        Ok(handle.status().await)
    }

    pub async fn statuses(&self) -> Vec<SessionStatus> {
        let handles: Vec<SessionHandle> = {
            let sessions = self.sessions.read().await;
            sessions.values().map(|s| s.handle.clone()).collect()
        };
        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            statuses.push(handle.status().await);
        }
        statuses
    }

    /// Route an external signal to a session
    pub async fn push_signal(&self, account_id: &str, signal: Signal) -> Result<()> {
        self.handle(account_id).await?.push_signal(signal).await
    }

    pub async fn is_running(&self, account_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .get(account_id)
            .map(|s| !s.task.is_finished())
            .unwrap_or(false)
    }

    pub async fn list(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Snapshot and suspend every live session
    pub async fn shutdown_all(&self) {
        let drained: Vec<(String, ManagedSession)> = self.sessions.write().await.drain().collect();
        info!("Shutting down {} session(s)", drained.len());

        for (account_id, managed) in drained {
            if !managed.task.is_finished() {
                if let Err(e) = managed.handle.shutdown().await {
                    debug!("{}: runner already gone: {}", account_id, e);
                }
            }
            match managed.task.await {
                Ok(()) => debug!(
                    "{}: runner joined (ran since {})",
                    account_id, managed.started_at
                ),
                Err(e) => error!("{}: runner task failed: {}", account_id, e),
            }
        }
    }

    async fn handle(&self, account_id: &str) -> Result<SessionHandle> {
        self.sessions
            .read()
            .await
            .get(account_id)
            .map(|s| s.handle.clone())
            .ok_or_else(|| TickbotError::SessionNotFound(account_id.to_string()))
    }

    /// Forget stopped sessions past their retention window
    async fn prune_stopped(&self, now: DateTime<Utc>) {
        let candidates: Vec<(String, SessionHandle, Duration)> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| s.task.is_finished())
                .map(|(id, s)| (id.clone(), s.handle.clone(), s.retain))
                .collect()
        };

        for (account_id, handle, retain) in candidates {
            let stopped_at = handle.status().await.stopped_at;
            let expired = match stopped_at {
                Some(at) => {
                    let retain = chrono::Duration::from_std(retain).unwrap_or(chrono::Duration::zero());
                    now >= at + retain
                }
                // Runner exited without a terminal stop (suspended)
                None => true,
            };
            if expired {
                debug!("Disposing stopped session {}", account_id);
                self.sessions.write().await.remove(&account_id);
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("recovery", &self.recovery)
            .finish_non_exhaustive()
    }
}
