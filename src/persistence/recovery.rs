//! Session recovery
//!
//! A session is snapshotted after every settlement, periodically, and on
//! graceful shutdown. On restart the latest snapshot is restored only if it
//! is fresh and passes integrity checks; anything else is discarded and the
//! session starts clean.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::SnapshotStore;
use crate::config::RiskConfig;
use crate::domain::{SessionState, TradeRecord};
use crate::error::Result;

pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

/// Durable copy of a trading session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub schema_version: u32,
    pub account_id: String,
    pub symbol: String,
    pub state: SessionState,
    pub martingale_level: u32,
    pub stake: Decimal,
    pub base_stake: Decimal,
    pub multiplier: Decimal,
    pub baseline_balance: Decimal,
    pub balance: Decimal,
    pub highest_balance: Decimal,
    pub lowest_balance: Decimal,
    pub session_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub daily_date: NaiveDate,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub consecutive_losses: u32,
    /// Oldest first
    pub history: Vec<TradeRecord>,
    pub last_trade_at: Option<DateTime<Utc>>,
    /// Contract that was open when the snapshot was taken
    pub open_contract: Option<u64>,
    pub taken_at: DateTime<Utc>,
}

/// Why a stored snapshot was not restored
#[derive(Debug, Error, PartialEq)]
pub enum IntegrityError {
    #[error("malformed snapshot: {0}")]
    Malformed(String),

    #[error("schema version {found} (expected {expected})")]
    SchemaVersion { found: u32, expected: u32 },

    #[error("snapshot belongs to {found}, not {expected}")]
    AccountMismatch { found: String, expected: String },

    #[error("snapshot is {age_secs}s old (limit {limit_secs}s)")]
    Stale { age_secs: i64, limit_secs: u64 },

    #[error("snapshot timestamp {0} is in the future")]
    FutureTimestamp(DateTime<Utc>),

    #[error("martingale level {level} exceeds maximum {max}")]
    LevelOutOfBounds { level: u32, max: u32 },

    #[error("consecutive losses {consecutive} exceed total losses {losses}")]
    ConsecutiveLosses { consecutive: u32, losses: u32 },

    #[error("wins {wins} + losses {losses} != trades {total}")]
    CounterMismatch { wins: u32, losses: u32, total: u32 },

    #[error("stake ${stake} below broker minimum ${min}")]
    StakeBelowMinimum { stake: Decimal, min: Decimal },

    #[error("negative balance field: {0}")]
    NegativeBalance(&'static str),

    #[error("history holds {len} trades (window {window})")]
    HistoryTooLong { len: usize, window: usize },

    #[error("session already stopped")]
    Terminal,
}

/// Validate a snapshot for `account_id` as of `now`
pub fn validate(
    snapshot: &SessionSnapshot,
    account_id: &str,
    now: DateTime<Utc>,
    freshness: Duration,
    risk: &RiskConfig,
) -> std::result::Result<(), IntegrityError> {
    if snapshot.schema_version != SNAPSHOT_SCHEMA_VERSION {
        return Err(IntegrityError::SchemaVersion {
            found: snapshot.schema_version,
            expected: SNAPSHOT_SCHEMA_VERSION,
        });
    }
    if snapshot.account_id != account_id {
        return Err(IntegrityError::AccountMismatch {
            found: snapshot.account_id.clone(),
            expected: account_id.to_string(),
        });
    }

    // Small allowance for clock skew between writer and reader
    let age = now.signed_duration_since(snapshot.taken_at);
    if age < -chrono::Duration::seconds(5) {
        return Err(IntegrityError::FutureTimestamp(snapshot.taken_at));
    }
    if age.num_seconds() > freshness.as_secs() as i64 {
        return Err(IntegrityError::Stale {
            age_secs: age.num_seconds(),
            limit_secs: freshness.as_secs(),
        });
    }

    if snapshot.state.is_terminal() {
        return Err(IntegrityError::Terminal);
    }
    if snapshot.martingale_level > risk.max_martingale_level {
        return Err(IntegrityError::LevelOutOfBounds {
            level: snapshot.martingale_level,
            max: risk.max_martingale_level,
        });
    }
    if snapshot.consecutive_losses > snapshot.losses {
        return Err(IntegrityError::ConsecutiveLosses {
            consecutive: snapshot.consecutive_losses,
            losses: snapshot.losses,
        });
    }
    if snapshot.wins.checked_add(snapshot.losses) != Some(snapshot.total_trades) {
        return Err(IntegrityError::CounterMismatch {
            wins: snapshot.wins,
            losses: snapshot.losses,
            total: snapshot.total_trades,
        });
    }
    if snapshot.stake < risk.min_stake {
        return Err(IntegrityError::StakeBelowMinimum {
            stake: snapshot.stake,
            min: risk.min_stake,
        });
    }
    for (name, value) in [
        ("balance", snapshot.balance),
        ("baseline_balance", snapshot.baseline_balance),
        ("highest_balance", snapshot.highest_balance),
        ("lowest_balance", snapshot.lowest_balance),
    ] {
        if value < Decimal::ZERO {
            return Err(IntegrityError::NegativeBalance(name));
        }
    }
    if snapshot.history.len() > risk.history_window {
        return Err(IntegrityError::HistoryTooLong {
            len: snapshot.history.len(),
            window: risk.history_window,
        });
    }

    Ok(())
}

/// Keyed snapshot store with freshness and integrity checks on restore
#[derive(Clone)]
pub struct RecoveryStore {
    store: Arc<dyn SnapshotStore>,
    freshness: Duration,
    risk: RiskConfig,
}

impl RecoveryStore {
    pub fn new(store: Arc<dyn SnapshotStore>, freshness: Duration, risk: RiskConfig) -> Self {
        Self {
            store,
            freshness,
            risk,
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Persist the latest snapshot for its account
    pub async fn snapshot(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let payload = serde_json::to_string(snapshot)?;
        self.store.save(&snapshot.account_id, &payload).await?;
        debug!(
            "Snapshot saved for {} ({}, level {}, {} trades)",
            snapshot.account_id, snapshot.state, snapshot.martingale_level, snapshot.total_trades
        );
        Ok(())
    }

    /// Latest valid snapshot for `account_id`, or `None` to start fresh.
    ///
    /// Invalid or stale snapshots are logged and deleted.
    pub async fn restore(&self, account_id: &str) -> Option<SessionSnapshot> {
        self.restore_at(account_id, Utc::now()).await
    }

    pub async fn restore_at(&self, account_id: &str, now: DateTime<Utc>) -> Option<SessionSnapshot> {
        let payload = match self.store.load(account_id).await {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                debug!("No snapshot for {}", account_id);
                return None;
            }
            Err(e) => {
                warn!("Failed to read snapshot for {}: {}", account_id, e);
                return None;
            }
        };

        let checked = serde_json::from_str::<SessionSnapshot>(&payload)
            .map_err(|e| IntegrityError::Malformed(e.to_string()))
            .and_then(|snapshot| {
                validate(&snapshot, account_id, now, self.freshness, &self.risk).map(|_| snapshot)
            });

        match checked {
            Ok(snapshot) => {
                info!(
                    "Restoring session for {}: level {}, stake ${}, {} trades ({}W/{}L)",
                    account_id,
                    snapshot.martingale_level,
                    snapshot.stake,
                    snapshot.total_trades,
                    snapshot.wins,
                    snapshot.losses
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!("Discarding snapshot for {}: {}", account_id, e);
                self.discard(account_id).await;
                None
            }
        }
    }

    /// Drop the stored snapshot, logging failures
    pub async fn discard(&self, account_id: &str) {
        if let Err(e) = self.store.delete(account_id).await {
            warn!("Failed to delete snapshot for {}: {}", account_id, e);
        }
    }
}

impl std::fmt::Debug for RecoveryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryStore")
            .field("freshness", &self.freshness)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::MemorySnapshotStore;
    use crate::domain::{Direction, Outcome};
    use rust_decimal_macros::dec;

    const FRESHNESS: Duration = Duration::from_secs(30 * 60);

    fn sample(now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            account_id: "VRTC1".into(),
            symbol: "R_100".into(),
            state: SessionState::Evaluating,
            martingale_level: 2,
            stake: dec!(2.205),
            base_stake: dec!(0.50),
            multiplier: dec!(2.1),
            baseline_balance: dec!(1000),
            balance: dec!(998.45),
            highest_balance: dec!(1000),
            lowest_balance: dec!(998.45),
            session_pnl: dec!(-1.55),
            daily_pnl: dec!(-1.55),
            daily_date: now.date_naive(),
            total_trades: 2,
            wins: 0,
            losses: 2,
            consecutive_losses: 2,
            history: vec![TradeRecord {
                contract_id: 7,
                direction: Direction::Call,
                stake: dec!(0.50),
                profit: dec!(-0.50),
                outcome: Outcome::Loss,
                martingale_level: 0,
                settled_at: now,
            }],
            last_trade_at: Some(now),
            open_contract: None,
            taken_at: now,
        }
    }

    fn store() -> RecoveryStore {
        RecoveryStore::new(
            Arc::new(MemorySnapshotStore::new()),
            FRESHNESS,
            RiskConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_roundtrip_within_window() {
        let recovery = store();
        let now = Utc::now();
        let snapshot = sample(now);
        recovery.snapshot(&snapshot).await.unwrap();

        let restored = recovery
            .restore_at("VRTC1", now + chrono::Duration::minutes(29))
            .await;
        assert_eq!(restored, Some(snapshot));
    }

    #[tokio::test]
    async fn test_stale_snapshot_discarded() {
        let recovery = store();
        let now = Utc::now();
        recovery.snapshot(&sample(now)).await.unwrap();

        let later = now + chrono::Duration::minutes(31);
        assert!(recovery.restore_at("VRTC1", later).await.is_none());
        // Deleted, not just skipped
        assert!(recovery.restore_at("VRTC1", now).await.is_none());
    }

    #[tokio::test]
    async fn test_corrupted_payload_discarded() {
        let memory = Arc::new(MemorySnapshotStore::new());
        memory.save("VRTC1", "{\"schema_version\": 1, \"acc").await.unwrap();
        let recovery = RecoveryStore::new(memory, FRESHNESS, RiskConfig::default());
        assert!(recovery.restore("VRTC1").await.is_none());
    }

    #[test]
    fn test_validate_rejections() {
        let now = Utc::now();
        let risk = RiskConfig::default();
        let check = |s: &SessionSnapshot| validate(s, "VRTC1", now, FRESHNESS, &risk);

        assert_eq!(check(&sample(now)), Ok(()));

        let mut s = sample(now);
        s.martingale_level = 9;
        assert_eq!(check(&s), Err(IntegrityError::LevelOutOfBounds { level: 9, max: 5 }));

        let mut s = sample(now);
        s.wins = 3;
        assert!(matches!(check(&s), Err(IntegrityError::CounterMismatch { .. })));

        let mut s = sample(now);
        s.consecutive_losses = 3;
        assert!(matches!(check(&s), Err(IntegrityError::ConsecutiveLosses { .. })));

        let mut s = sample(now);
        s.stake = dec!(0.10);
        assert!(matches!(check(&s), Err(IntegrityError::StakeBelowMinimum { .. })));

        let mut s = sample(now);
        s.balance = dec!(-1);
        assert_eq!(check(&s), Err(IntegrityError::NegativeBalance("balance")));

        let mut s = sample(now);
        s.account_id = "CR9".into();
        assert!(matches!(check(&s), Err(IntegrityError::AccountMismatch { .. })));

        let mut s = sample(now);
        s.taken_at = now + chrono::Duration::minutes(10);
        assert!(matches!(check(&s), Err(IntegrityError::FutureTimestamp(_))));

        let mut s = sample(now);
        s.state = SessionState::Stopped;
        assert_eq!(check(&s), Err(IntegrityError::Terminal));

        let mut s = sample(now);
        s.schema_version = 0;
        assert!(matches!(check(&s), Err(IntegrityError::SchemaVersion { .. })));
    }
}
