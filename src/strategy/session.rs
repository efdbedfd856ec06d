//! Trading session state machine
//!
//! ```text
//! IDLE -> WARMUP -> EVALUATING -> PENDING_ORDER -> OPEN -> SETTLING -> EVALUATING
//!                       |              |             |         |
//!                       +--------------+-------------+---------+--> STOPPED
//! ```
//!
//! Pure and synchronous: every input is a method call, every side effect the
//! caller must perform is returned or queued as a [`SessionEvent`]. The async
//! driver in `runner` owns timers, broker calls and the per-session lock.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::risk::{win_rate, RiskController, RiskSnapshot, StakeDecision};
use crate::config::SessionConfig;
use crate::coordination::order_retry_delay;
use crate::domain::{
    BuyReceipt, ContractUpdate, Direction, Outcome, OrderRequest, SessionState, Settlement, Signal,
    StateTransition, StopReason, TradeRecord,
};
use crate::error::RequestError;
use crate::persistence::{SessionSnapshot, SNAPSHOT_SCHEMA_VERSION};

/// Notifications for the command front-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    OrderOpened {
        account_id: String,
        contract_id: u64,
        direction: Direction,
        stake: Decimal,
        level: u32,
    },
    OrderClosed {
        account_id: String,
        contract_id: u64,
        outcome: Outcome,
        pnl: Decimal,
        /// Stake and level of the settled trade
        stake: Decimal,
        level: u32,
        /// What the next order will use
        next_stake: Decimal,
        next_level: u32,
    },
    SessionStopped {
        account_id: String,
        reason: StopReason,
        summary: SessionStatus,
    },
    /// Non-terminal problems are rate limited before reaching the front-end
    Error {
        account_id: String,
        message: String,
        fatal: bool,
    },
}

impl SessionEvent {
    pub fn account_id(&self) -> &str {
        match self {
            SessionEvent::OrderOpened { account_id, .. }
            | SessionEvent::OrderClosed { account_id, .. }
            | SessionEvent::SessionStopped { account_id, .. }
            | SessionEvent::Error { account_id, .. } => account_id,
        }
    }
}

/// Point-in-time session summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub account_id: String,
    pub symbol: String,
    pub state: SessionState,
    pub martingale_level: u32,
    pub stake: Decimal,
    pub multiplier: Decimal,
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub consecutive_losses: u32,
    pub session_pnl: Decimal,
    pub daily_pnl: Decimal,
    pub baseline_balance: Decimal,
    pub balance: Decimal,
    pub highest_balance: Decimal,
    pub lowest_balance: Decimal,
    pub open_contract: Option<u64>,
    /// Running P/L of the open contract
    pub open_pnl: Decimal,
    pub stop_pending: bool,
    pub stop_reason: Option<StopReason>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_trade_at: Option<DateTime<Utc>>,
}

/// What happened to a buy failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderFailure {
    /// Try again with the same order after `delay`
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted or not retryable; back to EVALUATING (or STOPPED)
    GaveUp,
    /// Credentials rejected; session stopped
    Fatal,
    /// Result for an order the session no longer waits on
    Stale,
}

/// What happened to a buy confirmation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderPlaced {
    /// Now OPEN; subscribe to the contract
    Opened { contract_id: u64 },
    /// Confirmation for an order the session no longer tracks
    Untracked { contract_id: u64 },
}

/// Result of a contract update
#[derive(Debug, Clone, PartialEq)]
pub enum ContractProgress {
    Ignored,
    Running { profit: Decimal },
    Settled(TradeRecord),
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopRequest {
    Stopped,
    /// Applied once the outstanding order resolves
    Deferred,
    AlreadyStopped,
}

#[derive(Debug, Clone)]
struct ActiveOrder {
    request: OrderRequest,
    attempt: u32,
    contract_id: Option<u64>,
    level: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Counters {
    total_trades: u32,
    wins: u32,
    losses: u32,
    consecutive_losses: u32,
}

pub struct TradingSession {
    account_id: String,
    currency: String,
    config: SessionConfig,
    risk: RiskController,
    state: SessionState,
    last_transition: Option<StateTransition>,

    level: u32,
    stake: Decimal,
    multiplier: Decimal,

    baseline_balance: Decimal,
    balance: Decimal,
    highest_balance: Decimal,
    lowest_balance: Decimal,
    balance_streamed: bool,

    counters: Counters,
    session_pnl: Decimal,
    daily_pnl: Decimal,
    daily_date: NaiveDate,
    history: VecDeque<TradeRecord>,
    last_trade_at: Option<DateTime<Utc>>,
    running_pnl: Decimal,

    order: Option<ActiveOrder>,
    abandoned: Option<ActiveOrder>,
    next_seq: u64,
    stop_pending: bool,
    stop_reason: Option<StopReason>,
    stopped_at: Option<DateTime<Utc>>,
    restored: bool,

    events: Vec<SessionEvent>,
}

impl TradingSession {
    pub fn new(
        account_id: impl Into<String>,
        currency: impl Into<String>,
        config: SessionConfig,
        risk: RiskController,
    ) -> Self {
        let stake = config.base_stake.max(risk.min_stake());
        let multiplier = risk.config().multiplier_normal;
        Self {
            account_id: account_id.into(),
            currency: currency.into(),
            config,
            risk,
            state: SessionState::Idle,
            last_transition: None,
            level: 0,
            stake,
            multiplier,
            baseline_balance: Decimal::ZERO,
            balance: Decimal::ZERO,
            highest_balance: Decimal::ZERO,
            lowest_balance: Decimal::ZERO,
            balance_streamed: false,
            counters: Counters::default(),
            session_pnl: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            daily_date: Utc::now().date_naive(),
            history: VecDeque::new(),
            last_trade_at: None,
            running_pnl: Decimal::ZERO,
            order: None,
            abandoned: None,
            next_seq: 1,
            stop_pending: false,
            stop_reason: None,
            stopped_at: None,
            restored: false,
            events: Vec::new(),
        }
    }

    /// Rebuild from a validated snapshot. Never resurrects an in-flight order.
    pub fn from_snapshot(
        snapshot: SessionSnapshot,
        currency: impl Into<String>,
        config: SessionConfig,
        risk: RiskController,
    ) -> Self {
        let mut session = Self::new(snapshot.account_id.clone(), currency, config, risk);

        if snapshot.state.has_order_in_flight() {
            match snapshot.open_contract {
                Some(contract_id) => warn!(
                    "Restored {} while {}: contract {} abandoned, not retried",
                    snapshot.account_id, snapshot.state, contract_id
                ),
                None => warn!(
                    "Restored {} while {}: unconfirmed order abandoned, not retried",
                    snapshot.account_id, snapshot.state
                ),
            }
        }

        session.level = snapshot.martingale_level;
        session.stake = snapshot.stake;
        session.multiplier = snapshot.multiplier;
        session.baseline_balance = snapshot.baseline_balance;
        session.balance = snapshot.balance;
        session.highest_balance = snapshot.highest_balance;
        session.lowest_balance = snapshot.lowest_balance;
        session.session_pnl = snapshot.session_pnl;
        session.daily_pnl = snapshot.daily_pnl;
        session.daily_date = snapshot.daily_date;
        session.counters = Counters {
            total_trades: snapshot.total_trades,
            wins: snapshot.wins,
            losses: snapshot.losses,
            consecutive_losses: snapshot.consecutive_losses,
        };
        session.history = snapshot.history.into_iter().collect();
        session.last_trade_at = snapshot.last_trade_at;
        session.restored = true;
        session
    }

    /// Durable copy of the current state
    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        SessionSnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            account_id: self.account_id.clone(),
            symbol: self.config.symbol.clone(),
            state: self.state,
            martingale_level: self.level,
            stake: self.stake,
            base_stake: self.config.base_stake,
            multiplier: self.multiplier,
            baseline_balance: self.baseline_balance,
            balance: self.balance,
            highest_balance: self.highest_balance,
            lowest_balance: self.lowest_balance,
            session_pnl: self.session_pnl,
            daily_pnl: self.daily_pnl,
            daily_date: self.daily_date,
            total_trades: self.counters.total_trades,
            wins: self.counters.wins,
            losses: self.counters.losses,
            consecutive_losses: self.counters.consecutive_losses,
            history: self.history.iter().cloned().collect(),
            last_trade_at: self.last_trade_at,
            open_contract: self.order.as_ref().and_then(|o| o.contract_id),
            taken_at: now,
        }
    }

    // ==================== Accessors ====================

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    pub fn stake(&self) -> Decimal {
        self.stake
    }

    pub fn balance(&self) -> Decimal {
        self.balance
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    pub fn is_stopped(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn stop_reason(&self) -> Option<&StopReason> {
        self.stop_reason.as_ref()
    }

    pub fn last_transition(&self) -> Option<&StateTransition> {
        self.last_transition.as_ref()
    }

    /// Sequence number of the order in PENDING_ORDER
    pub fn pending_seq(&self) -> Option<u64> {
        match self.state {
            SessionState::PendingOrder => self.order.as_ref().map(|o| o.request.seq),
            _ => None,
        }
    }

    pub fn open_contract(&self) -> Option<u64> {
        self.order.as_ref().and_then(|o| o.contract_id)
    }

    pub fn history(&self) -> impl Iterator<Item = &TradeRecord> {
        self.history.iter()
    }

    pub fn outcomes(&self) -> Vec<Outcome> {
        self.history.iter().map(|r| r.outcome).collect()
    }

    pub fn risk_snapshot(&self) -> RiskSnapshot {
        RiskSnapshot {
            baseline_balance: self.baseline_balance,
            balance: self.balance,
            session_pnl: self.session_pnl,
            daily_pnl: self.daily_pnl,
            consecutive_losses: self.counters.consecutive_losses,
        }
    }

    pub fn status(&self) -> SessionStatus {
        let outcomes = self.outcomes();
        let (rate, _) = win_rate(&outcomes);
        SessionStatus {
            account_id: self.account_id.clone(),
            symbol: self.config.symbol.clone(),
            state: self.state,
            martingale_level: self.level,
            stake: self.stake,
            multiplier: self.multiplier,
            total_trades: self.counters.total_trades,
            wins: self.counters.wins,
            losses: self.counters.losses,
            win_rate: rate,
            consecutive_losses: self.counters.consecutive_losses,
            session_pnl: self.session_pnl,
            daily_pnl: self.daily_pnl,
            baseline_balance: self.baseline_balance,
            balance: self.balance,
            highest_balance: self.highest_balance,
            lowest_balance: self.lowest_balance,
            open_contract: self.open_contract(),
            open_pnl: self.running_pnl,
            stop_pending: self.stop_pending,
            stop_reason: self.stop_reason.clone(),
            stopped_at: self.stopped_at,
            last_trade_at: self.last_trade_at,
        }
    }

    /// Take queued front-end events
    pub fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // ==================== Lifecycle ====================

    /// IDLE -> WARMUP, or straight to EVALUATING when the signal source is
    /// already warm or the session was restored
    pub fn start(&mut self, balance: Decimal, signal_ready: bool) {
        if self.state != SessionState::Idle {
            warn!("{}: start ignored in {}", self.account_id, self.state);
            return;
        }

        if !self.restored {
            self.baseline_balance = balance;
            self.highest_balance = balance;
            self.lowest_balance = balance;
            self.level = 0;
            self.stake = self.config.base_stake.max(self.risk.min_stake());
        }
        self.set_balance(balance);

        info!(
            "{}: session started on {} | base stake ${} | balance ${} {}",
            self.account_id, self.config.symbol, self.config.base_stake, balance, self.currency
        );

        if signal_ready || self.restored {
            self.transition(SessionState::Evaluating, "started");
        } else {
            self.transition(SessionState::Warmup, "waiting for signal data");
        }
    }

    /// Manual stop: immediate when idle/evaluating, deferred while an order is out
    pub fn request_stop(&mut self) -> StopRequest {
        match self.state {
            SessionState::Stopped => StopRequest::AlreadyStopped,
            state if state.has_order_in_flight() => {
                if !self.stop_pending {
                    info!(
                        "{}: stop requested in {}, deferred until the order resolves",
                        self.account_id, state
                    );
                }
                self.stop_pending = true;
                StopRequest::Deferred
            }
            _ => {
                self.stop(StopReason::Manual);
                StopRequest::Stopped
            }
        }
    }

    /// Unconditional stop for unrecoverable failures
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.is_stopped() {
            return;
        }
        if let Some(order) = self.order.take() {
            error!(
                "{}: abandoning order {} (contract {:?}) on fatal error",
                self.account_id, order.request.seq, order.contract_id
            );
        }
        self.events.push(SessionEvent::Error {
            account_id: self.account_id.clone(),
            message: message.clone(),
            fatal: true,
        });
        self.stop(StopReason::Fatal { message });
    }

    // ==================== Inputs ====================

    /// Balance from the broker stream
    pub fn on_balance(&mut self, balance: Decimal) {
        self.balance_streamed = true;
        self.set_balance(balance);
    }

    /// Evaluate a signal. Returns the order to place, if any.
    pub fn on_signal(&mut self, signal: &Signal, now: DateTime<Utc>) -> Option<OrderRequest> {
        if self.state == SessionState::Warmup {
            self.transition(SessionState::Evaluating, "signal available");
        }
        if self.state != SessionState::Evaluating {
            debug!("{}: signal ignored in {}", self.account_id, self.state);
            return None;
        }
        if signal.symbol != self.config.symbol {
            return None;
        }
        let direction = signal.contract_direction()?;
        if signal.confidence < self.config.min_confidence {
            debug!(
                "{}: confidence {:.2} below threshold {:.2}",
                self.account_id, signal.confidence, self.config.min_confidence
            );
            return None;
        }
        if let Some(last) = self.last_trade_at {
            let cooldown_end = chrono::Duration::from_std(Duration::from_secs(self.config.cooldown_secs))
                .ok()
                .and_then(|cooldown| last.checked_add_signed(cooldown));
            // Unrepresentable end means the cooldown never lapses
            if cooldown_end.map_or(true, |end| now < end) {
                debug!("{}: in cooldown", self.account_id);
                return None;
            }
        }

        if let Some(halt) = self.risk.should_halt(&self.risk_snapshot()) {
            self.stop(StopReason::RiskLimit(halt));
            return None;
        }
        let stake = match self
            .risk
            .max_safe_stake(self.level, self.stake, self.multiplier, self.balance)
        {
            StakeDecision::Halt(halt) => {
                self.stop(StopReason::RiskLimit(halt));
                return None;
            }
            decision => decision.stake()?,
        };
        self.stake = stake;

        let request = OrderRequest {
            seq: self.next_seq,
            symbol: self.config.symbol.clone(),
            direction,
            stake,
            duration: self.config.duration,
            currency: self.currency.clone(),
        };
        self.next_seq += 1;
        self.order = Some(ActiveOrder {
            request: request.clone(),
            attempt: 1,
            contract_id: None,
            level: self.level,
        });
        self.abandoned = None;
        self.transition(
            SessionState::PendingOrder,
            &format!("{} ${} (confidence {:.2})", direction, stake, signal.confidence),
        );
        Some(request)
    }

    /// Order to resend after a retry delay, if still pending
    pub fn retry_order(&self, seq: u64) -> Option<OrderRequest> {
        if self.pending_seq() == Some(seq) {
            self.order.as_ref().map(|o| o.request.clone())
        } else {
            None
        }
    }

    pub fn on_order_placed(&mut self, seq: u64, receipt: &BuyReceipt) -> OrderPlaced {
        let contract_id = receipt.contract_id;

        let adopt_late = self.state == SessionState::Evaluating
            && self.abandoned.as_ref().map(|o| o.request.seq) == Some(seq);
        if adopt_late {
            warn!(
                "{}: late fill for order {} (contract {}), tracking it",
                self.account_id, seq, contract_id
            );
            self.order = self.abandoned.take();
            self.transition(SessionState::PendingOrder, "late fill");
        } else if self.pending_seq() != Some(seq) {
            error!(
                "{}: contract {} bought for order {} while {}; not tracked",
                self.account_id, contract_id, seq, self.state
            );
            return OrderPlaced::Untracked { contract_id };
        }

        let Some(order) = self.order.as_mut() else {
            return OrderPlaced::Untracked { contract_id };
        };
        order.contract_id = Some(contract_id);
        let direction = order.request.direction;
        let stake = order.request.stake;
        let level = order.level;

        if !self.balance_streamed {
            self.set_balance(receipt.balance_after);
        }
        self.running_pnl = Decimal::ZERO;
        self.transition(SessionState::Open, &format!("contract {}", contract_id));
        self.events.push(SessionEvent::OrderOpened {
            account_id: self.account_id.clone(),
            contract_id,
            direction,
            stake,
            level,
        });
        OrderPlaced::Opened { contract_id }
    }

    pub fn on_order_failed(&mut self, seq: u64, err: &RequestError) -> OrderFailure {
        if self.pending_seq() != Some(seq) {
            debug!("{}: stale failure for order {}: {}", self.account_id, seq, err);
            return OrderFailure::Stale;
        }

        if err.is_auth() {
            self.fail(format!("order rejected: {}", err));
            return OrderFailure::Fatal;
        }

        let max_attempts = self.config.max_order_attempts.max(1);
        let Some(order) = self.order.as_mut() else {
            return OrderFailure::Stale;
        };
        if err.is_retryable() && order.attempt < max_attempts {
            let delay = order_retry_delay(
                Duration::from_millis(self.config.order_retry_base_ms),
                order.attempt,
                Duration::from_secs(self.config.buy_timeout_secs),
            );
            order.attempt += 1;
            let attempt = order.attempt;
            warn!(
                "{}: order {} failed ({}), retry {}/{} in {:?}",
                self.account_id, seq, err, attempt, max_attempts, delay
            );
            return OrderFailure::Retry { attempt, delay };
        }

        let attempts = order.attempt;
        self.abandon_pending(&format!("order failed after {} attempt(s): {}", attempts, err));
        OrderFailure::GaveUp
    }

    /// Buy-timeout guard fired. True if it reset the session.
    pub fn on_buy_timeout(&mut self, seq: u64) -> bool {
        if self.pending_seq() != Some(seq) {
            return false;
        }
        self.abandon_pending(&format!(
            "no buy result within {}s",
            self.config.buy_timeout_secs
        ));
        true
    }

    pub fn on_contract_update(&mut self, update: &ContractUpdate, now: DateTime<Utc>) -> ContractProgress {
        if self.state != SessionState::Open || self.open_contract() != Some(update.contract_id) {
            debug!(
                "{}: update for contract {} ignored in {}",
                self.account_id, update.contract_id, self.state
            );
            return ContractProgress::Ignored;
        }

        match update.settlement() {
            Some(mut settlement) => {
                settlement.settled_at = now;
                match self.on_settlement(&settlement) {
                    Some(record) => ContractProgress::Settled(record),
                    None => ContractProgress::Ignored,
                }
            }
            None => {
                self.running_pnl = update.profit;
                ContractProgress::Running {
                    profit: update.profit,
                }
            }
        }
    }

    /// OPEN -> SETTLING -> EVALUATING | STOPPED.
    ///
    /// Duplicate or unknown settlements are ignored.
    pub fn on_settlement(&mut self, settlement: &Settlement) -> Option<TradeRecord> {
        if self.state != SessionState::Open || self.open_contract() != Some(settlement.contract_id) {
            debug!(
                "{}: settlement for contract {} ignored in {}",
                self.account_id, settlement.contract_id, self.state
            );
            return None;
        }
        let order = self.order.take()?;
        self.transition(SessionState::Settling, &settlement.outcome.to_string());

        let record = TradeRecord {
            contract_id: settlement.contract_id,
            direction: order.request.direction,
            stake: order.request.stake,
            profit: settlement.profit,
            outcome: settlement.outcome,
            martingale_level: order.level,
            settled_at: settlement.settled_at,
        };
        self.record_trade(&record, settlement.buy_price);
        self.update_stake(settlement.outcome);

        info!(
            "{}: {} contract {} | P/L ${} | session ${} | next stake ${} (level {})",
            self.account_id,
            settlement.outcome,
            settlement.contract_id,
            settlement.profit,
            self.session_pnl,
            self.stake.round_dp(2),
            self.level
        );
        self.events.push(SessionEvent::OrderClosed {
            account_id: self.account_id.clone(),
            contract_id: settlement.contract_id,
            outcome: settlement.outcome,
            pnl: settlement.profit,
            stake: record.stake,
            level: record.martingale_level,
            next_stake: self.stake,
            next_level: self.level,
        });

        match self.stop_condition() {
            Some(reason) => self.stop(reason),
            None => {
                self.transition(SessionState::Evaluating, "settled");
            }
        }
        Some(record)
    }

    /// Contract never settled; drop it without touching stake or level
    pub fn abandon_open_order(&mut self, contract_id: u64) -> bool {
        if self.state != SessionState::Open || self.open_contract() != Some(contract_id) {
            return false;
        }
        self.order = None;
        let message = format!("contract {} did not settle; abandoned", contract_id);
        error!("{}: {}", self.account_id, message);
        self.events.push(SessionEvent::Error {
            account_id: self.account_id.clone(),
            message,
            fatal: false,
        });
        if self.stop_pending {
            self.stop(StopReason::Manual);
        } else {
            self.transition(SessionState::Evaluating, "settlement timeout");
        }
        true
    }

    // ==================== Internals ====================

    fn abandon_pending(&mut self, message: &str) {
        error!("{}: {}", self.account_id, message);
        self.abandoned = self.order.take();
        self.events.push(SessionEvent::Error {
            account_id: self.account_id.clone(),
            message: message.to_string(),
            fatal: false,
        });
        if self.stop_pending {
            self.stop(StopReason::Manual);
        } else {
            self.transition(SessionState::Evaluating, "order abandoned");
        }
    }

    fn record_trade(&mut self, record: &TradeRecord, buy_price: Decimal) {
        let today = record.settled_at.date_naive();
        if today != self.daily_date {
            debug!("{}: new trading day {}", self.account_id, today);
            self.daily_date = today;
            self.daily_pnl = Decimal::ZERO;
        }

        self.counters.total_trades += 1;
        if record.outcome.is_win() {
            self.counters.wins += 1;
            self.counters.consecutive_losses = 0;
        } else {
            self.counters.losses += 1;
            self.counters.consecutive_losses += 1;
        }
        self.session_pnl += record.profit;
        self.daily_pnl += record.profit;
        self.last_trade_at = Some(record.settled_at);

        self.history.push_back(record.clone());
        while self.history.len() > self.risk.config().history_window {
            self.history.pop_front();
        }

        if !self.balance_streamed {
            let balance = self.balance + buy_price + record.profit;
            self.set_balance(balance);
        }
    }

    fn update_stake(&mut self, outcome: Outcome) {
        if outcome.is_win() {
            self.level = 0;
            self.stake = self.config.base_stake.max(self.risk.min_stake());
            return;
        }

        let previous = self.level;
        self.level = (self.level + 1).min(self.risk.max_level());
        self.multiplier = self.risk.multiplier_for(&self.outcomes());
        if self.level > previous {
            self.stake *= self.multiplier;
        }
    }

    fn stop_condition(&mut self) -> Option<StopReason> {
        if let Some(halt) = self.risk.should_halt(&self.risk_snapshot()) {
            return Some(StopReason::RiskLimit(halt));
        }

        match self
            .risk
            .max_safe_stake(self.level, self.stake, self.multiplier, self.balance)
        {
            StakeDecision::Halt(halt) => return Some(StopReason::RiskLimit(halt)),
            decision => {
                if let Some(stake) = decision.stake() {
                    self.stake = stake;
                }
            }
        }

        let target = self.config.target_trades;
        if target > 0 && self.counters.total_trades >= target {
            return Some(StopReason::TargetReached {
                trades: self.counters.total_trades,
            });
        }

        if self.stop_pending {
            return Some(StopReason::Manual);
        }
        None
    }

    fn stop(&mut self, reason: StopReason) {
        if self.is_stopped() {
            return;
        }
        info!("{}: session stopped: {}", self.account_id, reason);
        self.stop_pending = false;
        self.stop_reason = Some(reason.clone());
        self.stopped_at = Some(Utc::now());
        self.transition(SessionState::Stopped, &reason.to_string());
        self.events.push(SessionEvent::SessionStopped {
            account_id: self.account_id.clone(),
            reason,
            summary: self.status(),
        });
    }

    fn set_balance(&mut self, balance: Decimal) {
        self.balance = balance;
        if balance > self.highest_balance {
            self.highest_balance = balance;
        }
        if balance < self.lowest_balance || self.lowest_balance.is_zero() {
            self.lowest_balance = balance;
        }
    }

    fn transition(&mut self, to: SessionState, reason: &str) -> bool {
        if !self.state.can_transition_to(to) {
            error!(
                "{}: invalid transition {} -> {} ({})",
                self.account_id, self.state, to, reason
            );
            return false;
        }
        debug!("{}: {} -> {} ({})", self.account_id, self.state, to, reason);
        self.last_transition = Some(StateTransition::new(self.state, to, reason));
        self.state = to;
        true
    }
}

impl std::fmt::Debug for TradingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingSession")
            .field("account_id", &self.account_id)
            .field("state", &self.state)
            .field("level", &self.level)
            .field("stake", &self.stake)
            .finish_non_exhaustive()
    }
}
