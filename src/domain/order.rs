use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Contract direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// Rise
    Call,
    /// Fall
    Put,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Call => "CALL",
            Direction::Put => "PUT",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DurationUnit {
    #[serde(rename = "t")]
    Ticks,
    #[serde(rename = "s")]
    Seconds,
    #[serde(rename = "m")]
    Minutes,
    #[serde(rename = "d")]
    Days,
}

impl DurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            DurationUnit::Ticks => "t",
            DurationUnit::Seconds => "s",
            DurationUnit::Minutes => "m",
            DurationUnit::Days => "d",
        }
    }
}

/// Contract length, e.g. `5t`, `30s`, `1m`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DurationSpec {
    pub value: u32,
    pub unit: DurationUnit,
}

impl DurationSpec {
    pub fn ticks(value: u32) -> Self {
        Self {
            value,
            unit: DurationUnit::Ticks,
        }
    }
}

impl Default for DurationSpec {
    fn default() -> Self {
        Self::ticks(5)
    }
}

impl fmt::Display for DurationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.as_str())
    }
}

impl FromStr for DurationSpec {
    type Err = String;

    /// A bare number means ticks.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (digits, unit) = match s.char_indices().last() {
            Some((idx, 't')) => (&s[..idx], DurationUnit::Ticks),
            Some((idx, 's')) => (&s[..idx], DurationUnit::Seconds),
            Some((idx, 'm')) => (&s[..idx], DurationUnit::Minutes),
            Some((idx, 'd')) => (&s[..idx], DurationUnit::Days),
            Some(_) => (s.as_str(), DurationUnit::Ticks),
            None => return Err("empty duration".to_string()),
        };

        let value: u32 = digits
            .parse()
            .map_err(|_| format!("invalid duration: {}", s))?;
        if value == 0 {
            return Err(format!("duration must be positive: {}", s));
        }

        Ok(Self { value, unit })
    }
}

impl TryFrom<String> for DurationSpec {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DurationSpec> for String {
    fn from(spec: DurationSpec) -> Self {
        spec.to_string()
    }
}

/// Truncate a stake to the broker's two-decimal precision.
///
/// Truncation never rounds above an approved ceiling.
pub fn wire_amount(stake: Decimal) -> Decimal {
    stake.round_dp_with_strategy(2, RoundingStrategy::ToZero)
}

/// A single buy order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Session-local sequence number, used to reject stale results
    pub seq: u64,
    pub symbol: String,
    pub direction: Direction,
    /// Exact stake; truncated on the wire
    pub stake: Decimal,
    pub duration: DurationSpec,
    pub currency: String,
}

impl OrderRequest {
    pub fn wire_amount(&self) -> Decimal {
        wire_amount(self.stake)
    }
}

/// Broker confirmation of a purchase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuyReceipt {
    pub contract_id: u64,
    pub buy_price: Decimal,
    pub payout: Decimal,
    pub balance_after: Decimal,
    pub purchased_at: DateTime<Utc>,
}

/// Contract lifecycle as reported by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Open,
    Won,
    Lost,
    Sold,
}

impl ContractStatus {
    pub fn is_settled(&self) -> bool {
        !matches!(self, ContractStatus::Open)
    }
}

/// Streamed or polled state of an open contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractUpdate {
    pub contract_id: u64,
    pub status: ContractStatus,
    pub is_sold: bool,
    /// Running P/L while open, realized P/L once sold
    pub profit: Decimal,
    pub buy_price: Decimal,
    pub sell_price: Option<Decimal>,
    pub exit_tick: Option<Decimal>,
}

impl ContractUpdate {
    pub fn is_settled(&self) -> bool {
        self.is_sold || self.status.is_settled()
    }

    /// The terminal settlement carried by this update, if any
    pub fn settlement(&self) -> Option<Settlement> {
        if !self.is_settled() {
            return None;
        }
        Some(Settlement {
            contract_id: self.contract_id,
            outcome: Outcome::from_profit(self.profit),
            profit: self.profit,
            buy_price: self.buy_price,
            settled_at: Utc::now(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Loss,
}

impl Outcome {
    /// Win iff realized profit is strictly positive
    pub fn from_profit(profit: Decimal) -> Self {
        if profit > Decimal::ZERO {
            Outcome::Win
        } else {
            Outcome::Loss
        }
    }

    pub fn is_win(&self) -> bool {
        matches!(self, Outcome::Win)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Win => write!(f, "WIN"),
            Outcome::Loss => write!(f, "LOSS"),
        }
    }
}

/// Terminal result of a contract
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub contract_id: u64,
    pub outcome: Outcome,
    pub profit: Decimal,
    pub buy_price: Decimal,
    pub settled_at: DateTime<Utc>,
}

/// One completed trade as kept in the rolling history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub contract_id: u64,
    pub direction: Direction,
    pub stake: Decimal,
    pub profit: Decimal,
    pub outcome: Outcome,
    pub martingale_level: u32,
    pub settled_at: DateTime<Utc>,
}
