use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::Direction;

/// Price tick for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub quote: Decimal,
    /// Broker epoch seconds
    pub epoch: i64,
}

impl Tick {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.epoch, 0).single()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Buy,
    Sell,
    None,
}

/// Output of the external signal source. Confidence is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub direction: SignalDirection,
    /// 0..=1
    pub confidence: f64,
    pub symbol: String,
}

impl Signal {
    pub fn new(direction: SignalDirection, confidence: f64, symbol: impl Into<String>) -> Self {
        Self {
            direction,
            confidence: confidence.clamp(0.0, 1.0),
            symbol: symbol.into(),
        }
    }

    /// Contract direction this signal asks for, if any
    pub fn contract_direction(&self) -> Option<Direction> {
        match self.direction {
            SignalDirection::Buy => Some(Direction::Call),
            SignalDirection::Sell => Some(Direction::Put),
            SignalDirection::None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Demo,
    Real,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Demo => "demo",
            AccountType::Real => "real",
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "demo" | "virtual" => Ok(AccountType::Demo),
            "real" | "live" => Ok(AccountType::Real),
            other => Err(format!("Unknown account type: {}", other)),
        }
    }
}

/// Account details returned by the authorize handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login_id: String,
    pub balance: Decimal,
    pub currency: String,
    pub is_virtual: bool,
}

impl AccountInfo {
    pub fn account_type(&self) -> AccountType {
        if self.is_virtual {
            AccountType::Demo
        } else {
            AccountType::Real
        }
    }
}

/// API token for one account. Wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    #[zeroize(skip)]
    pub account_type: AccountType,
    token: String,
}

impl Credentials {
    pub fn new(account_type: AccountType, token: impl Into<String>) -> Self {
        Self {
            account_type,
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Broker tokens are 15-40 alphanumeric characters
    pub fn looks_valid(&self) -> bool {
        let len = self.token.len();
        (15..=40).contains(&len) && self.token.chars().all(|c| c.is_ascii_alphanumeric())
    }

    /// First and last four characters, for logs
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.token.chars().collect();
        if chars.len() <= 8 {
            return "****".to_string();
        }
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("account_type", &self.account_type)
            .field("token", &self.masked())
            .finish()
    }
}
