//! Deriv API v3 wire format
//!
//! Outbound calls are typed structs serialized with a `req_id`. Inbound
//! frames are decoded once, at the boundary, into a closed set of
//! [`FrameBody`] variants; unknown message kinds become
//! [`FrameBody::Unrecognized`].

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::{
    AccountInfo, BuyReceipt, ContractStatus, ContractUpdate, OrderRequest, Tick,
};

// =============================================================================
// Subscriptions and intents
// =============================================================================

/// A standing stream interest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubscriptionKey {
    /// Price ticks for a symbol
    Ticks(String),
    /// Updates for one open contract
    Contract(u64),
    /// Account balance changes
    Balance,
}

impl SubscriptionKey {
    /// The request that establishes this subscription
    pub fn subscribe_request(&self) -> Outbound {
        match self {
            SubscriptionKey::Ticks(symbol) => Outbound::Ticks {
                symbol: symbol.clone(),
            },
            SubscriptionKey::Contract(id) => Outbound::ContractStatus {
                contract_id: *id,
                subscribe: true,
            },
            SubscriptionKey::Balance => Outbound::Balance,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubscriptionKey::Ticks(symbol) => write!(f, "ticks:{}", symbol),
            SubscriptionKey::Contract(id) => write!(f, "contract:{}", id),
            SubscriptionKey::Balance => write!(f, "balance"),
        }
    }
}

/// What a pending request was for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Authorize,
    Subscribe(SubscriptionKey),
    TickHistory,
    PlaceOrder,
    ContractStatus,
    Forget,
    Ping,
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Intent::Authorize => write!(f, "authorize"),
            Intent::Subscribe(key) => write!(f, "subscribe {}", key),
            Intent::TickHistory => write!(f, "tick history"),
            Intent::PlaceOrder => write!(f, "place order"),
            Intent::ContractStatus => write!(f, "contract status"),
            Intent::Forget => write!(f, "forget"),
            Intent::Ping => write!(f, "ping"),
        }
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// Every call the engine makes
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Authorize { token: String },
    Ping,
    Ticks { symbol: String },
    TicksHistory { symbol: String, count: u32 },
    Balance,
    Buy(OrderRequest),
    ContractStatus { contract_id: u64, subscribe: bool },
    Forget { subscription_id: String },
}

#[derive(Serialize)]
struct AuthorizeRequest<'a> {
    authorize: &'a str,
    req_id: u64,
}

#[derive(Serialize)]
struct PingRequest {
    ping: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    req_id: Option<u64>,
}

#[derive(Serialize)]
struct TicksRequest<'a> {
    ticks: &'a str,
    subscribe: u8,
    req_id: u64,
}

#[derive(Serialize)]
struct TicksHistoryRequest<'a> {
    ticks_history: &'a str,
    end: &'static str,
    count: u32,
    style: &'static str,
    req_id: u64,
}

#[derive(Serialize)]
struct BalanceRequest {
    balance: u8,
    subscribe: u8,
    req_id: u64,
}

#[derive(Serialize)]
struct BuyRequest<'a> {
    buy: u8,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
    parameters: BuyParameters<'a>,
    req_id: u64,
}

#[derive(Serialize)]
struct BuyParameters<'a> {
    #[serde(with = "rust_decimal::serde::float")]
    amount: Decimal,
    basis: &'static str,
    contract_type: &'static str,
    currency: &'a str,
    duration: u32,
    duration_unit: &'static str,
    symbol: &'a str,
}

#[derive(Serialize)]
struct ProposalOpenContractRequest {
    proposal_open_contract: u8,
    contract_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    subscribe: Option<u8>,
    req_id: u64,
}

#[derive(Serialize)]
struct ForgetRequest<'a> {
    forget: &'a str,
    req_id: u64,
}

impl Outbound {
    pub fn intent(&self) -> Intent {
        match self {
            Outbound::Authorize { .. } => Intent::Authorize,
            Outbound::Ping => Intent::Ping,
            Outbound::Ticks { symbol } => Intent::Subscribe(SubscriptionKey::Ticks(symbol.clone())),
            Outbound::TicksHistory { .. } => Intent::TickHistory,
            Outbound::Balance => Intent::Subscribe(SubscriptionKey::Balance),
            Outbound::Buy(_) => Intent::PlaceOrder,
            Outbound::ContractStatus {
                contract_id,
                subscribe: true,
            } => Intent::Subscribe(SubscriptionKey::Contract(*contract_id)),
            Outbound::ContractStatus { .. } => Intent::ContractStatus,
            Outbound::Forget { .. } => Intent::Forget,
        }
    }

    /// Serialize with the given correlation id
    pub fn encode(&self, req_id: u64) -> Result<String, serde_json::Error> {
        match self {
            Outbound::Authorize { token } => serde_json::to_string(&AuthorizeRequest {
                authorize: token,
                req_id,
            }),
            Outbound::Ping => serde_json::to_string(&PingRequest {
                ping: 1,
                req_id: Some(req_id),
            }),
            Outbound::Ticks { symbol } => serde_json::to_string(&TicksRequest {
                ticks: symbol,
                subscribe: 1,
                req_id,
            }),
            Outbound::TicksHistory { symbol, count } => {
                serde_json::to_string(&TicksHistoryRequest {
                    ticks_history: symbol,
                    end: "latest",
                    count: *count,
                    style: "ticks",
                    req_id,
                })
            }
            Outbound::Balance => serde_json::to_string(&BalanceRequest {
                balance: 1,
                subscribe: 1,
                req_id,
            }),
            Outbound::Buy(order) => {
                let amount = order.wire_amount();
                serde_json::to_string(&BuyRequest {
                    buy: 1,
                    price: amount,
                    parameters: BuyParameters {
                        amount,
                        basis: "stake",
                        contract_type: order.direction.as_str(),
                        currency: &order.currency,
                        duration: order.duration.value,
                        duration_unit: order.duration.unit.as_str(),
                        symbol: &order.symbol,
                    },
                    req_id,
                })
            }
            Outbound::ContractStatus {
                contract_id,
                subscribe,
            } => serde_json::to_string(&ProposalOpenContractRequest {
                proposal_open_contract: 1,
                contract_id: *contract_id,
                subscribe: subscribe.then_some(1),
                req_id,
            }),
            Outbound::Forget { subscription_id } => serde_json::to_string(&ForgetRequest {
                forget: subscription_id,
                req_id,
            }),
        }
    }
}

/// Uncorrelated keepalive frame
pub fn keepalive_frame() -> String {
    serde_json::to_string(&PingRequest {
        ping: 1,
        req_id: None,
    })
    .unwrap_or_else(|_| r#"{"ping":1}"#.to_string())
}

// =============================================================================
// Inbound
// =============================================================================

/// Code given to a well-formed frame whose payload could not be read
pub const MALFORMED_RESPONSE: &str = "MalformedResponse";

/// Error frame payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl ApiError {
    fn malformed(msg_type: &str, err: &serde_json::Error) -> Self {
        Self {
            code: MALFORMED_RESPONSE.to_string(),
            message: format!("unreadable {} payload: {}", msg_type, err),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    msg_type: Option<String>,
    req_id: Option<u64>,
    error: Option<ApiError>,
    subscription: Option<SubscriptionRef>,
    #[serde(default)]
    echo_req: serde_json::Value,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct AuthorizePayload {
    loginid: String,
    balance: Decimal,
    currency: String,
    #[serde(default)]
    is_virtual: u8,
}

#[derive(Debug, Deserialize)]
struct BalancePayload {
    balance: Decimal,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct TickPayload {
    symbol: String,
    quote: Decimal,
    epoch: i64,
}

#[derive(Debug, Deserialize)]
struct HistoryPayload {
    #[serde(default)]
    prices: Vec<Decimal>,
    #[serde(default)]
    times: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct BuyPayload {
    contract_id: u64,
    buy_price: Decimal,
    #[serde(default)]
    payout: Decimal,
    #[serde(default)]
    balance_after: Decimal,
}

#[derive(Debug, Deserialize)]
struct ContractPayload {
    contract_id: Option<u64>,
    #[serde(default)]
    is_sold: u8,
    status: Option<String>,
    #[serde(default)]
    profit: Decimal,
    #[serde(default)]
    buy_price: Decimal,
    sell_price: Option<Decimal>,
    exit_tick: Option<Decimal>,
}

/// Decoded frame content
#[derive(Debug, Clone, PartialEq)]
pub enum FrameBody {
    Authorize(AccountInfo),
    Balance { balance: Decimal, currency: String },
    Tick(Tick),
    History(Vec<Tick>),
    Buy(BuyReceipt),
    Contract(ContractUpdate),
    Forget(bool),
    Pong,
    Error(ApiError),
    Unrecognized { msg_type: String },
}

/// One inbound frame with its correlation metadata
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub msg_type: String,
    pub req_id: Option<u64>,
    pub subscription_id: Option<String>,
    pub body: FrameBody,
}

impl InboundFrame {
    /// Stream this frame belongs to, if it is a streamed kind
    pub fn stream_key(&self) -> Option<SubscriptionKey> {
        match &self.body {
            FrameBody::Tick(tick) => Some(SubscriptionKey::Ticks(tick.symbol.clone())),
            FrameBody::Contract(update) => Some(SubscriptionKey::Contract(update.contract_id)),
            FrameBody::Balance { .. } => Some(SubscriptionKey::Balance),
            _ => None,
        }
    }
}

/// Decode a text frame. Malformed JSON is an error; unknown kinds are not.
///
/// A readable envelope with an unreadable payload keeps its `req_id` and
/// decodes to a [`MALFORMED_RESPONSE`] error body, so the waiting request
/// fails instead of timing out.
pub fn decode(text: &str) -> Result<InboundFrame, serde_json::Error> {
    let mut envelope: Envelope = serde_json::from_str(text)?;
    let msg_type = envelope.msg_type.clone().unwrap_or_default();

    let body = if let Some(error) = envelope.error.take() {
        FrameBody::Error(error)
    } else {
        match decode_body(&msg_type, &mut envelope) {
            Ok(body) => body,
            Err(e) => FrameBody::Error(ApiError::malformed(&msg_type, &e)),
        }
    };

    Ok(InboundFrame {
        msg_type,
        req_id: envelope.req_id,
        subscription_id: envelope.subscription.map(|s| s.id),
        body,
    })
}

fn decode_body(msg_type: &str, envelope: &mut Envelope) -> Result<FrameBody, serde_json::Error> {
    let payload = envelope
        .rest
        .remove(msg_type)
        .unwrap_or(serde_json::Value::Null);

    let body = match msg_type {
        "authorize" => {
            let auth: AuthorizePayload = serde_json::from_value(payload)?;
            FrameBody::Authorize(AccountInfo {
                login_id: auth.loginid,
                balance: auth.balance,
                currency: auth.currency,
                is_virtual: auth.is_virtual == 1,
            })
        }
        "balance" => {
            let balance: BalancePayload = serde_json::from_value(payload)?;
            FrameBody::Balance {
                balance: balance.balance,
                currency: balance.currency,
            }
        }
        "tick" => {
            let tick: TickPayload = serde_json::from_value(payload)?;
            FrameBody::Tick(Tick {
                symbol: tick.symbol,
                quote: tick.quote,
                epoch: tick.epoch,
            })
        }
        "history" => {
            let history: HistoryPayload = serde_json::from_value(payload)?;
            let symbol = envelope
                .echo_req
                .get("ticks_history")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            FrameBody::History(
                history
                    .prices
                    .into_iter()
                    .zip(history.times)
                    .map(|(quote, epoch)| Tick {
                        symbol: symbol.clone(),
                        quote,
                        epoch,
                    })
                    .collect(),
            )
        }
        "buy" => {
            let buy: BuyPayload = serde_json::from_value(payload)?;
            FrameBody::Buy(BuyReceipt {
                contract_id: buy.contract_id,
                buy_price: buy.buy_price,
                payout: buy.payout,
                balance_after: buy.balance_after,
                purchased_at: chrono::Utc::now(),
            })
        }
        "proposal_open_contract" => {
            let poc: ContractPayload = serde_json::from_value(payload)?;
            match poc.contract_id {
                Some(contract_id) => FrameBody::Contract(ContractUpdate {
                    contract_id,
                    status: match poc.status.as_deref() {
                        Some("won") => ContractStatus::Won,
                        Some("lost") => ContractStatus::Lost,
                        Some("sold") => ContractStatus::Sold,
                        _ => ContractStatus::Open,
                    },
                    is_sold: poc.is_sold == 1,
                    profit: poc.profit,
                    buy_price: poc.buy_price,
                    sell_price: poc.sell_price,
                    exit_tick: poc.exit_tick,
                }),
                // Empty body: the contract is unknown or already gone
                None => FrameBody::Unrecognized {
                    msg_type: msg_type.to_string(),
                },
            }
        }
        "forget" => FrameBody::Forget(payload.as_u64().unwrap_or(0) == 1),
        "ping" => FrameBody::Pong,
        other => FrameBody::Unrecognized {
            msg_type: other.to_string(),
        },
    };

    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Direction, DurationSpec};
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_buy_request_wire_format() {
        let order = OrderRequest {
            seq: 1,
            symbol: "R_100".to_string(),
            direction: Direction::Put,
            stake: dec!(2.205),
            duration: DurationSpec::ticks(5),
            currency: "USD".to_string(),
        };

        let encoded = Outbound::Buy(order).encode(7).unwrap();
        let value: serde_json::Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(
            value,
            json!({
                "buy": 1,
                "price": 2.2,
                "parameters": {
                    "amount": 2.2,
                    "basis": "stake",
                    "contract_type": "PUT",
                    "currency": "USD",
                    "duration": 5,
                    "duration_unit": "t",
                    "symbol": "R_100"
                },
                "req_id": 7
            })
        );
    }

    #[test]
    fn test_subscription_requests() {
        let ticks = SubscriptionKey::Ticks("R_50".into()).subscribe_request();
        let value: serde_json::Value = serde_json::from_str(&ticks.encode(3).unwrap()).unwrap();
        assert_eq!(value, json!({"ticks": "R_50", "subscribe": 1, "req_id": 3}));

        let contract = SubscriptionKey::Contract(99).subscribe_request();
        assert_eq!(
            contract.intent(),
            Intent::Subscribe(SubscriptionKey::Contract(99))
        );
        let value: serde_json::Value = serde_json::from_str(&contract.encode(4).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"proposal_open_contract": 1, "contract_id": 99, "subscribe": 1, "req_id": 4})
        );

        let poll = Outbound::ContractStatus {
            contract_id: 99,
            subscribe: false,
        };
        let value: serde_json::Value = serde_json::from_str(&poll.encode(5).unwrap()).unwrap();
        assert!(value.get("subscribe").is_none());
    }

    #[test]
    fn test_decode_authorize() {
        let frame = decode(
            r#"{"msg_type":"authorize","req_id":1,"authorize":{"loginid":"VRTC123","balance":10000,"currency":"USD","is_virtual":1}}"#,
        )
        .unwrap();
        assert_eq!(frame.req_id, Some(1));
        match frame.body {
            FrameBody::Authorize(info) => {
                assert_eq!(info.login_id, "VRTC123");
                assert_eq!(info.balance, dec!(10000));
                assert!(info.is_virtual);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_frame() {
        let frame = decode(
            r#"{"msg_type":"authorize","req_id":1,"error":{"code":"InvalidToken","message":"The token is invalid."}}"#,
        )
        .unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Error(ApiError {
                code: "InvalidToken".into(),
                message: "The token is invalid.".into()
            })
        );
    }

    #[test]
    fn test_decode_streamed_tick() {
        let frame = decode(
            r#"{"msg_type":"tick","req_id":4,"subscription":{"id":"abc"},"tick":{"symbol":"R_100","quote":1234.56,"epoch":1700000000,"id":"abc"}}"#,
        )
        .unwrap();
        assert_eq!(frame.subscription_id.as_deref(), Some("abc"));
        assert_eq!(
            frame.stream_key(),
            Some(SubscriptionKey::Ticks("R_100".into()))
        );
    }

    #[test]
    fn test_decode_settled_contract() {
        let frame = decode(
            r#"{"msg_type":"proposal_open_contract","proposal_open_contract":{"contract_id":555,"is_sold":1,"status":"lost","profit":-1.05,"buy_price":1.05,"sell_price":0}}"#,
        )
        .unwrap();
        match frame.body {
            FrameBody::Contract(update) => {
                assert!(update.is_settled());
                assert_eq!(update.profit, dec!(-1.05));
                assert_eq!(update.status, ContractStatus::Lost);
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_history_uses_echoed_symbol() {
        let frame = decode(
            r#"{"msg_type":"history","req_id":9,"echo_req":{"ticks_history":"R_10"},"history":{"prices":[1.1,1.2],"times":[10,11]}}"#,
        )
        .unwrap();
        match frame.body {
            FrameBody::History(ticks) => {
                assert_eq!(ticks.len(), 2);
                assert_eq!(ticks[1].symbol, "R_10");
                assert_eq!(ticks[1].quote, dec!(1.2));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_unrecognized() {
        let frame = decode(r#"{"msg_type":"website_status","website_status":{}}"#).unwrap();
        assert_eq!(
            frame.body,
            FrameBody::Unrecognized {
                msg_type: "website_status".into()
            }
        );
        assert!(decode("not json").is_err());
    }

    #[test]
    fn test_unreadable_payload_keeps_req_id() {
        let frame = decode(r#"{"msg_type":"buy","req_id":12,"buy":{"contract_id":"x"}}"#).unwrap();
        assert_eq!(frame.req_id, Some(12));
        match frame.body {
            FrameBody::Error(err) => {
                assert_eq!(err.code, MALFORMED_RESPONSE);
                assert!(err.message.contains("buy"));
            }
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_decode_pong() {
        let frame = decode(r#"{"msg_type":"ping","ping":"pong","echo_req":{"ping":1}}"#).unwrap();
        assert_eq!(frame.body, FrameBody::Pong);
        assert_eq!(frame.req_id, None);
    }
}
