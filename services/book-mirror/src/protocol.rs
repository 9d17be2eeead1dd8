//! Wire vocabulary shared by the decoder and the supervisor
//!
//! Topics are dotted strings: `orderbook.<depth>.<symbol>` for books,
//! `trade.<symbol>` for trades. Requests are `{"op": ..., "args": [...]}`.

use std::fmt;
use std::str::FromStr;

use hmac::digest::InvalidLength;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use types::ids::Symbol;

/// Liveness frame sent by the client.
pub const PING: &str = "ping";
/// Liveness reply, discarded on receipt.
pub const PONG: &str = "pong";

/// Milliseconds an auth signature stays valid.
pub const AUTH_EXPIRY_MS: i64 = 10_000;

const ORDERBOOK_CHANNEL: &str = "orderbook";
const TRADE_CHANNEL: &str = "trade";

/// A subscription topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    OrderBook { depth: u32, symbol: Symbol },
    Trade { symbol: Symbol },
    /// Any topic this mirror does not interpret, kept verbatim.
    Other(String),
}

impl Topic {
    pub fn order_book(depth: u32, symbol: Symbol) -> Self {
        Topic::OrderBook { depth, symbol }
    }

    pub fn trade(symbol: Symbol) -> Self {
        Topic::Trade { symbol }
    }

    /// Symbol of a book topic; None for every other kind.
    pub fn book_symbol(&self) -> Option<&Symbol> {
        match self {
            Topic::OrderBook { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    pub fn is_order_book(&self) -> bool {
        matches!(self, Topic::OrderBook { .. })
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::OrderBook { depth, symbol } => {
                write!(f, "{}.{}.{}", ORDERBOOK_CHANNEL, depth, symbol)
            }
            Topic::Trade { symbol } => write!(f, "{}.{}", TRADE_CHANNEL, symbol),
            Topic::Other(raw) => f.write_str(raw),
        }
    }
}

impl FromStr for Topic {
    type Err = std::convert::Infallible;

    /// Never fails: unrecognised shapes become `Topic::Other`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let parsed = match parts.as_slice() {
            [ORDERBOOK_CHANNEL, depth, symbol] => match (depth.parse::<u32>(), Symbol::try_new(*symbol)) {
                (Ok(depth), Some(symbol)) => Some(Topic::OrderBook { depth, symbol }),
                _ => None,
            },
            [TRADE_CHANNEL, symbol] => Symbol::try_new(*symbol).map(|symbol| Topic::Trade { symbol }),
            _ => None,
        };
        Ok(parsed.unwrap_or_else(|| Topic::Other(s.to_string())))
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        match s.parse() {
            Ok(topic) => topic,
            Err(never) => match never {},
        }
    }
}

/// Request operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Subscribe,
    Unsubscribe,
    Auth,
}

/// Client request frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub op: Op,
    pub args: Vec<String>,
}

impl Request {
    pub fn subscribe<'a>(topics: impl IntoIterator<Item = &'a Topic>) -> Self {
        Self {
            op: Op::Subscribe,
            args: topics.into_iter().map(Topic::to_string).collect(),
        }
    }

    pub fn unsubscribe<'a>(topics: impl IntoIterator<Item = &'a Topic>) -> Self {
        Self {
            op: Op::Unsubscribe,
            args: topics.into_iter().map(Topic::to_string).collect(),
        }
    }

    /// Auth request signed for `expires_ms`.
    pub fn auth(api_key: &str, api_secret: &str, expires_ms: i64) -> Result<Self, InvalidLength> {
        Ok(Self {
            op: Op::Auth,
            args: vec![
                api_key.to_string(),
                expires_ms.to_string(),
                sign(api_secret, expires_ms)?,
            ],
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Hex HMAC-SHA256 of `GET/realtime{expires_ms}` keyed by `secret`.
pub fn sign(secret: &str, expires_ms: i64) -> Result<String, InvalidLength> {
    type HmacSha256 = Hmac<Sha256>;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())?;
    mac.update(format!("GET/realtime{}", expires_ms).as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}
