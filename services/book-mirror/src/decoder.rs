//! Decoder: raw text frame → `FeedMessage`
//!
//! A malformed frame is a `DecodeError` and is dropped whole. A malformed
//! price level inside an otherwise valid book frame is skipped on its own
//! and counted in `BookMessage::skipped`.

use std::str::FromStr;

use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use types::ids::Symbol;
use types::numeric::{Price, Quantity};
use types::order::Side;

use crate::level::{LevelChange, SequenceState};
use crate::protocol::{Topic, PONG};

/// A frame that could not be turned into a `FeedMessage`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),
}

/// Whether a book frame replaces or amends the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookKind {
    Snapshot,
    Delta,
}

/// A decoded order book frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookMessage {
    pub topic: Topic,
    pub symbol: Symbol,
    pub kind: BookKind,
    /// Bid changes first, then ask changes, each in wire order.
    pub changes: Vec<LevelChange>,
    pub sequence: SequenceState,
    /// Level entries dropped because they did not parse.
    pub skipped: usize,
}

impl BookMessage {
    pub fn side(&self, side: Side) -> impl Iterator<Item = &LevelChange> {
        self.changes.iter().filter(move |change| change.side == side)
    }
}

/// Subscription or auth acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub op: String,
    pub success: bool,
    pub ret_msg: String,
    pub conn_id: Option<String>,
}

/// Every frame the feed can deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    Book(BookMessage),
    Ack(Ack),
    Pong,
    /// Valid frame for a topic the mirror does not apply (e.g. trades).
    Other { topic: String },
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    topic: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    ts: Option<i64>,
    data: Option<Value>,

    success: Option<bool>,
    ret_msg: Option<String>,
    op: Option<String>,
    conn_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBook {
    s: Option<String>,
    #[serde(default)]
    b: Vec<Value>,
    #[serde(default)]
    a: Vec<Value>,
    u: Option<u64>,
    seq: Option<u64>,
}

/// Decode one text frame.
pub fn decode(frame: &str) -> Result<FeedMessage, DecodeError> {
    let trimmed = frame.trim();
    if trimmed == PONG {
        return Ok(FeedMessage::Pong);
    }

    let raw: RawFrame =
        serde_json::from_str(trimmed).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    if let Some(success) = raw.success {
        let op = raw.op.unwrap_or_default();
        let ret_msg = raw.ret_msg.unwrap_or_default();
        // JSON keep-alive replies arrive in ack form.
        if op == "ping" || op == PONG || ret_msg == PONG {
            return Ok(FeedMessage::Pong);
        }
        return Ok(FeedMessage::Ack(Ack {
            op,
            success,
            ret_msg,
            conn_id: raw.conn_id,
        }));
    }

    let topic_raw = raw.topic.ok_or(DecodeError::MissingField("topic"))?;
    let topic = Topic::from(topic_raw.as_str());
    if !topic.is_order_book() {
        return Ok(FeedMessage::Other { topic: topic_raw });
    }

    let kind = match raw.kind.as_deref() {
        Some("snapshot") => BookKind::Snapshot,
        Some("delta") => BookKind::Delta,
        Some(other) => return Err(DecodeError::UnknownType(other.to_string())),
        None => return Err(DecodeError::MissingField("type")),
    };
    let ts_ms = raw.ts.ok_or(DecodeError::MissingField("ts"))?;
    let data: RawBook = serde_json::from_value(raw.data.ok_or(DecodeError::MissingField("data"))?)
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let symbol_raw = data.s.ok_or(DecodeError::MissingField("data.s"))?;
    let symbol = Symbol::try_new(symbol_raw.as_str())
        .ok_or_else(|| DecodeError::InvalidSymbol(symbol_raw.clone()))?;
    let update_id = data.u.ok_or(DecodeError::MissingField("data.u"))?;
    let cross_seq = data.seq.ok_or(DecodeError::MissingField("data.seq"))?;

    let mut changes = Vec::with_capacity(data.b.len() + data.a.len());
    let mut skipped = 0;
    for (side, entries) in [(Side::Buy, &data.b), (Side::Sell, &data.a)] {
        for entry in entries {
            match parse_level(side, entry) {
                Some(change) => changes.push(change),
                None => {
                    skipped += 1;
                    warn!(
                        symbol = %symbol,
                        side = %side,
                        entry = %entry,
                        "Skipping malformed level entry"
                    );
                }
            }
        }
    }

    Ok(FeedMessage::Book(BookMessage {
        topic,
        symbol,
        kind,
        changes,
        sequence: SequenceState::new(update_id, cross_seq, ts_ms),
        skipped,
    }))
}

/// `[price, size]` with both as decimal strings (bare numbers tolerated).
fn parse_level(side: Side, entry: &Value) -> Option<LevelChange> {
    let pair = entry.as_array()?;
    if pair.len() < 2 {
        return None;
    }
    let price = Price::from_str(&decimal_text(&pair[0])?).ok()?;
    let size = Quantity::from_str(&decimal_text(&pair[1])?).ok()?;
    Some(LevelChange::new(side, price, size))
}

fn decimal_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
