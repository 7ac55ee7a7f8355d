//! Stable trade ordering for deterministic lot matching.

use crate::domain::{Side, TimeMs, TradeEvent};
use serde::{Deserialize, Serialize};

/// Stable ordering key for trade events.
///
/// Ordering: time_ms -> side (buy before sell) -> source trade id.
/// Buy-before-sell on equal timestamps lets a same-instant buy/sell pair match.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradeOrderingKey {
    pub time_ms: TimeMs,
    pub side: Side,
    pub trade_id: String,
}

impl TradeOrderingKey {
    pub fn new(time_ms: TimeMs, side: Side, trade_id: impl Into<String>) -> Self {
        TradeOrderingKey {
            time_ms,
            side,
            trade_id: trade_id.into(),
        }
    }

    pub fn from_event(event: &TradeEvent) -> Self {
        TradeOrderingKey {
            time_ms: event.time_ms,
            side: event.side,
            trade_id: event.source_trade_id.clone(),
        }
    }

    /// Encoded form stored as the persisted watermark.
    pub fn encode(&self) -> String {
        format!("{}|{}|{}", self.time_ms.as_ms(), self.side, self.trade_id)
    }

    /// Parse the encoded watermark form; `None` if it is malformed.
    pub fn decode(s: &str) -> Option<Self> {
        let mut parts = s.splitn(3, '|');
        let time_ms = parts.next()?.parse::<i64>().ok()?;
        let side = match parts.next()? {
            "buy" => Side::Buy,
            "sell" => Side::Sell,
            _ => return None,
        };
        let trade_id = parts.next()?.to_string();
        Some(TradeOrderingKey::new(TimeMs::new(time_ms), side, trade_id))
    }
}
