//! Core types for the TradeFlow trade aggregator

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Aggressor bought
    Buy,
    /// Aggressor sold
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Positional wire shape of a trade: index 1 is the timestamp.
type TradeTuple = (String, u64, String, f64, f64, Side, bool);

/// Normalized trade record, immutable on receipt.
///
/// Serializes positionally as
/// `(exchange, timestamp, pair, price, size, side, liquidation)` on every
/// wire: JSON frames to clients and bincode entries in storage segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "TradeTuple", into = "TradeTuple")]
pub struct Trade {
    /// Source exchange identifier
    pub exchange: String,
    /// Exchange-local pair symbol
    pub pair: String,
    /// Event time in milliseconds since the UNIX epoch
    pub timestamp: u64,
    /// Fill price, positive
    pub price: f64,
    /// Fill size, positive
    pub size: f64,
    /// Aggressor side
    pub side: Side,
    /// Whether the fill was a forced liquidation
    pub liquidation: bool,
}

impl From<TradeTuple> for Trade {
    fn from(t: TradeTuple) -> Self {
        Self {
            exchange: t.0,
            timestamp: t.1,
            pair: t.2,
            price: t.3,
            size: t.4,
            side: t.5,
            liquidation: t.6,
        }
    }
}

impl From<Trade> for TradeTuple {
    fn from(t: Trade) -> Self {
        (
            t.exchange,
            t.timestamp,
            t.pair,
            t.price,
            t.size,
            t.side,
            t.liquidation,
        )
    }
}

impl Trade {
    /// The `"{exchange}:{pair}"` identifier this trade routes under
    pub fn market(&self) -> String {
        market_key(&self.exchange, &self.pair)
    }
}

/// Build the `"{exchange}:{pair}"` identifier used across the registry,
/// aggregation, and broadcast routing.
pub fn market_key(exchange: &str, pair: &str) -> String {
    format!("{exchange}:{pair}")
}

/// Milliseconds since the UNIX epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trade() -> Trade {
        Trade {
            exchange: "BINANCE".to_string(),
            pair: "btcusdt".to_string(),
            timestamp: 1_700_000_000_000,
            price: 42_000.5,
            size: 0.25,
            side: Side::Buy,
            liquidation: false,
        }
    }

    #[test]
    fn trade_wire_shape_is_positional() {
        let value = serde_json::to_value(trade()).expect("serialize");
        let array = value.as_array().expect("positional record");
        assert_eq!(array.len(), 7);
        assert_eq!(array[0], serde_json::json!("BINANCE"));
        assert_eq!(array[1], serde_json::json!(1_700_000_000_000u64));
        assert_eq!(array[5], serde_json::json!("buy"));
    }

    #[test]
    fn trade_json_roundtrip() {
        let original = trade();
        let encoded = serde_json::to_string(&original).expect("serialize");
        let decoded: Trade = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(original, decoded);
    }

    #[test]
    fn trade_bincode_roundtrip() {
        let original = trade();
        let encoded = bincode::serialize(&original).expect("serialize");
        let decoded: Trade = bincode::deserialize(&encoded).expect("deserialize");
        assert_eq!(original, decoded);
    }

    #[test]
    fn market_key_format() {
        assert_eq!(market_key("BITMEX", "XBTUSD"), "BITMEX:XBTUSD");
        assert_eq!(trade().market(), "BINANCE:btcusdt");
    }
}
