//! Wire envelopes and API models

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// A pair symbol and the exchanges offering it, fed by adapter index
/// events. Append-only for the process lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedProduct {
    /// Pair symbol
    pub value: String,
    /// Number of exchanges listing the pair
    pub count: u32,
    /// Exchanges listing the pair
    pub exchanges: Vec<String>,
}

impl IndexedProduct {
    /// Start an index entry for `value` listed by `exchange`
    pub fn new(value: &str, exchange: &str) -> Self {
        Self {
            value: value.to_string(),
            count: 1,
            exchanges: vec![exchange.to_string()],
        }
    }

    /// Record another exchange listing the pair
    pub fn add_exchange(&mut self, exchange: &str) {
        if !self.exchanges.iter().any(|e| e == exchange) {
            self.exchanges.push(exchange.to_string());
            self.count = self.exchanges.len() as u32;
        }
    }
}

/// Envelope greeting a new broadcast client
pub fn welcome_envelope(
    pairs: &[String],
    exchanges: &[String],
    products: &[IndexedProduct],
) -> Value {
    json!({
        "type": "welcome",
        "pairs": pairs,
        "exchanges": exchanges,
        "products": products,
    })
}

/// Envelope announcing an exchange connection coming up
pub fn exchange_connected(exchange: &str) -> Value {
    json!({ "type": "exchange_connected", "id": exchange })
}

/// Envelope announcing an exchange connection going down
pub fn exchange_disconnected(exchange: &str) -> Value {
    json!({ "type": "exchange_disconnected", "id": exchange })
}

/// Envelope relaying an upstream exchange error
pub fn exchange_error(exchange: &str, message: &str) -> Value {
    json!({ "type": "exchange_error", "id": exchange, "message": message })
}
