//! Broadcast dispatcher and client session bookkeeping
//!
//! Sessions hold an ordered market subscription list and an outbound
//! channel drained by their socket task. Trade dispatch groups a tick's
//! trades by market, renders each `[market, trades]` frame once, and
//! delivers at most one frame per subscribed market per session.

use std::sync::atomic::{AtomicU64, Ordering};

use common::Trade;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// One connected broadcast client
struct ClientSession {
    pairs: Vec<String>,
    sender: mpsc::UnboundedSender<String>,
}

/// Fans frames out to connected broadcast clients
#[derive(Default)]
pub struct Dispatcher {
    sessions: RwLock<FxHashMap<u64, ClientSession>>,
    next_id: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher with no sessions
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session subscribed to `pairs`; frames arrive on the
    /// returned channel's sender counterpart passed in by the socket task
    pub async fn register(&self, pairs: Vec<String>, sender: mpsc::UnboundedSender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .write()
            .await
            .insert(id, ClientSession { pairs, sender });
        id
    }

    /// Drop a session
    pub async fn unregister(&self, id: u64) {
        self.sessions.write().await.remove(&id);
    }

    /// Replace a session's subscription list
    pub async fn resubscribe(&self, id: u64, pairs: Vec<String>) {
        if let Some(session) = self.sessions.write().await.get_mut(&id) {
            debug!("session {} resubscribed to {} markets", id, pairs.len());
            session.pairs = pairs;
        }
    }

    /// Number of connected sessions
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Send one JSON envelope to every session
    pub async fn broadcast_json(&self, value: &Value) {
        let frame = value.to_string();
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.sender.send(frame.clone()).ok();
        }
    }

    /// Group `trades` by market and deliver per-market frames to
    /// subscribed sessions, following each session's subscription order
    pub async fn broadcast_trades(&self, trades: &[Trade]) {
        if trades.is_empty() {
            return;
        }

        let mut groups: FxHashMap<String, Vec<&Trade>> = FxHashMap::default();
        for trade in trades {
            groups.entry(trade.market()).or_default().push(trade);
        }

        let mut frames: FxHashMap<String, String> = FxHashMap::default();
        for (market, group) in &groups {
            if let Ok(frame) = serde_json::to_string(&(market, group)) {
                frames.insert(market.clone(), frame);
            }
        }

        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            for pair in &session.pairs {
                if let Some(frame) = frames.get(pair) {
                    session.sender.send(frame.clone()).ok();
                }
            }
        }
    }

    /// Drop every session, closing their outbound channels
    pub async fn close_all(&self) {
        self.sessions.write().await.clear();
    }
}

/// Parse a `"A+B+C"` subscription list, deduplicating while preserving
/// order so a market never receives two frames in one dispatch
pub fn parse_pair_list(input: &str) -> Vec<String> {
    let mut pairs: Vec<String> = Vec::new();
    for pair in input.split('+') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        if !pairs.iter().any(|existing| existing == pair) {
            pairs.push(pair.to_string());
        }
    }
    pairs
}

/// Human-readable label for close codes worth logging
pub fn close_code_label(code: u16) -> Option<&'static str> {
    match code {
        1002 => Some("protocol error"),
        1003 => Some("unsupported data"),
        1007 => Some("invalid frame payload data"),
        1008 => Some("policy violation"),
        1009 => Some("message too big"),
        1010 => Some("mandatory extension missing"),
        1011 => Some("internal server error"),
        1012 => Some("service restart"),
        1013 => Some("try again later"),
        1014 => Some("bad gateway"),
        1015 => Some("TLS handshake failure"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Side;

    fn trade(exchange: &str, pair: &str, price: f64) -> Trade {
        Trade {
            exchange: exchange.to_string(),
            pair: pair.to_string(),
            timestamp: 1_000,
            price,
            size: 1.0,
            side: Side::Buy,
            liquidation: false,
        }
    }

    #[test]
    fn parses_and_dedupes_pair_lists() {
        assert_eq!(parse_pair_list("A+B+C"), vec!["A", "B", "C"]);
        assert_eq!(parse_pair_list("A+A+B"), vec!["A", "B"]);
        assert_eq!(parse_pair_list(""), Vec::<String>::new());
        assert_eq!(parse_pair_list("+A+"), vec!["A"]);
    }

    #[test]
    fn labels_unusual_close_codes() {
        assert_eq!(close_code_label(1002), Some("protocol error"));
        assert_eq!(close_code_label(1015), Some("TLS handshake failure"));
        assert_eq!(close_code_label(1000), None);
        assert_eq!(close_code_label(1001), None);
    }

    #[tokio::test]
    async fn trades_route_by_subscription() {
        let dispatcher = Dispatcher::new();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        dispatcher.register(vec!["X:BTC".to_string()], tx_a).await;
        dispatcher
            .register(vec!["X:BTC".to_string(), "X:ETH".to_string()], tx_b)
            .await;

        dispatcher
            .broadcast_trades(&[
                trade("X", "BTC", 100.0),
                trade("X", "BTC", 101.0),
                trade("X", "ETH", 50.0),
            ])
            .await;

        let frame_a = rx_a.try_recv().expect("frame for a");
        assert!(frame_a.starts_with("[\"X:BTC\""));
        assert!(rx_a.try_recv().is_err());

        let frame_b1 = rx_b.try_recv().expect("first frame for b");
        let frame_b2 = rx_b.try_recv().expect("second frame for b");
        assert!(frame_b1.starts_with("[\"X:BTC\""));
        assert!(frame_b2.starts_with("[\"X:ETH\""));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn json_broadcast_reaches_every_session() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatcher.register(Vec::new(), tx).await;

        dispatcher
            .broadcast_json(&serde_json::json!({ "type": "welcome" }))
            .await;
        let frame = rx.try_recv().expect("frame");
        assert!(frame.contains("welcome"));
    }

    #[tokio::test]
    async fn resubscribe_replaces_pairs() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher.register(vec!["X:BTC".to_string()], tx).await;

        dispatcher.resubscribe(id, vec!["X:ETH".to_string()]).await;
        dispatcher.broadcast_trades(&[trade("X", "BTC", 100.0)]).await;
        assert!(rx.try_recv().is_err());

        dispatcher.broadcast_trades(&[trade("X", "ETH", 50.0)]).await;
        assert!(rx.try_recv().is_ok());
    }
}
