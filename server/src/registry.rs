//! Connection registry: live (exchange, pair) feeds and their counters

use common::market_key;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

/// One live feed, keyed by its `"{exchange}:{pair}"` market key.
///
/// An entry exists iff the adapter has emitted `Connected` and not yet
/// `Disconnected` for the pair.
#[derive(Debug, Clone)]
pub struct ConnectionEntry {
    /// Identifier of the upstream socket carrying this feed
    pub api_id: String,
    /// Source exchange
    pub exchange: String,
    /// Pair symbol
    pub pair: String,
    /// Trades observed since registration
    pub hit: u64,
    /// Registration time, ms since epoch
    pub start: u64,
    /// Last trade time, ms since epoch
    pub timestamp: u64,
}

/// Per-API activity snapshot for the monitor
#[derive(Debug, Clone)]
pub struct ApiActivity {
    /// Owning exchange
    pub exchange: String,
    /// Upstream socket identifier
    pub api_id: String,
    /// Pairs the socket carries
    pub pairs: Vec<String>,
    /// Per-pair trade counts since registration
    pub hits: Vec<u64>,
    /// Per-pair last-trade times
    pub timestamps: Vec<u64>,
    /// Per-pair registration times
    pub starts: Vec<u64>,
}

/// Tracks live feeds; mutated only by adapter lifecycle events
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: FxHashMap<String, ConnectionEntry>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a feed coming up. Double registration is a bug upstream;
    /// it is logged and the existing entry kept.
    pub fn register(&mut self, exchange: &str, pair: &str, api_id: &str, now: u64) {
        let key = market_key(exchange, pair);
        if self.entries.contains_key(&key) {
            warn!("connection {} is already registered", key);
            return;
        }
        self.entries.insert(
            key,
            ConnectionEntry {
                api_id: api_id.to_string(),
                exchange: exchange.to_string(),
                pair: pair.to_string(),
                hit: 0,
                start: now,
                timestamp: now,
            },
        );
    }

    /// Record a feed going away
    pub fn deregister(&mut self, exchange: &str, pair: &str) {
        let key = market_key(exchange, pair);
        if self.entries.remove(&key).is_none() {
            warn!("connection {} was not registered", key);
        }
    }

    /// Count a trade against its feed. Returns whether the feed exists;
    /// trades for unknown feeds must be discarded by the caller.
    pub fn touch(&mut self, market: &str, now: u64) -> bool {
        match self.entries.get_mut(market) {
            Some(entry) => {
                entry.hit += 1;
                entry.timestamp = now;
                true
            }
            None => {
                debug!("trade for unregistered feed {}", market);
                false
            }
        }
    }

    /// Number of live feeds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no feed is live
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The entry for `market`, if live
    pub fn get(&self, market: &str) -> Option<&ConnectionEntry> {
        self.entries.get(market)
    }

    /// Market keys of all live feeds, sorted
    pub fn markets(&self) -> Vec<String> {
        let mut markets: Vec<String> = self.entries.keys().cloned().collect();
        markets.sort();
        markets
    }

    /// Exchanges with at least one live feed, sorted and deduplicated
    pub fn exchanges(&self) -> Vec<String> {
        let mut exchanges: Vec<String> = self
            .entries
            .values()
            .map(|entry| entry.exchange.clone())
            .collect();
        exchanges.sort();
        exchanges.dedup();
        exchanges
    }

    /// All entries, for diagnostics
    pub fn entries(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.entries.values()
    }

    /// Group live feeds by their carrying socket
    pub fn snapshot_by_api(&self) -> Vec<ApiActivity> {
        let mut by_api: FxHashMap<(String, String), ApiActivity> = FxHashMap::default();
        for entry in self.entries.values() {
            let key = (entry.exchange.clone(), entry.api_id.clone());
            let activity = by_api.entry(key).or_insert_with(|| ApiActivity {
                exchange: entry.exchange.clone(),
                api_id: entry.api_id.clone(),
                pairs: Vec::new(),
                hits: Vec::new(),
                timestamps: Vec::new(),
                starts: Vec::new(),
            });
            activity.pairs.push(entry.pair.clone());
            activity.hits.push(entry.hit);
            activity.timestamps.push(entry.timestamp);
            activity.starts.push(entry.start);
        }

        let mut snapshot: Vec<ApiActivity> = by_api.into_values().collect();
        snapshot.sort_by(|a, b| (&a.exchange, &a.api_id).cmp(&(&b.exchange, &b.api_id)));
        snapshot
    }
}
