//! Volume-weighted trade aggregation
//!
//! Collapses micro-bursts where an exchange emits several fills on the same
//! millisecond and side into one composite trade. While a composite is
//! open its `price` field holds the price-volume sum; sealing divides it by
//! the accumulated size, exactly once.

use common::Trade;
use rustc_hash::FxHashMap;

/// How long a composite may stay open after creation, ms
pub const AGGREGATION_WINDOW_MS: u64 = 50;

struct OpenComposite {
    trade: Trade,
    timeout: u64,
}

/// Per-market composite builder with a seal-on-timeout sweep
pub struct TradeAggregator {
    window: u64,
    open: FxHashMap<String, OpenComposite>,
    aggregated: Vec<Trade>,
}

impl TradeAggregator {
    /// Create an aggregator with the standard window
    pub fn new() -> Self {
        Self::with_window(AGGREGATION_WINDOW_MS)
    }

    /// Create an aggregator with a custom window (tests)
    pub fn with_window(window: u64) -> Self {
        Self {
            window,
            open: FxHashMap::default(),
            aggregated: Vec::new(),
        }
    }

    /// Feed one trade into its market's composite.
    ///
    /// A trade matching the open composite's (timestamp, side) merges into
    /// it; anything else displaces the composite, sealing it onto the
    /// aggregated queue, and opens a fresh one. The timeout is set at
    /// creation only, never refreshed by merges.
    pub fn ingest(&mut self, trade: Trade, now: u64) {
        let market = trade.market();

        if let Some(open) = self.open.get_mut(&market) {
            if open.trade.timestamp == trade.timestamp && open.trade.side == trade.side {
                open.trade.size += trade.size;
                open.trade.price += trade.price * trade.size;
                return;
            }
        }

        if let Some(displaced) = self.open.remove(&market) {
            self.aggregated.push(seal(displaced.trade));
        }

        let mut composite = trade.clone();
        composite.price = trade.price * trade.size;
        self.open.insert(
            market,
            OpenComposite {
                trade: composite,
                timeout: now + self.window,
            },
        );
    }

    /// Seal every composite whose timeout has passed
    pub fn sweep(&mut self, now: u64) {
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, open)| open.timeout < now)
            .map(|(market, _)| market.clone())
            .collect();

        for market in expired {
            if let Some(open) = self.open.remove(&market) {
                self.aggregated.push(seal(open.trade));
            }
        }
    }

    /// Take everything sealed so far, in seal order
    pub fn drain(&mut self) -> Vec<Trade> {
        std::mem::take(&mut self.aggregated)
    }

    /// Number of composites still open
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}

impl Default for TradeAggregator {
    fn default() -> Self {
        Self::new()
    }
}

fn seal(mut trade: Trade) -> Trade {
    if trade.size > 0.0 {
        trade.price /= trade.size;
    }
    trade
}
