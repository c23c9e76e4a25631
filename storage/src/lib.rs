//! Pluggable storage drivers for persisted trade batches
//!
//! Two driver kinds exist, distinguished by the closed [`StorageFormat`]
//! enum: trade-format drivers persist and serve raw trades, point-format
//! drivers persist and serve pre-bucketed OHLCV bars.

#![deny(warnings)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![deny(clippy::nursery)]
#![deny(clippy::cargo)]
#![deny(dead_code)]
#![deny(unused)]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use common::Trade;
use serde::{Deserialize, Serialize};

pub mod bars;
pub mod segment;
pub mod trades;

pub use bars::BarStore;
pub use trades::TradeLog;

/// On-disk format a driver persists and serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// Raw trades, one record per fill
    Trade,
    /// Pre-bucketed OHLCV bars
    Point,
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Trade => write!(f, "trade"),
            Self::Point => write!(f, "point"),
        }
    }
}

/// Time-range fetch request handed to a driver
#[derive(Debug, Clone)]
pub struct FetchQuery {
    /// Inclusive lower bound, ms since epoch
    pub from: u64,
    /// Upper bound, ms since epoch
    pub to: u64,
    /// Bucket width for point-format drivers, ms
    pub timeframe: u64,
    /// Markets to include; empty means all
    pub markets: Vec<String>,
}

/// OHLCV bar served by point-format drivers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// `"{exchange}:{pair}"` identifier
    pub market: String,
    /// Bucket open time, ms since epoch
    pub time: u64,
    /// First price in the bucket
    pub open: f64,
    /// Highest price in the bucket
    pub high: f64,
    /// Lowest price in the bucket
    pub low: f64,
    /// Last price in the bucket
    pub close: f64,
    /// Total size traded
    pub volume: f64,
    /// Size traded on the buy side
    pub buy_volume: f64,
    /// Number of fills folded in
    pub count: u32,
}

impl Bar {
    /// Open a new bar at `time` from the first trade of the bucket
    pub fn open(market: String, time: u64, trade: &Trade) -> Self {
        let mut bar = Self {
            market,
            time,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: 0.0,
            buy_volume: 0.0,
            count: 0,
        };
        bar.fold(trade);
        bar
    }

    /// Fold one trade into the bar
    pub fn fold(&mut self, trade: &Trade) {
        if trade.price > self.high {
            self.high = trade.price;
        }
        if trade.price < self.low {
            self.low = trade.price;
        }
        self.close = trade.price;
        self.volume += trade.size;
        if trade.side == common::Side::Buy {
            self.buy_volume += trade.size;
        }
        self.count += 1;
    }
}

/// What a fetch produced, tagged by the driver's format
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum FetchPayload {
    /// Raw trades from a trade-format driver
    Trades(Vec<Trade>),
    /// Bars from a point-format driver
    Points(Vec<Bar>),
}

impl FetchPayload {
    /// Whether the fetch produced nothing
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Trades(trades) => trades.is_empty(),
            Self::Points(bars) => bars.is_empty(),
        }
    }
}

/// Storage driver contract
///
/// Drivers are opaque sinks and fetchers: `save` receives whole flush
/// batches, `fetch` answers time-range queries. Failures are reported per
/// call and never poison the driver.
#[async_trait]
pub trait Storage: Send + Sync {
    /// The format this driver persists
    fn format(&self) -> StorageFormat;

    /// Driver name for logs and configuration
    fn name(&self) -> &str;

    /// One-time setup before first use
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Persist one flush batch; `exiting` marks the final flush before
    /// process teardown
    async fn save(&self, batch: &[Trade], exiting: bool) -> Result<()>;

    /// Serve a time-range query
    async fn fetch(&self, query: FetchQuery) -> Result<FetchPayload>;
}
