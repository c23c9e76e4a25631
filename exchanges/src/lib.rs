//! Exchange adapter contract for the TradeFlow trade aggregator
//!
//! Adapters are opaque producers: they own their upstream sockets and push
//! [`ExchangeEvent`]s into the server over a channel. The server drives
//! them back through the [`ExchangeController`] surface, wired up by
//! explicit registration at startup, with no object-graph cycle.

use anyhow::Result;
use async_trait::async_trait;
use common::Trade;
use tokio::sync::mpsc;

pub mod binance;

pub use binance::BinanceAdapter;

/// Channel on which adapters deliver events to the server
pub type EventSender = mpsc::Sender<ExchangeEvent>;

/// Events emitted by exchange adapters
#[derive(Debug, Clone)]
pub enum ExchangeEvent {
    /// A batch of normalized trades
    Trades {
        /// Emitting exchange id
        exchange: String,
        /// Trades in upstream arrival order
        trades: Vec<Trade>,
    },
    /// A batch of forced-liquidation fills
    Liquidations {
        /// Emitting exchange id
        exchange: String,
        /// Liquidation fills in upstream arrival order
        trades: Vec<Trade>,
    },
    /// Pair symbols the exchange lists
    Index {
        /// Emitting exchange id
        exchange: String,
        /// Listed pair symbols
        pairs: Vec<String>,
    },
    /// The exchange connection came up
    Open {
        /// Emitting exchange id
        exchange: String,
    },
    /// The exchange reported an error
    Error {
        /// Emitting exchange id
        exchange: String,
        /// Upstream error message
        message: String,
    },
    /// The exchange connection went down
    Close {
        /// Emitting exchange id
        exchange: String,
    },
    /// A pair feed became live on an upstream socket
    Connected {
        /// Emitting exchange id
        exchange: String,
        /// Pair symbol
        pair: String,
        /// Identifier of the carrying socket
        api_id: String,
    },
    /// A pair feed left an upstream socket
    Disconnected {
        /// Emitting exchange id
        exchange: String,
        /// Pair symbol
        pair: String,
        /// Identifier of the carrying socket
        api_id: String,
    },
}

/// Control surface the server drives on an adapter
#[async_trait]
pub trait ExchangeController: Send + Sync {
    /// Stable exchange identifier (e.g. `"BINANCE"`)
    fn id(&self) -> &str;

    /// Identifiers of the adapter's live upstream sockets
    async fn api_ids(&self) -> Vec<String>;

    /// Fetch listed products and open feeds for `pairs`
    async fn connect_products(&self, pairs: Vec<String>) -> Result<()>;

    /// Subscribe one additional pair
    async fn link(&self, pair: &str) -> Result<()>;

    /// Unsubscribe one pair
    async fn unlink(&self, pair: &str) -> Result<()>;

    /// Tear down and re-establish one upstream socket and every feed it
    /// carries
    async fn reconnect_api(&self, api_id: &str) -> Result<()>;
}
