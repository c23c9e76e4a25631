//! Ingestion hub: the single long-lived owner of shared state
//!
//! Every shared structure (registry, persistence chunk, aggregation map,
//! broadcast queues, product index) lives here behind its own lock, and
//! every mutation path goes through one hub method. Adapter events arrive
//! over a channel; periodic work runs as separate cancellable tasks that
//! call back into the hub.

use std::sync::Arc;

use common::{now_ms, Trade};
use exchanges::{ExchangeController, ExchangeEvent};
use rustc_hash::FxHashMap;
use storage::Storage;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::aggregator::{TradeAggregator, AGGREGATION_WINDOW_MS};
use crate::broadcast::Dispatcher;
use crate::config::ServerConfig;
use crate::models::{
    exchange_connected, exchange_disconnected, exchange_error, IndexedProduct,
};
use crate::registry::{ApiActivity, ConnectionRegistry};

/// Single owner of the aggregator's shared state
pub struct Hub {
    config: Arc<ServerConfig>,
    registry: RwLock<ConnectionRegistry>,
    chunk: Mutex<Vec<Trade>>,
    aggregator: Mutex<TradeAggregator>,
    delayed: Mutex<Vec<Trade>>,
    products: RwLock<FxHashMap<String, IndexedProduct>>,
    dispatcher: Arc<Dispatcher>,
    storages: Vec<Arc<dyn Storage>>,
    controllers: RwLock<FxHashMap<String, Arc<dyn ExchangeController>>>,
}

impl Hub {
    /// Build a hub over the configured storages and dispatcher
    pub fn new(
        config: Arc<ServerConfig>,
        storages: Vec<Arc<dyn Storage>>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config,
            registry: RwLock::new(ConnectionRegistry::new()),
            chunk: Mutex::new(Vec::new()),
            aggregator: Mutex::new(TradeAggregator::new()),
            delayed: Mutex::new(Vec::new()),
            products: RwLock::new(FxHashMap::default()),
            dispatcher,
            storages,
            controllers: RwLock::new(FxHashMap::default()),
        }
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The broadcast dispatcher
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// The storage serving the historical API, if any
    pub fn primary_storage(&self) -> Option<&Arc<dyn Storage>> {
        self.storages.first()
    }

    /// Wire up an exchange's control surface
    pub async fn register_controller(&self, controller: Arc<dyn ExchangeController>) {
        let id = controller.id().to_string();
        self.controllers.write().await.insert(id, controller);
    }

    /// Dispatch one adapter event
    pub async fn handle_event(&self, event: ExchangeEvent) {
        match event {
            ExchangeEvent::Trades { trades, .. } | ExchangeEvent::Liquidations { trades, .. } => {
                self.ingest(trades).await;
            }
            ExchangeEvent::Index { exchange, pairs } => {
                self.index_products(&exchange, &pairs).await;
            }
            ExchangeEvent::Open { exchange } => {
                info!("{} connected", exchange);
                self.dispatcher.broadcast_json(&exchange_connected(&exchange)).await;
            }
            ExchangeEvent::Error { exchange, message } => {
                warn!("{} error: {}", exchange, message);
                self.dispatcher
                    .broadcast_json(&exchange_error(&exchange, &message))
                    .await;
            }
            ExchangeEvent::Close { exchange } => {
                info!("{} disconnected", exchange);
                self.dispatcher
                    .broadcast_json(&exchange_disconnected(&exchange))
                    .await;
            }
            ExchangeEvent::Connected {
                exchange,
                pair,
                api_id,
            } => {
                self.registry
                    .write()
                    .await
                    .register(&exchange, &pair, &api_id, now_ms());
            }
            ExchangeEvent::Disconnected { exchange, pair, .. } => {
                self.registry.write().await.deregister(&exchange, &pair);
            }
        }
    }

    /// Route one batch of trades: registry gate, persistence buffer, then
    /// the configured broadcast path. Trades whose feed has no registry
    /// entry are dropped before any buffer is touched.
    pub async fn ingest(&self, trades: Vec<Trade>) {
        if trades.is_empty() {
            return;
        }
        let now = now_ms();

        let mut accepted = Vec::with_capacity(trades.len());
        {
            let mut registry = self.registry.write().await;
            for trade in trades {
                if registry.touch(&trade.market(), now) {
                    accepted.push(trade);
                } else {
                    debug!("dropped trade for unregistered feed {}", trade.market());
                }
            }
        }
        if accepted.is_empty() {
            return;
        }

        if self.config.collect && !self.storages.is_empty() {
            self.chunk.lock().await.extend(accepted.iter().cloned());
        }

        if !self.config.broadcast {
            return;
        }
        if self.config.broadcast_aggr {
            let mut aggregator = self.aggregator.lock().await;
            for trade in accepted {
                aggregator.ingest(trade, now);
            }
        } else if self.config.broadcast_debounce > 0 {
            self.delayed.lock().await.extend(accepted);
        } else {
            self.dispatcher.broadcast_trades(&accepted).await;
        }
    }

    async fn index_products(&self, exchange: &str, pairs: &[String]) {
        let mut products = self.products.write().await;
        for pair in pairs {
            products
                .entry(pair.clone())
                .and_modify(|product| product.add_exchange(exchange))
                .or_insert_with(|| IndexedProduct::new(pair, exchange));
        }
        debug!("indexed {} products from {}", pairs.len(), exchange);
    }

    /// Swap the chunk out and hand it to every storage. Returns the number
    /// of trades flushed. Per-storage failures are logged; the batch is
    /// not retried.
    pub async fn flush(&self, exiting: bool) -> usize {
        let batch = {
            let mut chunk = self.chunk.lock().await;
            std::mem::take(&mut *chunk)
        };
        if batch.is_empty() {
            return 0;
        }

        for storage in &self.storages {
            if let Err(e) = storage.save(&batch, exiting).await {
                error!(
                    "storage {} failed to save {} trades: {}",
                    storage.name(),
                    batch.len(),
                    e
                );
            }
        }
        debug!("flushed {} trades to {} storages", batch.len(), self.storages.len());
        batch.len()
    }

    /// Run the aggregator timeout sweep, then take everything sealed
    pub async fn sweep_and_drain_aggregated(&self) -> Vec<Trade> {
        let mut aggregator = self.aggregator.lock().await;
        aggregator.sweep(now_ms());
        aggregator.drain()
    }

    /// Take the debounced broadcast queue
    pub async fn drain_delayed(&self) -> Vec<Trade> {
        std::mem::take(&mut *self.delayed.lock().await)
    }

    /// Number of trades awaiting the next flush
    pub async fn chunk_len(&self) -> usize {
        self.chunk.lock().await.len()
    }

    /// Buffered trades whose timestamp lies strictly inside `(from, to)`,
    /// merged into trade-format historical responses
    pub async fn chunk_tail(&self, from: u64, to: u64) -> Vec<Trade> {
        self.chunk
            .lock()
            .await
            .iter()
            .filter(|trade| trade.timestamp > from && trade.timestamp < to)
            .cloned()
            .collect()
    }

    /// Per-API activity snapshot for the monitor
    pub async fn snapshot_by_api(&self) -> Vec<ApiActivity> {
        self.registry.read().await.snapshot_by_api()
    }

    /// Market keys of all live feeds
    pub async fn markets(&self) -> Vec<String> {
        self.registry.read().await.markets()
    }

    /// Exchanges with at least one live feed
    pub async fn exchanges(&self) -> Vec<String> {
        self.registry.read().await.exchanges()
    }

    /// Indexed products, sorted by pair symbol
    pub async fn products(&self) -> Vec<IndexedProduct> {
        let mut products: Vec<IndexedProduct> =
            self.products.read().await.values().cloned().collect();
        products.sort_by(|a, b| a.value.cmp(&b.value));
        products
    }

    /// Registry hit counter for one market (diagnostics, tests)
    pub async fn feed_hits(&self, market: &str) -> Option<u64> {
        self.registry.read().await.get(market).map(|entry| entry.hit)
    }

    /// Ask the owning exchange to reconnect one of its sockets
    pub async fn reconnect(&self, exchange: &str, api_id: &str) {
        let controller = self.controllers.read().await.get(exchange).cloned();
        match controller {
            Some(controller) => {
                if let Err(e) = controller.reconnect_api(api_id).await {
                    error!("failed to reconnect {} {}: {}", exchange, api_id, e);
                }
            }
            None => error!("no controller registered for {}", exchange),
        }
    }

    /// Log the connection table (periodic diagnostic)
    pub async fn log_connection_table(&self, now: u64) {
        let registry = self.registry.read().await;
        if registry.is_empty() {
            info!("no live connections");
            return;
        }

        let mut table = String::from("live connections:\n");
        table.push_str(
            "  market                     api             since      hits       rate/min   ping\n",
        );
        for entry in registry.entries() {
            let market = common::market_key(&entry.exchange, &entry.pair);
            let since = chrono::DateTime::from_timestamp_millis(entry.start as i64)
                .map(|start| start.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string());
            let elapsed = now.saturating_sub(entry.start).max(1);
            let rate = entry.hit as f64 * 60_000.0 / elapsed as f64;
            let ping = now.saturating_sub(entry.timestamp) as f64 / 1000.0;
            table.push_str(&format!(
                "  {:<26} {:<15} {:<10} {:<10} {:<10.1} {:.1}s\n",
                market, entry.api_id, since, entry.hit, rate, ping
            ));
        }
        info!("{}", table.trim_end());
    }
}

/// Consume adapter events until the channel closes or shutdown flips
pub async fn event_loop(
    hub: Arc<Hub>,
    mut events: mpsc::Receiver<ExchangeEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => hub.handle_event(event).await,
                None => break,
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("event loop stopped");
}

/// Periodic broadcast tick: the aggregated mode sweeps every 50 ms, the
/// debounced mode drains on its configured cadence. Immediate mode has no
/// tick; the router dispatches inline.
pub async fn broadcast_task(hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) {
    let aggregated = hub.config().broadcast_aggr;
    let tick_ms = if aggregated {
        AGGREGATION_WINDOW_MS
    } else if hub.config().broadcast_debounce > 0 {
        hub.config().broadcast_debounce
    } else {
        return;
    };
    if !hub.config().broadcast {
        return;
    }

    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(tick_ms));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let trades = if aggregated {
                    hub.sweep_and_drain_aggregated().await
                } else {
                    hub.drain_delayed().await
                };
                hub.dispatcher().broadcast_trades(&trades).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}
