//! Shared fixtures for server integration tests

#![allow(dead_code)]

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use common::{Side, Trade};
use exchanges::ExchangeEvent;
use storage::{Bar, FetchPayload, FetchQuery, Storage, StorageFormat};
use tokio::sync::Mutex;
use tradeflow_server::banlist::BanList;
use tradeflow_server::broadcast::Dispatcher;
use tradeflow_server::{AppState, Hub, ServerConfig};

/// Build a trade on exchange `X` unless overridden
pub fn trade(exchange: &str, pair: &str, timestamp: u64, price: f64, size: f64) -> Trade {
    Trade {
        exchange: exchange.to_string(),
        pair: pair.to_string(),
        timestamp,
        price,
        size,
        side: Side::Buy,
        liquidation: false,
    }
}

/// Register a feed on the hub the way an adapter would
pub async fn connect_feed(hub: &Hub, exchange: &str, pair: &str, api_id: &str) {
    hub.handle_event(ExchangeEvent::Connected {
        exchange: exchange.to_string(),
        pair: pair.to_string(),
        api_id: api_id.to_string(),
    })
    .await;
}

/// Hub over the given storages with an isolated dispatcher
pub fn build_hub(config: ServerConfig, storages: Vec<Arc<dyn Storage>>) -> Arc<Hub> {
    Arc::new(Hub::new(
        Arc::new(config),
        storages,
        Arc::new(Dispatcher::new()),
    ))
}

/// App state over a hub with no rate limiting, origin policy, or bans
pub fn build_state(hub: Arc<Hub>) -> AppState {
    AppState {
        hub,
        banlist: Arc::new(BanList::new(std::path::Path::new("/nonexistent/banned.txt"))),
        limiter: None,
        origin: None,
    }
}

/// Storage stub serving canned trades and recording saves and queries
pub struct MockTradeStorage {
    canned: Vec<Trade>,
    pub saved: Mutex<Vec<Vec<Trade>>>,
    pub queries: Mutex<Vec<FetchQuery>>,
}

impl MockTradeStorage {
    pub fn new(canned: Vec<Trade>) -> Arc<Self> {
        Arc::new(Self {
            canned,
            saved: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Storage for MockTradeStorage {
    fn format(&self) -> StorageFormat {
        StorageFormat::Trade
    }

    fn name(&self) -> &str {
        "mock-trades"
    }

    async fn save(&self, batch: &[Trade], _exiting: bool) -> Result<()> {
        self.saved.lock().await.push(batch.to_vec());
        Ok(())
    }

    async fn fetch(&self, query: FetchQuery) -> Result<FetchPayload> {
        self.queries.lock().await.push(query);
        Ok(FetchPayload::Trades(self.canned.clone()))
    }
}

/// Point-format storage stub recording the rounded query it receives
pub struct MockPointStorage {
    canned: Vec<Bar>,
    pub queries: Mutex<Vec<FetchQuery>>,
}

impl MockPointStorage {
    pub fn new(canned: Vec<Bar>) -> Arc<Self> {
        Arc::new(Self {
            canned,
            queries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Storage for MockPointStorage {
    fn format(&self) -> StorageFormat {
        StorageFormat::Point
    }

    fn name(&self) -> &str {
        "mock-points"
    }

    async fn save(&self, _batch: &[Trade], _exiting: bool) -> Result<()> {
        Ok(())
    }

    async fn fetch(&self, query: FetchQuery) -> Result<FetchPayload> {
        self.queries.lock().await.push(query);
        Ok(FetchPayload::Points(self.canned.clone()))
    }
}

/// Storage stub that always fails to save
pub struct FailingStorage;

#[async_trait]
impl Storage for FailingStorage {
    fn format(&self) -> StorageFormat {
        StorageFormat::Trade
    }

    fn name(&self) -> &str {
        "mock-failing"
    }

    async fn save(&self, _batch: &[Trade], _exiting: bool) -> Result<()> {
        anyhow::bail!("disk on fire")
    }

    async fn fetch(&self, _query: FetchQuery) -> Result<FetchPayload> {
        anyhow::bail!("disk on fire")
    }
}
