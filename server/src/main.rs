//! TradeFlow server entry point

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use exchanges::{BinanceAdapter, ExchangeController};
use storage::{BarStore, Storage, TradeLog};
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tradeflow_server::banlist::{self, BanList};
use tradeflow_server::broadcast::Dispatcher;
use tradeflow_server::config::StorageKind;
use tradeflow_server::{hub, monitor, persistence, server};
use tradeflow_server::{AppState, Hub, ServerConfig};

/// Capacity of the adapter event channel
const EVENT_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tradeflow_server=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("TRADEFLOW_CONFIG").unwrap_or_else(|_| "tradeflow.toml".to_string());
    let config = match ServerConfig::from_file(Path::new(&config_path)) {
        Ok(config) => {
            info!("loaded configuration from {}", config_path);
            config
        }
        Err(e) => {
            info!("no configuration at {} ({}), using defaults", config_path, e);
            ServerConfig::default()
        }
    };
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        return Err(e);
    }
    let config = Arc::new(config);

    let mut storages: Vec<Arc<dyn Storage>> = Vec::new();
    for kind in &config.storage {
        let storage: Arc<dyn Storage> = match kind {
            StorageKind::Files => Arc::new(TradeLog::open(
                "files",
                &config.storage_dir.join("trades"),
                None,
            )?),
            StorageKind::Bars => Arc::new(BarStore::open(
                "bars",
                &config.storage_dir.join("bars"),
                config.bar_resolution,
                None,
            )?),
        };
        storage.connect().await?;
        storages.push(storage);
    }

    let dispatcher = Arc::new(Dispatcher::new());
    let hub = Arc::new(Hub::new(config.clone(), storages, dispatcher));

    let banlist = Arc::new(BanList::new(&config.banned_ips_path));
    banlist.reload_if_changed().await.ok();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    if config.pairs.is_empty() {
        info!("no pairs configured, running without upstream feeds");
    } else {
        let adapter = Arc::new(BinanceAdapter::new(events_tx.clone()));
        hub.register_controller(adapter.clone()).await;
        adapter.connect_products(config.pairs.clone()).await?;
    }
    drop(events_tx);

    tokio::spawn(hub::event_loop(
        hub.clone(),
        events_rx,
        shutdown_rx.clone(),
    ));
    if config.collect {
        tokio::spawn(persistence::backup_task(hub.clone(), shutdown_rx.clone()));
    }
    tokio::spawn(monitor::monitor_task(hub.clone(), shutdown_rx.clone()));
    tokio::spawn(hub::broadcast_task(hub.clone(), shutdown_rx.clone()));
    tokio::spawn(banlist::watch_task(banlist.clone(), shutdown_rx.clone()));

    let server_handle = if config.port > 0 {
        let state = AppState::new(hub.clone(), banlist)?;
        Some(tokio::spawn(server::serve(state, shutdown_rx)))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown_tx.send(true).ok();

    // Final flush must complete before teardown proceeds.
    let flushed = hub.flush(true).await;
    if flushed > 0 {
        info!("exit flush persisted {} trades", flushed);
    }
    hub.dispatcher().close_all().await;

    if let Some(handle) = server_handle {
        handle.await??;
    }
    Ok(())
}
