//! Ingestion, registry gating, and flush behavior

mod support;

use std::sync::Arc;

use anyhow::Result;
use storage::{FetchPayload, FetchQuery, Storage, TradeLog};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tradeflow_server::ServerConfig;

use support::{build_hub, connect_feed, trade, FailingStorage, MockTradeStorage};

fn collect_config() -> ServerConfig {
    ServerConfig {
        broadcast: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn unregistered_feeds_are_dropped() {
    let storage = MockTradeStorage::new(Vec::new());
    let hub = build_hub(collect_config(), vec![storage]);
    connect_feed(&hub, "X", "BTC", "X-0").await;

    hub.ingest(vec![
        trade("X", "BTC", 1_000, 100.0, 1.0),
        trade("X", "ETH", 1_000, 50.0, 1.0),
    ])
    .await;

    assert_eq!(hub.chunk_len().await, 1);
    assert_eq!(hub.feed_hits("X:BTC").await, Some(1));
    assert_eq!(hub.feed_hits("X:ETH").await, None);
}

#[tokio::test]
async fn flush_hands_over_the_batch_in_arrival_order() {
    let storage = MockTradeStorage::new(Vec::new());
    let hub = build_hub(collect_config(), vec![storage.clone()]);
    connect_feed(&hub, "X", "BTC", "X-0").await;

    let first = trade("X", "BTC", 1_000, 100.0, 1.0);
    let second = trade("X", "BTC", 2_000, 101.0, 1.0);
    hub.ingest(vec![first.clone(), second.clone()]).await;

    let flushed = hub.flush(false).await;
    assert_eq!(flushed, 2);
    assert_eq!(hub.chunk_len().await, 0);

    let saved = storage.saved.lock().await;
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0], vec![first, second]);
}

#[tokio::test]
async fn trades_after_the_swap_stay_in_the_chunk() {
    let storage = MockTradeStorage::new(Vec::new());
    let hub = build_hub(collect_config(), vec![storage.clone()]);
    connect_feed(&hub, "X", "BTC", "X-0").await;

    hub.ingest(vec![trade("X", "BTC", 1_000, 100.0, 1.0)]).await;
    hub.flush(false).await;
    hub.ingest(vec![trade("X", "BTC", 2_000, 101.0, 1.0)]).await;

    assert_eq!(hub.chunk_len().await, 1);
    let tail = hub.chunk_tail(0, 10_000).await;
    assert_eq!(tail[0].timestamp, 2_000);
}

#[tokio::test]
async fn empty_flush_saves_nothing() {
    let storage = MockTradeStorage::new(Vec::new());
    let hub = build_hub(collect_config(), vec![storage.clone()]);

    assert_eq!(hub.flush(false).await, 0);
    assert!(storage.saved.lock().await.is_empty());
}

#[tokio::test]
async fn one_failing_storage_does_not_abort_the_others() {
    let recording = MockTradeStorage::new(Vec::new());
    let hub = build_hub(
        collect_config(),
        vec![Arc::new(FailingStorage), recording.clone()],
    );
    connect_feed(&hub, "X", "BTC", "X-0").await;

    hub.ingest(vec![trade("X", "BTC", 1_000, 100.0, 1.0)]).await;
    hub.flush(false).await;

    assert_eq!(recording.saved.lock().await.len(), 1);
}

#[tokio::test]
async fn ingest_flush_fetch_roundtrip() -> Result<()> {
    let dir = TempDir::new()?;
    let log: Arc<dyn Storage> = Arc::new(TradeLog::open("files", dir.path(), None)?);
    let hub = build_hub(collect_config(), vec![log.clone()]);
    connect_feed(&hub, "X", "BTC", "X-0").await;

    let sequence = vec![
        trade("X", "BTC", 1_000, 100.0, 1.0),
        trade("X", "BTC", 2_000, 101.0, 2.0),
        trade("X", "BTC", 3_000, 102.0, 3.0),
    ];
    hub.ingest(sequence.clone()).await;
    hub.flush(true).await;

    let payload = log
        .fetch(FetchQuery {
            from: 1_000,
            to: 3_000,
            timeframe: 60_000,
            markets: Vec::new(),
        })
        .await?;
    match payload {
        FetchPayload::Trades(trades) => assert_eq!(trades, sequence),
        FetchPayload::Points(_) => panic!("trade log served points"),
    }
    Ok(())
}

#[tokio::test]
async fn immediate_mode_dispatches_inline() {
    let config = ServerConfig {
        broadcast: true,
        broadcast_aggr: false,
        broadcast_debounce: 0,
        ..Default::default()
    };
    let hub = build_hub(config, vec![MockTradeStorage::new(Vec::new())]);
    connect_feed(&hub, "X", "BTC", "X-0").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.dispatcher()
        .register(vec!["X:BTC".to_string()], tx)
        .await;

    hub.ingest(vec![trade("X", "BTC", 1_000, 100.0, 1.0)]).await;

    let frame = rx.try_recv().expect("inline frame");
    assert!(frame.starts_with("[\"X:BTC\""));
}

#[tokio::test]
async fn debounced_mode_queues_until_drained() {
    let config = ServerConfig {
        broadcast: true,
        broadcast_aggr: false,
        broadcast_debounce: 200,
        ..Default::default()
    };
    let hub = build_hub(config, vec![MockTradeStorage::new(Vec::new())]);
    connect_feed(&hub, "X", "BTC", "X-0").await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    hub.dispatcher()
        .register(vec!["X:BTC".to_string()], tx)
        .await;

    hub.ingest(vec![trade("X", "BTC", 1_000, 100.0, 1.0)]).await;
    assert!(rx.try_recv().is_err());

    let delayed = hub.drain_delayed().await;
    assert_eq!(delayed.len(), 1);
    hub.dispatcher().broadcast_trades(&delayed).await;
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn aggregated_mode_keeps_unregistered_feeds_out() {
    let config = ServerConfig {
        broadcast: true,
        broadcast_aggr: true,
        ..Default::default()
    };
    let hub = build_hub(config, vec![MockTradeStorage::new(Vec::new())]);
    connect_feed(&hub, "X", "BTC", "X-0").await;

    hub.ingest(vec![
        trade("X", "BTC", 1_000, 100.0, 1.0),
        trade("Y", "BTC", 1_000, 100.0, 1.0),
    ])
    .await;

    tokio::time::sleep(tokio::time::Duration::from_millis(60)).await;
    let sealed = hub.sweep_and_drain_aggregated().await;
    assert_eq!(sealed.len(), 1);
    assert_eq!(sealed[0].exchange, "X");
}
