//! Trade-format driver: an append-only log of raw trades

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use common::Trade;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::segment::{SegmentLog, SegmentReader};
use crate::{FetchPayload, FetchQuery, Storage, StorageFormat};

/// Default segment size (128 MB)
const DEFAULT_SEGMENT_SIZE: u64 = 128 * 1024 * 1024;

/// Append-only trade log over CRC-checked segment files
pub struct TradeLog {
    name: String,
    log: Mutex<SegmentLog>,
}

impl TradeLog {
    /// Open (or initialize) a trade log under `dir`
    pub fn open(name: impl Into<String>, dir: &Path, segment_size: Option<u64>) -> Result<Self> {
        let segment_size = segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE);
        let log = SegmentLog::open(dir, "trades", segment_size)?;

        info!(
            "initialized trade log at {} with segment size {} MB",
            dir.display(),
            segment_size / (1024 * 1024)
        );
        Ok(Self {
            name: name.into(),
            log: Mutex::new(log),
        })
    }
}

#[async_trait]
impl Storage for TradeLog {
    fn format(&self) -> StorageFormat {
        StorageFormat::Trade
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn save(&self, batch: &[Trade], exiting: bool) -> Result<()> {
        let mut log = self.log.lock().await;
        for trade in batch {
            let data = bincode::serialize(trade)?;
            log.append(&data)?;
        }
        log.flush()?;

        debug!(
            "persisted {} trades to {}{}",
            batch.len(),
            self.name,
            if exiting { " (exit flush)" } else { "" }
        );
        Ok(())
    }

    async fn fetch(&self, query: FetchQuery) -> Result<FetchPayload> {
        // Hold the writer lock across the scan so a concurrent save cannot
        // leave a half-flushed entry under the reader.
        let log = self.log.lock().await;
        let segments = log.segments()?;

        let mut trades = Vec::new();
        for path in segments {
            let mut reader = SegmentReader::open(&path)?;
            while let Some(data) = reader.read_next()? {
                let trade: Trade = match bincode::deserialize(&data) {
                    Ok(trade) => trade,
                    Err(e) => {
                        debug!("skipping undecodable entry in {}: {}", path.display(), e);
                        continue;
                    }
                };
                if trade.timestamp < query.from || trade.timestamp > query.to {
                    continue;
                }
                if !query.markets.is_empty() && !query.markets.contains(&trade.market()) {
                    continue;
                }
                trades.push(trade);
            }
        }

        trades.sort_by_key(|trade| trade.timestamp);
        Ok(FetchPayload::Trades(trades))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Side;
    use tempfile::TempDir;

    fn trade(exchange: &str, pair: &str, timestamp: u64, price: f64) -> Trade {
        Trade {
            exchange: exchange.to_string(),
            pair: pair.to_string(),
            timestamp,
            price,
            size: 1.0,
            side: Side::Buy,
            liquidation: false,
        }
    }

    #[tokio::test]
    async fn save_then_fetch_roundtrip() -> Result<()> {
        let dir = TempDir::new()?;
        let log = TradeLog::open("files", dir.path(), Some(1024 * 1024))?;

        let batch = vec![
            trade("X", "BTC", 1_000, 100.0),
            trade("X", "BTC", 2_000, 101.0),
            trade("Y", "ETH", 3_000, 50.0),
        ];
        log.save(&batch, false).await?;

        let payload = log
            .fetch(FetchQuery {
                from: 0,
                to: 10_000,
                timeframe: 60_000,
                markets: Vec::new(),
            })
            .await?;
        match payload {
            FetchPayload::Trades(trades) => assert_eq!(trades, batch),
            FetchPayload::Points(_) => panic!("trade log served points"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn fetch_filters_range_and_markets() -> Result<()> {
        let dir = TempDir::new()?;
        let log = TradeLog::open("files", dir.path(), Some(1024 * 1024))?;

        log.save(
            &[
                trade("X", "BTC", 1_000, 100.0),
                trade("X", "BTC", 5_000, 102.0),
                trade("Y", "ETH", 2_000, 50.0),
            ],
            false,
        )
        .await?;

        let payload = log
            .fetch(FetchQuery {
                from: 500,
                to: 3_000,
                timeframe: 60_000,
                markets: vec!["X:BTC".to_string()],
            })
            .await?;
        match payload {
            FetchPayload::Trades(trades) => {
                assert_eq!(trades.len(), 1);
                assert_eq!(trades[0].timestamp, 1_000);
            }
            FetchPayload::Points(_) => panic!("trade log served points"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn fetch_survives_restart() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let log = TradeLog::open("files", dir.path(), Some(1024 * 1024))?;
            log.save(&[trade("X", "BTC", 1_000, 100.0)], true).await?;
        }

        let log = TradeLog::open("files", dir.path(), Some(1024 * 1024))?;
        let payload = log
            .fetch(FetchQuery {
                from: 0,
                to: 10_000,
                timeframe: 60_000,
                markets: Vec::new(),
            })
            .await?;
        assert!(!payload.is_empty());
        Ok(())
    }
}
