//! Point-format driver: OHLCV bars folded from saved trade batches
//!
//! Bars are kept in memory keyed by `(market, open_time)` and every bar
//! touched by a save is re-appended to the segment log, so replaying the
//! log on connect rebuilds the map with the latest state winning.

use std::collections::hash_map::Entry;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use common::Trade;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::segment::{SegmentLog, SegmentReader};
use crate::{Bar, FetchPayload, FetchQuery, Storage, StorageFormat};

/// Default segment size (32 MB); bar entries are small
const DEFAULT_SEGMENT_SIZE: u64 = 32 * 1024 * 1024;

struct BarStoreInner {
    bars: FxHashMap<(String, u64), Bar>,
    log: SegmentLog,
}

/// OHLCV bar store over CRC-checked segment files
pub struct BarStore {
    name: String,
    resolution: u64,
    inner: Mutex<BarStoreInner>,
}

impl BarStore {
    /// Open (or initialize) a bar store under `dir` bucketing at
    /// `resolution` milliseconds
    pub fn open(
        name: impl Into<String>,
        dir: &Path,
        resolution: u64,
        segment_size: Option<u64>,
    ) -> Result<Self> {
        let segment_size = segment_size.unwrap_or(DEFAULT_SEGMENT_SIZE);
        let log = SegmentLog::open(dir, "bars", segment_size)?;

        info!(
            "initialized bar store at {} with {} ms resolution",
            dir.display(),
            resolution
        );
        Ok(Self {
            name: name.into(),
            resolution,
            inner: Mutex::new(BarStoreInner {
                bars: FxHashMap::default(),
                log,
            }),
        })
    }

    /// Bucket resolution in milliseconds
    pub fn resolution(&self) -> u64 {
        self.resolution
    }
}

#[async_trait]
impl Storage for BarStore {
    fn format(&self) -> StorageFormat {
        StorageFormat::Point
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let segments = inner.log.segments()?;

        let mut replayed = 0u64;
        for path in segments {
            let mut reader = SegmentReader::open(&path)?;
            while let Some(data) = reader.read_next()? {
                match bincode::deserialize::<Bar>(&data) {
                    Ok(bar) => {
                        inner.bars.insert((bar.market.clone(), bar.time), bar);
                        replayed += 1;
                    }
                    Err(e) => {
                        debug!("skipping undecodable bar in {}: {}", path.display(), e);
                    }
                }
            }
        }

        info!("replayed {} bar entries into {}", replayed, self.name);
        Ok(())
    }

    async fn save(&self, batch: &[Trade], exiting: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;

        let mut touched: Vec<(String, u64)> = Vec::new();
        for trade in batch {
            let market = trade.market();
            let time = trade.timestamp - trade.timestamp % self.resolution;
            let key = (market.clone(), time);
            inner
                .bars
                .entry(key.clone())
                .and_modify(|bar| bar.fold(trade))
                .or_insert_with(|| Bar::open(market, time, trade));
            if !touched.contains(&key) {
                touched.push(key);
            }
        }

        for key in &touched {
            if let Some(bar) = inner.bars.get(key) {
                let data = bincode::serialize(bar)?;
                inner.log.append(&data)?;
            }
        }
        inner.log.flush()?;

        debug!(
            "folded {} trades into {} bars in {}{}",
            batch.len(),
            touched.len(),
            self.name,
            if exiting { " (exit flush)" } else { "" }
        );
        Ok(())
    }

    async fn fetch(&self, query: FetchQuery) -> Result<FetchPayload> {
        let inner = self.inner.lock().await;
        let timeframe = query.timeframe.max(self.resolution);

        // Resample native-resolution bars into the requested timeframe.
        let mut source: Vec<&Bar> = inner
            .bars
            .values()
            .filter(|bar| bar.time >= query.from && bar.time < query.to)
            .filter(|bar| query.markets.is_empty() || query.markets.contains(&bar.market))
            .collect();
        source.sort_by(|a, b| (a.time, &a.market).cmp(&(b.time, &b.market)));

        let mut merged: FxHashMap<(String, u64), Bar> = FxHashMap::default();
        let mut order: Vec<(String, u64)> = Vec::new();
        for bar in source {
            let bucket = bar.time - bar.time % timeframe;
            match merged.entry((bar.market.clone(), bucket)) {
                Entry::Occupied(mut entry) => {
                    let out = entry.get_mut();
                    if bar.high > out.high {
                        out.high = bar.high;
                    }
                    if bar.low < out.low {
                        out.low = bar.low;
                    }
                    out.close = bar.close;
                    out.volume += bar.volume;
                    out.buy_volume += bar.buy_volume;
                    out.count += bar.count;
                }
                Entry::Vacant(entry) => {
                    let mut out = bar.clone();
                    out.time = bucket;
                    order.push(entry.key().clone());
                    entry.insert(out);
                }
            }
        }

        order.sort_by(|a, b| (a.1, &a.0).cmp(&(b.1, &b.0)));
        let bars = order
            .into_iter()
            .filter_map(|key| merged.remove(&key))
            .collect();
        Ok(FetchPayload::Points(bars))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Side;
    use tempfile::TempDir;

    fn trade(timestamp: u64, price: f64, size: f64, side: Side) -> Trade {
        Trade {
            exchange: "X".to_string(),
            pair: "BTC".to_string(),
            timestamp,
            price,
            size,
            side,
            liquidation: false,
        }
    }

    fn query(from: u64, to: u64, timeframe: u64) -> FetchQuery {
        FetchQuery {
            from,
            to,
            timeframe,
            markets: Vec::new(),
        }
    }

    #[tokio::test]
    async fn folds_trades_into_bars() -> Result<()> {
        let dir = TempDir::new()?;
        let store = BarStore::open("bars", dir.path(), 10_000, None)?;

        store
            .save(
                &[
                    trade(1_000, 100.0, 2.0, Side::Buy),
                    trade(2_000, 110.0, 1.0, Side::Sell),
                    trade(9_000, 95.0, 1.0, Side::Buy),
                ],
                false,
            )
            .await?;

        let payload = store.fetch(query(0, 10_000, 10_000)).await?;
        let FetchPayload::Points(bars) = payload else {
            panic!("bar store served trades");
        };
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].high, 110.0);
        assert_eq!(bars[0].low, 95.0);
        assert_eq!(bars[0].close, 95.0);
        assert_eq!(bars[0].volume, 4.0);
        assert_eq!(bars[0].buy_volume, 3.0);
        assert_eq!(bars[0].count, 3);
        Ok(())
    }

    #[tokio::test]
    async fn resamples_to_requested_timeframe() -> Result<()> {
        let dir = TempDir::new()?;
        let store = BarStore::open("bars", dir.path(), 10_000, None)?;

        store
            .save(
                &[
                    trade(5_000, 100.0, 1.0, Side::Buy),
                    trade(15_000, 120.0, 1.0, Side::Buy),
                    trade(65_000, 90.0, 1.0, Side::Sell),
                ],
                false,
            )
            .await?;

        let payload = store.fetch(query(0, 120_000, 60_000)).await?;
        let FetchPayload::Points(bars) = payload else {
            panic!("bar store served trades");
        };
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].time, 0);
        assert_eq!(bars[0].open, 100.0);
        assert_eq!(bars[0].close, 120.0);
        assert_eq!(bars[0].volume, 2.0);
        assert_eq!(bars[1].time, 60_000);
        assert_eq!(bars[1].close, 90.0);
        Ok(())
    }

    #[tokio::test]
    async fn replays_bars_on_connect() -> Result<()> {
        let dir = TempDir::new()?;
        {
            let store = BarStore::open("bars", dir.path(), 10_000, None)?;
            store.save(&[trade(1_000, 100.0, 1.0, Side::Buy)], true).await?;
        }

        let store = BarStore::open("bars", dir.path(), 10_000, None)?;
        store.connect().await?;
        let payload = store.fetch(query(0, 10_000, 10_000)).await?;
        assert!(!payload.is_empty());
        Ok(())
    }
}
