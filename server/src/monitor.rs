//! Activity monitor: adaptive stall detection over per-API statistics
//!
//! A high-rate feed that goes quiet for ten seconds is suspicious; a
//! near-idle feed earns proportionally more slack, floored at ten seconds
//! so quiet feeds are not churned.

use std::sync::Arc;

use common::now_ms;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::hub::Hub;
use crate::registry::ApiActivity;

/// Lower bound for the adaptive stall threshold, ms
const THRESHOLD_FLOOR_MS: f64 = 10_000.0;

/// Monitor ticks between connection-table dumps
const TABLE_EVERY_TICKS: u64 = 60;

/// Trades per minute across an API's feeds, each feed extrapolated from
/// its hit count over its own lifetime
pub fn api_rate(activity: &ApiActivity, now: u64) -> f64 {
    activity
        .starts
        .iter()
        .zip(&activity.hits)
        .map(|(&start, &hit)| {
            let elapsed = now.saturating_sub(start).max(1);
            60_000.0 / elapsed as f64 * hit as f64
        })
        .sum()
}

/// Smallest idle time across an API's feeds, ms
pub fn min_ping(activity: &ApiActivity, now: u64) -> u64 {
    activity
        .timestamps
        .iter()
        .map(|&timestamp| now.saturating_sub(timestamp))
        .min()
        .unwrap_or(0)
}

/// Adaptive stall threshold:
/// `max(base / (0.5 + rate / feeds / 100), 10s)`
pub fn stall_threshold(base: u64, rate: f64, feed_count: usize) -> u64 {
    let feeds = feed_count.max(1) as f64;
    let adjusted = base as f64 / (0.5 + rate / feeds / 100.0);
    adjusted.max(THRESHOLD_FLOOR_MS) as u64
}

/// Whether an API counts as stalled right now
pub fn is_stalled(activity: &ApiActivity, base: u64, now: u64) -> bool {
    if activity.pairs.is_empty() {
        return false;
    }
    let rate = api_rate(activity, now);
    let threshold = stall_threshold(base, rate, activity.pairs.len());
    min_ping(activity, now) > threshold
}

/// Inspect every API on a fixed cadence and reconnect the stalled ones
pub async fn monitor_task(hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) {
    let base = hub.config().reconnection_threshold;
    let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
        hub.config().monitor_interval.max(1),
    ));
    let mut ticks = 0u64;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                ticks += 1;
                let now = now_ms();

                for activity in hub.snapshot_by_api().await {
                    if is_stalled(&activity, base, now) {
                        warn!(
                            "{} {} stalled ({} feeds idle >= {} ms), reconnecting",
                            activity.exchange,
                            activity.api_id,
                            activity.pairs.len(),
                            min_ping(&activity, now)
                        );
                        hub.reconnect(&activity.exchange, &activity.api_id).await;
                    }
                }

                if ticks % TABLE_EVERY_TICKS == 0 {
                    hub.log_connection_table(now).await;
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("activity monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn activity(starts: Vec<u64>, hits: Vec<u64>, timestamps: Vec<u64>) -> ApiActivity {
        let pairs = (0..starts.len()).map(|i| format!("P{i}")).collect();
        ApiActivity {
            exchange: "X".to_string(),
            api_id: "X-0".to_string(),
            pairs,
            hits,
            timestamps,
            starts,
        }
    }

    #[test]
    fn threshold_adapts_to_rate() {
        // 600 trades/min over two feeds: 60000 / (0.5 + 300 / 100) = 17143
        assert_eq!(stall_threshold(60_000, 600.0, 2), 17_142);
        // Near-idle feeds keep the ten-second floor.
        assert_eq!(stall_threshold(60_000, 1_200.0, 2), 10_000);
        assert_eq!(stall_threshold(5_000, 0.0, 1), 10_000);
    }

    #[test]
    fn stall_requires_ping_above_threshold() {
        let now = 120_000;
        // Two feeds, 600 hits each over one minute: rate/feed = 600/min,
        // threshold = max(60000 / 6.5, 10000) = 10000.
        let busy = activity(
            vec![60_000, 60_000],
            vec![600, 600],
            vec![now - 12_000, now - 15_000],
        );
        assert!(is_stalled(&busy, 60_000, now));

        let recent = activity(
            vec![60_000, 60_000],
            vec![600, 600],
            vec![now - 8_000, now - 15_000],
        );
        assert!(!is_stalled(&recent, 60_000, now));
    }

    #[test]
    fn min_ping_takes_freshest_feed() {
        let now = 100_000;
        let activity = activity(
            vec![0, 0],
            vec![1, 1],
            vec![now - 30_000, now - 2_000],
        );
        assert_eq!(min_ping(&activity, now), 2_000);
    }
}
