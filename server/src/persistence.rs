//! Wall-clock-aligned persistence scheduling
//!
//! Flushes land at the start of each `backup_interval` bucket, 20 ms
//! early, so every instance of the server (and every storage behind it)
//! sees batches cut on the same boundaries.

use std::sync::Arc;

use common::now_ms;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::hub::Hub;

/// Safety gap before the interval boundary, ms
const BOUNDARY_GAP_MS: i64 = 20;

/// Minimum delay before a flush may fire, ms
const MIN_DELAY_MS: i64 = 1000;

/// Delay until the next aligned flush: `ceil(now / interval) * interval -
/// now - 20ms`, pushed out one full interval when it lands under a second
pub fn aligned_flush_delay(now: u64, interval: u64) -> u64 {
    let interval = interval.max(1) as i64;
    let now = now as i64;

    let boundary = now.div_euclid(interval) * interval
        + if now % interval == 0 { 0 } else { interval };
    let mut delay = boundary - now - BOUNDARY_GAP_MS;
    if delay < MIN_DELAY_MS {
        delay += interval;
    }
    delay as u64
}

/// Flush the chunk to every storage on aligned boundaries until shutdown
pub async fn backup_task(hub: Arc<Hub>, mut shutdown: watch::Receiver<bool>) {
    let interval = hub.config().backup_interval;
    loop {
        let delay = aligned_flush_delay(now_ms(), interval);
        debug!("next flush in {} ms", delay);

        tokio::select! {
            _ = tokio::time::sleep(tokio::time::Duration::from_millis(delay)) => {
                let flushed = hub.flush(false).await;
                if flushed > 0 {
                    info!("flushed {} trades", flushed);
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!("backup task stopped");
}
