//! Per-IP rate limiting with token buckets

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::debug;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Token-bucket rate limiter keyed per client IP
pub struct IpRateLimiter {
    quota: Quota,
    limiters: RwLock<FxHashMap<IpAddr, Arc<DirectLimiter>>>,
}

impl IpRateLimiter {
    /// Allow `max` requests per `window_ms`, with the full window
    /// available as burst
    pub fn new(max: u32, window_ms: u64) -> Self {
        let max = NonZeroU32::new(max).unwrap_or(NonZeroU32::MIN);
        let replenish_ms = (window_ms / u64::from(max.get())).max(1);
        let quota = Quota::with_period(Duration::from_millis(replenish_ms))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(max);

        Self {
            quota,
            limiters: RwLock::new(FxHashMap::default()),
        }
    }

    /// Whether a request from `ip` is allowed right now
    pub async fn check(&self, ip: IpAddr) -> bool {
        if let Some(limiter) = self.limiters.read().await.get(&ip).cloned() {
            return limiter.check().is_ok();
        }

        let limiter = Arc::new(RateLimiter::direct(self.quota));
        let allowed = limiter.check().is_ok();
        self.limiters.write().await.entry(ip).or_insert(limiter);
        debug!("created rate limiter for {}", ip);
        allowed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enforces_burst_then_recovers_nothing_within_window() {
        let limiter = IpRateLimiter::new(3, 60_000);
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        assert!(limiter.check(ip).await);
        assert!(limiter.check(ip).await);
        assert!(limiter.check(ip).await);
        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn limits_are_per_ip() {
        let limiter = IpRateLimiter::new(1, 60_000);
        let first: IpAddr = "10.0.0.1".parse().unwrap();
        let second: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check(first).await);
        assert!(!limiter.check(first).await);
        assert!(limiter.check(second).await);
    }
}
