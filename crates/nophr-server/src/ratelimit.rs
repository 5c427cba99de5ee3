//! Per-client rate limiting, keyed by peer IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};

use nophr_config::{RateLimit, RateLimitQuota};

type KeyedLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

fn limiter(quota: &RateLimitQuota) -> Option<KeyedLimiter> {
    let per_minute = NonZeroU32::new(quota.requests_per_minute)?;
    let burst = NonZeroU32::new(quota.burst_size.max(1))?;
    Some(RateLimiter::keyed(
        Quota::per_minute(per_minute).allow_burst(burst),
    ))
}

pub struct RateLimits {
    global: Option<KeyedLimiter>,
    per_protocol: HashMap<String, KeyedLimiter>,
}

impl RateLimits {
    pub fn from_config(config: &RateLimit) -> Self {
        if !config.enabled {
            return Self {
                global: None,
                per_protocol: HashMap::new(),
            };
        }
        Self {
            global: limiter(&config.global),
            per_protocol: config
                .per_protocol
                .iter()
                .filter_map(|(name, quota)| Some((name.clone(), limiter(quota)?)))
                .collect(),
        }
    }

    /// Whether a request from `ip` over `protocol` may proceed.
    pub fn check(&self, protocol: &str, ip: IpAddr) -> bool {
        if let Some(limiter) = self.per_protocol.get(protocol) {
            if limiter.check_key(&ip).is_err() {
                return false;
            }
        }
        match &self.global {
            Some(limiter) => limiter.check_key(&ip).is_ok(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_limited() {
        let config = RateLimit {
            enabled: true,
            global: RateLimitQuota {
                requests_per_minute: 60,
                burst_size: 10,
            },
            per_protocol: Default::default(),
        };
        let limits = RateLimits::from_config(&config);
        let ip: IpAddr = "198.51.100.7".parse().unwrap();

        for _ in 0..10 {
            assert!(limits.check("gemini", ip));
        }
        assert!(!limits.check("gemini", ip));
        assert!(!limits.check("gemini", ip));

        // A different client is unaffected.
        let other: IpAddr = "198.51.100.8".parse().unwrap();
        assert!(limits.check("gemini", other));
    }

    #[test]
    fn disabled_config_allows_everything() {
        let limits = RateLimits::from_config(&RateLimit::default());
        let ip: IpAddr = "203.0.113.1".parse().unwrap();
        for _ in 0..1_000 {
            assert!(limits.check("gopher", ip));
        }
    }
}
