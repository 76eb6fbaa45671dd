//! Per-client token buckets for the HTTP gateway.

use axum::http::HeaderMap;
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Keyed limiter allowing each client `per_second` requests with bursts of
/// up to `burst`.
pub struct ClientRateLimiter {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
    trust_proxy_headers: bool,
}

impl ClientRateLimiter {
    /// `None` when rate limiting is disabled.
    pub fn from_config(config: &RateLimitConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        let per_second = NonZeroU32::new(config.per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst).unwrap_or(per_second);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        Some(Self {
            limiter: RateLimiter::keyed(quota),
            trust_proxy_headers: config.trust_proxy_headers,
        })
    }

    /// Take one token for `client`. `false` when the bucket is empty.
    pub fn check(&self, client: IpAddr) -> bool {
        match self.limiter.check_key(&client) {
            Ok(()) => true,
            Err(_) => {
                debug!("Rate limit exceeded for {}", client);
                false
            }
        }
    }

    /// Address to charge for a request: the proxy-reported client when
    /// proxy headers are trusted, else the socket peer.
    pub fn client_ip(&self, headers: &HeaderMap, peer: SocketAddr) -> IpAddr {
        if self.trust_proxy_headers {
            if let Some(ip) = forwarded_ip(headers) {
                return ip;
            }
        }
        peer.ip()
    }

    /// Drop buckets that have refilled completely.
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
    {
        return Some(ip);
    }
    // First entry is the original client.
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
}

/// Periodically prune idle buckets until the limiter is dropped elsewhere.
pub fn spawn_pruner(limiter: Arc<ClientRateLimiter>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            limiter.prune();
            if Arc::strong_count(&limiter) == 1 {
                break;
            }
        }
    })
}
