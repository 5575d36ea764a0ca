//! Per-caller token bucket rate limiting.
//!
//! Each caller identity owns a bucket holding at most `burst` tokens that
//! refills continuously at `requests_per_minute / 60` tokens per second. A new
//! identity starts with a full bucket, so its first request is never starved.
//! Every accepted request consumes one token.
//!
//! # Memory Management
//!
//! Buckets unused for `visitor_idle_secs` are purged. The purge runs lazily
//! inside [`RateLimiter::allow`], at most once per `sweep_interval_secs`, so no
//! background task is needed.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for the rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Steady-state refill rate.
    pub requests_per_minute: u32,
    /// Bucket capacity. Defaults to `requests_per_minute` when unset.
    pub burst: Option<u32>,
    /// Idle time after which a caller's bucket is forgotten.
    pub visitor_idle_secs: u64,
    /// Minimum time between two purges of idle buckets.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            burst: None,
            visitor_idle_secs: 600,
            sweep_interval_secs: 60,
        }
    }
}

impl RateLimitConfig {
    /// Maximum tokens a bucket can hold.
    pub fn capacity(&self) -> f64 {
        f64::from(self.burst.unwrap_or(self.requests_per_minute))
    }

    /// Tokens added per second.
    pub fn refill_per_sec(&self) -> f64 {
        f64::from(self.requests_per_minute) / 60.0
    }

    pub const fn visitor_idle(&self) -> Duration {
        Duration::from_secs(self.visitor_idle_secs)
    }

    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(Error::Config(
                "rate_limit.requests_per_minute must be positive".into(),
            ));
        }
        if self.burst == Some(0) {
            return Err(Error::Config("rate_limit.burst must be positive".into()));
        }
        if self.visitor_idle_secs == 0 || self.sweep_interval_secs == 0 {
            return Err(Error::Config(
                "rate_limit idle and sweep intervals must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Visitor {
    tokens: f64,
    last_refill: Instant,
    last_used: Instant,
}

impl Visitor {
    fn tokens_at(&self, now: Instant, refill_per_sec: f64, capacity: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        elapsed.mul_add(refill_per_sec, self.tokens).min(capacity)
    }
}

#[derive(Debug)]
struct LimiterState {
    visitors: HashMap<String, Visitor>,
    last_sweep: Instant,
}

/// In-memory token bucket rate limiter keyed by caller identity.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    /// Create a rate limiter with the given configuration.
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(LimiterState {
                visitors: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Consume one token for `identity`. Returns `false` when the bucket is
    /// empty. Never blocks beyond the internal mutex.
    pub fn allow(&self, identity: &str) -> bool {
        let now = Instant::now();
        let capacity = self.config.capacity();
        let refill = self.config.refill_per_sec();

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_duration_since(state.last_sweep) >= self.config.sweep_interval() {
            Self::sweep(&mut state, now, self.config.visitor_idle());
        }

        let visitor = state
            .visitors
            .entry(identity.to_string())
            .or_insert_with(|| Visitor {
                tokens: capacity,
                last_refill: now,
                last_used: now,
            });

        visitor.tokens = visitor.tokens_at(now, refill, capacity);
        visitor.last_refill = now;
        visitor.last_used = now;

        if visitor.tokens >= 1.0 {
            visitor.tokens -= 1.0;
            true
        } else {
            warn!(identity, "rate limit exceeded");
            false
        }
    }

    /// Like [`allow`](Self::allow), but returns a classified error on rejection.
    pub fn check(&self, identity: &str) -> Result<()> {
        if self.allow(identity) {
            Ok(())
        } else {
            Err(Error::RateLimitExceeded {
                identity: identity.to_string(),
            })
        }
    }

    /// Time until `identity` has a whole token again. Zero for unknown callers.
    pub fn retry_after(&self, identity: &str) -> Duration {
        let now = Instant::now();
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(visitor) = state.visitors.get(identity) else {
            return Duration::ZERO;
        };
        let tokens =
            visitor.tokens_at(now, self.config.refill_per_sec(), self.config.capacity());
        if tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - tokens) / self.config.refill_per_sec())
        }
    }

    /// Forget every tracked caller.
    pub fn clear(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .visitors
            .clear();
    }

    /// Number of tracked caller identities.
    pub fn visitor_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .visitors
            .len()
    }

    fn sweep(state: &mut LimiterState, now: Instant, idle: Duration) {
        let before = state.visitors.len();
        state
            .visitors
            .retain(|_, v| now.saturating_duration_since(v.last_used) < idle);
        state.last_sweep = now;
        let removed = before - state.visitors.len();
        if removed > 0 {
            debug!(removed, remaining = state.visitors.len(), "Purged idle rate-limit visitors");
        }
    }
}

/// Derive the rate-limit identity for a request.
///
/// Prefers the first `X-Forwarded-For` entry, else the transport peer. Ports
/// are stripped from IPv4 and bracketed IPv6 forms; bare IPv6 is kept whole.
pub fn client_identity(forwarded_for: Option<&str>, peer: Option<SocketAddr>) -> String {
    let forwarded = forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (forwarded, peer) {
        (Some(addr), _) => normalize_address(addr),
        (None, Some(peer)) => canonical_ip(peer.ip()).to_string(),
        (None, None) => "unknown".to_string(),
    }
}

/// Strip a port suffix from an address string without splitting IPv6 on `:`.
pub fn normalize_address(raw: &str) -> String {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return canonical_ip(addr.ip()).to_string();
    }
    if let Ok(ip) = raw.parse::<IpAddr>() {
        return canonical_ip(ip).to_string();
    }
    if let Some(inner) = raw.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
        return inner.to_string();
    }
    raw.to_string()
}

fn canonical_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map_or(ip, IpAddr::V4),
        IpAddr::V4(_) => ip,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn limiter(rpm: u32, burst: Option<u32>) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            requests_per_minute: rpm,
            burst,
            visitor_idle_secs: 600,
            sweep_interval_secs: 60,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_after_burst_and_recovers() {
        let rl = limiter(60, Some(3));
        for _ in 0..3 {
            assert!(rl.allow("10.0.0.1"));
        }
        assert!(!rl.allow("10.0.0.1"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(rl.allow("10.0.0.1"));
        assert!(!rl.allow("10.0.0.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_defaults_to_rate() {
        let rl = limiter(5, None);
        for _ in 0..5 {
            assert!(rl.allow("a"));
        }
        assert!(!rl.allow("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn identities_are_independent() {
        let rl = limiter(60, Some(1));
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        assert!(rl.allow("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_never_exceeds_capacity() {
        let rl = limiter(60, Some(2));
        assert!(rl.allow("a"));
        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(rl.allow("a"));
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn check_returns_classified_error() {
        let rl = limiter(60, Some(1));
        rl.check("a").unwrap();
        let err = rl.check("a").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::RateLimitExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_reports_refill_time() {
        let rl = limiter(30, Some(1));
        assert_eq!(rl.retry_after("a"), Duration::ZERO);
        assert!(rl.allow("a"));
        assert_eq!(rl.retry_after("a"), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_visitors_are_swept_lazily() {
        let rl = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: None,
            visitor_idle_secs: 10,
            sweep_interval_secs: 5,
        });
        assert!(rl.allow("old"));
        assert_eq!(rl.visitor_count(), 1);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(rl.allow("new"));
        assert_eq!(rl.visitor_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_forgets_visitors() {
        let rl = limiter(60, Some(1));
        assert!(rl.allow("a"));
        assert!(!rl.allow("a"));
        rl.clear();
        assert_eq!(rl.visitor_count(), 0);
        assert!(rl.allow("a"));
    }

    #[test]
    fn zero_rate_is_invalid() {
        let config = RateLimitConfig {
            requests_per_minute: 0,
            ..RateLimitConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn identity_prefers_forwarded_header() {
        let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        assert_eq!(
            client_identity(Some("203.0.113.7, 10.0.0.1"), Some(peer)),
            "203.0.113.7"
        );
        assert_eq!(client_identity(None, Some(peer)), "127.0.0.1");
        assert_eq!(client_identity(Some("  "), None), "unknown");
    }

    #[test]
    fn ipv4_port_is_stripped() {
        assert_eq!(normalize_address("198.51.100.4:8080"), "198.51.100.4");
        assert_eq!(normalize_address("198.51.100.4"), "198.51.100.4");
    }

    #[test]
    fn ipv6_is_kept_intact() {
        assert_eq!(normalize_address("2001:db8::1"), "2001:db8::1");
        assert_eq!(normalize_address("[2001:db8::1]:443"), "2001:db8::1");
        assert_eq!(normalize_address("[2001:db8::1]"), "2001:db8::1");
    }

    #[test]
    fn ipv4_mapped_peer_is_canonicalised() {
        let peer: SocketAddr = "[::ffff:192.0.2.1]:9000".parse().unwrap();
        assert_eq!(client_identity(None, Some(peer)), "192.0.2.1");
    }
}
