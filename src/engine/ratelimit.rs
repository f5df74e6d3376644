//! Sliding-window rate limiting keyed by (source address, destination port).
//!
//! Windows are pruned lazily at check time against a caller-supplied `now`;
//! there is no sweeper thread. Buckets live in a sharded map so evaluations
//! for different keys never contend, while checks for the same key linearize
//! on the bucket's entry lock.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// A rate limit: at most `max_requests` within the trailing `window_seconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl RateLimit {
    pub fn new(max_requests: u32, window_seconds: u64) -> Self {
        Self {
            max_requests,
            window_seconds,
        }
    }

    /// The window as a `Duration`, clamped so configured values beyond
    /// chrono's representable range saturate instead of panicking.
    pub fn window(&self) -> Duration {
        let seconds = i64::try_from(self.window_seconds).unwrap_or(i64::MAX);
        Duration::try_seconds(seconds).unwrap_or(Duration::MAX)
    }

    /// Instants at or before the cutoff are outside the window. Saturates at
    /// the epoch floor when the window exceeds the representable range.
    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

impl Default for RateLimit {
    fn default() -> Self {
        // 100 connections per minute.
        Self {
            max_requests: 100,
            window_seconds: 60,
        }
    }
}

/// Timestamps of requests inside one window. Stale entries are dropped on
/// every check, so the count never reflects requests older than the window.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    hits: Vec<DateTime<Utc>>,
}

impl SlidingWindow {
    /// Prune entries older than the window, then either reject without
    /// recording (at the limit) or record the hit and allow. Rejected
    /// attempts are deliberately not recorded, so a limited client recovers
    /// as soon as old entries age out.
    pub fn check_and_record(&mut self, limit: &RateLimit, now: DateTime<Utc>) -> bool {
        self.prune(limit, now);

        if self.hits.len() as u32 >= limit.max_requests {
            return false;
        }
        self.hits.push(now);
        true
    }

    /// Drop hits that have aged out of the window; reports whether any
    /// remain.
    pub fn prune(&mut self, limit: &RateLimit, now: DateTime<Utc>) -> bool {
        let cutoff = limit.cutoff(now);
        self.hits.retain(|t| *t > cutoff);
        !self.hits.is_empty()
    }

    /// Number of recorded hits still inside the window.
    pub fn count(&self, limit: &RateLimit, now: DateTime<Utc>) -> usize {
        let cutoff = limit.cutoff(now);
        self.hits.iter().filter(|t| **t > cutoff).count()
    }
}

/// Key identifying one rate bucket: source address and destination port.
pub type BucketKey = (IpAddr, u16);

/// The global rate limiter: per-key sliding windows with a default limit and
/// per-port overrides.
///
/// Thread-safe and shared across all evaluations. Limit configuration is
/// read-mostly behind its own lock, released before any bucket is touched.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<BucketKey, SlidingWindow>,
    default_limit: RwLock<RateLimit>,
    overrides: RwLock<HashMap<u16, RateLimit>>,
}

impl RateLimiter {
    pub fn new(default_limit: RateLimit) -> Self {
        Self {
            buckets: DashMap::new(),
            default_limit: RwLock::new(default_limit),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the default limit. Last write wins.
    pub fn set_default_limit(&self, limit: RateLimit) {
        *self.default_limit.write() = limit;
    }

    /// Set or replace the limit for a specific destination port.
    pub fn set_override(&self, port: u16, limit: RateLimit) {
        debug!(
            port = port,
            max_requests = limit.max_requests,
            window_seconds = limit.window_seconds,
            "Rate limit override set"
        );
        self.overrides.write().insert(port, limit);
    }

    /// The limit that applies to a port: its override if present, else the
    /// default.
    pub fn effective_limit(&self, port: u16) -> RateLimit {
        if let Some(limit) = self.overrides.read().get(&port) {
            return *limit;
        }
        *self.default_limit.read()
    }

    /// Check the limit for `(address, port)` and record the hit when under
    /// it. Returns `true` when the request is allowed.
    pub fn check_and_record(&self, address: IpAddr, port: u16, now: DateTime<Utc>) -> bool {
        let limit = self.effective_limit(port);

        let mut bucket = self.buckets.entry((address, port)).or_default();
        let allowed = bucket.check_and_record(&limit, now);

        if !allowed {
            trace!(address = %address, port = port, "Rate limit exceeded");
        }
        allowed
    }

    /// Current in-window count for a key. `None` when no bucket exists.
    /// Observer for tests and status reporting; never records.
    pub fn current_count(&self, address: IpAddr, port: u16, now: DateTime<Utc>) -> Option<usize> {
        let limit = self.effective_limit(port);
        self.buckets
            .get(&(address, port))
            .map(|bucket| bucket.count(&limit, now))
    }

    /// Evict buckets whose recorded hits have all aged out. Checks only
    /// touch their own key, so idle buckets otherwise live forever; this is
    /// the maintenance call that reclaims them.
    pub fn prune(&self, now: DateTime<Utc>) {
        self.buckets.retain(|&(_, port), window| {
            let limit = self.effective_limit(port);
            window.prune(&limit, now)
        });
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Drop all buckets. Primarily useful for testing.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimit::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, last))
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(RateLimit::new(3, 60));
        let now = t0();

        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(!limiter.check_and_record(addr(1), 80, now));
    }

    #[test]
    fn test_recovers_after_window_passes() {
        let limiter = RateLimiter::new(RateLimit::new(3, 60));
        let now = t0();

        for _ in 0..3 {
            assert!(limiter.check_and_record(addr(1), 80, now));
        }
        assert!(!limiter.check_and_record(addr(1), 80, now));

        // Past the window the old entries age out.
        let later = now + Duration::seconds(61);
        assert!(limiter.check_and_record(addr(1), 80, later));
    }

    #[test]
    fn test_rejected_attempts_do_not_extend_the_window() {
        let limiter = RateLimiter::new(RateLimit::new(2, 60));
        let now = t0();

        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(limiter.check_and_record(addr(1), 80, now));

        // Hammer while limited; none of these may be recorded.
        for i in 0..10 {
            let t = now + Duration::seconds(i);
            assert!(!limiter.check_and_record(addr(1), 80, t));
        }
        assert_eq!(limiter.current_count(addr(1), 80, now), Some(2));

        // Recovery is driven purely by the first two hits aging out.
        let later = now + Duration::seconds(61);
        assert!(limiter.check_and_record(addr(1), 80, later));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(RateLimit::new(1, 60));
        let now = t0();

        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(!limiter.check_and_record(addr(1), 80, now));

        // Different address and different port each get their own bucket.
        assert!(limiter.check_and_record(addr(2), 80, now));
        assert!(limiter.check_and_record(addr(1), 443, now));
        assert_eq!(limiter.bucket_count(), 3);
    }

    #[test]
    fn test_port_override_takes_precedence() {
        let limiter = RateLimiter::new(RateLimit::new(100, 60));
        limiter.set_override(22, RateLimit::new(1, 60));
        let now = t0();

        assert!(limiter.check_and_record(addr(1), 22, now));
        assert!(!limiter.check_and_record(addr(1), 22, now));

        // Other ports still use the default.
        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(limiter.check_and_record(addr(1), 80, now));
    }

    #[test]
    fn test_override_is_last_write_wins() {
        let limiter = RateLimiter::default();
        limiter.set_override(22, RateLimit::new(1, 60));
        limiter.set_override(22, RateLimit::new(5, 30));
        assert_eq!(limiter.effective_limit(22), RateLimit::new(5, 30));
    }

    #[test]
    fn test_prune_evicts_idle_buckets() {
        let limiter = RateLimiter::new(RateLimit::new(3, 60));
        let now = t0();

        limiter.check_and_record(addr(1), 80, now);
        limiter.check_and_record(addr(2), 443, now + Duration::seconds(30));
        assert_eq!(limiter.bucket_count(), 2);

        // Only the first bucket's hit has aged out.
        limiter.prune(now + Duration::seconds(61));
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(
            limiter.current_count(addr(2), 443, now + Duration::seconds(61)),
            Some(1)
        );

        limiter.prune(now + Duration::seconds(120));
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn test_prune_honors_port_overrides() {
        let limiter = RateLimiter::new(RateLimit::new(10, 10));
        limiter.set_override(22, RateLimit::new(10, 3600));
        let now = t0();

        limiter.check_and_record(addr(1), 22, now);
        limiter.check_and_record(addr(1), 80, now);

        // The default window has passed, the override's has not.
        limiter.prune(now + Duration::seconds(60));
        assert_eq!(limiter.bucket_count(), 1);
        assert!(limiter.current_count(addr(1), 22, now).is_some());
    }

    #[test]
    fn test_oversized_window_saturates() {
        let limiter = RateLimiter::new(RateLimit::new(2, u64::MAX));
        let now = t0();

        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(limiter.check_and_record(addr(1), 80, now));
        assert!(!limiter.check_and_record(addr(1), 80, now));
        assert_eq!(limiter.current_count(addr(1), 80, now), Some(2));
        limiter.prune(now);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_concurrent_same_key_never_overcounts() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new(RateLimit::new(50, 60)));
        let now = t0();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    let mut allowed = 0u32;
                    for _ in 0..25 {
                        if limiter.check_and_record(addr(1), 80, now) {
                            allowed += 1;
                        }
                    }
                    allowed
                })
            })
            .collect();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 50);
        assert_eq!(limiter.current_count(addr(1), 80, now), Some(50));
    }
}
