//! Sliding-window request limiter keyed by client identity.
//!
//! State is in-process only and resets on restart. Clients without a
//! forwarded address all share the [`UNKNOWN_CLIENT`] bucket; that bucket
//! is coarse and is kept as-is.

use super::periodic::PeriodicTask;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

/// Bucket shared by every request that carries no usable client address.
pub const UNKNOWN_CLIENT: &str = "unknown";

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    buckets: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit or reject one request from `identity` at the current instant.
    pub fn check(&self, identity: &str) -> bool {
        self.check_at(identity, Instant::now())
    }

    /// Timestamps older than the window are discarded first. A rejected
    /// request is not recorded.
    pub fn check_at(&self, identity: &str, now: Instant) -> bool {
        let mut buckets = self.lock();
        let live: Vec<Instant> = buckets
            .get(identity)
            .map(|stamps| {
                stamps
                    .iter()
                    .copied()
                    .filter(|t| !self.aged_out(*t, now))
                    .collect()
            })
            .unwrap_or_default();

        if live.len() >= self.max_requests {
            buckets.insert(identity.to_string(), live);
            return false;
        }

        let mut next = live;
        next.push(now);
        buckets.insert(identity.to_string(), next);
        true
    }

    /// Drop buckets whose every timestamp has aged out. Returns how many
    /// were removed.
    pub fn compact_at(&self, now: Instant) -> usize {
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, stamps| !stamps.iter().all(|t| self.aged_out(*t, now)));
        before - buckets.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.lock().len()
    }

    /// Run compaction once per window until the returned task is stopped.
    pub fn start_compaction(self: &Arc<Self>) -> PeriodicTask {
        let limiter = Arc::clone(self);
        PeriodicTask::spawn("rate-limit-compaction", self.window, move || {
            let limiter = Arc::clone(&limiter);
            async move {
                let dropped = limiter.compact_at(Instant::now());
                if dropped > 0 {
                    tracing::debug!(
                        dropped,
                        remaining = limiter.tracked_clients(),
                        "compacted idle rate-limit buckets"
                    );
                }
            }
        })
    }

    fn aged_out(&self, stamp: Instant, now: Instant) -> bool {
        now.saturating_duration_since(stamp) >= self.window
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        // A panic mid-update cannot leave a bucket half-written: buckets
        // are only ever replaced whole.
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn fourth_request_in_window_is_rejected() {
        let limiter = RateLimiter::new(MINUTE, 3);
        let start = Instant::now();

        assert!(limiter.check_at("10.0.0.1", start));
        assert!(limiter.check_at("10.0.0.1", start + Duration::from_secs(10)));
        assert!(limiter.check_at("10.0.0.1", start + Duration::from_secs(20)));
        assert!(!limiter.check_at("10.0.0.1", start + Duration::from_secs(30)));

        assert!(limiter.check_at("10.0.0.1", start + Duration::from_secs(80)));
    }

    #[test]
    fn rejected_requests_do_not_extend_the_window() {
        let limiter = RateLimiter::new(MINUTE, 1);
        let start = Instant::now();

        assert!(limiter.check_at("a", start));
        for s in [5, 30, 59] {
            assert!(!limiter.check_at("a", start + Duration::from_secs(s)));
        }
        assert!(limiter.check_at("a", start + MINUTE));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(MINUTE, 1);
        let now = Instant::now();

        assert!(limiter.check_at("a", now));
        assert!(!limiter.check_at("a", now));
        assert!(limiter.check_at("b", now));
        assert!(limiter.check_at(UNKNOWN_CLIENT, now));
        assert!(!limiter.check_at(UNKNOWN_CLIENT, now));
    }

    #[test]
    fn compaction_drops_only_idle_buckets() {
        let limiter = RateLimiter::new(MINUTE, 5);
        let start = Instant::now();

        limiter.check_at("idle", start);
        limiter.check_at("busy", start);
        limiter.check_at("busy", start + Duration::from_secs(50));
        assert_eq!(limiter.tracked_clients(), 2);

        assert_eq!(limiter.compact_at(start + Duration::from_secs(70)), 1);
        assert_eq!(limiter.tracked_clients(), 1);
        assert_eq!(limiter.compact_at(start + Duration::from_secs(200)), 1);
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn concurrent_checks_never_over_admit() {
        let limiter = Arc::new(RateLimiter::new(MINUTE, 10));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..5).filter(|_| limiter.check_at("shared", now)).count())
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }
}
