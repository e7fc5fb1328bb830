//! Rate limiting primitives for auth flows.
//!
//! Two in-memory bucket flavors are used: a refilling token bucket for
//! burst-style limits (signup, login, sends) and an expiring-window bucket
//! where all counters for a key lapse a fixed interval after first use
//! (verification codes, TOTP, recovery). Check and consume run under one
//! mutex so concurrent requests for the same key cannot interleave between
//! the probe and the charge.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use uuid::Uuid;

struct RefillEntry {
    tokens: u32,
    refilled_at: Instant,
}

/// Token bucket refilled one token per `refill_interval`, capped at `max`.
pub struct RefillBucket<K> {
    max: u32,
    refill_interval: Duration,
    entries: Mutex<HashMap<K, RefillEntry>>,
}

impl<K: Eq + Hash + Clone> RefillBucket<K> {
    #[must_use]
    pub fn new(max: u32, refill_interval: Duration) -> Self {
        Self {
            max,
            refill_interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn available(&self, entry: &RefillEntry) -> u32 {
        let interval = self.refill_interval.as_millis().max(1);
        let elapsed = entry.refilled_at.elapsed().as_millis();
        let refilled = u32::try_from(elapsed / interval).unwrap_or(u32::MAX);
        entry.tokens.saturating_add(refilled).min(self.max)
    }

    /// Non-mutating probe: would `consume(key, cost)` succeed right now?
    pub fn check(&self, key: &K, cost: u32) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(key) {
            Some(entry) => self.available(entry) >= cost,
            None => cost <= self.max,
        }
    }

    /// Charge `cost` tokens; fails closed when the bucket is short.
    pub fn consume(&self, key: &K, cost: u32) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let now = Instant::now();
        let entry = entries.entry(key.clone()).or_insert(RefillEntry {
            tokens: self.max,
            refilled_at: now,
        });
        let available = {
            let interval = self.refill_interval.as_millis().max(1);
            let elapsed = now.duration_since(entry.refilled_at).as_millis();
            let refilled = u32::try_from(elapsed / interval).unwrap_or(u32::MAX);
            entry.tokens.saturating_add(refilled).min(self.max)
        };
        if available < cost {
            return false;
        }
        entry.tokens = available - cost;
        entry.refilled_at = now;
        true
    }

    pub fn reset(&self, key: &K) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

struct ExpiringEntry {
    remaining: u32,
    expires_at: Instant,
}

/// Fixed-window bucket: counters for a key lapse `window` after first use,
/// independent of how many tokens were consumed.
pub struct ExpiringBucket<K> {
    max: u32,
    window: Duration,
    entries: Mutex<HashMap<K, ExpiringEntry>>,
}

impl<K: Eq + Hash + Clone> ExpiringBucket<K> {
    #[must_use]
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Non-mutating probe: would `consume(key, cost)` succeed right now?
    pub fn check(&self, key: &K, cost: u32) -> bool {
        let Ok(entries) = self.entries.lock() else {
            return false;
        };
        match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => entry.remaining >= cost,
            _ => cost <= self.max,
        }
    }

    /// Charge `cost` tokens within the current window; fails closed.
    pub fn consume(&self, key: &K, cost: u32) -> bool {
        if cost > self.max {
            return false;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let now = Instant::now();
        let entry = entries.entry(key.clone()).or_insert(ExpiringEntry {
            remaining: self.max,
            expires_at: now + self.window,
        });
        if entry.expires_at <= now {
            // The window lapsed; start a fresh one.
            entry.remaining = self.max;
            entry.expires_at = now + self.window;
        }
        if entry.remaining < cost {
            return false;
        }
        entry.remaining -= cost;
        true
    }

    pub fn reset(&self, key: &K) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

/// Per-action buckets shared across handlers.
///
/// Handlers call `check` before doing expensive work and `consume`
/// immediately before the effectful step, so failed validation is never
/// charged against the caller.
pub struct RateLimits {
    pub signup_ip: RefillBucket<String>,
    pub login_ip: RefillBucket<String>,
    pub login_email: ExpiringBucket<String>,
    pub send_verification_user: RefillBucket<Uuid>,
    pub verify_email_user: ExpiringBucket<Uuid>,
    pub forgot_ip: RefillBucket<String>,
    pub forgot_email: ExpiringBucket<String>,
    pub totp_user: ExpiringBucket<Uuid>,
    pub recovery_user: ExpiringBucket<Uuid>,
}

impl RateLimits {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signup_ip: RefillBucket::new(3, Duration::from_secs(10)),
            login_ip: RefillBucket::new(10, Duration::from_secs(2)),
            login_email: ExpiringBucket::new(5, Duration::from_secs(15 * 60)),
            send_verification_user: RefillBucket::new(3, Duration::from_secs(60)),
            verify_email_user: ExpiringBucket::new(5, Duration::from_secs(30 * 60)),
            forgot_ip: RefillBucket::new(3, Duration::from_secs(60)),
            forgot_email: ExpiringBucket::new(3, Duration::from_secs(30 * 60)),
            totp_user: ExpiringBucket::new(5, Duration::from_secs(30 * 60)),
            recovery_user: ExpiringBucket::new(3, Duration::from_secs(60 * 60)),
        }
    }

    /// Effectively-unbounded buckets for handler tests.
    #[must_use]
    pub fn unlimited() -> Self {
        let wide = Duration::from_millis(1);
        Self {
            signup_ip: RefillBucket::new(u32::MAX, wide),
            login_ip: RefillBucket::new(u32::MAX, wide),
            login_email: ExpiringBucket::new(u32::MAX, wide),
            send_verification_user: RefillBucket::new(u32::MAX, wide),
            verify_email_user: ExpiringBucket::new(u32::MAX, wide),
            forgot_ip: RefillBucket::new(u32::MAX, wide),
            forgot_email: ExpiringBucket::new(u32::MAX, wide),
            totp_user: ExpiringBucket::new(u32::MAX, wide),
            recovery_user: ExpiringBucket::new(u32::MAX, wide),
        }
    }
}

impl Default for RateLimits {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn refill_bucket_denies_when_empty_and_refills() {
        let bucket = RefillBucket::new(2, Duration::from_millis(50));
        let key = "10.0.0.1".to_string();

        assert!(bucket.check(&key, 1));
        assert!(bucket.consume(&key, 1));
        assert!(bucket.consume(&key, 1));
        assert!(!bucket.check(&key, 1));
        assert!(!bucket.consume(&key, 1));

        sleep(Duration::from_millis(60));
        assert!(bucket.check(&key, 1));
        assert!(bucket.consume(&key, 1));
    }

    #[test]
    fn refill_bucket_check_does_not_charge() {
        let bucket = RefillBucket::new(1, Duration::from_secs(3600));
        let key = "10.0.0.2".to_string();
        for _ in 0..10 {
            assert!(bucket.check(&key, 1));
        }
        assert!(bucket.consume(&key, 1));
        assert!(!bucket.consume(&key, 1));
    }

    #[test]
    fn refill_bucket_reset_restores_capacity() {
        let bucket = RefillBucket::new(1, Duration::from_secs(3600));
        let key = "10.0.0.3".to_string();
        assert!(bucket.consume(&key, 1));
        assert!(!bucket.consume(&key, 1));
        bucket.reset(&key);
        assert!(bucket.consume(&key, 1));
    }

    #[test]
    fn expiring_bucket_rejects_sixth_within_window() {
        // Capacity five: the sixth consume inside the window must fail.
        let bucket = ExpiringBucket::new(5, Duration::from_secs(30 * 60));
        let key = Uuid::new_v4();
        for _ in 0..5 {
            assert!(bucket.consume(&key, 1));
        }
        assert!(!bucket.consume(&key, 1));
        assert!(!bucket.check(&key, 1));
    }

    #[test]
    fn expiring_bucket_accepts_again_after_window() {
        let bucket = ExpiringBucket::new(2, Duration::from_millis(40));
        let key = Uuid::new_v4();
        assert!(bucket.consume(&key, 1));
        assert!(bucket.consume(&key, 1));
        assert!(!bucket.consume(&key, 1));

        sleep(Duration::from_millis(50));
        assert!(bucket.check(&key, 1));
        assert!(bucket.consume(&key, 1));
    }

    #[test]
    fn expiring_bucket_window_lapses_independent_of_consumption() {
        let bucket = ExpiringBucket::new(5, Duration::from_millis(40));
        let key = Uuid::new_v4();
        // Touch once, then let the window lapse without draining it.
        assert!(bucket.consume(&key, 1));
        sleep(Duration::from_millis(50));
        for _ in 0..5 {
            assert!(bucket.consume(&key, 1));
        }
        assert!(!bucket.consume(&key, 1));
    }

    #[test]
    fn expiring_bucket_cost_above_capacity_fails_closed() {
        let bucket = ExpiringBucket::new(3, Duration::from_secs(60));
        let key = Uuid::new_v4();
        assert!(!bucket.consume(&key, 4));
        assert!(bucket.consume(&key, 3));
    }
}
