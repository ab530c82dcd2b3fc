//! Token-bucket admission for public requests.
//!
//! Two independent limiter maps guard the public handler: one keyed by
//! client IP, one keyed by tunnel key. Each bucket refills at `rate`
//! tokens/sec with a burst capacity of `2 * rate`; a rate of 0 disables the
//! limiter entirely. Buckets are created lazily on first observation and
//! never evicted — eviction could only manufacture spurious refusals.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

/// One lazily-created limiter map. Admission is `allow()`: take a token or
/// refuse.
pub struct AdmissionLimiter {
    /// Tokens per second; 0 means unlimited.
    rate: u32,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl AdmissionLimiter {
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Admit one request for `key`, consuming a token if one is available.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    fn allow_at(&self, key: &str, now: Instant) -> bool {
        if self.rate == 0 {
            return true;
        }
        let burst = f64::from(self.rate) * 2.0;
        let mut buckets = self.buckets.lock().expect("limiter lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: burst,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * f64::from(self.rate)).min(burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_zero_rate_is_unlimited() {
        let limiter = AdmissionLimiter::new(0);
        for _ in 0..1000 {
            assert!(limiter.allow("10.0.0.1"));
        }
    }

    #[test]
    fn test_burst_is_twice_the_rate() {
        let limiter = AdmissionLimiter::new(3);
        let now = Instant::now();
        for _ in 0..6 {
            assert!(limiter.allow_at("k", now));
        }
        assert!(!limiter.allow_at("k", now));
    }

    #[test]
    fn test_tokens_refill_over_time() {
        let limiter = AdmissionLimiter::new(1);
        let start = Instant::now();
        assert!(limiter.allow_at("k", start));
        assert!(limiter.allow_at("k", start));
        assert!(!limiter.allow_at("k", start));

        // One second later a single token is back.
        let later = start + Duration::from_secs(1);
        assert!(limiter.allow_at("k", later));
        assert!(!limiter.allow_at("k", later));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = AdmissionLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.allow_at("a", now));
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }
}
