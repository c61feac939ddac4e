//! Token-bucket rate limiting for control operations.
//!
//! Buckets are keyed by `(key, operation)` where the key is a session-id,
//! or a device-id for pre-session auth attempts. Buckets are created lazily
//! with a full complement of tokens and refilled proportionally to elapsed
//! time.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

/// Operations with independent buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Touch,
    Key,
    Macro,
    Ai,
    System,
    AppControl,
    /// Pre-session, keyed by device-id rather than session-id.
    Auth,
    /// WebSocket upgrades, keyed by remote IP.
    Connect,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Touch => "touch",
            Self::Key => "key",
            Self::Macro => "macro",
            Self::Ai => "ai",
            Self::System => "system",
            Self::AppControl => "app_control",
            Self::Auth => "auth",
            Self::Connect => "connect",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity and refill rate for one operation's buckets.
#[derive(Debug, Clone, Copy)]
pub struct LimitSettings {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

/// Per-operation limits.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub touch: LimitSettings,
    pub key: LimitSettings,
    pub macro_run: LimitSettings,
    pub ai: LimitSettings,
    pub system: LimitSettings,
    pub app_control: LimitSettings,
    pub auth: LimitSettings,
    pub connect: LimitSettings,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            touch: LimitSettings { capacity: 100.0, refill_per_sec: 100.0 },
            key: LimitSettings { capacity: 10.0, refill_per_sec: 10.0 },
            macro_run: LimitSettings { capacity: 1.0, refill_per_sec: 1.0 },
            ai: LimitSettings { capacity: 2.0, refill_per_sec: 2.0 },
            system: LimitSettings { capacity: 20.0, refill_per_sec: 20.0 },
            app_control: LimitSettings { capacity: 5.0, refill_per_sec: 5.0 },
            // 5 attempts, recovering over a minute.
            auth: LimitSettings { capacity: 5.0, refill_per_sec: 5.0 / 60.0 },
            connect: LimitSettings { capacity: 60.0, refill_per_sec: 30.0 },
        }
    }
}

impl RateLimitConfig {
    fn settings(&self, op: Operation) -> LimitSettings {
        match op {
            Operation::Touch => self.touch,
            Operation::Key => self.key,
            Operation::Macro => self.macro_run,
            Operation::Ai => self.ai,
            Operation::System => self.system,
            Operation::AppControl => self.app_control,
            Operation::Auth => self.auth,
            Operation::Connect => self.connect,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token-bucket rate limiter over `(key, operation)` pairs.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: Mutex<HashMap<(String, Operation), Bucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token. Returns `false` when the bucket is dry.
    pub fn allow(&self, key: &str, op: Operation) -> bool {
        let settings = self.config.settings(op);
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((key.to_string(), op))
            .or_insert_with(|| Bucket {
                tokens: settings.capacity,
                last_refill: now,
            });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * settings.refill_per_sec).min(settings.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Drop every bucket for a key, e.g. on session close.
    pub fn reset(&self, key: &str) {
        self.buckets.lock().retain(|(k, _), _| k != key);
    }

    /// Number of live buckets, for metrics.
    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter_with(op_settings: LimitSettings) -> RateLimiter {
        let mut config = RateLimitConfig::default();
        config.touch = op_settings;
        RateLimiter::new(config)
    }

    #[test]
    fn test_burst_up_to_capacity_then_denied() {
        let limiter = limiter_with(LimitSettings { capacity: 3.0, refill_per_sec: 0.0 });
        assert!(limiter.allow("s1", Operation::Touch));
        assert!(limiter.allow("s1", Operation::Touch));
        assert!(limiter.allow("s1", Operation::Touch));
        assert!(!limiter.allow("s1", Operation::Touch));
    }

    #[test]
    fn test_default_touch_burst() {
        // 101 taps inside the burst window: exactly 100 pass.
        let limiter = RateLimiter::default();
        let allowed = (0..101)
            .filter(|_| limiter.allow("s1", Operation::Touch))
            .count();
        assert_eq!(allowed, 100);
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = limiter_with(LimitSettings { capacity: 1.0, refill_per_sec: 20.0 });
        assert!(limiter.allow("s1", Operation::Touch));
        assert!(!limiter.allow("s1", Operation::Touch));

        std::thread::sleep(Duration::from_millis(100));
        assert!(limiter.allow("s1", Operation::Touch));
    }

    #[test]
    fn test_keys_and_operations_are_independent() {
        let limiter = limiter_with(LimitSettings { capacity: 1.0, refill_per_sec: 0.0 });
        assert!(limiter.allow("s1", Operation::Touch));
        assert!(!limiter.allow("s1", Operation::Touch));

        // Other sessions and other operations are untouched.
        assert!(limiter.allow("s2", Operation::Touch));
        assert!(limiter.allow("s1", Operation::Key));
    }

    #[test]
    fn test_reset_drops_all_buckets_for_key() {
        let limiter = limiter_with(LimitSettings { capacity: 1.0, refill_per_sec: 0.0 });
        assert!(limiter.allow("s1", Operation::Touch));
        assert!(!limiter.allow("s1", Operation::Touch));

        limiter.reset("s1");
        assert!(limiter.allow("s1", Operation::Touch));
    }

    #[test]
    fn test_auth_limit_shape() {
        let limiter = RateLimiter::default();
        for _ in 0..5 {
            assert!(limiter.allow("d1", Operation::Auth));
        }
        assert!(!limiter.allow("d1", Operation::Auth));
    }

    #[test]
    fn prop_allow_count_bounded_by_capacity_plus_refill() {
        use proptest::prelude::*;

        proptest!(|(
            capacity in 1.0f64..50.0,
            refill in 0.0f64..100.0,
            attempts in 1usize..500,
        )| {
            let limiter = limiter_with(LimitSettings {
                capacity,
                refill_per_sec: refill,
            });
            let start = Instant::now();
            let allowed = (0..attempts)
                .filter(|_| limiter.allow("k", Operation::Touch))
                .count() as f64;
            let elapsed = start.elapsed().as_secs_f64();

            // In any window of length T, successes <= C + R*T (plus one
            // token of slack for boundary arithmetic).
            prop_assert!(allowed <= capacity + refill * elapsed + 1.0);
        });
    }
}
