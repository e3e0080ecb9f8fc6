//! Per-item retry delays for the pod work queues.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::time::Instant;

use crate::cache::ObjectKey;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
pub const DEFAULT_QPS: f64 = 10.0;
pub const DEFAULT_BURST: u32 = 100;

pub trait RateLimiter: Send + Sync {
    /// Delay before `key` may be processed again. Counts as one retry.
    fn when(&self, key: &ObjectKey) -> Duration;

    /// Clears the retry history of `key`.
    fn forget(&self, key: &ObjectKey);

    fn num_requeues(&self, key: &ObjectKey) -> u32;
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `max`.
#[derive(Debug)]
pub struct ItemExponentialFailureRateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        let mut failures = locked(&self.failures);
        let count = failures.entry(key.clone()).or_insert(0);
        let exponent = *count;
        *count = count.saturating_add(1);

        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    fn forget(&self, key: &ObjectKey) {
        locked(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        locked(&self.failures).get(key).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Overall token bucket shared by all items.
///
/// Each call reserves a token; when the bucket is empty the returned delay is
/// the time until the reserved token is refilled.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _key: &ObjectKey) -> Duration {
        let mut bucket = locked(&self.bucket);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last_refill = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &ObjectKey) {}

    fn num_requeues(&self, _key: &ObjectKey) -> u32 {
        0
    }
}

/// Longest delay of its members.
pub struct MaxOfRateLimiter {
    limiters: Vec<Arc<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Arc<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, key: &ObjectKey) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or_default()
    }

    fn forget(&self, key: &ObjectKey) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn num_requeues(&self, key: &ObjectKey) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

/// Parameters for one queue's limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub qps: f64,
    pub burst: u32,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            qps: DEFAULT_QPS,
            burst: DEFAULT_BURST,
        }
    }
}

impl RateLimiterConfig {
    /// Per-item exponential backoff combined with an overall token bucket.
    pub fn build(&self) -> Arc<dyn RateLimiter> {
        Arc::new(MaxOfRateLimiter::new(vec![
            Arc::new(ItemExponentialFailureRateLimiter::new(
                self.base_delay,
                self.max_delay,
            )),
            Arc::new(BucketRateLimiter::new(self.qps, self.burst)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let limiter =
            ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_millis(30));
        let key = ObjectKey::new("default", "web");

        let delays: Vec<_> = (0..5).map(|_| limiter.when(&key)).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(5),
                Duration::from_millis(10),
                Duration::from_millis(20),
                Duration::from_millis(30),
                Duration::from_millis(30),
            ]
        );
        assert_eq!(limiter.num_requeues(&key), 5);

        limiter.forget(&key);
        assert_eq!(limiter.num_requeues(&key), 0);
        assert_eq!(limiter.when(&key), Duration::from_millis(5));
    }

    #[test]
    fn exponential_backoff_survives_huge_failure_counts() {
        let limiter = ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), DEFAULT_MAX_DELAY);
        let key = ObjectKey::new("default", "web");
        let last = (0..100).map(|_| limiter.when(&key)).last().unwrap();
        assert_eq!(last, DEFAULT_MAX_DELAY);
    }

    #[test(tokio::test(start_paused = true))]
    async fn bucket_delays_once_burst_is_spent() {
        let limiter = BucketRateLimiter::new(10.0, 2);
        let key = ObjectKey::new("default", "web");

        assert_eq!(limiter.when(&key), Duration::ZERO);
        assert_eq!(limiter.when(&key), Duration::ZERO);
        assert_eq!(limiter.when(&key), Duration::from_millis(100));
        assert_eq!(limiter.when(&key), Duration::from_millis(200));
    }

    #[test]
    fn max_of_takes_the_longest_delay() {
        let limiter = RateLimiterConfig {
            base_delay: Duration::from_millis(50),
            ..Default::default()
        }
        .build();
        let key = ObjectKey::new("default", "web");
        assert_eq!(limiter.when(&key), Duration::from_millis(50));
        assert_eq!(limiter.when(&key), Duration::from_millis(100));
        assert_eq!(limiter.num_requeues(&key), 2);
    }
}
