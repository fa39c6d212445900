//! # Rate Limiters
//!
//! Decide how long a failing key waits before it is handed out again.
//!
//! - [`ItemExponentialFailureRateLimiter`]: `base * 2^failures`, capped.
//! - [`ItemFibonacciRateLimiter`]: grows along the Fibonacci sequence, which
//!   climbs more slowly than exponential backoff.
//! - [`BucketRateLimiter`]: overall token bucket shared by every key.
//! - [`MaxOfRateLimiter`]: the worst case of several limiters.

use crate::queue::QueueKey;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Per-key retry delay policy.
pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `item` may be processed again. Records one more failure.
    fn when(&self, item: &K) -> Duration;

    /// Clears the failure history of `item`.
    fn forget(&self, item: &K);

    /// Number of failures recorded for `item` since it was last forgotten.
    fn num_requeues(&self, item: &K) -> u32;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exponential per-key backoff: `base * 2^failures`, capped at `max`.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> fmt::Debug for ItemExponentialFailureRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemExponentialFailureRateLimiter")
            .field("base", &self.base)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl<K: QueueKey> ItemExponentialFailureRateLimiter<K> {
    /// Creates a limiter starting at `base` and never exceeding `max`.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Delay for the `failures`-th consecutive failure (0-indexed).
    #[must_use]
    pub fn backoff_for(&self, failures: u32) -> Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

impl<K: QueueKey> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = self.backoff_for(*count);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

/// Fibonacci per-key backoff.
///
/// Sequence for `min = 1s`, `max = 10s`: 1s, 1s, 2s, 3s, 5s, 8s, 10s (max).
pub struct ItemFibonacciRateLimiter<K> {
    min: Duration,
    max: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K> fmt::Debug for ItemFibonacciRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemFibonacciRateLimiter")
            .field("min", &self.min)
            .field("max", &self.max)
            .finish_non_exhaustive()
    }
}

impl<K: QueueKey> ItemFibonacciRateLimiter<K> {
    /// Creates a limiter whose first two delays are `min`, capped at `max`.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Calculate the Fibonacci backoff for a given error count (stateless).
    ///
    /// The sequence starts at `min` for error counts 0 and 1, then follows
    /// min, min, 2*min, 3*min, 5*min, 8*min, ..., capped at `max`.
    #[must_use]
    pub fn backoff_for(error_count: u32, min: Duration, max: Duration) -> Duration {
        if error_count <= 1 {
            return min.min(max);
        }

        let mut prev = min;
        let mut current = min;
        for _ in 2..=error_count {
            let next = prev.saturating_add(current);
            prev = current;
            current = next.min(max);

            // Once capped the sequence stays at max
            if current >= max {
                break;
            }
        }

        current
    }
}

impl<K: QueueKey> RateLimiter<K> for ItemFibonacciRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(item.clone()).or_insert(0);
        let delay = Self::backoff_for(*count, self.min, self.max);
        *count = count.saturating_add(1);
        delay
    }

    fn forget(&self, item: &K) {
        lock(&self.failures).remove(item);
    }

    fn num_requeues(&self, item: &K) -> u32 {
        lock(&self.failures).get(item).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Overall token bucket: `qps` refill rate, up to `burst` tokens.
///
/// Each call to `when` reserves one token; once the bucket is empty callers
/// are spread out at `1 / qps` intervals. Keeps no per-key state.
#[derive(Debug)]
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    /// Creates a full bucket. A `qps` that is not positive is raised to the
    /// smallest positive rate.
    #[must_use]
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: qps.max(f64::MIN_POSITIVE),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _item: &K) -> Duration {
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            // Saturates when a near-zero rate puts the next token out of range
            Duration::try_from_secs_f64(-bucket.tokens / self.qps).unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _item: &K) {}

    fn num_requeues(&self, _item: &K) -> u32 {
        0
    }
}

/// Combines limiters by taking the longest delay and highest requeue count.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> fmt::Debug for MaxOfRateLimiter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaxOfRateLimiter")
            .field("limiters", &self.limiters.len())
            .finish()
    }
}

impl<K> MaxOfRateLimiter<K> {
    /// Creates a combined limiter.
    #[must_use]
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, item: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &K) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Default controller backoff: per-key exponential from 5ms to 1000s,
/// combined with an overall 10 qps bucket allowing bursts of 100.
#[must_use]
pub fn default_controller_rate_limiter<K: QueueKey>() -> MaxOfRateLimiter<K> {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}
