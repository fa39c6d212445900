//! Work queue with per-key retry backoff.

use crate::metrics::{NoopMetrics, QueueMetrics};
use crate::queue::{QueueKey, WorkQueue};
use crate::rate_limiter::RateLimiter;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// A [`WorkQueue`] whose retries are spaced out by a [`RateLimiter`].
///
/// Derefs to the underlying queue for `add`, `get`, `done` and `shut_down`.
pub struct RateLimitingQueue<K> {
    queue: WorkQueue<K>,
    limiter: Arc<dyn RateLimiter<K>>,
    metrics: Arc<dyn QueueMetrics>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            limiter: Arc::clone(&self.limiter),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<K> fmt::Debug for RateLimitingQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitingQueue")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl<K: QueueKey> RateLimitingQueue<K> {
    /// Creates a queue backed by `limiter`, without instrumentation.
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self::with_metrics(name, limiter, Arc::new(NoopMetrics))
    }

    /// Creates a queue backed by `limiter`, reporting to `metrics`.
    pub fn with_metrics(
        name: impl Into<String>,
        limiter: impl RateLimiter<K> + 'static,
        metrics: Arc<dyn QueueMetrics>,
    ) -> Self {
        Self {
            queue: WorkQueue::with_metrics(name, Arc::clone(&metrics)),
            limiter: Arc::new(limiter),
            metrics,
        }
    }

    /// Adds `item` after the delay the rate limiter assigns to it.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.limiter.when(&item);
        debug!(queue = %self.queue.name(), ?item, ?delay, "Requeueing with backoff");
        self.metrics.record_retry(self.queue.name());
        self.queue.add_after(item, delay);
    }

    /// Number of times `item` has been requeued through the rate limiter.
    pub fn num_requeues(&self, item: &K) -> u32 {
        self.limiter.num_requeues(item)
    }

    /// Clears the retry history of `item`. Does not remove it from the queue.
    pub fn forget(&self, item: &K) {
        self.limiter.forget(item);
    }

    /// The underlying work queue.
    pub fn queue(&self) -> &WorkQueue<K> {
        &self.queue
    }
}

impl<K> Deref for RateLimitingQueue<K> {
    type Target = WorkQueue<K>;

    fn deref(&self) -> &Self::Target {
        &self.queue
    }
}
