//! Prometheus metrics for the queue and the reconcile loop.

use crate::error::ControllerError;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};
use std::time::Duration;
use workqueue::QueueMetrics;

/// Controller metrics, registered once and shared by clone.
#[derive(Debug, Clone)]
pub struct Metrics {
    queue_adds: IntCounter,
    queue_depth: IntGauge,
    queue_retries: IntCounter,
    reconcile_total: IntCounterVec,
    reconcile_duration: Histogram,
}

impl Metrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &Registry) -> Result<Self, ControllerError> {
        let queue_adds = IntCounter::new(
            "ingress_manager_queue_adds_total",
            "Keys added to the work queue",
        )?;
        let queue_depth = IntGauge::new(
            "ingress_manager_queue_depth",
            "Keys waiting in the work queue",
        )?;
        let queue_retries = IntCounter::new(
            "ingress_manager_queue_retries_total",
            "Keys requeued with backoff",
        )?;
        let reconcile_total = IntCounterVec::new(
            Opts::new(
                "ingress_manager_reconcile_total",
                "Sync passes by result",
            ),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ingress_manager_reconcile_duration_seconds",
                "Time spent in one sync pass",
            )
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 30.0]),
        )?;

        registry.register(Box::new(queue_adds.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(queue_retries.clone()))?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            queue_adds,
            queue_depth,
            queue_retries,
            reconcile_total,
            reconcile_duration,
        })
    }

    /// Records one sync pass. `result` is a short label such as `create`,
    /// `delete`, `noop` or `error`.
    pub fn observe_reconcile(&self, result: &str, elapsed: Duration) {
        self.reconcile_total.with_label_values(&[result]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }
}

impl QueueMetrics for Metrics {
    fn record_add(&self, _queue: &str) {
        self.queue_adds.inc();
    }

    fn record_depth(&self, _queue: &str, depth: usize) {
        self.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }

    fn record_retry(&self, _queue: &str) {
        self.queue_retries.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use workqueue::{ItemExponentialFailureRateLimiter, RateLimitingQueue};

    #[test]
    fn test_registering_twice_fails() {
        let registry = Registry::new();
        Metrics::new(&registry).unwrap();
        assert!(matches!(
            Metrics::new(&registry),
            Err(ControllerError::Server(_))
        ));
    }

    #[test]
    fn test_observe_reconcile_counts_by_result() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();

        metrics.observe_reconcile("create", Duration::from_millis(20));
        metrics.observe_reconcile("create", Duration::from_millis(40));
        metrics.observe_reconcile("error", Duration::from_millis(10));

        assert_eq!(
            metrics.reconcile_total.with_label_values(&["create"]).get(),
            2
        );
        assert_eq!(metrics.reconcile_total.with_label_values(&["error"]).get(), 1);
        assert_eq!(metrics.reconcile_duration.get_sample_count(), 3);
    }

    #[tokio::test]
    async fn test_queue_reports_through_metrics() {
        let registry = Registry::new();
        let metrics = Metrics::new(&registry).unwrap();
        let queue = RateLimitingQueue::with_metrics(
            "test",
            ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(1),
                Duration::from_millis(10),
            ),
            Arc::new(metrics.clone()),
        );

        queue.add("ns/a".to_string());
        queue.add("ns/a".to_string());
        queue.add("ns/b".to_string());
        queue.add_rate_limited("ns/c".to_string());

        assert_eq!(metrics.queue_adds.get(), 2);
        assert_eq!(metrics.queue_depth.get(), 2);
        assert_eq!(metrics.queue_retries.get(), 1);
    }
}
