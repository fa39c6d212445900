//! Queue instrumentation hooks.
//!
//! The queue does not depend on a metrics backend. Controllers plug their
//! own recorder in at construction time.

/// Observer for queue activity.
///
/// All methods default to no-ops so implementors only override what they
/// export.
pub trait QueueMetrics: Send + Sync {
    /// A new key entered the queue (coalesced adds are not counted).
    fn record_add(&self, _queue: &str) {}

    /// Current number of keys waiting to be handed out.
    fn record_depth(&self, _queue: &str, _depth: usize) {}

    /// A key was re-added through the rate limiter.
    fn record_retry(&self, _queue: &str) {}
}

/// Recorder that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl QueueMetrics for NoopMetrics {}
