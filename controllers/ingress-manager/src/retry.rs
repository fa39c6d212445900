//! Retry policy for failed reconciles.

use crate::error::ControllerError;
use tracing::{error, warn};
use workqueue::RateLimitingQueue;

/// What happened to a key after a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Sync succeeded; backoff history cleared
    Succeeded,
    /// Sync failed and the key was requeued with backoff
    Requeued,
    /// Sync failed for good; the key waits for a new event
    Dropped,
}

/// Decides between requeue and give-up after each sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl RetryPolicy {
    /// Creates a policy allowing `max_retries` requeues per failure streak.
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Retry ceiling.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Feeds the outcome of `sync(key)` back into `queue`.
    ///
    /// Does not call `done`; the worker owns that.
    pub fn handle<T>(
        &self,
        queue: &RateLimitingQueue<String>,
        key: &str,
        result: &Result<T, ControllerError>,
    ) -> RetryOutcome {
        let key = key.to_string();
        let err = match result {
            Ok(_) => {
                queue.forget(&key);
                return RetryOutcome::Succeeded;
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            error!("Dropping {} from the queue: {}", key, err);
            queue.forget(&key);
            return RetryOutcome::Dropped;
        }

        let requeues = queue.num_requeues(&key);
        // Strict: `max_retries` retries after the first attempt, never one more
        if requeues < self.max_retries {
            warn!(
                "Error syncing {} (attempt {}/{}): {}",
                key,
                requeues + 1,
                self.max_retries,
                err
            );
            queue.add_rate_limited(key);
            return RetryOutcome::Requeued;
        }

        error!(
            "Dropping {} out of the queue after {} retries: {}",
            key, requeues, err
        );
        queue.forget(&key);
        RetryOutcome::Dropped
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_RETRIES)
    }
}
