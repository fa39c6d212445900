//! Controller Work Queue
//!
//! A deduplicating, rate-limited work queue for level-triggered controllers.
//! Events about the same object collapse into one queue entry, and a key is
//! never handed to two workers at the same time.
//!
//! # Example
//!
//! ```no_run
//! use workqueue::{RateLimitingQueue, default_controller_rate_limiter};
//!
//! # async fn example() {
//! let queue = RateLimitingQueue::new("services", default_controller_rate_limiter());
//!
//! queue.add("default/web".to_string());
//! while let Some(key) = queue.get().await {
//!     // reconcile `key` ...
//!     queue.forget(&key);
//!     queue.done(&key);
//! }
//! # }
//! ```
//!
//! # Semantics
//!
//! - **Coalescing**: `add` is a no-op while the key is already queued.
//! - **At most one in flight**: a key added while a worker holds it is
//!   redelivered only after `done`.
//! - **Delayed adds**: `add_after` parks the key until its ready time; the
//!   earliest ready time wins.
//! - **Shutdown**: queued keys are still drained, then `get` returns `None`.

pub mod metrics;
pub mod queue;
pub mod rate_limiter;
pub mod rate_limiting_queue;

pub use metrics::*;
pub use queue::*;
pub use rate_limiter::*;
pub use rate_limiting_queue::*;
