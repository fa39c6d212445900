//! Deduplicating delaying work queue.
//!
//! `WorkQueue` keeps three pieces of bookkeeping behind one mutex:
//! the FIFO of keys ready to be handed out, the *dirty* set of keys that
//! need processing, and the *processing* set of keys currently held by a
//! worker. A key is in the FIFO only if it is dirty and not processing.
//!
//! Delayed adds are parked in a `DelayQueue` owned by a background task
//! (the waiting loop) and moved into the FIFO once their ready time passes.

use crate::metrics::{NoopMetrics, QueueMetrics};
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, trace};

/// Bounds every queue key must satisfy.
pub trait QueueKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Longest delay accepted by [`WorkQueue::add_after`]. Longer delays are
/// clamped since `DelayQueue` rejects deadlines roughly two years out.
pub const MAX_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    delayed_tx: mpsc::UnboundedSender<(K, Duration)>,
    shutdown: CancellationToken,
    metrics: Arc<dyn QueueMetrics>,
}

impl<K: QueueKey> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn add(&self, item: K) {
        let mut state = self.lock();
        if state.shutting_down {
            trace!(queue = %self.name, ?item, "Ignoring add after shutdown");
            return;
        }
        if !state.dirty.insert(item.clone()) {
            trace!(queue = %self.name, ?item, "Key already pending, coalesced");
            return;
        }
        self.metrics.record_add(&self.name);

        // Redelivered from `done` once the current holder releases it
        if state.processing.contains(&item) {
            return;
        }

        state.queue.push_back(item);
        let depth = state.queue.len();
        drop(state);

        self.metrics.record_depth(&self.name, depth);
        self.notify.notify_one();
    }
}

/// A deduplicating work queue with in-flight tracking and delayed adds.
///
/// Cloning is cheap; every clone refers to the same queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl<K: QueueKey> WorkQueue<K> {
    /// Creates a new queue without instrumentation.
    ///
    /// Must be called from within a Tokio runtime: the waiting loop for
    /// delayed adds is spawned here.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_metrics(name, Arc::new(NoopMetrics))
    }

    /// Creates a new queue reporting to `metrics`.
    pub fn with_metrics(name: impl Into<String>, metrics: Arc<dyn QueueMetrics>) -> Self {
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let inner = Arc::new(Inner {
            name: name.into(),
            state: Mutex::new(State {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            delayed_tx,
            shutdown: shutdown.clone(),
            metrics,
        });

        tokio::spawn(waiting_loop(Arc::downgrade(&inner), delayed_rx, shutdown));

        Self { inner }
    }

    /// Name used in logs and metrics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Marks `item` as needing processing.
    ///
    /// No-op if the key is already queued. If a worker currently holds the
    /// key, it is queued again once that worker calls [`WorkQueue::done`].
    pub fn add(&self, item: K) {
        self.inner.add(item);
    }

    /// Adds `item` once `delay` has elapsed.
    ///
    /// A zero delay is an immediate add. If the key is already waiting, the
    /// earlier ready time is kept. Delays above [`MAX_DELAY`] are clamped.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        if delay > MAX_DELAY {
            debug!(queue = %self.inner.name, ?item, ?delay, "Clamping delayed add");
        }
        let delay = delay.min(MAX_DELAY);
        if self.inner.delayed_tx.send((item, delay)).is_err() {
            debug!(queue = %self.inner.name, "Waiting loop stopped, dropping delayed add");
        }
    }

    /// Waits for the next key to process.
    ///
    /// The returned key is marked as processing until [`WorkQueue::done`] is
    /// called for it. Returns `None` once the queue is shut down and every
    /// key queued before the shutdown has been handed out.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            {
                let mut state = self.inner.lock();
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    let depth = state.queue.len();
                    drop(state);

                    self.inner.metrics.record_depth(&self.inner.name, depth);
                    return Some(item);
                }
                if state.shutting_down {
                    return None;
                }
                // Register before releasing the lock so a concurrent add or
                // shutdown cannot slip between the check and the wait.
                notified.as_mut().enable();
            }

            notified.await;
        }
    }

    /// Releases `item` after processing.
    ///
    /// Must be called for every key returned by [`WorkQueue::get`], whether
    /// processing succeeded or not.
    pub fn done(&self, item: &K) {
        let mut state = self.inner.lock();
        state.processing.remove(item);
        if !state.dirty.contains(item) {
            return;
        }

        state.queue.push_back(item.clone());
        let depth = state.queue.len();
        drop(state);

        self.inner.metrics.record_depth(&self.inner.name, depth);
        self.inner.notify.notify_one();
    }

    /// Number of keys ready to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Whether no key is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops accepting new keys and wakes every waiting worker.
    ///
    /// Keys already queued are still handed out; pending delayed adds are
    /// discarded.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
        debug!(queue = %self.inner.name, "Work queue shut down");
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }
}

async fn waiting_loop<K: QueueKey>(
    queue: Weak<Inner<K>>,
    mut requests: mpsc::UnboundedReceiver<(K, Duration)>,
    shutdown: CancellationToken,
) {
    let mut waiting: DelayQueue<K> = DelayQueue::new();
    let mut ready_at: HashMap<K, (delay_queue::Key, Instant)> = HashMap::new();

    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            request = requests.recv() => {
                let Some((item, delay)) = request else { break };
                let at = Instant::now() + delay.min(MAX_DELAY);
                match ready_at.get_mut(&item) {
                    Some((slot, current)) => {
                        if at < *current {
                            waiting.reset_at(slot, at);
                            *current = at;
                        }
                    }
                    None => {
                        let slot = waiting.insert_at(item.clone(), at);
                        ready_at.insert(item, (slot, at));
                    }
                }
            }
            Some(expired) = waiting.next() => {
                let item = expired.into_inner();
                ready_at.remove(&item);
                let Some(inner) = queue.upgrade() else { break };
                inner.add(item);
            }
        }
    }
}
