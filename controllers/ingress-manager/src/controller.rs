//! Main controller implementation.
//!
//! This module contains the `Controller` struct that drains the work queue
//! with a fixed pool of workers. Each worker takes one key at a time, runs
//! the reconciler on it, and hands the result to the retry policy.
//!
//! Keys are never processed by two workers at once; the queue guarantees
//! that. Shutdown lets in-flight syncs finish and drains keys that were
//! already queued.

use crate::cache::Lister;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::{Decision, Reconciler};
use crate::retry::RetryPolicy;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use workqueue::RateLimitingQueue;

/// State shared by every worker.
struct Worker {
    reconciler: Arc<Reconciler>,
    queue: RateLimitingQueue<String>,
    retry: RetryPolicy,
    metrics: Option<Metrics>,
}

impl Worker {
    async fn run(self: Arc<Self>, id: usize) {
        debug!("Worker {} started", id);
        while self.process_next_item().await {}
        debug!("Worker {} stopped", id);
    }

    /// Handles one key. Returns `false` once the queue has shut down.
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let started = Instant::now();
        let result = self.reconciler.sync(&key).await;
        if let Some(metrics) = &self.metrics {
            metrics.observe_reconcile(result_label(&result), started.elapsed());
        }

        self.retry.handle(&self.queue, &key, &result);
        self.queue.done(&key);
        true
    }
}

fn result_label(result: &Result<Decision, ControllerError>) -> &'static str {
    match result {
        Ok(Decision::Create) => "create",
        Ok(Decision::Delete) => "delete",
        Ok(Decision::Noop) => "noop",
        Err(_) => "error",
    }
}

/// Worker pool over the shared work queue.
pub struct Controller {
    reconciler: Arc<Reconciler>,
    queue: RateLimitingQueue<String>,
    retry: RetryPolicy,
    workers: usize,
    services: Arc<dyn Lister<Service>>,
    ingresses: Arc<dyn Lister<Ingress>>,
    metrics: Option<Metrics>,
    ready: Arc<AtomicBool>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("queue", &self.queue)
            .field("retry", &self.retry)
            .field("workers", &self.workers)
            .field("ready", &self.ready.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a new controller instance.
    ///
    /// `services` and `ingresses` are only used to wait for the initial
    /// cache sync; the reconciler reads through its own handles.
    pub fn new(
        reconciler: Arc<Reconciler>,
        queue: RateLimitingQueue<String>,
        retry: RetryPolicy,
        workers: usize,
        services: Arc<dyn Lister<Service>>,
        ingresses: Arc<dyn Lister<Ingress>>,
    ) -> Self {
        Self {
            reconciler,
            queue,
            retry,
            workers,
            services,
            ingresses,
            metrics: None,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Records reconcile results in `metrics`.
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Shares the readiness flag with the probe server.
    pub fn with_ready_flag(mut self, ready: Arc<AtomicBool>) -> Self {
        self.ready = ready;
        self
    }

    /// Runs the controller until `shutdown` fires.
    ///
    /// Waits for both caches to sync, starts the workers, then blocks. On
    /// shutdown the queue is closed and every worker is joined before
    /// returning.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let queue = self.queue.clone();
        info!("Waiting for informer caches to sync");

        let synced = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested before caches synced");
                queue.shut_down();
                return Ok(());
            }
            synced = self.wait_for_caches() => synced,
        };
        if let Err(e) = synced {
            queue.shut_down();
            return Err(e);
        }

        info!("Caches synced, starting {} workers", self.workers);
        let worker = Arc::new(Worker {
            reconciler: Arc::clone(&self.reconciler),
            queue: queue.clone(),
            retry: self.retry,
            metrics: self.metrics.clone(),
        });
        let handles: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|id| tokio::spawn(Arc::clone(&worker).run(id)))
            .collect();
        self.ready.store(true, Ordering::SeqCst);

        shutdown.cancelled().await;
        info!("Shutting down workers");
        self.ready.store(false, Ordering::SeqCst);
        queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker panicked: {}", e);
            }
        }
        info!("All workers stopped");
        Ok(())
    }

    async fn wait_for_caches(&self) -> Result<(), ControllerError> {
        self.services.wait_for_sync().await?;
        self.ingresses.wait_for_sync().await
    }
}
