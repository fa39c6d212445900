//! Ingress Manager Controller
//!
//! Keeps an Ingress next to every Service that carries the intent
//! annotation (`ingress/http` by default):
//! - Annotated Service without an Ingress: the Ingress is created, owned by
//!   the Service
//! - Annotation removed: the Ingress is deleted
//! - Ingress deleted behind our back: it is recreated
//!
//! Reconciliation is level-triggered. Watch events only enqueue keys; the
//! workers re-derive the desired state from the caches on every pass.

mod cache;
mod client;
mod config;
mod controller;
mod error;
mod event_bridge;
mod informer;
mod key;
mod metrics;
mod reconciler;
mod retry;
mod server;

#[cfg(test)]
mod test_utils;


use crate::cache::Lister;
use crate::client::KubeIngressClient;
use crate::config::ControllerConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use crate::event_bridge::EventBridge;
use crate::informer::{EventHandler, Informer};
use crate::metrics::Metrics;
use crate::reconciler::Reconciler;
use crate::retry::RetryPolicy;
use crate::server::ServerState;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config};
use kube_runtime::WatchStreamExt;
use kube_runtime::watcher;
use prometheus::Registry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use workqueue::RateLimitingQueue;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    if let Err(e) =
        rustls::crypto::CryptoProvider::install_default(rustls::crypto::ring::default_provider())
    {
        debug!(?e, "CryptoProvider already installed; proceeding");
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Ingress Manager Controller");

    let config = ControllerConfig::from_env()?;
    info!("Configuration:");
    info!(
        "  Namespace: {}",
        config.namespace.as_deref().unwrap_or("all namespaces")
    );
    info!("  Workers: {}", config.workers);
    info!("  Max retries: {}", config.max_retries);
    info!("  Backoff: {:?}", config.backoff_kind);
    info!("  Intent annotation: {}", config.intent_annotation);
    info!("  Metrics address: {}", config.metrics_addr);

    let client = create_client(config.kubeconfig_path.as_deref()).await?;

    let registry = Registry::new();
    let metrics = Metrics::new(&registry)?;
    let queue = RateLimitingQueue::with_metrics(
        "ingress-manager",
        config.rate_limiter(),
        Arc::new(metrics.clone()),
    );

    let (service_api, ingress_api): (Api<Service>, Api<Ingress>) = match &config.namespace {
        Some(namespace) => (
            Api::namespaced(client.clone(), namespace),
            Api::namespaced(client.clone(), namespace),
        ),
        None => (Api::all(client.clone()), Api::all(client.clone())),
    };

    let service_informer = Informer::<Service>::new("Service");
    let ingress_informer = Informer::<Ingress>::new("Ingress");
    let services: Arc<dyn Lister<Service>> = Arc::new(service_informer.store());
    let ingresses: Arc<dyn Lister<Ingress>> = Arc::new(ingress_informer.store());

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&services),
        Arc::clone(&ingresses),
        Arc::new(KubeIngressClient::new(client)),
        config.intent_annotation.clone(),
        config.ingress.clone(),
        config.api_timeout,
    ));

    let shutdown = CancellationToken::new();
    let bridge = EventBridge::new(queue.clone());
    let service_handler: Arc<dyn EventHandler<Service>> = Arc::new(bridge.clone());
    let ingress_handler: Arc<dyn EventHandler<Ingress>> = Arc::new(bridge);

    let service_watch = tokio::spawn(service_informer.run(
        watcher(service_api, watcher::Config::default()).default_backoff(),
        service_handler,
        shutdown.clone(),
    ));
    let ingress_watch = tokio::spawn(ingress_informer.run(
        watcher(ingress_api, watcher::Config::default()).default_backoff(),
        ingress_handler,
        shutdown.clone(),
    ));

    let server_state = ServerState::new(registry);
    let ready = server_state.ready_flag();
    let server = tokio::spawn(server::serve(
        config.metrics_addr,
        server_state,
        shutdown.clone(),
    ));

    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let controller = Controller::new(
        reconciler,
        queue,
        RetryPolicy::new(config.max_retries),
        config.workers,
        services,
        ingresses,
    )
    .with_metrics(metrics)
    .with_ready_flag(ready);

    let mut controller_task = tokio::spawn(controller.run(shutdown.clone()));

    // A dead informer or server takes the whole process down
    let result = tokio::select! {
        result = &mut controller_task => flatten("controller", result),
        result = service_watch => flatten("Service informer", result),
        result = ingress_watch => flatten("Ingress informer", result),
        result = server => flatten("metrics server", result),
    };

    shutdown.cancel();
    if !controller_task.is_finished() {
        if let Err(e) = flatten("controller", controller_task.await) {
            error!("Controller stopped with error: {}", e);
        }
    }

    match &result {
        Ok(()) => info!("Ingress Manager Controller stopped"),
        Err(e) => error!("Ingress Manager Controller failed: {}", e),
    }
    result
}

fn flatten(
    what: &str,
    joined: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    joined.map_err(|e| ControllerError::Watch(format!("{what} panicked: {e}")))?
}

async fn create_client(kubeconfig_path: Option<&str>) -> Result<Client, ControllerError> {
    let Some(path) = kubeconfig_path else {
        return Ok(Client::try_default().await?);
    };

    let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
        ControllerError::InvalidConfig(format!("failed to read kubeconfig {path}: {e}"))
    })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            ControllerError::InvalidConfig(format!("failed to load kubeconfig {path}: {e}"))
        })?;
    Ok(Client::try_from(config)?)
}

async fn shutdown_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}
