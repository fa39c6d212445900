//! Watch notifications → work queue.
//!
//! Service adds and updates enqueue the Service key. Ingress deletions
//! enqueue the owning Service's key so a deleted child is recreated while
//! intent holds. Handlers only ever touch the queue.

use crate::informer::EventHandler;
use crate::key::{controller_owner_key, extract_key};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use tracing::{debug, trace, warn};
use workqueue::RateLimitingQueue;

/// Kind an Ingress must be controller-owned by to be tracked.
pub const PARENT_KIND: &str = "Service";

/// Turns cache notifications into queue keys.
#[derive(Debug, Clone)]
pub struct EventBridge {
    queue: RateLimitingQueue<String>,
}

impl EventBridge {
    /// Creates a bridge feeding `queue`.
    pub fn new(queue: RateLimitingQueue<String>) -> Self {
        Self { queue }
    }

    fn enqueue<K: Resource>(&self, obj: &K, reason: &str) {
        match extract_key(obj) {
            Ok(key) => {
                debug!("Enqueue {} ({})", key, reason);
                self.queue.add(key.to_string());
            }
            Err(e) => warn!("Dropping {} event: {}", reason, e),
        }
    }
}

impl EventHandler<Service> for EventBridge {
    fn on_add(&self, service: &Service) {
        self.enqueue(service, "service added");
    }

    fn on_update(&self, old: &Service, new: &Service) {
        if old == new {
            trace!(
                "Service {:?} unchanged, skipping",
                new.metadata.name.as_deref()
            );
            return;
        }
        self.enqueue(new, "service updated");
    }
}

impl EventHandler<Ingress> for EventBridge {
    fn on_delete(&self, ingress: &Ingress) {
        match controller_owner_key(ingress, PARENT_KIND) {
            Some(key) => {
                debug!("Enqueue {} (owned ingress deleted)", key);
                self.queue.add(key.to_string());
            }
            None => trace!(
                "Ingress {:?} not owned by a {}, ignoring deletion",
                ingress.metadata.name.as_deref(),
                PARENT_KIND
            ),
        }
    }
}
