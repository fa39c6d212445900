//! Test utilities for unit testing the controller
//!
//! This module provides object builders and an in-memory cluster that stands
//! in for both the local caches and the Ingress API.

use crate::cache::Lister;
use crate::client::IngressClient;
use crate::error::ControllerError;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Helper to create a test Service, optionally carrying the intent annotation
pub fn create_test_service(namespace: &str, name: &str, with_intent: bool) -> Service {
    let annotations = with_intent.then(|| {
        BTreeMap::from([("ingress/http".to_string(), "true".to_string())])
    });
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{namespace}-{name}")),
            annotations,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Helper to create a test Ingress with an optional owner reference
pub fn create_test_ingress(
    namespace: &str,
    name: &str,
    owner: Option<OwnerReference>,
) -> Ingress {
    Ingress {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            owner_references: owner.map(|owner| vec![owner]),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Controller owner reference pointing at `service`
pub fn owner_reference(service: &Service) -> OwnerReference {
    service
        .controller_owner_ref(&())
        .expect("test services always carry a uid")
}

/// A mutating call observed by [`FakeCluster`]
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Ingress created
    Create(Ingress),
    /// Ingress deleted (namespace, name)
    Delete(String, String),
}

#[derive(Default)]
struct FakeState {
    services: HashMap<(String, String), Arc<Service>>,
    ingresses: HashMap<(String, String), Arc<Ingress>>,
    actions: Vec<Action>,
}

/// In-memory cluster: caches and API in one place.
///
/// Creates and deletes are applied to the cached state immediately, as if
/// the watch had already caught up.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
    /// Service lookups fail while set
    pub fail_service_lookup: AtomicBool,
    /// Creates and deletes fail while set
    pub fail_writes: AtomicBool,
    /// Delete reports 404 and leaves the cache untouched
    pub delete_not_found: AtomicBool,
    /// Create reports 409 and leaves the cache untouched
    pub create_conflict: AtomicBool,
    /// Writes stall for this long before answering
    pub write_delay: Mutex<Option<Duration>>,
}

fn key_of<K: Resource>(obj: &K) -> (String, String) {
    (
        obj.meta().namespace.clone().unwrap_or_default(),
        obj.meta().name.clone().unwrap_or_default(),
    )
}

impl FakeCluster {
    /// Empty cluster
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Puts a Service in the cache
    pub fn add_service(&self, service: Service) {
        let key = key_of(&service);
        self.state.lock().unwrap().services.insert(key, Arc::new(service));
    }

    /// Removes a Service from the cache
    pub fn remove_service(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .services
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Puts an Ingress in the cache without recording an action
    pub fn add_ingress(&self, ingress: Ingress) {
        let key = key_of(&ingress);
        self.state.lock().unwrap().ingresses.insert(key, Arc::new(ingress));
    }

    /// Removes an Ingress behind the controller's back
    pub fn remove_ingress(&self, namespace: &str, name: &str) {
        self.state
            .lock()
            .unwrap()
            .ingresses
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Cached Ingress, if any
    pub fn ingress(&self, namespace: &str, name: &str) -> Option<Arc<Ingress>> {
        self.state
            .lock()
            .unwrap()
            .ingresses
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Mutating calls so far
    pub fn actions(&self) -> Vec<Action> {
        self.state.lock().unwrap().actions.clone()
    }

    async fn stall(&self) {
        let delay = *self.write_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Lister<Service> for FakeCluster {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Service>>, ControllerError> {
        if self.fail_service_lookup.load(Ordering::SeqCst) {
            return Err(ControllerError::Cache("service cache unavailable".to_string()));
        }
        Ok(self
            .state
            .lock()
            .unwrap()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn wait_for_sync(&self) -> Result<(), ControllerError> {
        Ok(())
    }
}

#[async_trait]
impl Lister<Ingress> for FakeCluster {
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<Ingress>>, ControllerError> {
        Ok(self.ingress(namespace, name))
    }

    async fn wait_for_sync(&self) -> Result<(), ControllerError> {
        Ok(())
    }
}

#[async_trait]
impl IngressClient for FakeCluster {
    async fn create(&self, ingress: &Ingress) -> Result<(), ControllerError> {
        self.stall().await;
        let mut state = self.state.lock().unwrap();
        state.actions.push(Action::Create(ingress.clone()));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ControllerError::Api("apiserver unavailable".to_string()));
        }
        if self.create_conflict.load(Ordering::SeqCst) {
            return Err(ControllerError::AlreadyExists("ingress".to_string()));
        }
        state
            .ingresses
            .insert(key_of(ingress), Arc::new(ingress.clone()));
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        self.stall().await;
        let mut state = self.state.lock().unwrap();
        state
            .actions
            .push(Action::Delete(namespace.to_string(), name.to_string()));
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(ControllerError::Api("apiserver unavailable".to_string()));
        }
        if self.delete_not_found.load(Ordering::SeqCst) {
            return Err(ControllerError::NotFound("ingress".to_string()));
        }
        state
            .ingresses
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }
}
