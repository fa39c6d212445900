//! Reconciliation logic for Service → Ingress.
//!
//! This module converges one key at a time. It reads the Service and the
//! Ingress from the local caches, decides whether an Ingress should exist,
//! and issues at most one create or delete to get there. It never updates an
//! existing Ingress.
//!
//! The routine is level-triggered: it does not know which event queued the
//! key and re-derives everything from current cache state on every pass.

use crate::cache::Lister;
use crate::client::IngressClient;
use crate::error::ControllerError;
use crate::key::{ObjectKey, split_key};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Shape of the Ingress created for every annotated Service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressTemplate {
    /// Host of the single routing rule
    pub host: String,
    /// `spec.ingressClassName`
    pub class_name: String,
    /// Port on the Service that traffic is routed to
    pub backend_port: i32,
}

impl Default for IngressTemplate {
    fn default() -> Self {
        Self {
            host: "client-go-demo.com".to_string(),
            class_name: "nginx".to_string(),
            backend_port: 80,
        }
    }
}

/// What a sync pass does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Intent present, Ingress missing
    Create,
    /// Intent absent, Ingress present
    Delete,
    /// Already converged
    Noop,
}

impl Decision {
    /// Decision table over (intent present, child exists).
    pub fn from_state(intent: bool, child_exists: bool) -> Self {
        match (intent, child_exists) {
            (true, false) => Self::Create,
            (false, true) => Self::Delete,
            (true, true) | (false, false) => Self::Noop,
        }
    }
}

/// Reconciles Ingresses against Service intent.
pub struct Reconciler {
    services: Arc<dyn Lister<Service>>,
    ingresses: Arc<dyn Lister<Ingress>>,
    client: Arc<dyn IngressClient>,
    intent_annotation: String,
    template: IngressTemplate,
    api_timeout: Duration,
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("intent_annotation", &self.intent_annotation)
            .field("template", &self.template)
            .field("api_timeout", &self.api_timeout)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    /// Creates a new reconciler instance.
    pub fn new(
        services: Arc<dyn Lister<Service>>,
        ingresses: Arc<dyn Lister<Ingress>>,
        client: Arc<dyn IngressClient>,
        intent_annotation: String,
        template: IngressTemplate,
        api_timeout: Duration,
    ) -> Self {
        Self {
            services,
            ingresses,
            client,
            intent_annotation,
            template,
            api_timeout,
        }
    }

    /// Whether `service` asks for an Ingress. Only the annotation key matters.
    pub fn wants_ingress(&self, service: &Service) -> bool {
        service
            .metadata
            .annotations
            .as_ref()
            .is_some_and(|annotations| annotations.contains_key(&self.intent_annotation))
    }

    /// Converges the Ingress for `key`.
    ///
    /// This method:
    /// 1. Splits the key (malformed keys are not retryable)
    /// 2. Reads the Service; a missing Service still lets cleanup run
    /// 3. Reads the Ingress; missing is an expected state
    /// 4. Creates or deletes the Ingress according to the decision table
    pub async fn sync(&self, key: &str) -> Result<Decision, ControllerError> {
        let key = split_key(key)?;
        let namespace = key.namespace.as_str();
        let name = key.name.as_str();

        let service = self.services.get(namespace, name)?;
        if service.is_none() {
            debug!("Service {} not in cache, checking for orphaned Ingress", key);
        }
        let intent = service.as_deref().is_some_and(|svc| self.wants_ingress(svc));

        let ingress = self.ingresses.get(namespace, name)?;
        let decision = Decision::from_state(intent, ingress.is_some());

        match (decision, service) {
            (Decision::Create, Some(service)) => {
                let desired = construct_ingress(&service, &self.template)?;
                let created = self
                    .bounded("create", &key, self.client.create(&desired))
                    .await;
                match created {
                    Ok(()) => info!("Created Ingress {}", key),
                    // Cache lagged behind the API server: already converged
                    Err(ControllerError::AlreadyExists(_)) => {
                        debug!("Ingress {} already exists", key);
                    }
                    Err(e) => return Err(e),
                }
            }
            (Decision::Delete, _) => {
                let deleted = self
                    .bounded("delete", &key, self.client.delete(namespace, name))
                    .await;
                match deleted {
                    Ok(()) => info!("Deleted Ingress {}", key),
                    Err(ControllerError::NotFound(_)) => {
                        debug!("Ingress {} already gone", key);
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => debug!("Ingress {} up to date (intent: {})", key, intent),
        }

        Ok(decision)
    }

    async fn bounded<F>(&self, verb: &str, key: &ObjectKey, call: F) -> Result<(), ControllerError>
    where
        F: Future<Output = Result<(), ControllerError>>,
    {
        tokio::time::timeout(self.api_timeout, call)
            .await
            .map_err(|_elapsed| {
                ControllerError::Timeout(format!(
                    "{verb} Ingress {key} after {:?}",
                    self.api_timeout
                ))
            })?
    }
}

/// Builds the Ingress owned by `service`.
///
/// The shape depends only on the Service's name and namespace: one rule on
/// `template.host`, path `/` (prefix match), routed to the Service on
/// `template.backend_port`.
pub fn construct_ingress(
    service: &Service,
    template: &IngressTemplate,
) -> Result<Ingress, ControllerError> {
    let name = service.metadata.name.clone().ok_or_else(|| {
        ControllerError::MissingObjectKey("Service without metadata.name".to_string())
    })?;
    let owner = service.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::MissingObjectKey(format!("Service {name} has no uid"))
    })?;

    Ok(Ingress {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: service.metadata.namespace.clone(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: Some(template.class_name.clone()),
            rules: Some(vec![IngressRule {
                host: Some(template.host.clone()),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some("/".to_string()),
                        path_type: "Prefix".to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name,
                                port: Some(ServiceBackendPort {
                                    number: Some(template.backend_port),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}
