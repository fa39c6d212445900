//! Mutating access to Ingress objects.
//!
//! Writes go straight to the API server, bypassing the cache. Conflicts the
//! reconciler cares about (`404` on delete, `409` on create) are surfaced as
//! dedicated error variants so callers never inspect raw status codes.

use crate::error::ControllerError;
use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{DeleteParams, PostParams};
use kube::{Api, Client};
use tracing::debug;

/// Create/delete calls for the child kind.
#[async_trait]
pub trait IngressClient: Send + Sync {
    /// Creates `ingress` in its own namespace.
    async fn create(&self, ingress: &Ingress) -> Result<(), ControllerError>;

    /// Deletes the named Ingress.
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError>;
}

/// [`IngressClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeIngressClient {
    client: Client,
}

impl std::fmt::Debug for KubeIngressClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeIngressClient").finish_non_exhaustive()
    }
}

impl KubeIngressClient {
    /// Creates a new client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

/// Maps API status codes onto controller errors.
fn classify(e: kube::Error, what: String) -> ControllerError {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => ControllerError::NotFound(what),
        kube::Error::Api(ae) if ae.code == 409 => ControllerError::AlreadyExists(what),
        other => ControllerError::Kube(other),
    }
}

#[async_trait]
impl IngressClient for KubeIngressClient {
    async fn create(&self, ingress: &Ingress) -> Result<(), ControllerError> {
        let namespace = ingress.metadata.namespace.as_deref().unwrap_or("default");
        let name = ingress.metadata.name.as_deref().unwrap_or_default();
        debug!("Creating Ingress {}/{}", namespace, name);

        self.api(namespace)
            .create(&PostParams::default(), ingress)
            .await
            .map(|_| ())
            .map_err(|e| classify(e, format!("Ingress {namespace}/{name}")))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ControllerError> {
        debug!("Deleting Ingress {}/{}", namespace, name);

        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| classify(e, format!("Ingress {namespace}/{name}")))
    }
}
