//! Read access to the local object caches.
//!
//! The reconciler only ever reads through [`Lister`], so it can run against
//! a `reflector::Store` in production and an in-memory map in tests.

use crate::error::ControllerError;
use async_trait::async_trait;
use kube::Resource;
use kube_runtime::reflector::{ObjectRef, Store};
use std::fmt::Debug;
use std::sync::Arc;

/// Namespaced lookups against an eventually consistent cache.
#[async_trait]
pub trait Lister<K>: Send + Sync {
    /// Returns the cached object, `Ok(None)` when it is not in the cache.
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, ControllerError>;

    /// Waits until the cache holds a complete initial listing.
    async fn wait_for_sync(&self) -> Result<(), ControllerError>;
}

#[async_trait]
impl<K> Lister<K> for Store<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    fn get(&self, namespace: &str, name: &str) -> Result<Option<Arc<K>>, ControllerError> {
        let object_ref = ObjectRef::<K>::new(name).within(namespace);
        Ok(Store::get(self, &object_ref))
    }

    async fn wait_for_sync(&self) -> Result<(), ControllerError> {
        self.wait_until_ready()
            .await
            .map_err(|e| ControllerError::Cache(format!("cache writer dropped before sync: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_service;
    use k8s_openapi::api::core::v1::Service;
    use kube_runtime::{reflector, watcher};

    #[tokio::test]
    async fn test_store_lister_finds_cached_objects() {
        let (store, mut writer) = reflector::store::<Service>();
        writer.apply_watcher_event(&watcher::Event::Apply(create_test_service(
            "ns", "svc1", true,
        )));

        let found = Lister::get(&store, "ns", "svc1").unwrap();
        assert_eq!(found.unwrap().metadata.name.as_deref(), Some("svc1"));

        assert!(Lister::get(&store, "ns", "missing").unwrap().is_none());
        assert!(Lister::get(&store, "other", "svc1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_for_sync_completes_after_initial_list() {
        let (store, mut writer) = reflector::store::<Service>();
        writer.apply_watcher_event(&watcher::Event::Init);
        writer.apply_watcher_event(&watcher::Event::InitApply(create_test_service(
            "ns", "svc1", false,
        )));
        writer.apply_watcher_event(&watcher::Event::InitDone);

        tokio::time::timeout(std::time::Duration::from_secs(5), store.wait_for_sync())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store.state().len(), 1);
    }
}
