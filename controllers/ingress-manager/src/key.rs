//! Object keys.
//!
//! Every event about an object collapses to its `namespace/name` key, which
//! is what the work queue deduplicates on. Cluster-scoped objects render as
//! just `name`.

use crate::error::ControllerError;
use kube::Resource;
use std::fmt;
use std::str::FromStr;

/// Identity of one object within the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace, empty for cluster-scoped objects
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Creates a key from its parts.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl FromStr for ObjectKey {
    type Err = ControllerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        split_key(s)
    }
}

/// Derives the key of any parent or child object.
///
/// Fails only when the object has no name, which means the cache handed us
/// something malformed.
pub fn extract_key<K: Resource>(obj: &K) -> Result<ObjectKey, ControllerError> {
    let meta = obj.meta();
    let name = meta
        .name
        .as_deref()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            ControllerError::MissingObjectKey(format!(
                "object without metadata.name (uid {:?})",
                meta.uid
            ))
        })?;

    Ok(ObjectKey::new(
        meta.namespace.clone().unwrap_or_default(),
        name,
    ))
}

/// Splits a `namespace/name` (or bare `name`) key.
pub fn split_key(key: &str) -> Result<ObjectKey, ControllerError> {
    let mut parts = key.split('/');
    let (namespace, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(name), None, None) => ("", name),
        (Some(namespace), Some(name), None) => (namespace, name),
        _ => {
            return Err(ControllerError::InvalidKey(format!(
                "unexpected key format: {key:?}"
            )));
        }
    };

    if name.is_empty() {
        return Err(ControllerError::InvalidKey(format!(
            "key has an empty name: {key:?}"
        )));
    }

    Ok(ObjectKey::new(namespace, name))
}

/// Resolves the parent key of a child through its controller owner reference.
///
/// Returns `None` when the child has no controller owner or the owner is not
/// of `parent_kind`. By convention the parent shares the child's namespace
/// and name, so the child's own key is the parent's key.
pub fn controller_owner_key<K: Resource>(child: &K, parent_kind: &str) -> Option<ObjectKey> {
    let owner = child
        .meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|owner| owner.controller == Some(true))?;

    if owner.kind != parent_kind {
        return None;
    }

    extract_key(child).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_ingress, create_test_service, owner_reference};
    use k8s_openapi::api::core::v1::Service;

    #[test]
    fn test_extract_key_namespaced() {
        let svc = create_test_service("ns", "svc1", false);
        let key = extract_key(&svc).unwrap();
        assert_eq!(key, ObjectKey::new("ns", "svc1"));
        assert_eq!(key.to_string(), "ns/svc1");
    }

    #[test]
    fn test_extract_key_is_stable_across_kinds() {
        let svc = create_test_service("ns", "svc1", true);
        let ing = create_test_ingress("ns", "svc1", None);
        assert_eq!(extract_key(&svc).unwrap(), extract_key(&ing).unwrap());
    }

    #[test]
    fn test_extract_key_without_namespace() {
        let mut svc = create_test_service("", "cluster-wide", false);
        svc.metadata.namespace = None;
        assert_eq!(extract_key(&svc).unwrap().to_string(), "cluster-wide");
    }

    #[test]
    fn test_extract_key_without_name_fails() {
        let svc = Service::default();
        let err = extract_key(&svc).unwrap_err();
        assert!(matches!(err, ControllerError::MissingObjectKey(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_split_key() {
        assert_eq!(split_key("ns/svc1").unwrap(), ObjectKey::new("ns", "svc1"));
        assert_eq!(split_key("svc1").unwrap(), ObjectKey::new("", "svc1"));
        assert_eq!("ns/svc1".parse::<ObjectKey>().unwrap().name, "svc1");
    }

    #[test]
    fn test_split_key_rejects_malformed() {
        for key in ["a/b/c", "ns/", "", "/"] {
            let err = split_key(key).unwrap_err();
            assert!(matches!(err, ControllerError::InvalidKey(_)), "{key:?}");
        }
    }

    #[test]
    fn test_controller_owner_key_matches_parent_kind() {
        let parent = create_test_service("ns", "svc1", true);
        let child = create_test_ingress("ns", "svc1", Some(owner_reference(&parent)));
        assert_eq!(
            controller_owner_key(&child, "Service"),
            Some(ObjectKey::new("ns", "svc1"))
        );
        assert_eq!(controller_owner_key(&child, "Deployment"), None);
    }

    #[test]
    fn test_controller_owner_key_ignores_unowned_and_non_controller_refs() {
        let unowned = create_test_ingress("ns", "svc1", None);
        assert_eq!(controller_owner_key(&unowned, "Service"), None);

        let parent = create_test_service("ns", "svc1", true);
        let mut weak = owner_reference(&parent);
        weak.controller = None;
        let child = create_test_ingress("ns", "svc1", Some(weak));
        assert_eq!(controller_owner_key(&child, "Service"), None);
    }
}
