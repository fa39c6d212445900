//! Shared informers.
//!
//! An [`Informer`] owns the write side of a `reflector` store. Every watch
//! event is applied to the store first and then turned into add/update/delete
//! notifications for an [`EventHandler`], so a handler that enqueues a key
//! can rely on the cache already reflecting the object.
//!
//! A relist (`Init` .. `InitDone`) is diffed against the store as it was
//! before the relist: objects that vanished while the watch was down are
//! reported as deletions, unchanged objects as updates with `old == new`.

use crate::error::ControllerError;
use futures::{Stream, StreamExt};
use kube::Resource;
use kube_runtime::reflector::{self, ObjectRef, Store};
use kube_runtime::watcher;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Callbacks for cache changes.
///
/// Handlers run on the informer task and must not block.
pub trait EventHandler<K>: Send + Sync {
    /// Object seen for the first time.
    fn on_add(&self, _obj: &K) {}

    /// Object changed (or was re-listed unchanged).
    fn on_update(&self, _old: &K, _new: &K) {}

    /// Object removed; this is the last known state.
    fn on_delete(&self, _obj: &K) {}
}

/// A change derived from one or more watch events.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification<K> {
    /// New object
    Add(Arc<K>),
    /// Previous and current state
    Update { old: Arc<K>, new: Arc<K> },
    /// Final known state
    Delete(Arc<K>),
}

impl<K> Notification<K> {
    /// Invokes the matching callback on `handler`.
    pub fn dispatch(&self, handler: &dyn EventHandler<K>) {
        match self {
            Self::Add(obj) => handler.on_add(obj),
            Self::Update { old, new } => handler.on_update(old, new),
            Self::Delete(obj) => handler.on_delete(obj),
        }
    }
}

struct Relist<K: Resource> {
    previous: HashMap<ObjectRef<K>, Arc<K>>,
    seen: HashSet<ObjectRef<K>>,
    pending: Vec<Notification<K>>,
}

/// Watch-driven cache plus change notifications for one kind.
pub struct Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    name: String,
    writer: reflector::store::Writer<K>,
    reader: Store<K>,
    relist: Option<Relist<K>>,
}

impl<K> std::fmt::Debug for Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Informer")
            .field("name", &self.name)
            .field("cached", &self.reader.state().len())
            .field("relisting", &self.relist.is_some())
            .finish_non_exhaustive()
    }
}

impl<K> Informer<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    /// Creates an informer with an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        let (reader, writer) = reflector::store();
        Self {
            name: name.into(),
            writer,
            reader,
            relist: None,
        }
    }

    /// Read handle on the cache; clones share state.
    pub fn store(&self) -> Store<K> {
        self.reader.clone()
    }

    /// Applies `event` to the store and returns the resulting notifications.
    ///
    /// Notifications produced during a relist are held back until `InitDone`,
    /// when the relisted state becomes visible through the store.
    pub fn process(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        // Diff against the store before the event lands in it.
        let notifications = self.notifications_for(&event);
        self.writer.apply_watcher_event(&event);
        notifications
    }

    fn notifications_for(&mut self, event: &watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(obj) => {
                let new = Arc::new(obj.clone());
                let notification = match self.reader.get(&ObjectRef::from_obj(obj)) {
                    Some(old) => Notification::Update { old, new },
                    None => Notification::Add(new),
                };
                vec![notification]
            }
            watcher::Event::Delete(obj) => vec![Notification::Delete(Arc::new(obj.clone()))],
            watcher::Event::Init => {
                debug!("{} informer relist started", self.name);
                let previous = self
                    .reader
                    .state()
                    .into_iter()
                    .map(|obj| (ObjectRef::from_obj(obj.as_ref()), obj))
                    .collect();
                self.relist = Some(Relist {
                    previous,
                    seen: HashSet::new(),
                    pending: Vec::new(),
                });
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                let new = Arc::new(obj.clone());
                let Some(relist) = self.relist.as_mut() else {
                    return vec![Notification::Add(new)];
                };
                let object_ref = ObjectRef::from_obj(obj);
                let notification = match relist.previous.get(&object_ref) {
                    Some(old) => Notification::Update {
                        old: Arc::clone(old),
                        new,
                    },
                    None => Notification::Add(new),
                };
                relist.seen.insert(object_ref);
                relist.pending.push(notification);
                Vec::new()
            }
            watcher::Event::InitDone => {
                let Some(relist) = self.relist.take() else {
                    return Vec::new();
                };
                let listed = relist.seen.len();
                let mut notifications = relist.pending;
                let mut removed = 0;
                for (object_ref, obj) in relist.previous {
                    if !relist.seen.contains(&object_ref) {
                        notifications.push(Notification::Delete(obj));
                        removed += 1;
                    }
                }
                info!(
                    "{} informer synced ({} objects, {} removed while disconnected)",
                    self.name, listed, removed
                );
                notifications
            }
        }
    }

    /// Drives the informer from `stream` until `shutdown` fires.
    ///
    /// Watch errors are logged and skipped; the stream is expected to carry
    /// its own backoff. The stream ending is reported as an error.
    pub async fn run<S>(
        mut self,
        stream: S,
        handler: Arc<dyn EventHandler<K>>,
        shutdown: CancellationToken,
    ) -> Result<(), ControllerError>
    where
        S: Stream<Item = Result<watcher::Event<K>, watcher::Error>> + Send,
    {
        info!("Starting {} informer", self.name);
        let mut stream = std::pin::pin!(stream);

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{} informer stopped", self.name);
                    return Ok(());
                }
                event = stream.next() => event,
            };

            match event {
                Some(Ok(event)) => {
                    for notification in self.process(event) {
                        notification.dispatch(handler.as_ref());
                    }
                }
                Some(Err(e)) => warn!("{} watch error: {}", self.name, e),
                None => {
                    return Err(ControllerError::Watch(format!(
                        "{} watch stream ended",
                        self.name
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_service;
    use k8s_openapi::api::core::v1::Service;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventHandler<Service> for Recorder {
        fn on_add(&self, obj: &Service) {
            self.push("add", obj);
        }

        fn on_update(&self, _old: &Service, new: &Service) {
            self.push("update", new);
        }

        fn on_delete(&self, obj: &Service) {
            self.push("delete", obj);
        }
    }

    impl Recorder {
        fn push(&self, what: &str, obj: &Service) {
            let name = obj.metadata.name.clone().unwrap_or_default();
            self.seen.lock().unwrap().push(format!("{what}:{name}"));
        }
    }

    fn names(notifications: &[Notification<Service>]) -> Vec<String> {
        notifications
            .iter()
            .map(|n| match n {
                Notification::Add(obj) => format!("add:{}", obj.metadata.name.as_deref().unwrap()),
                Notification::Update { new, .. } => {
                    format!("update:{}", new.metadata.name.as_deref().unwrap())
                }
                Notification::Delete(obj) => {
                    format!("delete:{}", obj.metadata.name.as_deref().unwrap())
                }
            })
            .collect()
    }

    #[test]
    fn test_apply_then_update_then_delete() {
        let mut informer = Informer::<Service>::new("services");
        let store = informer.store();

        let added = informer.process(watcher::Event::Apply(create_test_service("ns", "a", false)));
        assert_eq!(names(&added), vec!["add:a"]);
        assert_eq!(store.state().len(), 1);

        let updated = informer.process(watcher::Event::Apply(create_test_service("ns", "a", true)));
        let [Notification::Update { old, new }] = updated.as_slice() else {
            panic!("expected one update, got {updated:?}");
        };
        assert!(old.metadata.annotations.is_none());
        assert!(new.metadata.annotations.is_some());

        let deleted = informer.process(watcher::Event::Delete(create_test_service("ns", "a", true)));
        assert_eq!(names(&deleted), vec!["delete:a"]);
        assert!(store.state().is_empty());
    }

    #[test]
    fn test_debug_reports_cache_size() {
        let mut informer = Informer::<Service>::new("services");
        informer.process(watcher::Event::Apply(create_test_service("ns", "a", false)));

        let rendered = format!("{informer:?}");
        assert!(rendered.contains("\"services\""));
        assert!(rendered.contains("cached: 1"));
    }

    #[test]
    fn test_relist_reports_objects_removed_while_disconnected() {
        let mut informer = Informer::<Service>::new("services");
        let store = informer.store();
        informer.process(watcher::Event::Apply(create_test_service("ns", "kept", true)));
        informer.process(watcher::Event::Apply(create_test_service("ns", "gone", true)));

        assert!(informer.process(watcher::Event::Init).is_empty());
        assert!(
            informer
                .process(watcher::Event::InitApply(create_test_service("ns", "kept", true)))
                .is_empty()
        );
        assert!(
            informer
                .process(watcher::Event::InitApply(create_test_service("ns", "new", false)))
                .is_empty()
        );

        let mut done = names(&informer.process(watcher::Event::InitDone));
        done.sort();
        assert_eq!(done, vec!["add:new", "delete:gone", "update:kept"]);

        let mut cached: Vec<_> = store
            .state()
            .iter()
            .filter_map(|svc| svc.metadata.name.clone())
            .collect();
        cached.sort();
        assert_eq!(cached, vec!["kept", "new"]);
    }

    #[test]
    fn test_relisted_unchanged_object_is_an_equal_update() {
        let mut informer = Informer::<Service>::new("services");
        informer.process(watcher::Event::Apply(create_test_service("ns", "a", true)));

        informer.process(watcher::Event::Init);
        informer.process(watcher::Event::InitApply(create_test_service("ns", "a", true)));
        let done = informer.process(watcher::Event::InitDone);

        let [Notification::Update { old, new }] = done.as_slice() else {
            panic!("expected one update, got {done:?}");
        };
        assert_eq!(old, new);
    }

    #[tokio::test]
    async fn test_run_dispatches_and_fails_when_stream_ends() {
        let informer = Informer::<Service>::new("services");
        let store = informer.store();
        let recorder = Arc::new(Recorder::default());
        let events = futures::stream::iter(vec![
            Ok::<_, watcher::Error>(watcher::Event::Init),
            Ok(watcher::Event::InitApply(create_test_service("ns", "a", true))),
            Ok(watcher::Event::InitDone),
            Ok(watcher::Event::Delete(create_test_service("ns", "a", true))),
        ]);

        let result = informer
            .run(events, recorder.clone(), CancellationToken::new())
            .await;

        assert!(matches!(result, Err(ControllerError::Watch(_))));
        assert_eq!(*recorder.seen.lock().unwrap(), vec!["add:a", "delete:a"]);
        assert!(store.state().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let informer = Informer::<Service>::new("services");
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let result = informer
            .run(
                futures::stream::pending::<Result<watcher::Event<Service>, watcher::Error>>(),
                Arc::new(Recorder::default()),
                shutdown,
            )
            .await;
        assert!(result.is_ok());
    }
}
