//! Local, read-only views over control plane objects.
//!
//! A [`ResourceCache`] only changes when its informer applies a
//! [`FeedEvent`](crate::cluster::FeedEvent); nothing else holds a write path.
//! Readers get `Arc` snapshots and cannot mutate what other readers see.

pub mod informer;
pub mod manager;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;
use tokio::sync::broadcast;
use tokio::sync::watch;

pub use self::informer::Informers;
pub use self::manager::CachedObject;
pub use self::manager::ResourceKind;
pub use self::manager::ResourceManager;
use crate::cluster::FeedEvent;

const NOTIFY_CAPACITY: usize = 4096;

/// Namespace/name identity of a cached object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    pub fn of<K: Metadata<Ty = ObjectMeta>>(object: &K) -> Self {
        let meta = object.metadata();
        Self {
            namespace: meta.namespace.clone().filter(|ns| !ns.is_empty()),
            name: meta.name.clone().unwrap_or_default(),
        }
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Change notification delivered to cache subscribers.
#[derive(Debug, Clone)]
pub enum CacheEvent<K> {
    Upserted { key: ObjectKey },
    /// The object left the cache; `last` is its final known state.
    Removed { key: ObjectKey, last: Arc<K> },
}

impl<K> CacheEvent<K> {
    pub fn key(&self) -> &ObjectKey {
        match self {
            Self::Upserted { key } | Self::Removed { key, .. } => key,
        }
    }
}

pub struct ResourceCache<K> {
    objects: RwLock<HashMap<ObjectKey, Arc<K>>>,
    synced: watch::Sender<bool>,
    notifier: broadcast::Sender<CacheEvent<K>>,
}

impl<K> Default for ResourceCache<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> ResourceCache<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (synced, _) = watch::channel(false);
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            synced,
            notifier,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ObjectKey, Arc<K>>> {
        self.objects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<K>> {
        let key = if namespace.is_empty() {
            ObjectKey::cluster_scoped(name)
        } else {
            ObjectKey::new(namespace, name)
        };
        self.get_key(&key)
    }

    pub fn get_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.read().get(key).cloned()
    }

    /// Objects in `namespace`, or every object when `None`.
    pub fn list(&self, namespace: Option<&str>) -> Vec<Arc<K>> {
        self.read()
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace() == ns))
            .map(|(_, object)| Arc::clone(object))
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Resolves once the first full listing has been applied.
    pub async fn wait_until_synced(&self) {
        let mut rx = self.synced.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel here.
        let _ = rx.wait_for(|synced| *synced).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent<K>> {
        self.notifier.subscribe()
    }

    /// Applies one feed event. The informer is the only caller.
    pub(crate) fn apply(&self, event: FeedEvent<K>) {
        let mut notifications = Vec::new();
        match event {
            FeedEvent::Applied(object) => {
                let key = ObjectKey::of(&object);
                self.write().insert(key.clone(), Arc::new(object));
                notifications.push(CacheEvent::Upserted { key });
            }
            FeedEvent::Deleted(object) => {
                let key = ObjectKey::of(&object);
                let last = self.write().remove(&key).unwrap_or_else(|| Arc::new(object));
                notifications.push(CacheEvent::Removed { key, last });
            }
            FeedEvent::Restarted(objects) => {
                let fresh: HashMap<ObjectKey, Arc<K>> = objects
                    .into_iter()
                    .map(|object| (ObjectKey::of(&object), Arc::new(object)))
                    .collect();
                let previous = std::mem::replace(&mut *self.write(), fresh.clone());
                for (key, last) in previous {
                    if !fresh.contains_key(&key) {
                        notifications.push(CacheEvent::Removed { key, last });
                    }
                }
                notifications.extend(fresh.into_keys().map(|key| CacheEvent::Upserted { key }));
                self.synced.send_replace(true);
            }
        }
        for notification in notifications {
            // No subscribers is fine.
            let _ = self.notifier.send(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::Secret;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;

    fn secret(namespace: &str, name: &str, value: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                labels: Some([("v".to_string(), value.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn label(secret: &Secret) -> String {
        secret.metadata.labels.as_ref().unwrap()["v"].clone()
    }

    #[test]
    fn restart_replaces_contents_and_marks_synced() {
        let cache = ResourceCache::<Secret>::new();
        assert!(!cache.is_synced());

        cache.apply(FeedEvent::Applied(secret("a", "stale", "0")));
        cache.apply(FeedEvent::Restarted(vec![
            secret("a", "one", "1"),
            secret("b", "two", "2"),
        ]));

        assert!(cache.is_synced());
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", "stale").is_none());
        assert_eq!(cache.list(Some("b")).len(), 1);
        assert_eq!(cache.list(None).len(), 2);
    }

    #[test]
    fn returned_objects_are_snapshots() {
        let cache = ResourceCache::<Secret>::new();
        cache.apply(FeedEvent::Applied(secret("a", "s", "1")));

        let before = cache.get("a", "s").unwrap();
        let mut edited = (*before).clone();
        edited.metadata.labels = Some([("v".to_string(), "local".to_string())].into());

        assert_eq!(label(&cache.get("a", "s").unwrap()), "1");

        cache.apply(FeedEvent::Applied(secret("a", "s", "2")));
        assert_eq!(label(&before), "1");
        assert_eq!(label(&cache.get("a", "s").unwrap()), "2");
    }

    #[test(tokio::test)]
    async fn subscribers_see_removals_with_last_state() {
        let cache = ResourceCache::<Secret>::new();
        let mut events = cache.subscribe();
        cache.apply(FeedEvent::Applied(secret("a", "s", "1")));
        cache.apply(FeedEvent::Deleted(secret("a", "s", "1")));

        assert!(matches!(events.recv().await.unwrap(), CacheEvent::Upserted { .. }));
        match events.recv().await.unwrap() {
            CacheEvent::Removed { key, last } => {
                assert_eq!(key.to_string(), "a/s");
                assert_eq!(label(&last), "1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(cache.is_empty());
    }

    #[test(tokio::test)]
    async fn wait_until_synced_resolves_after_first_listing() {
        let cache = Arc::new(ResourceCache::<Secret>::new());
        let waiter = tokio::spawn({
            let cache = Arc::clone(&cache);
            async move { cache.wait_until_synced().await }
        });
        cache.apply(FeedEvent::Restarted(Vec::new()));
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
