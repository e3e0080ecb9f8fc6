//! In-memory control plane used by unit and integration tests.
//!
//! Every call is recorded in a [`CallLog`] so tests can assert on how many
//! requests a code path issued, including "none at all".

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use async_trait::async_trait;
use error_stack::Report;
use futures::future;
use futures::stream;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::Metadata;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::stored_form;
use super::ClusterClient;
use super::ClusterError;
use super::EventSink;
use super::FeedEvent;
use super::FeedStream;
use super::LeaseApi;
use super::NodeApi;
use super::PodApi;
use super::WatchScope;

type StoreKey = (String, String);

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn store_key(meta: &ObjectMeta) -> StoreKey {
    (
        meta.namespace.clone().unwrap_or_default(),
        meta.name.clone().unwrap_or_default(),
    )
}

fn display_key((namespace, name): &StoreKey) -> String {
    if namespace.is_empty() {
        name.clone()
    } else {
        format!("{namespace}/{name}")
    }
}

/// Names of the operations issued against a [`FakeCluster`], in order.
#[derive(Debug, Default)]
pub struct CallLog {
    calls: Mutex<Vec<String>>,
}

impl CallLog {
    fn record(&self, op: &str) {
        locked(&self.calls).push(op.to_string());
    }

    pub fn count(&self, op: &str) -> usize {
        locked(&self.calls).iter().filter(|c| *c == op).count()
    }

    pub fn total(&self) -> usize {
        locked(&self.calls).len()
    }

    pub fn snapshot(&self) -> Vec<String> {
        locked(&self.calls).clone()
    }
}

/// Objects of one kind plus a change feed.
pub struct FakeStore<K> {
    kind: &'static str,
    objects: Mutex<BTreeMap<StoreKey, K>>,
    changes: broadcast::Sender<FeedEvent<K>>,
    resource_version: AtomicU64,
}

impl<K> FakeStore<K>
where
    K: Metadata<Ty = ObjectMeta> + Clone + Send + Sync + 'static,
{
    fn new(kind: &'static str) -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            kind,
            objects: Mutex::new(BTreeMap::new()),
            changes,
            resource_version: AtomicU64::new(1),
        }
    }

    fn bump(&self, object: &mut K) {
        let rv = self.resource_version.fetch_add(1, Ordering::SeqCst);
        object.metadata_mut().resource_version = Some(rv.to_string());
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<K> {
        locked(&self.objects)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn list(&self) -> Vec<K> {
        locked(&self.objects).values().cloned().collect()
    }

    /// Creates or replaces an object and notifies watchers.
    pub fn apply(&self, mut object: K) -> K {
        self.bump(&mut object);
        let key = store_key(object.metadata());
        locked(&self.objects).insert(key, object.clone());
        let _ = self.changes.send(FeedEvent::Applied(object.clone()));
        object
    }

    /// Removes an object and notifies watchers.
    pub fn remove(&self, namespace: &str, name: &str) -> Option<K> {
        let removed = locked(&self.objects).remove(&(namespace.to_string(), name.to_string()));
        if let Some(object) = &removed {
            let _ = self.changes.send(FeedEvent::Deleted(object.clone()));
        }
        removed
    }

    fn create(&self, object: &K) -> Result<K, Report<ClusterError>> {
        let key = store_key(object.metadata());
        if locked(&self.objects).contains_key(&key) {
            return Err(Report::new(ClusterError::AlreadyExists {
                kind: self.kind,
                name: display_key(&key),
            }));
        }
        let mut created = object.clone();
        let serial = self.resource_version.load(Ordering::SeqCst);
        created.metadata_mut().uid = Some(format!("{}-uid-{serial}", self.kind.to_lowercase()));
        Ok(self.apply(created))
    }

    fn modify(&self, object: &K, update: impl FnOnce(&mut K, &K)) -> Result<K, Report<ClusterError>> {
        let key = store_key(object.metadata());
        let mut stored = locked(&self.objects).get(&key).cloned().ok_or_else(|| {
            Report::new(ClusterError::NotFound {
                kind: self.kind,
                name: display_key(&key),
            })
        })?;
        update(&mut stored, object);
        Ok(self.apply(stored))
    }

    fn lookup(&self, namespace: &str, name: &str) -> Result<K, Report<ClusterError>> {
        let key = (namespace.to_string(), name.to_string());
        self.get(namespace, name).ok_or_else(|| {
            Report::new(ClusterError::NotFound {
                kind: self.kind,
                name: display_key(&key),
            })
        })
    }

    /// Snapshot followed by live changes, both restricted by `filter`.
    pub fn feed(
        self: &Arc<Self>,
        filter: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> FeedStream<K> {
        let store = Arc::clone(self);
        let filter = Arc::new(filter);
        stream::once(async move {
            let (receiver, snapshot) = {
                let objects = locked(&store.objects);
                let receiver = store.changes.subscribe();
                let snapshot: Vec<K> = objects.values().filter(|o| filter(*o)).cloned().collect();
                (receiver, snapshot)
            };
            let kind = store.kind;
            let live = BroadcastStream::new(receiver).filter_map(move |change| {
                let filter = Arc::clone(&filter);
                future::ready(match change {
                    Ok(FeedEvent::Applied(o)) if filter(&o) => Some(Ok(FeedEvent::Applied(o))),
                    Ok(FeedEvent::Deleted(o)) if filter(&o) => Some(Ok(FeedEvent::Deleted(o))),
                    Ok(_) => None,
                    Err(e) => Some(Err(Report::new(ClusterError::Watch {
                        kind,
                        message: e.to_string(),
                    }))),
                })
            });
            stream::iter([Ok(FeedEvent::Restarted(snapshot))]).chain(live)
        })
        .flatten()
        .boxed()
    }
}

/// A complete in-memory [`ClusterClient`].
pub struct FakeCluster {
    pub calls: Arc<CallLog>,
    pub nodes: Arc<FakeStore<Node>>,
    pub pods: Arc<FakeStore<Pod>>,
    pub leases: Arc<FakeStore<Lease>>,
    pub secrets: Arc<FakeStore<Secret>>,
    pub config_maps: Arc<FakeStore<ConfigMap>>,
    pub services: Arc<FakeStore<Service>>,
    pub pvcs: Arc<FakeStore<PersistentVolumeClaim>>,
    pub pvs: Arc<FakeStore<PersistentVolume>>,
    events: Arc<Mutex<Vec<Event>>>,
    fail_next_node_status: Arc<AtomicBool>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(CallLog::default()),
            nodes: Arc::new(FakeStore::new("Node")),
            pods: Arc::new(FakeStore::new("Pod")),
            leases: Arc::new(FakeStore::new("Lease")),
            secrets: Arc::new(FakeStore::new("Secret")),
            config_maps: Arc::new(FakeStore::new("ConfigMap")),
            services: Arc::new(FakeStore::new("Service")),
            pvcs: Arc::new(FakeStore::new("PersistentVolumeClaim")),
            pvs: Arc::new(FakeStore::new("PersistentVolume")),
            events: Arc::new(Mutex::new(Vec::new())),
            fail_next_node_status: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.get("", name)
    }

    pub fn lease(&self, name: &str) -> Option<Lease> {
        self.leases.get(super::NODE_LEASE_NAMESPACE, name)
    }

    /// Events written through the event sink so far.
    pub fn recorded_events(&self) -> Vec<Event> {
        locked(&self.events).clone()
    }

    /// Makes the next node status push fail with an API error.
    pub fn fail_next_status_update(&self) {
        self.fail_next_node_status.store(true, Ordering::SeqCst);
    }
}

struct FakeNodes {
    calls: Arc<CallLog>,
    store: Arc<FakeStore<Node>>,
    fail_next_status: Arc<AtomicBool>,
}

#[async_trait]
impl NodeApi for FakeNodes {
    async fn get(&self, name: &str) -> Result<Node, Report<ClusterError>> {
        self.calls.record("nodes.get");
        self.store.lookup("", name)
    }

    async fn create(&self, node: &Node) -> Result<Node, Report<ClusterError>> {
        self.calls.record("nodes.create");
        self.store.create(node)
    }

    async fn update_status(&self, node: &Node) -> Result<Node, Report<ClusterError>> {
        self.calls.record("nodes.update_status");
        if self.fail_next_status.swap(false, Ordering::SeqCst) {
            return Err(Report::new(ClusterError::Api {
                message: "injected status update failure".to_string(),
            }));
        }
        self.store.modify(node, |stored, incoming| {
            stored.status = incoming.status.clone();
        })
    }
}

struct FakePods {
    calls: Arc<CallLog>,
    store: Arc<FakeStore<Pod>>,
}

#[async_trait]
impl PodApi for FakePods {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Report<ClusterError>> {
        self.calls.record("pods.get");
        self.store.lookup(namespace, name)
    }

    async fn update_status(&self, pod: &Pod) -> Result<Pod, Report<ClusterError>> {
        self.calls.record("pods.update_status");
        self.store.modify(pod, |stored, incoming| {
            stored.status = stored_form(&incoming.status).unwrap_or_else(|_| incoming.status.clone());
        })
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<(), Report<ClusterError>> {
        self.calls.record("pods.delete");
        self.store
            .remove(namespace, name)
            .map(|_| ())
            .ok_or_else(|| Report::new(ClusterError::not_found("Pod", format!("{namespace}/{name}"))))
    }
}

struct FakeLeases {
    calls: Arc<CallLog>,
    store: Arc<FakeStore<Lease>>,
}

#[async_trait]
impl LeaseApi for FakeLeases {
    async fn get(&self, name: &str) -> Result<Lease, Report<ClusterError>> {
        self.calls.record("leases.get");
        self.store.lookup(super::NODE_LEASE_NAMESPACE, name)
    }

    async fn create(&self, lease: &Lease) -> Result<Lease, Report<ClusterError>> {
        self.calls.record("leases.create");
        self.store.create(lease)
    }

    async fn update(&self, lease: &Lease) -> Result<Lease, Report<ClusterError>> {
        self.calls.record("leases.update");
        self.store.modify(lease, |stored, incoming| {
            stored.spec = incoming.spec.clone();
        })
    }
}

struct FakeEvents {
    calls: Arc<CallLog>,
    events: Arc<Mutex<Vec<Event>>>,
}

#[async_trait]
impl EventSink for FakeEvents {
    async fn create_event(&self, event: &Event) -> Result<(), Report<ClusterError>> {
        self.calls.record("events.create");
        locked(&self.events).push(event.clone());
        Ok(())
    }
}

impl ClusterClient for FakeCluster {
    fn nodes(&self) -> Arc<dyn NodeApi> {
        Arc::new(FakeNodes {
            calls: Arc::clone(&self.calls),
            store: Arc::clone(&self.nodes),
            fail_next_status: Arc::clone(&self.fail_next_node_status),
        })
    }

    fn pods(&self) -> Arc<dyn PodApi> {
        Arc::new(FakePods {
            calls: Arc::clone(&self.calls),
            store: Arc::clone(&self.pods),
        })
    }

    fn leases(&self) -> Arc<dyn LeaseApi> {
        Arc::new(FakeLeases {
            calls: Arc::clone(&self.calls),
            store: Arc::clone(&self.leases),
        })
    }

    fn events(&self) -> Arc<dyn EventSink> {
        Arc::new(FakeEvents {
            calls: Arc::clone(&self.calls),
            events: Arc::clone(&self.events),
        })
    }

    fn watch_pods(&self, scope: &WatchScope) -> FeedStream<Pod> {
        self.calls.record("pods.watch");
        let scope = scope.clone();
        self.pods.feed(move |pod| scope.matches_pod(pod))
    }

    fn watch_secrets(&self) -> FeedStream<Secret> {
        self.calls.record("secrets.watch");
        self.secrets.feed(|_| true)
    }

    fn watch_config_maps(&self) -> FeedStream<ConfigMap> {
        self.calls.record("configmaps.watch");
        self.config_maps.feed(|_| true)
    }

    fn watch_services(&self) -> FeedStream<Service> {
        self.calls.record("services.watch");
        self.services.feed(|_| true)
    }

    fn watch_pvcs(&self) -> FeedStream<PersistentVolumeClaim> {
        self.calls.record("persistentvolumeclaims.watch");
        self.pvcs.feed(|_| true)
    }

    fn watch_pvs(&self) -> FeedStream<PersistentVolume> {
        self.calls.record("persistentvolumes.watch");
        self.pvs.feed(|_| true)
    }
}
