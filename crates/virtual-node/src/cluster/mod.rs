//! Control plane access layer.
//!
//! The rest of the crate talks to the cluster only through the traits defined
//! here, which keeps the orchestrator and both controllers testable against
//! the in-memory [`fake::FakeCluster`]. [`kube::KubeCluster`] is the production
//! implementation backed by `kube`.

pub mod client;
pub mod error;
pub mod fake;
pub mod kube;

use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use futures::stream::BoxStream;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use self::client::ConnectionConfig;
pub use self::error::is_not_found;
pub use self::error::ClusterError;

/// Namespace holding node heartbeat leases.
pub const NODE_LEASE_NAMESPACE: &str = "kube-node-lease";

/// `value` as the API server persists it.
///
/// Timestamps are encoded with whole-second precision, so a value built from
/// `Utc::now()` only compares equal to what a watch returns after this.
pub fn stored_form<T>(value: &T) -> Result<T, serde_json::Error>
where
    T: Serialize + DeserializeOwned,
{
    serde_json::to_value(value).and_then(serde_json::from_value)
}

/// A single change delivered by a watch feed.
#[derive(Debug, Clone)]
pub enum FeedEvent<K> {
    /// The object was created or modified.
    Applied(K),
    /// The object was deleted.
    Deleted(K),
    /// The feed (re)listed and this is the complete current set.
    Restarted(Vec<K>),
}

/// Stream of changes for one object kind.
pub type FeedStream<K> = BoxStream<'static, Result<FeedEvent<K>, Report<ClusterError>>>;

/// Narrows a watch to a namespace and/or the pods bound to one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchScope {
    pub namespace: Option<String>,
    pub node_name: Option<String>,
}

impl WatchScope {
    /// Pods in `namespace` (all namespaces when `None`) scheduled to `node_name`.
    pub fn pods_on_node(namespace: Option<String>, node_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.filter(|ns| !ns.is_empty()),
            node_name: Some(node_name.into()),
        }
    }

    /// Field selector equivalent of the node restriction.
    pub fn field_selector(&self) -> Option<String> {
        self.node_name
            .as_ref()
            .map(|node| format!("spec.nodeName={node}"))
    }

    pub fn matches_pod(&self, pod: &Pod) -> bool {
        if let Some(ns) = &self.namespace {
            if pod.metadata.namespace.as_deref() != Some(ns.as_str()) {
                return false;
            }
        }
        match &self.node_name {
            Some(node) => {
                pod.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node.as_str())
            }
            None => true,
        }
    }
}

/// Node objects.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get(&self, name: &str) -> Result<Node, Report<ClusterError>>;

    async fn create(&self, node: &Node) -> Result<Node, Report<ClusterError>>;

    /// Pushes `node.status` to the control plane.
    async fn update_status(&self, node: &Node) -> Result<Node, Report<ClusterError>>;
}

/// Pod objects.
#[async_trait]
pub trait PodApi: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Report<ClusterError>>;

    /// Pushes `pod.status` to the control plane.
    async fn update_status(&self, pod: &Pod) -> Result<Pod, Report<ClusterError>>;

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), Report<ClusterError>>;
}

/// Lease objects in [`NODE_LEASE_NAMESPACE`].
#[async_trait]
pub trait LeaseApi: Send + Sync {
    async fn get(&self, name: &str) -> Result<Lease, Report<ClusterError>>;

    async fn create(&self, lease: &Lease) -> Result<Lease, Report<ClusterError>>;

    async fn update(&self, lease: &Lease) -> Result<Lease, Report<ClusterError>>;
}

/// Destination for recorded events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn create_event(&self, event: &Event) -> Result<(), Report<ClusterError>>;
}

/// Everything the agent needs from the control plane.
///
/// Implementations must be safe for concurrent use; both controllers and the
/// informers share one instance.
pub trait ClusterClient: Send + Sync {
    fn nodes(&self) -> Arc<dyn NodeApi>;

    fn pods(&self) -> Arc<dyn PodApi>;

    fn leases(&self) -> Arc<dyn LeaseApi>;

    fn events(&self) -> Arc<dyn EventSink>;

    fn watch_pods(&self, scope: &WatchScope) -> FeedStream<Pod>;

    fn watch_secrets(&self) -> FeedStream<Secret>;

    fn watch_config_maps(&self) -> FeedStream<ConfigMap>;

    fn watch_services(&self) -> FeedStream<Service>;

    fn watch_pvcs(&self) -> FeedStream<PersistentVolumeClaim>;

    fn watch_pvs(&self) -> FeedStream<PersistentVolume>;
}
