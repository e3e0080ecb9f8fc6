//! [`ClusterClient`] backed by a live API server.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
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
use kube::api::DeleteParams;
use kube::api::Patch;
use kube::api::PatchParams;
use kube::api::PostParams;
use kube::runtime::watcher;
use kube::runtime::WatchStreamExt;
use kube::Api;
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::client::init_kube_client;
use super::ClusterClient;
use super::ClusterError;
use super::ConnectionConfig;
use super::EventSink;
use super::FeedEvent;
use super::FeedStream;
use super::LeaseApi;
use super::NodeApi;
use super::PodApi;
use super::WatchScope;
use super::NODE_LEASE_NAMESPACE;

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn connect(connection: &ConnectionConfig) -> Result<Self, Report<ClusterError>> {
        Ok(Self::new(init_kube_client(connection).await?))
    }

    fn feed<K>(&self, api: Api<K>, config: watcher::Config) -> FeedStream<K>
    where
        K: k8s_openapi::Resource + kube::Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let kind = <K as k8s_openapi::Resource>::URL_PATH_SEGMENT;
        watcher(api, config)
            .default_backoff()
            .map(move |event| match event {
                Ok(watcher::Event::Applied(obj)) => Ok(FeedEvent::Applied(obj)),
                Ok(watcher::Event::Deleted(obj)) => Ok(FeedEvent::Deleted(obj)),
                Ok(watcher::Event::Restarted(objs)) => Ok(FeedEvent::Restarted(objs)),
                Err(e) => Err(Report::new(ClusterError::Watch {
                    kind,
                    message: e.to_string(),
                })),
            })
            .boxed()
    }
}

/// Maps an API failure onto the error kinds the controllers branch on.
fn api_error(kind: &'static str, name: &str, err: kube::Error) -> Report<ClusterError> {
    let context = match &err {
        kube::Error::Api(response) if response.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 && response.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind,
                name: name.to_string(),
            }
        }
        kube::Error::Api(response) if response.code == 409 => ClusterError::Conflict {
            kind,
            name: name.to_string(),
        },
        other => ClusterError::Api {
            message: other.to_string(),
        },
    };
    Report::new(context).attach_printable(format!("Kubernetes API error: {err}"))
}

fn status_patch<T: serde::Serialize>(
    kind: &'static str,
    name: &str,
    status: &T,
) -> Result<Patch<serde_json::Value>, Report<ClusterError>> {
    let value = serde_json::to_value(status).map_err(|e| {
        Report::new(ClusterError::Serialization {
            kind,
            message: e.to_string(),
        })
        .attach_printable(format!("object: {name}"))
    })?;
    Ok(Patch::Merge(json!({ "status": value })))
}

fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or_default()
}

struct KubeNodes(Api<Node>);

#[async_trait]
impl NodeApi for KubeNodes {
    async fn get(&self, name: &str) -> Result<Node, Report<ClusterError>> {
        self.0.get(name).await.map_err(|e| api_error("Node", name, e))
    }

    async fn create(&self, node: &Node) -> Result<Node, Report<ClusterError>> {
        let name = object_name(&node.metadata);
        self.0
            .create(&PostParams::default(), node)
            .await
            .map_err(|e| api_error("Node", name, e))
    }

    async fn update_status(&self, node: &Node) -> Result<Node, Report<ClusterError>> {
        let name = object_name(&node.metadata);
        let patch = status_patch("Node", name, &node.status)?;
        self.0
            .patch_status(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| api_error("Node", name, e))
    }
}

struct KubePods(Client);

impl KubePods {
    fn api(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.0.clone(), namespace)
    }
}

#[async_trait]
impl PodApi for KubePods {
    async fn get(&self, namespace: &str, name: &str) -> Result<Pod, Report<ClusterError>> {
        self.api(namespace)
            .get(name)
            .await
            .map_err(|e| api_error("Pod", &format!("{namespace}/{name}"), e))
    }

    async fn update_status(&self, pod: &Pod) -> Result<Pod, Report<ClusterError>> {
        let name = object_name(&pod.metadata);
        let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
        let patch = status_patch("Pod", name, &pod.status)?;
        self.api(namespace)
            .patch_status(name, &PatchParams::default(), &patch)
            .await
            .map_err(|e| api_error("Pod", &format!("{namespace}/{name}"), e))
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), Report<ClusterError>> {
        let params = DeleteParams {
            grace_period_seconds,
            ..Default::default()
        };
        self.api(namespace)
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(|e| api_error("Pod", &format!("{namespace}/{name}"), e))
    }
}

struct KubeLeases(Api<Lease>);

#[async_trait]
impl LeaseApi for KubeLeases {
    async fn get(&self, name: &str) -> Result<Lease, Report<ClusterError>> {
        self.0.get(name).await.map_err(|e| api_error("Lease", name, e))
    }

    async fn create(&self, lease: &Lease) -> Result<Lease, Report<ClusterError>> {
        let name = object_name(&lease.metadata);
        self.0
            .create(&PostParams::default(), lease)
            .await
            .map_err(|e| api_error("Lease", name, e))
    }

    async fn update(&self, lease: &Lease) -> Result<Lease, Report<ClusterError>> {
        let name = object_name(&lease.metadata);
        self.0
            .replace(name, &PostParams::default(), lease)
            .await
            .map_err(|e| api_error("Lease", name, e))
    }
}

struct KubeEvents(Client);

#[async_trait]
impl EventSink for KubeEvents {
    async fn create_event(&self, event: &Event) -> Result<(), Report<ClusterError>> {
        let namespace = event.metadata.namespace.as_deref().unwrap_or("default");
        let api: Api<Event> = Api::namespaced(self.0.clone(), namespace);
        api.create(&PostParams::default(), event)
            .await
            .map(|_| ())
            .map_err(|e| api_error("Event", object_name(&event.metadata), e))
    }
}

impl ClusterClient for KubeCluster {
    fn nodes(&self) -> Arc<dyn NodeApi> {
        Arc::new(KubeNodes(Api::all(self.client.clone())))
    }

    fn pods(&self) -> Arc<dyn PodApi> {
        Arc::new(KubePods(self.client.clone()))
    }

    fn leases(&self) -> Arc<dyn LeaseApi> {
        Arc::new(KubeLeases(Api::namespaced(
            self.client.clone(),
            NODE_LEASE_NAMESPACE,
        )))
    }

    fn events(&self) -> Arc<dyn EventSink> {
        Arc::new(KubeEvents(self.client.clone()))
    }

    fn watch_pods(&self, scope: &WatchScope) -> FeedStream<Pod> {
        let api: Api<Pod> = match &scope.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let mut config = watcher::Config::default();
        if let Some(selector) = scope.field_selector() {
            config = config.fields(&selector);
        }
        self.feed(api, config)
    }

    fn watch_secrets(&self) -> FeedStream<Secret> {
        self.feed(Api::all(self.client.clone()), watcher::Config::default())
    }

    fn watch_config_maps(&self) -> FeedStream<ConfigMap> {
        self.feed(Api::all(self.client.clone()), watcher::Config::default())
    }

    fn watch_services(&self) -> FeedStream<Service> {
        self.feed(Api::all(self.client.clone()), watcher::Config::default())
    }

    fn watch_pvcs(&self) -> FeedStream<PersistentVolumeClaim> {
        self.feed(Api::all(self.client.clone()), watcher::Config::default())
    }

    fn watch_pvs(&self) -> FeedStream<PersistentVolume> {
        self.feed(Api::all(self.client.clone()), watcher::Config::default())
    }
}
