//! In-memory backend that pretends every pod starts instantly.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;

use async_trait::async_trait;
use chrono::SubsecRound;
use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use k8s_openapi::api::core::v1::ContainerState;
use k8s_openapi::api::core::v1::ContainerStateRunning;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::DaemonEndpoint;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::NodeAddress;
use k8s_openapi::api::core::v1::NodeCondition;
use k8s_openapi::api::core::v1::NodeDaemonEndpoints;
use k8s_openapi::api::core::v1::NodeStatus;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodCondition;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::info;

use super::ContainerLogOpts;
use super::InitConfig;
use super::NodeProvider;
use super::Provider;
use super::ProviderError;
use crate::cache::ObjectKey;

const MOCK_POD_IP: &str = "10.0.0.1";

/// Capacity advertised by the mock node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    pub cpu: String,
    pub memory: String,
    pub pods: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            cpu: "20".to_string(),
            memory: "100Gi".to_string(),
            pods: "20".to_string(),
        }
    }
}

impl MockConfig {
    pub fn load(path: &Path) -> Result<Self, Report<ProviderError>> {
        let contents = std::fs::read_to_string(path).change_context(ProviderError::InvalidConfig {
            message: format!("failed to read {}", path.display()),
        })?;
        let config: Self =
            serde_yaml::from_str(&contents).change_context(ProviderError::InvalidConfig {
                message: format!("failed to parse {}", path.display()),
            })?;
        for (field, value) in [("cpu", &config.cpu), ("memory", &config.memory), ("pods", &config.pods)] {
            if value.trim().is_empty() {
                return Err(Report::new(ProviderError::InvalidConfig {
                    message: format!("{field} must not be empty"),
                }));
            }
        }
        Ok(config)
    }
}

pub struct MockProvider {
    node_name: String,
    internal_ip: Option<String>,
    daemon_port: u16,
    config: MockConfig,
    pods: Mutex<HashMap<ObjectKey, Pod>>,
    node_updates: Mutex<Option<mpsc::Sender<Node>>>,
}

impl MockProvider {
    pub const NAME: &'static str = "mock";

    pub fn new(init: &InitConfig, config: MockConfig) -> Self {
        Self {
            node_name: init.node_name.clone(),
            internal_ip: init.internal_ip.clone(),
            daemon_port: init.daemon_port,
            config,
            pods: Mutex::new(HashMap::new()),
            node_updates: Mutex::new(None),
        }
    }

    /// Registry entry point.
    pub fn init(init: InitConfig) -> Result<Arc<dyn Provider>, Report<ProviderError>> {
        let config = match &init.config_path {
            Some(path) => MockConfig::load(path)?,
            None => MockConfig::default(),
        };
        info!(node = %init.node_name, ?config, "Initialized mock provider");
        Ok(Arc::new(Self::new(&init, config)))
    }

    /// Sends `node` to the registered status listener. Returns false when nobody listens.
    pub async fn publish_node_status(&self, node: Node) -> bool {
        let sender = self
            .node_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match sender {
            Some(sender) => sender.send(node).await.is_ok(),
            None => false,
        }
    }

    /// Overrides the status reported for a stored pod. Returns false for unknown pods.
    pub fn set_pod_status(&self, namespace: &str, name: &str, status: PodStatus) -> bool {
        match self.pods().get_mut(&ObjectKey::new(namespace, name)) {
            Some(pod) => {
                pod.status = Some(status);
                true
            }
            None => false,
        }
    }

    pub fn has_pod(&self, namespace: &str, name: &str) -> bool {
        self.pods().contains_key(&ObjectKey::new(namespace, name))
    }

    fn pods(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, Pod>> {
        self.pods.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn running_status(&self, pod: &Pod) -> PodStatus {
        let now = Time(Utc::now().trunc_subsecs(0));
        let condition = |type_: &str| PodCondition {
            type_: type_.to_string(),
            status: "True".to_string(),
            last_transition_time: Some(now.clone()),
            ..Default::default()
        };
        let container_statuses = pod
            .spec
            .iter()
            .flat_map(|spec| spec.containers.iter())
            .map(|container| ContainerStatus {
                name: container.name.clone(),
                image: container.image.clone().unwrap_or_default(),
                image_id: String::new(),
                ready: true,
                restart_count: 0,
                started: Some(true),
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning {
                        started_at: Some(now.clone()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();

        PodStatus {
            phase: Some("Running".to_string()),
            host_ip: self.internal_ip.clone(),
            pod_ip: Some(MOCK_POD_IP.to_string()),
            start_time: Some(now.clone()),
            conditions: Some(vec![
                condition("PodScheduled"),
                condition("Initialized"),
                condition("Ready"),
            ]),
            container_statuses: Some(container_statuses),
            ..Default::default()
        }
    }

    fn node_conditions(&self) -> Vec<NodeCondition> {
        let now = Time(Utc::now().trunc_subsecs(0));
        [
            ("Ready", "True", "KubeletReady", "kubelet is ready."),
            ("OutOfDisk", "False", "KubeletHasSufficientDisk", "kubelet has sufficient disk space available"),
            ("MemoryPressure", "False", "KubeletHasSufficientMemory", "kubelet has sufficient memory available"),
            ("DiskPressure", "False", "KubeletHasNoDiskPressure", "kubelet has no disk pressure"),
            ("NetworkUnavailable", "False", "RouteCreated", "RouteController created a route"),
        ]
        .into_iter()
        .map(|(type_, status, reason, message)| NodeCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_heartbeat_time: Some(now.clone()),
            last_transition_time: Some(now.clone()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        })
        .collect()
    }

    fn capacity(&self) -> BTreeMap<String, Quantity> {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(self.config.cpu.clone())),
            ("memory".to_string(), Quantity(self.config.memory.clone())),
            ("pods".to_string(), Quantity(self.config.pods.clone())),
        ])
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>> {
        let key = ObjectKey::of(pod);
        debug!(pod = %key, "Creating pod");
        let mut stored = pod.clone();
        stored.status = Some(self.running_status(pod));
        self.pods().insert(key, stored);
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>> {
        let key = ObjectKey::of(pod);
        debug!(pod = %key, "Updating pod");
        let mut pods = self.pods();
        let status = match pods.get(&key) {
            Some(existing) => existing.status.clone(),
            None => Some(self.running_status(pod)),
        };
        let mut stored = pod.clone();
        stored.status = status;
        pods.insert(key, stored);
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>> {
        let key = ObjectKey::of(pod);
        debug!(pod = %key, "Deleting pod");
        match self.pods().remove(&key) {
            Some(_) => Ok(()),
            None => Err(Report::new(ProviderError::pod_not_found(key.namespace(), &key.name))),
        }
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, Report<ProviderError>> {
        Ok(self.pods().get(&ObjectKey::new(namespace, name)).cloned())
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodStatus>, Report<ProviderError>> {
        Ok(self
            .pods()
            .get(&ObjectKey::new(namespace, name))
            .and_then(|pod| pod.status.clone()))
    }

    async fn get_pods(&self) -> Result<Vec<Pod>, Report<ProviderError>> {
        Ok(self.pods().values().cloned().collect())
    }

    fn configure_node(&self, node: &mut Node) {
        let status = node.status.get_or_insert_with(NodeStatus::default);
        status.capacity = Some(self.capacity());
        status.allocatable = Some(self.capacity());
        status.conditions = Some(self.node_conditions());
        status.addresses = self.internal_ip.as_ref().map(|ip| {
            vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.clone(),
            }]
        });
        status.daemon_endpoints = Some(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint {
                port: i32::from(self.daemon_port),
            }),
        });
    }

    async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> Result<String, Report<ProviderError>> {
        if !self.pods().contains_key(&ObjectKey::new(namespace, pod)) {
            return Err(Report::new(ProviderError::pod_not_found(namespace, pod)));
        }
        let lines = [
            format!("mock log for {namespace}/{pod}/{container}"),
            format!("running on {}", self.node_name),
        ];
        let skip = opts.tail.map_or(0, |tail| lines.len().saturating_sub(tail));
        Ok(lines
            .iter()
            .skip(skip)
            .map(|line| format!("{line}\n"))
            .collect())
    }

    fn node_provider(self: Arc<Self>) -> Option<Arc<dyn NodeProvider>> {
        Some(self)
    }
}

#[async_trait]
impl NodeProvider for MockProvider {
    async fn ping(&self) -> Result<(), Report<ProviderError>> {
        Ok(())
    }

    fn notify_node_status(&self, updates: mpsc::Sender<Node>) {
        *self
            .node_updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(updates);
    }
}
