//! Pluggable execution backends.
//!
//! Pod lifecycle is mandatory for every backend. Node status reporting is an
//! optional capability discovered through [`Provider::node_provider`]; when a
//! backend does not offer it, [`NaiveNodeProvider`] stands in.

pub mod mock;
pub mod registry;

use core::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodStatus;
use tokio::sync::mpsc;

pub use self::registry::ProviderRegistry;
use crate::cache::ResourceManager;

#[derive(Debug, derive_more::Display)]
pub enum ProviderError {
    #[display("pod {namespace}/{name} not found")]
    PodNotFound { namespace: String, name: String },
    #[display("operation not supported: {operation}")]
    NotSupported { operation: &'static str },
    #[display("backend error: {message}")]
    Backend { message: String },
    #[display("invalid provider configuration: {message}")]
    InvalidConfig { message: String },
}

impl Error for ProviderError {}

impl ProviderError {
    pub fn pod_not_found(namespace: &str, name: &str) -> Self {
        Self::PodNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PodNotFound { .. })
    }
}

/// Everything a backend gets at construction time.
#[derive(Debug, Clone)]
pub struct InitConfig {
    pub config_path: Option<PathBuf>,
    pub node_name: String,
    pub operating_system: String,
    pub resource_manager: ResourceManager,
    pub daemon_port: u16,
    pub internal_ip: Option<String>,
    pub cluster_domain: String,
}

pub type InitFn =
    Arc<dyn Fn(InitConfig) -> Result<Arc<dyn Provider>, Report<ProviderError>> + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerLogOpts {
    pub tail: Option<usize>,
    pub timestamps: bool,
}

/// Pod lifecycle operations a backend must implement.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn create_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>>;

    async fn update_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>>;

    /// Stops the pod and forgets it. Returns `PodNotFound` if it was never created.
    async fn delete_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>>;

    async fn get_pod(&self, namespace: &str, name: &str)
        -> Result<Option<Pod>, Report<ProviderError>>;

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodStatus>, Report<ProviderError>>;

    async fn get_pods(&self) -> Result<Vec<Pod>, Report<ProviderError>>;

    /// Fills in capacity, conditions, addresses and daemon endpoints.
    fn configure_node(&self, node: &mut Node);

    async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        opts: &ContainerLogOpts,
    ) -> Result<String, Report<ProviderError>> {
        let _ = (namespace, pod, container, opts);
        Err(Report::new(ProviderError::NotSupported {
            operation: "get_container_logs",
        }))
    }

    /// Node status capability, if this backend reports one.
    fn node_provider(self: Arc<Self>) -> Option<Arc<dyn NodeProvider>> {
        None
    }
}

/// Optional capability: the backend pushes node status on its own schedule.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    /// Liveness check run on every ping tick.
    async fn ping(&self) -> Result<(), Report<ProviderError>>;

    /// Registers the channel on which updated node objects are delivered.
    fn notify_node_status(&self, updates: mpsc::Sender<Node>);
}

/// Stand-in for backends without node status reporting.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaiveNodeProvider;

#[async_trait]
impl NodeProvider for NaiveNodeProvider {
    async fn ping(&self) -> Result<(), Report<ProviderError>> {
        Ok(())
    }

    fn notify_node_status(&self, _updates: mpsc::Sender<Node>) {}
}

/// The provider's node capability, or the no-op default.
pub fn node_capability(provider: &Arc<dyn Provider>) -> Arc<dyn NodeProvider> {
    Arc::clone(provider)
        .node_provider()
        .unwrap_or_else(|| Arc::new(NaiveNodeProvider))
}
