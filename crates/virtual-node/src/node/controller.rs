//! Node lifecycle loop: registration, status pushes, lease renewal.

use core::error::Error;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use error_stack::Report;
use error_stack::ResultExt;
use futures::future::BoxFuture;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval_at;
use tokio::time::Instant;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::lease::LeaseKeeper;
use crate::cluster::ClusterError;
use crate::cluster::LeaseApi;
use crate::cluster::NodeApi;
use crate::provider::NodeProvider;

pub const DEFAULT_STATUS_UPDATE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(40);

const PROVIDER_UPDATE_BUFFER: usize = 16;

#[derive(Debug, derive_more::Display)]
pub enum NodeControllerError {
    #[display("invalid node controller option: {message}")]
    InvalidOption { message: String },
    #[display("failed to register node {node}")]
    Registration { node: String },
}

impl Error for NodeControllerError {}

/// Called with every failed status push. Returning `Ok` swallows the error;
/// `Ok(Some(node))` also replaces the controller's view of the registered node.
pub type StatusUpdateErrorHandler = Arc<
    dyn Fn(Node, Report<ClusterError>) -> BoxFuture<'static, Result<Option<Node>, Report<ClusterError>>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct LeaseOptions {
    pub client: Arc<dyn LeaseApi>,
    pub duration: Duration,
}

#[derive(Clone)]
pub struct NodeControllerOptions {
    pub lease: Option<LeaseOptions>,
    pub status_update_interval: Duration,
    pub ping_interval: Duration,
    pub status_update_error_handler: Option<StatusUpdateErrorHandler>,
}

impl Default for NodeControllerOptions {
    fn default() -> Self {
        Self {
            lease: None,
            status_update_interval: DEFAULT_STATUS_UPDATE_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            status_update_error_handler: None,
        }
    }
}

impl NodeControllerOptions {
    pub fn with_lease(mut self, client: Arc<dyn LeaseApi>, duration: Duration) -> Self {
        self.lease = Some(LeaseOptions { client, duration });
        self
    }

    pub fn with_status_update_interval(mut self, interval: Duration) -> Self {
        self.status_update_interval = interval;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_status_update_error_handler(mut self, handler: StatusUpdateErrorHandler) -> Self {
        self.status_update_error_handler = Some(handler);
        self
    }
}

pub struct NodeController {
    provider: Arc<dyn NodeProvider>,
    node: Node,
    nodes: Arc<dyn NodeApi>,
    lease: Option<LeaseKeeper>,
    status_update_interval: Duration,
    ping_interval: Duration,
    error_handler: Option<StatusUpdateErrorHandler>,
}

impl NodeController {
    pub fn new(
        provider: Arc<dyn NodeProvider>,
        node: Node,
        nodes: Arc<dyn NodeApi>,
        options: NodeControllerOptions,
    ) -> Result<Self, Report<NodeControllerError>> {
        let invalid = |message: &str| {
            Report::new(NodeControllerError::InvalidOption {
                message: message.to_string(),
            })
        };
        if node.metadata.name.as_deref().is_none_or(str::is_empty) {
            return Err(invalid("node must have a name"));
        }
        if options.status_update_interval.is_zero() {
            return Err(invalid("status update interval must be greater than zero"));
        }
        if options.ping_interval.is_zero() {
            return Err(invalid("ping interval must be greater than zero"));
        }
        if let Some(lease) = &options.lease {
            if lease.duration.is_zero() {
                return Err(invalid("lease duration must be greater than zero"));
            }
        }

        Ok(Self {
            provider,
            node,
            nodes,
            lease: options
                .lease
                .map(|lease| LeaseKeeper::new(lease.client, lease.duration)),
            status_update_interval: options.status_update_interval,
            ping_interval: options.ping_interval,
            error_handler: options.status_update_error_handler,
        })
    }

    pub fn name(&self) -> &str {
        self.node.metadata.name.as_deref().unwrap_or_default()
    }

    /// Registers the node and keeps it fresh until `token` is cancelled.
    ///
    /// Only a failed registration ends the loop with an error; later push and
    /// lease failures are logged and retried on the next tick.
    #[tracing::instrument(skip_all, fields(node = %self.name()))]
    pub async fn run(mut self, token: CancellationToken) -> Result<(), Report<NodeControllerError>> {
        self.ensure_node().await?;
        info!("Node registered");

        if let Some(lease) = self.lease.as_mut() {
            if let Err(e) = lease.ensure(&self.node).await {
                warn!("Failed to create node lease, will retry: {e:?}");
            }
        }

        let (updates_tx, mut updates_rx) = mpsc::channel(PROVIDER_UPDATE_BUFFER);
        self.provider.notify_node_status(updates_tx);

        // With a lease carrying liveness, full status pushes can be infrequent.
        let status_period = if self.lease.is_some() {
            self.status_update_interval
        } else {
            self.ping_interval
        };
        let mut ping_ticker = ticker(self.ping_interval);
        let mut status_ticker = ticker(status_period);
        let mut lease_ticker = ticker(
            self.lease
                .as_ref()
                .map_or(self.ping_interval, LeaseKeeper::renew_interval),
        );

        loop {
            select! {
                biased;
                _ = token.cancelled() => {
                    info!("Node controller shutdown requested");
                    return Ok(());
                }
                _ = ping_ticker.tick() => {
                    if let Err(e) = self.provider.ping().await {
                        warn!("Provider ping failed: {e:?}");
                    }
                }
                _ = status_ticker.tick() => {
                    if let Err(e) = self.push_status().await {
                        warn!("Failed to update node status: {e:?}");
                    }
                }
                _ = lease_ticker.tick(), if self.lease.is_some() => {
                    if let Some(lease) = self.lease.as_mut() {
                        if let Err(e) = lease.renew(&self.node).await {
                            warn!("Failed to renew node lease: {e:?}");
                        }
                    }
                }
                Some(update) = updates_rx.recv() => {
                    self.merge_provider_update(update);
                    if let Err(e) = self.push_status().await {
                        warn!("Failed to push provider node status: {e:?}");
                    }
                }
            }
        }
    }

    async fn ensure_node(&mut self) -> Result<(), Report<NodeControllerError>> {
        let node_name = self.name().to_string();
        let registration = || NodeControllerError::Registration {
            node: node_name.clone(),
        };
        match self.nodes.create(&self.node).await {
            Ok(created) => {
                self.node.metadata = created.metadata;
                Ok(())
            }
            Err(e) if e.current_context().is_already_exists() => {
                debug!("Node already exists, updating status");
                let existing = self
                    .nodes
                    .get(&node_name)
                    .await
                    .change_context_lazy(registration)?;
                self.node.metadata.uid = existing.metadata.uid;
                self.node.metadata.resource_version = existing.metadata.resource_version;
                self.push_status().await.change_context_lazy(registration)
            }
            Err(e) => Err(e.change_context(registration())),
        }
    }

    fn merge_provider_update(&mut self, update: Node) {
        if let Some(labels) = update.metadata.labels {
            self.node
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .extend(labels);
        }
        if update.status.is_some() {
            self.node.status = update.status;
        }
    }

    fn refresh_heartbeats(&mut self) {
        let now = Time(Utc::now());
        let conditions = self
            .node
            .status
            .as_mut()
            .and_then(|status| status.conditions.as_mut());
        for condition in conditions.into_iter().flatten() {
            condition.last_heartbeat_time = Some(now.clone());
        }
    }

    /// Pushes the current status, routing failures through the error handler.
    async fn push_status(&mut self) -> Result<(), Report<ClusterError>> {
        self.refresh_heartbeats();
        match self.nodes.update_status(&self.node).await {
            Ok(updated) => {
                self.node.metadata.resource_version = updated.metadata.resource_version;
                debug!("Node status updated");
                Ok(())
            }
            Err(e) => {
                let Some(handler) = &self.error_handler else {
                    return Err(e);
                };
                if let Some(registered) = handler(self.node.clone(), e).await? {
                    self.node.metadata = registered.metadata;
                }
                Ok(())
            }
        }
    }
}

fn ticker(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::ClusterClient;
    use crate::cluster::NODE_LEASE_NAMESPACE;
    use crate::orchestrator::recovery::recreate_missing_node;
    use crate::provider::NaiveNodeProvider;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn controller(cluster: &FakeCluster, options: NodeControllerOptions) -> NodeController {
        NodeController::new(
            Arc::new(NaiveNodeProvider),
            node("vk"),
            cluster.nodes(),
            options,
        )
        .unwrap()
    }

    #[test]
    fn rejects_invalid_options() {
        let cluster = FakeCluster::new();
        let zero_lease = NodeControllerOptions::default().with_lease(cluster.leases(), Duration::ZERO);
        let err = NodeController::new(
            Arc::new(NaiveNodeProvider),
            node("vk"),
            cluster.nodes(),
            zero_lease,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.current_context(),
            NodeControllerError::InvalidOption { .. }
        ));

        let unnamed = NodeController::new(
            Arc::new(NaiveNodeProvider),
            Node::default(),
            cluster.nodes(),
            NodeControllerOptions::default(),
        );
        assert!(unnamed.is_err());
    }

    #[test(tokio::test)]
    async fn registers_node_and_lease_then_stops_on_cancel() {
        let cluster = FakeCluster::new();
        let options = NodeControllerOptions::default()
            .with_lease(cluster.leases(), Duration::from_millis(40))
            .with_status_update_interval(Duration::from_millis(10));
        let token = CancellationToken::new();
        let task = tokio::spawn(controller(&cluster, options).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(60)).await;
        token.cancel();
        task.await.unwrap().unwrap();

        assert!(cluster.node("vk").is_some());
        assert!(cluster.lease("vk").is_some());
        assert!(cluster.calls.count("nodes.update_status") >= 1);
        assert!(cluster.calls.count("leases.update") >= 1);
    }

    #[test(tokio::test)]
    async fn existing_node_gets_status_pushed() {
        let cluster = FakeCluster::new();
        cluster.nodes.apply(node("vk"));
        let mut controller = controller(&cluster, NodeControllerOptions::default());

        controller.ensure_node().await.unwrap();
        assert_eq!(cluster.calls.count("nodes.create"), 1);
        assert_eq!(cluster.calls.count("nodes.update_status"), 1);
    }

    #[test(tokio::test)]
    async fn not_found_push_recreates_node_once() {
        let cluster = FakeCluster::new();
        let options = NodeControllerOptions::default()
            .with_status_update_error_handler(recreate_missing_node(cluster.nodes()));
        let mut controller = controller(&cluster, options);
        controller.ensure_node().await.unwrap();

        let first_uid = controller.node.metadata.uid.clone();
        assert!(first_uid.is_some());

        cluster.nodes.remove("", "vk");
        controller.push_status().await.unwrap();
        controller.push_status().await.unwrap();

        assert_eq!(cluster.calls.count("nodes.create"), 2);
        assert_eq!(cluster.calls.count("nodes.update_status"), 2);
        let recreated = cluster.node("vk").unwrap();
        assert_ne!(recreated.metadata.uid, first_uid);
        assert_eq!(controller.node.metadata.uid, recreated.metadata.uid);
    }

    #[test(tokio::test)]
    async fn lease_recreated_after_node_recreation_points_at_the_new_node() {
        let cluster = FakeCluster::new();
        let options = NodeControllerOptions::default()
            .with_lease(cluster.leases(), Duration::from_secs(40))
            .with_status_update_error_handler(recreate_missing_node(cluster.nodes()));
        let mut controller = controller(&cluster, options);
        controller.ensure_node().await.unwrap();

        cluster.nodes.remove("", "vk");
        cluster.leases.remove(NODE_LEASE_NAMESPACE, "vk");
        controller.push_status().await.unwrap();
        let lease = controller.lease.as_mut().unwrap();
        lease.renew(&controller.node).await.unwrap();

        let owner_uid = cluster.lease("vk").unwrap().metadata.owner_references.unwrap()[0]
            .uid
            .clone();
        assert_eq!(Some(owner_uid), cluster.node("vk").unwrap().metadata.uid);
    }

    #[test(tokio::test)]
    async fn other_push_errors_reach_the_caller() {
        let cluster = FakeCluster::new();
        let options = NodeControllerOptions::default()
            .with_status_update_error_handler(recreate_missing_node(cluster.nodes()));
        let mut controller = controller(&cluster, options);
        controller.ensure_node().await.unwrap();

        cluster.fail_next_status_update();
        let err = controller.push_status().await.unwrap_err();
        assert!(matches!(err.current_context(), ClusterError::Api { .. }));
        assert_eq!(cluster.calls.count("nodes.create"), 1);
    }

    #[test(tokio::test)]
    async fn provider_updates_are_merged_and_pushed() {
        use crate::cache::ResourceCache;
        use crate::cache::ResourceManager;
        use crate::provider::mock::MockConfig;
        use crate::provider::mock::MockProvider;
        use crate::provider::InitConfig;

        let cluster = FakeCluster::new();
        let provider = Arc::new(MockProvider::new(
            &InitConfig {
                config_path: None,
                node_name: "vk".to_string(),
                operating_system: "Linux".to_string(),
                resource_manager: ResourceManager::new(
                    Arc::new(ResourceCache::new()),
                    Arc::new(ResourceCache::new()),
                    Arc::new(ResourceCache::new()),
                    Arc::new(ResourceCache::new()),
                    Arc::new(ResourceCache::new()),
                    Arc::new(ResourceCache::new()),
                ),
                daemon_port: 10250,
                internal_ip: None,
                cluster_domain: "cluster.local".to_string(),
            },
            MockConfig::default(),
        ));
        let token = CancellationToken::new();
        let controller = NodeController::new(
            Arc::clone(&provider) as Arc<dyn NodeProvider>,
            node("vk"),
            cluster.nodes(),
            NodeControllerOptions::default(),
        )
        .unwrap();
        let task = tokio::spawn(controller.run(token.clone()));

        let mut update = node("vk");
        update.metadata.labels = Some([("zone".to_string(), "a".to_string())].into());
        tokio::time::timeout(Duration::from_secs(1), async {
            while !provider.publish_node_status(update.clone()).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while cluster.calls.count("nodes.update_status") == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        token.cancel();
        task.await.unwrap().unwrap();
    }
}
