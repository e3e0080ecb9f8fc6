//! End-to-end startup, supervision and shutdown against the in-memory cluster.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodStatus;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use similar_asserts::assert_eq;
use test_log::test;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use virtual_node::cache::ResourceManager;
use virtual_node::cluster::fake::FakeCluster;
use virtual_node::cluster::ClusterClient;
use virtual_node::cluster::ClusterError;
use virtual_node::cluster::ConnectionConfig;
use virtual_node::cluster::EventSink;
use virtual_node::cluster::FeedStream;
use virtual_node::cluster::LeaseApi;
use virtual_node::cluster::NodeApi;
use virtual_node::cluster::PodApi;
use virtual_node::cluster::WatchScope;
use virtual_node::config::AgentConfig;
use virtual_node::error::ControllerKind;
use virtual_node::error::StartupPhase;
use virtual_node::provider::mock::MockProvider;
use virtual_node::provider::InitConfig;
use virtual_node::provider::InitFn;
use virtual_node::provider::Provider;
use virtual_node::provider::ProviderError;
use virtual_node::provider::ProviderRegistry;
use virtual_node::AgentError;
use virtual_node::Orchestrator;
use virtual_node::Stage;

const NODE: &str = "vk-test";

fn test_config() -> AgentConfig {
    AgentConfig {
        node_name: NODE.to_string(),
        listen_address: "127.0.0.1".to_string(),
        daemon_port: 0,
        node_lease_duration: Duration::from_millis(200),
        node_status_update_interval: Duration::from_millis(50),
        node_ping_interval: Duration::from_millis(20),
        pod_status_poll_interval: Duration::from_millis(50),
        pod_sync_workers: 2,
        ..AgentConfig::default()
    }
}

fn as_client(cluster: &Arc<FakeCluster>) -> Arc<dyn ClusterClient> {
    Arc::clone(cluster) as Arc<dyn ClusterClient>
}

fn mock_init() -> InitFn {
    Arc::new(MockProvider::init)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Runs an orchestrator in the background, recording its stages.
struct Running {
    token: CancellationToken,
    stages: mpsc::UnboundedReceiver<Stage>,
    released: Arc<AtomicUsize>,
    handle: JoinHandle<Result<(), Report<AgentError>>>,
}

impl Running {
    fn start(config: AgentConfig, init: InitFn, cluster: Arc<dyn ClusterClient>) -> Self {
        let token = CancellationToken::new();
        let (tx, stages) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let orchestrator = Orchestrator::new(config)
            .with_stage_reporter(tx)
            .with_admin_release_hook(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        let run_token = token.clone();
        let handle = tokio::spawn(async move { orchestrator.run(run_token, init, cluster).await });
        Self {
            token,
            stages,
            released,
            handle,
        }
    }

    async fn wait_for(&mut self, stage: Stage) -> Vec<Stage> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(next) = self.stages.recv().await {
                seen.push(next);
                if next == stage {
                    return;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {stage}, saw {seen:?}"));
        seen
    }

    async fn stop(self) -> (Result<(), Report<AgentError>>, usize) {
        self.token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("run did not return after cancellation")
            .unwrap();
        (result, self.released.load(Ordering::SeqCst))
    }

    async fn finished(self) -> (Result<(), Report<AgentError>>, usize, Vec<Stage>) {
        let mut stages = self.stages;
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("run did not return")
            .unwrap();
        let mut seen = Vec::new();
        while let Ok(stage) = stages.try_recv() {
            seen.push(stage);
        }
        (result, self.released.load(Ordering::SeqCst), seen)
    }
}

/// Mock backend whose provider listing is slow, which delays pod controller readiness.
struct SlowStartProvider {
    inner: Arc<dyn Provider>,
    delay: Duration,
}

#[async_trait]
impl Provider for SlowStartProvider {
    async fn create_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>> {
        self.inner.create_pod(pod).await
    }

    async fn update_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>> {
        self.inner.update_pod(pod).await
    }

    async fn delete_pod(&self, pod: &Pod) -> Result<(), Report<ProviderError>> {
        self.inner.delete_pod(pod).await
    }

    async fn get_pod(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Pod>, Report<ProviderError>> {
        self.inner.get_pod(namespace, name).await
    }

    async fn get_pod_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PodStatus>, Report<ProviderError>> {
        self.inner.get_pod_status(namespace, name).await
    }

    async fn get_pods(&self) -> Result<Vec<Pod>, Report<ProviderError>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_pods().await
    }

    fn configure_node(&self, node: &mut Node) {
        self.inner.configure_node(node);
    }
}

fn slow_init(delay: Duration) -> InitFn {
    Arc::new(move |config: InitConfig| {
        let inner = MockProvider::init(config)?;
        Ok(Arc::new(SlowStartProvider { inner, delay }) as Arc<dyn Provider>)
    })
}

/// Node API that refuses every write.
struct BrokenNodes;

#[async_trait]
impl NodeApi for BrokenNodes {
    async fn get(&self, name: &str) -> Result<Node, Report<ClusterError>> {
        Err(Report::new(ClusterError::not_found("Node", name)))
    }

    async fn create(&self, _node: &Node) -> Result<Node, Report<ClusterError>> {
        Err(Report::new(ClusterError::Api {
            message: "admission webhook denied the request".to_string(),
        }))
    }

    async fn update_status(&self, _node: &Node) -> Result<Node, Report<ClusterError>> {
        Err(Report::new(ClusterError::Api {
            message: "admission webhook denied the request".to_string(),
        }))
    }
}

/// In-memory cluster whose node API is broken.
struct NodeRejectingCluster(Arc<FakeCluster>);

impl ClusterClient for NodeRejectingCluster {
    fn nodes(&self) -> Arc<dyn NodeApi> {
        Arc::new(BrokenNodes)
    }

    fn pods(&self) -> Arc<dyn PodApi> {
        self.0.pods()
    }

    fn leases(&self) -> Arc<dyn LeaseApi> {
        self.0.leases()
    }

    fn events(&self) -> Arc<dyn EventSink> {
        ClusterClient::events(self.0.as_ref())
    }

    fn watch_pods(&self, scope: &WatchScope) -> FeedStream<Pod> {
        self.0.watch_pods(scope)
    }

    fn watch_secrets(&self) -> FeedStream<Secret> {
        self.0.watch_secrets()
    }

    fn watch_config_maps(&self) -> FeedStream<ConfigMap> {
        self.0.watch_config_maps()
    }

    fn watch_services(&self) -> FeedStream<Service> {
        self.0.watch_services()
    }

    fn watch_pvcs(&self) -> FeedStream<PersistentVolumeClaim> {
        self.0.watch_pvcs()
    }

    fn watch_pvs(&self) -> FeedStream<PersistentVolume> {
        self.0.watch_pvs()
    }
}

#[test(tokio::test)]
async fn zero_workers_fail_before_any_cluster_call() {
    let cluster = Arc::new(FakeCluster::new());
    let config = AgentConfig {
        pod_sync_workers: 0,
        ..test_config()
    };

    let err = Orchestrator::new(config)
        .run_with_registry(
            CancellationToken::new(),
            &ProviderRegistry::with_builtin(),
            Some(as_client(&cluster)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err.current_context(), AgentError::Configuration { .. }));
    assert_eq!(err.downcast_ref::<StartupPhase>(), Some(&StartupPhase::Validation));
    assert_eq!(cluster.calls.total(), 0);
}

#[test(tokio::test)]
async fn unknown_provider_is_a_configuration_error() {
    let cluster = Arc::new(FakeCluster::new());
    let config = AgentConfig {
        provider: "does-not-exist".to_string(),
        ..test_config()
    };

    let err = Orchestrator::new(config)
        .run_with_registry(
            CancellationToken::new(),
            &ProviderRegistry::with_builtin(),
            Some(as_client(&cluster)),
        )
        .await
        .unwrap_err();

    assert!(matches!(err.current_context(), AgentError::Configuration { .. }));
    assert_eq!(err.downcast_ref::<StartupPhase>(), Some(&StartupPhase::ProviderLookup));
    assert_eq!(cluster.calls.total(), 0);
}

#[test(tokio::test)]
async fn unusable_kubeconfig_is_a_connectivity_error() {
    let kubeconfig = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(kubeconfig.path(), "clusters: [unterminated").unwrap();
    let config = AgentConfig {
        connection: ConnectionConfig {
            kubeconfig: Some(kubeconfig.path().to_path_buf()),
            master_uri: None,
        },
        ..test_config()
    };

    let called = Arc::new(AtomicBool::new(false));
    let mut registry = ProviderRegistry::new();
    registry.register("mock", {
        let called = Arc::clone(&called);
        move |config| {
            called.store(true, Ordering::SeqCst);
            MockProvider::init(config)
        }
    });

    let err = Orchestrator::new(config)
        .run_with_registry(CancellationToken::new(), &registry, None)
        .await
        .unwrap_err();

    assert!(matches!(err.current_context(), AgentError::Connectivity { .. }));
    assert_eq!(
        err.downcast_ref::<StartupPhase>(),
        Some(&StartupPhase::ClientConstruction)
    );
    assert!(err.downcast_ref::<ClusterError>().is_some());
    assert!(!called.load(Ordering::SeqCst));
}

#[test(tokio::test)]
async fn unsupported_operating_system_never_initializes_the_provider() {
    let cluster = Arc::new(FakeCluster::new());
    let called = Arc::new(AtomicBool::new(false));
    let init_called = Arc::clone(&called);
    let init: InitFn = Arc::new(move |config| {
        init_called.store(true, Ordering::SeqCst);
        MockProvider::init(config)
    });
    let config = AgentConfig {
        operating_system: "Plan9".to_string(),
        ..test_config()
    };

    let err = Orchestrator::new(config)
        .run(CancellationToken::new(), init, as_client(&cluster))
        .await
        .unwrap_err();

    assert!(matches!(err.current_context(), AgentError::Configuration { .. }));
    assert!(!called.load(Ordering::SeqCst));
    assert_eq!(cluster.calls.total(), 0);
}

#[test(tokio::test)]
async fn invalid_taint_effect_fails_before_caches_start() {
    let cluster = Arc::new(FakeCluster::new());
    let mut config = test_config();
    config.taint.effect = "Sometimes".to_string();

    let err = Orchestrator::new(config)
        .run(CancellationToken::new(), mock_init(), as_client(&cluster))
        .await
        .unwrap_err();

    assert_eq!(err.downcast_ref::<StartupPhase>(), Some(&StartupPhase::Taint));
    assert_eq!(cluster.calls.total(), 0);
}

#[test(tokio::test)]
async fn provider_init_failure_starts_no_controller() {
    let cluster = Arc::new(FakeCluster::new());
    let init: InitFn = Arc::new(|_config| {
        Err(Report::new(ProviderError::Backend {
            message: "backend unreachable".to_string(),
        }))
    });

    let running = Running::start(test_config(), init, as_client(&cluster));
    let (result, released, stages) = running.finished().await;

    let err = result.unwrap_err();
    assert!(matches!(
        err.current_context(),
        AgentError::ProviderInit { provider } if provider == "mock"
    ));
    assert_eq!(err.downcast_ref::<StartupPhase>(), Some(&StartupPhase::ProviderInit));
    assert!(err.downcast_ref::<ProviderError>().is_some());
    assert_eq!(stages, vec![Stage::CachesSynced]);
    assert_eq!(released, 0);
    assert_eq!(cluster.calls.count("nodes.create"), 0);
}

#[test(tokio::test)]
async fn missing_token_file_aborts_startup() {
    let cluster = Arc::new(FakeCluster::new());
    let mut config = test_config();
    config.admin_auth.webhook_enabled = true;
    config.admin_auth.token_file = Some("/nonexistent/admin-token".into());

    let running = Running::start(config, mock_init(), as_client(&cluster));
    let (result, _, stages) = running.finished().await;

    let err = result.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::Connectivity { .. }));
    assert_eq!(
        err.downcast_ref::<StartupPhase>(),
        Some(&StartupPhase::AdminAuthentication)
    );
    assert!(!stages.contains(&Stage::ProviderInitialized));
}

#[test(tokio::test)]
async fn startup_timeout_shorter_than_readiness_fails() {
    let cluster = Arc::new(FakeCluster::new());
    let config = AgentConfig {
        startup_timeout: Duration::from_millis(100),
        ..test_config()
    };

    let running = Running::start(config, slow_init(Duration::from_secs(1)), as_client(&cluster));
    let (result, released, stages) = running.finished().await;

    let err = result.unwrap_err();
    assert!(matches!(err.current_context(), AgentError::StartupTimeout { .. }));
    assert_eq!(err.downcast_ref::<StartupPhase>(), Some(&StartupPhase::Readiness));
    assert!(stages.contains(&Stage::PodControllerStarted));
    assert!(!stages.contains(&Stage::PodControllerReady));
    assert!(!stages.contains(&Stage::NodeControllerStarted));
    assert_eq!(released, 1);
    assert_eq!(cluster.calls.count("nodes.create"), 0);
}

#[test(tokio::test)]
async fn readiness_is_observed_before_the_node_controller_starts() {
    let cluster = Arc::new(FakeCluster::new());
    let config = AgentConfig {
        startup_timeout: Duration::from_secs(5),
        ..test_config()
    };

    let mut running = Running::start(
        config,
        slow_init(Duration::from_millis(200)),
        as_client(&cluster),
    );
    let stages = running.wait_for(Stage::Initialized).await;
    assert_eq!(
        stages,
        vec![
            Stage::CachesSynced,
            Stage::ProviderInitialized,
            Stage::AdminServerStarted,
            Stage::PodControllerStarted,
            Stage::PodControllerReady,
            Stage::NodeControllerStarted,
            Stage::Initialized,
        ]
    );

    let (result, released) = running.stop().await;
    result.unwrap();
    assert_eq!(released, 1);
}

#[test(tokio::test)]
async fn deleted_node_is_recreated_without_surfacing_an_error() {
    let cluster = Arc::new(FakeCluster::new());
    let mut running = Running::start(test_config(), mock_init(), as_client(&cluster));
    running.wait_for(Stage::Initialized).await;

    eventually("node registration", || cluster.node(NODE).is_some()).await;
    eventually("lease creation", || cluster.lease(NODE).is_some()).await;
    assert_eq!(cluster.calls.count("nodes.create"), 1);

    cluster.nodes.remove("", NODE);
    eventually("node re-creation", || cluster.node(NODE).is_some()).await;
    assert_eq!(cluster.calls.count("nodes.create"), 2);

    let pushes = cluster.calls.count("nodes.update_status");
    eventually("a later status push", || {
        cluster.calls.count("nodes.update_status") > pushes
    })
    .await;
    assert_eq!(cluster.calls.count("nodes.create"), 2);

    let (result, _) = running.stop().await;
    result.unwrap();
}

#[test(tokio::test)]
async fn cancellation_after_startup_is_clean_and_releases_once() {
    let cluster = Arc::new(FakeCluster::new());
    let mut running = Running::start(test_config(), mock_init(), as_client(&cluster));
    running.wait_for(Stage::Initialized).await;
    eventually("node registration", || cluster.node(NODE).is_some()).await;

    let (result, released) = running.stop().await;
    result.unwrap();
    assert_eq!(released, 1);
}

#[test(tokio::test)]
async fn node_controller_failure_ends_the_run() {
    let cluster = Arc::new(FakeCluster::new());
    let rejecting: Arc<dyn ClusterClient> = Arc::new(NodeRejectingCluster(Arc::clone(&cluster)));

    let running = Running::start(test_config(), mock_init(), rejecting);
    let (result, released, stages) = running.finished().await;

    let err = result.unwrap_err();
    assert!(matches!(
        err.current_context(),
        AgentError::FatalController {
            controller: ControllerKind::Node
        }
    ));
    assert!(stages.contains(&Stage::NodeControllerStarted));
    assert_eq!(released, 1);
}

#[test(tokio::test)]
async fn pods_assigned_to_the_node_reach_the_provider() {
    let cluster = Arc::new(FakeCluster::new());
    let provider: Arc<Mutex<Option<Arc<dyn Provider>>>> = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&provider);
    let init: InitFn = Arc::new(move |config| {
        let created = MockProvider::init(config)?;
        *captured.lock().unwrap() = Some(Arc::clone(&created));
        Ok(created)
    });

    let mut running = Running::start(test_config(), init, as_client(&cluster));
    running.wait_for(Stage::Initialized).await;

    cluster.pods.apply(Pod {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some("web".to_string()),
            ..Default::default()
        },
        spec: Some(k8s_openapi::api::core::v1::PodSpec {
            node_name: Some(NODE.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    });

    eventually("pod reported running", || {
        cluster
            .pods
            .get("default", "web")
            .and_then(|pod| pod.status)
            .and_then(|status| status.phase)
            .as_deref()
            == Some("Running")
    })
    .await;
    let provider = provider.lock().unwrap().clone().unwrap();
    assert_eq!(provider.get_pods().await.unwrap().len(), 1);

    let (result, _) = running.stop().await;
    result.unwrap();
}

#[test(tokio::test)]
async fn cache_reads_only_reflect_feed_deliveries() {
    let cluster = Arc::new(FakeCluster::new());
    let manager: Arc<Mutex<Option<ResourceManager>>> = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&manager);
    let init: InitFn = Arc::new(move |config: InitConfig| {
        *captured.lock().unwrap() = Some(config.resource_manager.clone());
        MockProvider::init(config)
    });

    cluster.secrets.apply(Secret {
        metadata: ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some("creds".to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            "password".to_string(),
            ByteString(b"hunter2".to_vec()),
        )])),
        ..Default::default()
    });

    let mut running = Running::start(test_config(), init, as_client(&cluster));
    running.wait_for(Stage::Initialized).await;
    let manager = manager.lock().unwrap().clone().unwrap();

    let password = |manager: &ResourceManager| {
        manager
            .get_secret("default", "creds")
            .and_then(|secret| secret.data.clone())
            .and_then(|data| data.get("password").cloned())
    };
    assert_eq!(password(&manager), Some(ByteString(b"hunter2".to_vec())));

    let mut raw = cluster.secrets.get("default", "creds").unwrap();
    raw.data = Some(BTreeMap::from([(
        "password".to_string(),
        ByteString(b"changed".to_vec()),
    )]));
    assert_eq!(password(&manager), Some(ByteString(b"hunter2".to_vec())));

    cluster.secrets.apply(raw);
    eventually("feed delivery", || {
        password(&manager) == Some(ByteString(b"changed".to_vec()))
    })
    .await;

    let (result, _) = running.stop().await;
    result.unwrap();
}
