//! Brings the agent up in order and supervises it until shutdown.

pub mod readiness;
pub mod recovery;
pub mod tasks;

use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

pub use self::readiness::GateOutcome;
pub use self::readiness::ReadinessGate;
pub use self::recovery::recreate_missing_node;
pub use self::tasks::ControllerTasks;
use crate::api::load_token_file;
use crate::api::AdminServer;
use crate::api::AdminServerConfig;
use crate::api::AdminServerHandle;
use crate::api::ReleaseHook;
use crate::cache::Informers;
use crate::cluster::kube::KubeCluster;
use crate::cluster::ClusterClient;
use crate::cluster::WatchScope;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::error::ControllerKind;
use crate::error::StartupPhase;
use crate::node::node_from_provider;
use crate::node::NodeController;
use crate::node::NodeControllerOptions;
use crate::pod::EventBroadcaster;
use crate::pod::PodController;
use crate::pod::PodControllerConfig;
use crate::provider::node_capability;
use crate::provider::InitConfig;
use crate::provider::InitFn;
use crate::provider::ProviderRegistry;

/// How long controllers get to drain once the run is cancelled.
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Startup milestones, reported in order as they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Stage {
    CachesSynced,
    ProviderInitialized,
    AdminServerStarted,
    PodControllerStarted,
    PodControllerReady,
    NodeControllerStarted,
    Initialized,
}

/// Everything started by a run that has to be torn down with it.
struct Running {
    token: CancellationToken,
    tasks: ControllerTasks,
    admin: AdminServerHandle,
    events: EventBroadcaster,
    informers: Informers,
}

impl Running {
    /// Stops everything. Returns the controller whose failure ended the run, if any.
    async fn stop(self) -> Option<ControllerKind> {
        self.token.cancel();
        let fatal = self.tasks.shutdown(SHUTDOWN_GRACE_PERIOD).await;
        self.admin.stop().await;
        self.events.stopped().await;
        self.informers.stopped().await;
        fatal
    }
}

pub struct Orchestrator {
    config: AgentConfig,
    stages: Option<mpsc::UnboundedSender<Stage>>,
    admin_release_hook: Option<ReleaseHook>,
}

impl Orchestrator {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config,
            stages: None,
            admin_release_hook: None,
        }
    }

    pub fn with_stage_reporter(mut self, stages: mpsc::UnboundedSender<Stage>) -> Self {
        self.stages = Some(stages);
        self
    }

    /// Called once when the admin server is released at the end of the run.
    pub fn with_admin_release_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.admin_release_hook = Some(Arc::new(hook));
        self
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn report(&self, stage: Stage) {
        tracing::debug!(%stage, "Startup stage reached");
        if let Some(stages) = &self.stages {
            let _ = stages.send(stage);
        }
    }

    /// Resolves the provider by name and the cluster client, then [`Orchestrator::run`]s.
    ///
    /// Without a supplied `cluster`, a client is built from the connection settings.
    pub async fn run_with_registry(
        &self,
        token: CancellationToken,
        registry: &ProviderRegistry,
        cluster: Option<Arc<dyn ClusterClient>>,
    ) -> Result<(), Report<AgentError>> {
        let init = registry.get(&self.config.provider).ok_or_else(|| {
            Report::new(AgentError::configuration(format!(
                "provider {:?} not found",
                self.config.provider
            )))
            .attach_printable(StartupPhase::ProviderLookup)
            .attach_printable(format!("available providers: {}", registry.names().join(", ")))
        })?;

        let cluster = match cluster {
            Some(cluster) => cluster,
            None => {
                let client = KubeCluster::connect(&self.config.connection)
                    .await
                    .change_context(AgentError::connectivity("failed to build the cluster client"))
                    .attach_printable(StartupPhase::ClientConstruction)?;
                Arc::new(client) as Arc<dyn ClusterClient>
            }
        };

        self.run(token, init, cluster).await
    }

    /// Starts the agent and blocks until `token` is cancelled.
    ///
    /// Returns `Ok` on cancellation. Startup failures carry the failed
    /// [`StartupPhase`]; a controller failing after startup ends the run
    /// with [`AgentError::FatalController`].
    #[tracing::instrument(
        name = "orchestrator",
        skip_all,
        fields(
            provider = %self.config.provider,
            os = %self.config.operating_system,
            node = %self.config.node_name,
            watched_namespace = %self.config.namespace,
        )
    )]
    pub async fn run(
        &self,
        token: CancellationToken,
        init: InitFn,
        cluster: Arc<dyn ClusterClient>,
    ) -> Result<(), Report<AgentError>> {
        let config = &self.config;
        config
            .validate_operating_system()
            .attach_printable(StartupPhase::Validation)?;
        config
            .validate_workers()
            .attach_printable(StartupPhase::Validation)?;

        let taint = config.taint.to_taint().attach_printable(StartupPhase::Taint)?;

        let run_token = token.child_token();
        let _cancel_on_exit = run_token.clone().drop_guard();

        let scope = WatchScope::pods_on_node(Some(config.namespace.clone()), &config.node_name);
        let informers = Informers::start(cluster.as_ref(), &scope, &run_token);
        if !informers.wait_for_sync(&run_token).await {
            info!("Cancelled before the caches synced");
            return Ok(());
        }
        self.report(Stage::CachesSynced);

        let resource_manager = informers.resource_manager();

        let auth_token = self
            .admin_auth_token()
            .attach_printable(StartupPhase::AdminAuthentication)?;

        let provider = init(InitConfig {
            config_path: config.provider_config.clone(),
            node_name: config.node_name.clone(),
            operating_system: config.operating_system.clone(),
            resource_manager,
            daemon_port: config.daemon_port,
            internal_ip: config.internal_ip.clone(),
            cluster_domain: config.cluster_domain.clone(),
        })
        .change_context_lazy(|| AgentError::ProviderInit {
            provider: config.provider.clone(),
        })
        .attach_printable(StartupPhase::ProviderInit)?;
        self.report(Stage::ProviderInitialized);

        let node = node_from_provider(
            &config.node_name,
            taint,
            provider.as_ref(),
            &utils::version::KUBELET_VERSION,
            &config.operating_system,
        );

        let mut node_options = NodeControllerOptions::default()
            .with_status_update_interval(config.node_status_update_interval)
            .with_ping_interval(config.node_ping_interval)
            .with_status_update_error_handler(recreate_missing_node(cluster.nodes()));
        if config.enable_node_lease {
            node_options = node_options.with_lease(cluster.leases(), config.node_lease_duration);
        }
        let node_controller = NodeController::new(
            node_capability(&provider),
            node,
            cluster.nodes(),
            node_options,
        )
        .change_context(AgentError::configuration("invalid node controller options"))
        .attach_printable(StartupPhase::NodeController)?;

        let events = EventBroadcaster::start(cluster.events(), run_token.clone());
        let recorder = events.new_recorder(
            format!("{}/pod-controller", config.node_name),
            config.node_name.clone(),
        );

        let pod_controller = PodController::new(PodControllerConfig {
            pods: cluster.pods(),
            pod_cache: Arc::clone(&informers.pods),
            recorder,
            provider: Arc::clone(&provider),
            secrets: Arc::clone(&informers.secrets),
            config_maps: Arc::clone(&informers.config_maps),
            services: Arc::clone(&informers.services),
            sync_rate_limiter: config.sync_rate_limiter.build(),
            delete_rate_limiter: config.delete_rate_limiter.build(),
            status_rate_limiter: config.status_rate_limiter.build(),
            status_poll_interval: config.pod_status_poll_interval,
        })
        .change_context(AgentError::configuration("invalid pod controller options"))
        .attach_printable(StartupPhase::PodController)?;

        let listen_addr = config.admin_listen_addr();
        let admin = AdminServer::new(
            Arc::clone(&provider),
            AdminServerConfig {
                listen_addr: listen_addr.clone(),
                auth_token,
            },
        )
        .start(&run_token, self.admin_release_hook.clone())
        .await
        .change_context_lazy(|| AgentError::AdminServer {
            message: format!("failed to serve on {listen_addr}"),
        })
        .attach_printable(StartupPhase::AdminServer)?;
        self.report(Stage::AdminServerStarted);

        let ready = pod_controller.ready();
        let mut tasks = ControllerTasks::new(run_token.clone());
        tasks.spawn(
            ControllerKind::Pod,
            pod_controller.run(run_token.clone(), config.pod_sync_workers),
        );
        self.report(Stage::PodControllerStarted);

        let mut running = Running {
            token: run_token.clone(),
            tasks,
            admin,
            events,
            informers,
        };

        if !config.startup_timeout.is_zero() {
            match ReadinessGate::new(ready)
                .wait(config.startup_timeout, &run_token)
                .await
            {
                Ok(GateOutcome::Ready) => self.report(Stage::PodControllerReady),
                Ok(GateOutcome::Cancelled) => return Self::finish(running).await,
                Err(e) => {
                    running.stop().await;
                    return Err(e.attach_printable(StartupPhase::Readiness));
                }
            }
        }

        running
            .tasks
            .spawn(ControllerKind::Node, node_controller.run(run_token.clone()));
        self.report(Stage::NodeControllerStarted);

        info!("Initialized");
        self.report(Stage::Initialized);

        run_token.cancelled().await;
        Self::finish(running).await
    }

    /// Tears the run down and maps a controller failure to the run's result.
    async fn finish(running: Running) -> Result<(), Report<AgentError>> {
        match running.stop().await {
            None => {
                info!("Shut down cleanly");
                Ok(())
            }
            Some(controller) => {
                warn!(%controller, "Run ended by a controller failure");
                Err(Report::new(AgentError::FatalController { controller }))
            }
        }
    }

    fn admin_auth_token(&self) -> Result<Option<String>, Report<AgentError>> {
        let auth = &self.config.admin_auth;
        if !auth.webhook_enabled {
            return Ok(None);
        }
        let Some(path) = auth.token_file.as_deref() else {
            return Err(Report::new(AgentError::connectivity(
                "token authentication is enabled but no token file was given",
            )));
        };
        load_token_file(path)
            .change_context(AgentError::connectivity("failed to load admin authentication material"))
            .map(Some)
    }
}
