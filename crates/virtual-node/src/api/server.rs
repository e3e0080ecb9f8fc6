use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use poem::endpoint::BoxEndpoint;
use poem::get;
use poem::listener::Acceptor;
use poem::listener::Listener;
use poem::listener::TcpListener;
use poem::middleware::Tracing;
use poem::EndpointExt;
use poem::Route;
use poem::Server;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::auth::BearerAuthMiddleware;
use super::errors::ApiError;
use super::handlers::container_logs;
use super::handlers::healthz;
use super::handlers::running_pods;
use crate::provider::Provider;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Invoked once when the admin server is released.
pub type ReleaseHook = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Clone)]
pub struct AdminServerConfig {
    pub listen_addr: String,
    /// Bearer token required on every route except `/healthz`.
    pub auth_token: Option<String>,
}

/// HTTP admin endpoint serving provider data
pub struct AdminServer {
    provider: Arc<dyn Provider>,
    config: AdminServerConfig,
}

impl AdminServer {
    pub fn new(provider: Arc<dyn Provider>, config: AdminServerConfig) -> Self {
        Self { provider, config }
    }

    pub fn routes(&self) -> BoxEndpoint<'static> {
        let app = Route::new()
            .at("/healthz", get(healthz))
            .at("/runningpods/", get(running_pods))
            .at(
                "/containerLogs/:namespace/:pod/:container",
                get(container_logs),
            )
            .data(Arc::clone(&self.provider));

        match &self.config.auth_token {
            Some(token) => app
                .with(BearerAuthMiddleware::new(token.as_str()))
                .with(Tracing)
                .boxed(),
            None => app.with(Tracing).boxed(),
        }
    }

    /// Binds the listener and serves until `token` is cancelled or the handle is dropped.
    ///
    /// # Errors
    ///
    /// - [`ApiError::Bind`] if the address cannot be bound
    pub async fn start(
        self,
        token: &CancellationToken,
        on_release: Option<ReleaseHook>,
    ) -> Result<AdminServerHandle, Report<ApiError>> {
        let addr = self.config.listen_addr.clone();
        let acceptor = TcpListener::bind(addr.clone())
            .into_acceptor()
            .await
            .change_context(ApiError::Bind { addr: addr.clone() })?;
        let local_addr = acceptor
            .local_addr()
            .first()
            .and_then(|a| a.as_socket_addr().copied());
        info!(addr = %addr, ?local_addr, "Admin server listening");

        let shutdown = token.child_token();
        let app = self.routes();
        let signal = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = Server::new_with_acceptor(acceptor)
                .run_with_graceful_shutdown(
                    app,
                    async move { signal.cancelled().await },
                    Some(SHUTDOWN_TIMEOUT),
                )
                .await;
            match result {
                Ok(()) => info!("Admin server stopped"),
                Err(e) => error!("Admin server failed: {e}"),
            }
        });

        Ok(AdminServerHandle {
            local_addr,
            shutdown,
            task: Some(task),
            on_release,
        })
    }
}

/// Scoped admin server: dropping it stops the server and fires the release hook.
pub struct AdminServerHandle {
    local_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
    on_release: Option<ReleaseHook>,
}

impl AdminServerHandle {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops the server and waits for in-flight requests to drain.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Admin server task failed: {e}");
            }
        }
    }
}

impl Drop for AdminServerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(hook) = self.on_release.take() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use similar_asserts::assert_eq;
    use test_log::test;

    use super::*;
    use crate::cache::ResourceCache;
    use crate::cache::ResourceManager;
    use crate::provider::mock::MockProvider;
    use crate::provider::InitConfig;

    async fn provider_with_pod() -> Arc<dyn Provider> {
        let provider = MockProvider::init(InitConfig {
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
        })
        .unwrap();
        provider
            .create_pod(&Pod {
                metadata: ObjectMeta {
                    namespace: Some("default".to_string()),
                    name: Some("web".to_string()),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                status: None,
            })
            .await
            .unwrap();
        provider
    }

    fn config(auth_token: Option<&str>) -> AdminServerConfig {
        AdminServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            auth_token: auth_token.map(str::to_string),
        }
    }

    #[test(tokio::test)]
    async fn serves_running_pods_and_logs() {
        let server = AdminServer::new(provider_with_pod().await, config(None));
        let cli = TestClient::new(server.routes());

        let resp = cli.get("/healthz").send().await;
        resp.assert_status_is_ok();
        resp.assert_text("ok").await;

        let resp = cli.get("/runningpods/").send().await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        json.value().object().get("kind").assert_string("PodList");
        json.value().object().get("items").array().assert_len(1);

        let resp = cli
            .get("/containerLogs/default/web/app")
            .query("tailLines", &1)
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_text("running on vk\n").await;

        let resp = cli.get("/containerLogs/default/missing/app").send().await;
        resp.assert_status(StatusCode::NOT_FOUND);
    }

    #[test(tokio::test)]
    async fn bearer_token_guards_everything_but_healthz() {
        let server = AdminServer::new(provider_with_pod().await, config(Some("s3cret")));
        let cli = TestClient::new(server.routes());

        cli.get("/healthz").send().await.assert_status_is_ok();
        cli.get("/runningpods/")
            .send()
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        cli.get("/runningpods/")
            .header("Authorization", "Bearer wrong")
            .send()
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
        cli.get("/runningpods/")
            .header("Authorization", "Bearer s3cret")
            .send()
            .await
            .assert_status_is_ok();
    }

    #[test(tokio::test)]
    async fn dropping_the_handle_fires_release_hook_once() {
        let released = Arc::new(AtomicUsize::new(0));
        let hook: ReleaseHook = {
            let released = Arc::clone(&released);
            Arc::new(move || {
                released.fetch_add(1, Ordering::SeqCst);
            })
        };
        let token = CancellationToken::new();
        let handle = AdminServer::new(provider_with_pod().await, config(None))
            .start(&token, Some(hook))
            .await
            .unwrap();
        assert!(handle.local_addr().is_some());

        handle.stop().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test(tokio::test)]
    async fn bind_failure_is_reported() {
        let token = CancellationToken::new();
        let first = AdminServer::new(provider_with_pod().await, config(None))
            .start(&token, None)
            .await
            .unwrap();
        let taken = first.local_addr().unwrap().to_string();

        let err = AdminServer::new(
            provider_with_pod().await,
            AdminServerConfig {
                listen_addr: taken,
                auth_token: None,
            },
        )
        .start(&token, None)
        .await
        .err()
        .unwrap();
        assert!(matches!(err.current_context(), ApiError::Bind { .. }));
    }
}
